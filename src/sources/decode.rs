//! Runtime ABI event decoding.
//!
//! Sources carry plain JSON ABIs, so decoding is dynamic: topic0 selects the
//! event definition, `alloy`'s dyn-abi decodes topics and data, and the
//! result is rendered into named JSON arguments for handlers.
//!
//! Rendering rules: `address` becomes lowercase hex, integers become decimal
//! strings (arbitrary precision survives JSON), byte strings become hex,
//! tuples become records when property names are known (arrays otherwise),
//! and arrays stay ordered sequences.

use std::collections::HashMap;

use alloy::dyn_abi::{DynSolValue, EventExt};
use alloy::json_abi::Event as AbiEvent;
use alloy::primitives::B256;
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::types::CachedLog;

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT DECODER
// ═══════════════════════════════════════════════════════════════════════════════

/// Selector-indexed decoder for one source's event set.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    by_selector: HashMap<B256, AbiEvent>,
}

impl EventDecoder {
    /// Build a decoder over the given events.
    #[must_use]
    pub fn new(events: &[AbiEvent]) -> Self {
        Self {
            by_selector: events.iter().map(|e| (e.selector(), e.clone())).collect(),
        }
    }

    /// The event definition for a selector, if indexed by this source.
    #[must_use]
    pub fn event_for(&self, selector: &B256) -> Option<&AbiEvent> {
        self.by_selector.get(selector)
    }

    /// Decode a cached log into `(eventName, args)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] when the log has no selector, the selector
    /// is not part of this source's event set, or the payload does not match
    /// the ABI definition.
    pub fn decode(&self, log: &CachedLog) -> Result<(String, Value)> {
        let selector =
            log.topics.first().ok_or_else(|| Error::Decode("log has no topics".into()))?;
        let event = self.event_for(selector).ok_or_else(|| {
            Error::Decode(format!("no event with selector {selector:x} in source ABI"))
        })?;

        let decoded = event
            .decode_log_parts(log.topics.iter().copied(), &log.data)
            .map_err(|e| Error::Decode(format!("{}: {e}", event.name)))?;

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut args = Map::new();
        for (position, input) in event.inputs.iter().enumerate() {
            let value = if input.indexed { indexed.next() } else { body.next() };
            let value = value.ok_or_else(|| {
                Error::Decode(format!("{}: missing argument {}", event.name, input.name))
            })?;
            let name = if input.name.is_empty() {
                format!("arg{position}")
            } else {
                input.name.clone()
            };
            args.insert(name, render(&value));
        }

        Ok((event.name.clone(), Value::Object(args)))
    }
}

/// Render a decoded Solidity value as JSON.
fn render(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Address(address) => json!(format!("0x{}", hex::encode(address))),
        DynSolValue::Bool(b) => json!(b),
        DynSolValue::Uint(u, _) => json!(u.to_string()),
        DynSolValue::Int(i, _) => json!(i.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            json!(format!("0x{}", hex::encode(&word[..*size])))
        }
        DynSolValue::Bytes(bytes) => json!(format!("0x{}", hex::encode(bytes))),
        DynSolValue::String(s) => json!(s),
        DynSolValue::Function(f) => json!(format!("0x{}", hex::encode(f))),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            Value::Array(items.iter().map(render).collect())
        }
        DynSolValue::Tuple(items) => Value::Array(items.iter().map(render).collect()),
        DynSolValue::CustomStruct { prop_names, tuple, .. } => {
            let mut object = Map::new();
            for (name, item) in prop_names.iter().zip(tuple.iter()) {
                object.insert(name.clone(), render(item));
            }
            Value::Object(object)
        }
        _ => Value::Null,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use alloy::primitives::{Address, Bytes, U256};

    use super::*;
    use crate::types::{BlockNumber, ChainId, LogIndex};

    fn transfer_event() -> AbiEvent {
        let abi: alloy::json_abi::JsonAbi =
            serde_json::from_str(crate::sources::tests::ERC20_ABI).unwrap();
        abi.events().next().unwrap().clone()
    }

    fn topic_for(address: Address) -> B256 {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(address.as_slice());
        B256::from(word)
    }

    fn transfer_log(from: Address, to: Address, value: U256) -> CachedLog {
        CachedLog {
            chain_id: ChainId::new(1),
            address: Address::from([0x01; 20]),
            block_hash: B256::from([0xAA; 32]),
            block_number: BlockNumber::new(100),
            log_index: LogIndex::new(0),
            topics: vec![transfer_event().selector(), topic_for(from), topic_for(to)],
            data: Bytes::from(value.to_be_bytes::<32>().to_vec()),
            transaction_hash: B256::from([0xFE; 32]),
            transaction_index: 0,
        }
    }

    #[test]
    fn decodes_named_arguments() {
        let decoder = EventDecoder::new(&[transfer_event()]);
        let from = Address::from([0x11; 20]);
        let to = Address::from([0x22; 20]);
        let log = transfer_log(from, to, U256::from(1_000_000u64));

        let (name, args) = decoder.decode(&log).unwrap();
        assert_eq!(name, "Transfer");
        assert_eq!(args["from"], json!(format!("0x{}", hex::encode(from))));
        assert_eq!(args["to"], json!(format!("0x{}", hex::encode(to))));
        assert_eq!(args["value"], json!("1000000"));
    }

    #[test]
    fn unknown_selector_is_decode_error() {
        let decoder = EventDecoder::new(&[transfer_event()]);
        let mut log = transfer_log(Address::ZERO, Address::ZERO, U256::ZERO);
        log.topics[0] = B256::from([0xDD; 32]);
        assert!(decoder.decode(&log).is_err());
    }

    #[test]
    fn large_integers_render_as_decimal_strings() {
        let decoder = EventDecoder::new(&[transfer_event()]);
        let value = U256::MAX;
        let log = transfer_log(Address::ZERO, Address::ZERO, value);
        let (_, args) = decoder.decode(&log).unwrap();
        assert_eq!(args["value"], json!(value.to_string()));
    }
}
