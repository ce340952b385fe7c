//! The user-facing record store port and its in-memory reference
//! implementation.
//!
//! The engine does not own user tables; handlers mutate them through this
//! port inside the dispatcher's transaction. The contract that matters to
//! the engine:
//!
//! - a transaction's mutations and its checkpoint commit atomically
//! - after `rewind(chain, R)` the store reflects exactly the state as of the
//!   last event with `blockNumber < R` on that chain
//!
//! The in-memory implementation keeps a per-commit inverse log (prior values
//! of every touched record) tagged with the commit's chain and block, and
//! rewinds by replaying inverses newest-first. Durable implementations may
//! substitute snapshots as long as the observable contract holds.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{BlockNumber, ChainId, Checkpoint};

// ═══════════════════════════════════════════════════════════════════════════════
// QUERY MODEL
// ═══════════════════════════════════════════════════════════════════════════════

/// A single filter condition on one field.
#[derive(Debug, Clone)]
pub enum Condition {
    /// Equal to.
    Eq(Value),
    /// Greater than.
    Gt(Value),
    /// Greater than or equal.
    Gte(Value),
    /// Less than.
    Lt(Value),
    /// Less than or equal.
    Lte(Value),
    /// Member of the list.
    In(Vec<Value>),
    /// Not a member of the list.
    NotIn(Vec<Value>),
    /// String or array containment.
    Contains(Value),
    /// String prefix.
    StartsWith(String),
    /// String suffix.
    EndsWith(String),
}

impl Condition {
    /// Evaluate against a field value (missing fields never match).
    #[must_use]
    pub fn matches(&self, field: Option<&Value>) -> bool {
        let Some(actual) = field else { return false };
        match self {
            Self::Eq(expected) => actual == expected,
            Self::Gt(expected) => compare(actual, expected) == Some(std::cmp::Ordering::Greater),
            Self::Gte(expected) => {
                matches!(
                    compare(actual, expected),
                    Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                )
            }
            Self::Lt(expected) => compare(actual, expected) == Some(std::cmp::Ordering::Less),
            Self::Lte(expected) => {
                matches!(
                    compare(actual, expected),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                )
            }
            Self::In(list) => list.contains(actual),
            Self::NotIn(list) => !list.contains(actual),
            Self::Contains(needle) => match (actual, needle) {
                (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
            Self::StartsWith(prefix) => {
                matches!(actual, Value::String(s) if s.starts_with(prefix))
            }
            Self::EndsWith(suffix) => matches!(actual, Value::String(s) if s.ends_with(suffix)),
        }
    }
}

/// Compare two JSON values: numbers numerically, strings lexically.
fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// AND-combined conditions keyed by field name.
pub type Where = Vec<(String, Condition)>;

/// Sort direction for `find_many`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Ascending (default).
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// A `find_many` query.
#[derive(Debug, Clone, Default)]
pub struct FindMany {
    /// AND-combined filter conditions.
    pub r#where: Where,
    /// Order by field.
    pub order_by: Option<(String, Direction)>,
    /// Rows to skip.
    pub skip: usize,
    /// Maximum rows to return.
    pub take: Option<usize>,
}

/// Update payload: a partial merge or a function of the current record.
pub enum UpdateData {
    /// Shallow-merge these fields into the record.
    Merge(Value),
    /// Compute the partial update from the current record.
    Map(Box<dyn Fn(&Value) -> Value + Send + Sync>),
}

impl std::fmt::Debug for UpdateData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Merge(value) => f.debug_tuple("Merge").field(value).finish(),
            Self::Map(_) => f.write_str("Map(..)"),
        }
    }
}

impl UpdateData {
    fn partial_for(&self, current: &Value) -> Value {
        match self {
            Self::Merge(value) => value.clone(),
            Self::Map(func) => func(current),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PORTS
// ═══════════════════════════════════════════════════════════════════════════════

/// An open transaction over user tables.
///
/// Mutations are visible to later reads in the same transaction and become
/// durable only at [`RecordTransaction::commit`].
#[async_trait]
pub trait RecordTransaction: Send {
    /// Insert a record; errors if the id exists.
    async fn create(&mut self, table: &str, id: &str, data: Value) -> Result<()>;

    /// Update an existing record; errors if the id does not exist.
    /// Returns the updated record.
    async fn update(&mut self, table: &str, id: &str, data: UpdateData) -> Result<Value>;

    /// Insert or update. Returns the resulting record.
    async fn upsert(&mut self, table: &str, id: &str, create: Value, update: UpdateData)
    -> Result<Value>;

    /// Delete a record. Returns true when it existed.
    async fn delete(&mut self, table: &str, id: &str) -> Result<bool>;

    /// Read one record by id.
    async fn find_unique(&self, table: &str, id: &str) -> Result<Option<Value>>;

    /// Query records.
    async fn find_many(&self, table: &str, query: FindMany) -> Result<Vec<Value>>;

    /// Insert many records at once.
    async fn create_many(&mut self, table: &str, rows: Vec<(String, Value)>) -> Result<()>;

    /// Update every record matching the filter. Returns the count.
    async fn update_many(&mut self, table: &str, filter: Where, data: UpdateData) -> Result<u64>;

    /// Commit, atomically recording the checkpoint when given.
    async fn commit(self: Box<Self>, checkpoint: Option<Checkpoint>) -> Result<()>;

    /// Discard the transaction.
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// The user record store port.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Open a transaction. At most one is open at a time (the dispatcher is
    /// single-tasked).
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>>;

    /// Rewind the effects of every commit on `chain_id` with
    /// `block_number >= from_block`.
    async fn rewind(&self, chain_id: ChainId, from_block: BlockNumber) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// IN-MEMORY IMPLEMENTATION
// ═══════════════════════════════════════════════════════════════════════════════

type Tables = HashMap<String, BTreeMap<String, Value>>;

/// Prior value of one record, for the inverse log.
#[derive(Debug, Clone)]
struct UndoOp {
    table: String,
    id: String,
    /// `None` means the record did not exist before the commit.
    prior: Option<Value>,
}

#[derive(Debug)]
struct UndoGroup {
    chain_id: ChainId,
    block_number: BlockNumber,
    ops: Vec<UndoOp>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    tables: Tables,
    undo_log: Vec<UndoGroup>,
    checkpoints: HashMap<String, Checkpoint>,
}

/// In-memory record store used by tests and development runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryRecordStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryRecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a record outside any transaction (test convenience).
    #[must_use]
    pub fn peek(&self, table: &str, id: &str) -> Option<Value> {
        self.inner.lock().tables.get(table).and_then(|t| t.get(id)).cloned()
    }

    /// All records of a table, ordered by id (test convenience).
    #[must_use]
    pub fn dump(&self, table: &str) -> Vec<(String, Value)> {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// The committed checkpoint for a source, if any.
    #[must_use]
    pub fn checkpoint(&self, source_name: &str) -> Option<Checkpoint> {
        self.inner.lock().checkpoints.get(source_name).cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>> {
        let tables = self.inner.lock().tables.clone();
        Ok(Box::new(MemoryTransaction {
            store: Arc::clone(&self.inner),
            tables,
            undo: Vec::new(),
        }))
    }

    async fn rewind(&self, chain_id: ChainId, from_block: BlockNumber) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut kept = Vec::with_capacity(inner.undo_log.len());
        let mut to_undo = Vec::new();
        for group in inner.undo_log.drain(..) {
            if group.chain_id == chain_id && group.block_number >= from_block {
                to_undo.push(group);
            } else {
                kept.push(group);
            }
        }
        // Newest first: inverses compose in reverse commit order.
        for group in to_undo.into_iter().rev() {
            for op in group.ops.into_iter().rev() {
                let table = inner.tables.entry(op.table).or_default();
                match op.prior {
                    Some(value) => {
                        table.insert(op.id, value);
                    }
                    None => {
                        table.remove(&op.id);
                    }
                }
            }
        }
        inner.undo_log = kept;
        Ok(())
    }
}

/// Clone-on-begin transaction over the in-memory tables.
struct MemoryTransaction {
    store: Arc<Mutex<MemoryInner>>,
    tables: Tables,
    undo: Vec<UndoOp>,
}

impl MemoryTransaction {
    fn record_undo(&mut self, table: &str, id: &str) {
        if self.undo.iter().any(|op| op.table == table && op.id == id) {
            return;
        }
        let prior = self.tables.get(table).and_then(|t| t.get(id)).cloned();
        self.undo.push(UndoOp { table: table.to_owned(), id: id.to_owned(), prior });
    }

    fn apply_partial(current: &mut Value, partial: Value) {
        if let (Value::Object(target), Value::Object(fields)) = (current, partial) {
            for (key, value) in fields {
                target.insert(key, value);
            }
        }
    }
}

#[async_trait]
impl RecordTransaction for MemoryTransaction {
    async fn create(&mut self, table: &str, id: &str, data: Value) -> Result<()> {
        if self.tables.get(table).is_some_and(|t| t.contains_key(id)) {
            return Err(Error::Store(format!("create: {table}.{id} already exists")));
        }
        self.record_undo(table, id);
        self.tables.entry(table.to_owned()).or_default().insert(id.to_owned(), data);
        Ok(())
    }

    async fn update(&mut self, table: &str, id: &str, data: UpdateData) -> Result<Value> {
        self.record_undo(table, id);
        let record = self
            .tables
            .get_mut(table)
            .and_then(|t| t.get_mut(id))
            .ok_or_else(|| Error::Store(format!("update: {table}.{id} not found")))?;
        let partial = data.partial_for(record);
        Self::apply_partial(record, partial);
        Ok(record.clone())
    }

    async fn upsert(
        &mut self,
        table: &str,
        id: &str,
        create: Value,
        update: UpdateData,
    ) -> Result<Value> {
        if self.tables.get(table).is_some_and(|t| t.contains_key(id)) {
            self.update(table, id, update).await
        } else {
            self.create(table, id, create.clone()).await?;
            Ok(create)
        }
    }

    async fn delete(&mut self, table: &str, id: &str) -> Result<bool> {
        self.record_undo(table, id);
        Ok(self.tables.get_mut(table).is_some_and(|t| t.remove(id).is_some()))
    }

    async fn find_unique(&self, table: &str, id: &str) -> Result<Option<Value>> {
        Ok(self.tables.get(table).and_then(|t| t.get(id)).cloned())
    }

    async fn find_many(&self, table: &str, query: FindMany) -> Result<Vec<Value>> {
        let Some(rows) = self.tables.get(table) else { return Ok(Vec::new()) };
        let mut matched: Vec<&Value> = rows
            .values()
            .filter(|record| {
                query
                    .r#where
                    .iter()
                    .all(|(field, condition)| condition.matches(record.get(field)))
            })
            .collect();

        if let Some((field, direction)) = &query.order_by {
            matched.sort_by(|a, b| {
                let ordering = match (a.get(field), b.get(field)) {
                    (Some(x), Some(y)) => compare(x, y).unwrap_or(std::cmp::Ordering::Equal),
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                match direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                }
            });
        }

        let iter = matched.into_iter().skip(query.skip);
        let out: Vec<Value> = match query.take {
            Some(take) => iter.take(take).cloned().collect(),
            None => iter.cloned().collect(),
        };
        Ok(out)
    }

    async fn create_many(&mut self, table: &str, rows: Vec<(String, Value)>) -> Result<()> {
        for (id, data) in rows {
            self.create(table, &id, data).await?;
        }
        Ok(())
    }

    async fn update_many(&mut self, table: &str, filter: Where, data: UpdateData) -> Result<u64> {
        let ids: Vec<String> = self
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, record)| {
                        filter.iter().all(|(field, cond)| cond.matches(record.get(field)))
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();

        let count = ids.len() as u64;
        for id in ids {
            let current = self
                .tables
                .get(table)
                .and_then(|t| t.get(&id))
                .cloned()
                .unwrap_or(Value::Null);
            let partial = data.partial_for(&current);
            self.update(table, &id, UpdateData::Merge(partial)).await?;
        }
        Ok(count)
    }

    async fn commit(self: Box<Self>, checkpoint: Option<Checkpoint>) -> Result<()> {
        let mut inner = self.store.lock();
        inner.tables = self.tables;
        if let Some(checkpoint) = checkpoint {
            if !self.undo.is_empty() {
                inner.undo_log.push(UndoGroup {
                    chain_id: checkpoint.chain_id,
                    block_number: checkpoint.block_number,
                    ops: self.undo,
                });
            }
            inner.checkpoints.insert(checkpoint.source_name.clone(), checkpoint);
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::LogIndex;

    fn checkpoint(block: u64) -> Checkpoint {
        Checkpoint {
            chain_id: ChainId::new(1),
            source_name: "s".into(),
            block_number: BlockNumber::new(block),
            log_index: LogIndex::new(0),
        }
    }

    #[tokio::test]
    async fn crud_roundtrip() {
        let store = MemoryRecordStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.create("accounts", "a", json!({"balance": 10})).await.unwrap();
        tx.update("accounts", "a", UpdateData::Merge(json!({"balance": 20}))).await.unwrap();
        assert_eq!(
            tx.find_unique("accounts", "a").await.unwrap(),
            Some(json!({"balance": 20}))
        );
        tx.commit(Some(checkpoint(1))).await.unwrap();

        assert_eq!(store.peek("accounts", "a"), Some(json!({"balance": 20})));
    }

    #[tokio::test]
    async fn update_with_function_sees_current_value() {
        let store = MemoryRecordStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.create("accounts", "a", json!({"balance": 10})).await.unwrap();
        tx.update(
            "accounts",
            "a",
            UpdateData::Map(Box::new(|current| {
                let balance = current["balance"].as_i64().unwrap_or(0);
                json!({"balance": balance + 5})
            })),
        )
        .await
        .unwrap();
        assert_eq!(
            tx.find_unique("accounts", "a").await.unwrap(),
            Some(json!({"balance": 15}))
        );
        tx.abort().await.unwrap();
    }

    #[tokio::test]
    async fn abort_discards_mutations() {
        let store = MemoryRecordStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.create("accounts", "a", json!({"balance": 1})).await.unwrap();
        tx.abort().await.unwrap();
        assert!(store.peek("accounts", "a").is_none());
    }

    #[tokio::test]
    async fn find_many_filters_sorts_and_pages() {
        let store = MemoryRecordStore::new();
        let mut tx = store.begin().await.unwrap();
        for (id, balance) in [("a", 5), ("b", 15), ("c", 10), ("d", 20)] {
            tx.create("accounts", id, json!({"balance": balance})).await.unwrap();
        }

        let query = FindMany {
            r#where: vec![("balance".into(), Condition::Gte(json!(10)))],
            order_by: Some(("balance".into(), Direction::Desc)),
            skip: 1,
            take: Some(2),
        };
        let rows = tx.find_many("accounts", query).await.unwrap();
        assert_eq!(rows, vec![json!({"balance": 15}), json!({"balance": 10})]);
        tx.abort().await.unwrap();
    }

    #[tokio::test]
    async fn string_conditions() {
        let c = Condition::StartsWith("0xab".into());
        assert!(c.matches(Some(&json!("0xabc1"))));
        assert!(!c.matches(Some(&json!("0xbbc1"))));
        assert!(!c.matches(None));

        let c = Condition::Contains(json!("bc"));
        assert!(c.matches(Some(&json!("0xabc1"))));

        let c = Condition::In(vec![json!(1), json!(2)]);
        assert!(c.matches(Some(&json!(2))));
        assert!(!c.matches(Some(&json!(3))));
    }

    #[tokio::test]
    async fn rewind_restores_prior_state_per_chain() {
        let store = MemoryRecordStore::new();

        // Block 100 on chain 1 creates the record.
        let mut tx = store.begin().await.unwrap();
        tx.create("accounts", "a", json!({"balance": 1})).await.unwrap();
        tx.commit(Some(checkpoint(100))).await.unwrap();

        // Block 101 updates it.
        let mut tx = store.begin().await.unwrap();
        tx.update("accounts", "a", UpdateData::Merge(json!({"balance": 2}))).await.unwrap();
        tx.commit(Some(checkpoint(101))).await.unwrap();

        // A commit on another chain interleaves.
        let mut tx = store.begin().await.unwrap();
        tx.create("other", "x", json!({"v": 1})).await.unwrap();
        tx.commit(Some(Checkpoint {
            chain_id: ChainId::new(2),
            source_name: "t".into(),
            block_number: BlockNumber::new(7),
            log_index: LogIndex::new(0),
        }))
        .await
        .unwrap();

        // Reorg chain 1 at block 101: the update is undone, chain 2 untouched.
        store.rewind(ChainId::new(1), BlockNumber::new(101)).await.unwrap();
        assert_eq!(store.peek("accounts", "a"), Some(json!({"balance": 1})));
        assert_eq!(store.peek("other", "x"), Some(json!({"v": 1})));

        // Reorg at block 100 removes the create entirely.
        store.rewind(ChainId::new(1), BlockNumber::new(100)).await.unwrap();
        assert!(store.peek("accounts", "a").is_none());
    }
}
