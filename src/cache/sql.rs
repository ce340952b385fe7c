//! Relational cache store over SQLx's `Any` driver.
//!
//! One implementation serves both backends: the embedded SQLite file used in
//! development and the PostgreSQL server used in production. To stay inside
//! the `Any` driver's type set, hashes, addresses, topics and data are stored
//! as lowercase hex text and block numbers as `BIGINT`.
//!
//! Interval merges are serialized per `(chain, fingerprint)` with an
//! in-process lock; blocks, logs, and transactions tolerate concurrent
//! inserts because every write is an idempotent upsert on the primary key.

// Block numbers and indices fit i64 (the chain would need ~292 billion years
// of 1s blocks to overflow), so the sign casts below are safe.
#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, B256, Bytes};
use async_trait::async_trait;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, FromRow, Row};
use tracing::{debug, info, instrument};

use crate::cache::intervals::{BlockRange, IntervalSet};
use crate::cache::CacheStore;
use crate::error::{Error, Result};
use crate::rpc::LogFilter;
use crate::sources::SourceFingerprint;
use crate::types::{
    BlockNumber, CachedBlock, CachedLog, CachedTransaction, ChainId, Checkpoint, LogIndex,
};

// ═══════════════════════════════════════════════════════════════════════════════
// SCHEMA
// ═══════════════════════════════════════════════════════════════════════════════

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS blocks (
        chain_id BIGINT NOT NULL,
        hash TEXT NOT NULL,
        parent_hash TEXT NOT NULL,
        number BIGINT NOT NULL,
        timestamp BIGINT NOT NULL,
        PRIMARY KEY (chain_id, hash)
    )",
    "CREATE INDEX IF NOT EXISTS blocks_by_number ON blocks (chain_id, number)",
    "CREATE TABLE IF NOT EXISTS logs (
        chain_id BIGINT NOT NULL,
        block_hash TEXT NOT NULL,
        log_index BIGINT NOT NULL,
        address TEXT NOT NULL,
        block_number BIGINT NOT NULL,
        topic0 TEXT,
        topic1 TEXT,
        topic2 TEXT,
        topic3 TEXT,
        data TEXT NOT NULL,
        tx_hash TEXT NOT NULL,
        tx_index BIGINT NOT NULL,
        PRIMARY KEY (chain_id, block_hash, log_index)
    )",
    "CREATE INDEX IF NOT EXISTS logs_by_number ON logs (chain_id, block_number, log_index)",
    "CREATE TABLE IF NOT EXISTS transactions (
        chain_id BIGINT NOT NULL,
        hash TEXT NOT NULL,
        block_hash TEXT NOT NULL,
        block_number BIGINT NOT NULL,
        tx_index BIGINT NOT NULL,
        PRIMARY KEY (chain_id, hash)
    )",
    "CREATE TABLE IF NOT EXISTS intervals (
        chain_id BIGINT NOT NULL,
        source_fingerprint TEXT NOT NULL,
        from_block BIGINT NOT NULL,
        to_block BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS intervals_by_source ON intervals (chain_id, source_fingerprint)",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        chain_id BIGINT NOT NULL,
        source_name TEXT NOT NULL,
        block_number BIGINT NOT NULL,
        log_index BIGINT NOT NULL,
        PRIMARY KEY (chain_id, source_name)
    )",
];

// ═══════════════════════════════════════════════════════════════════════════════
// HEX HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn hex_b256(value: &B256) -> String {
    format!("0x{}", hex::encode(value))
}

fn hex_address(value: &Address) -> String {
    format!("0x{}", hex::encode(value))
}

fn hex_bytes(value: &Bytes) -> String {
    format!("0x{}", hex::encode(value))
}

fn parse_b256(s: &str) -> Result<B256> {
    B256::from_str(s).map_err(|e| Error::Decode(format!("bad hash in cache: {e}")))
}

fn parse_address(s: &str) -> Result<Address> {
    Address::from_str(s).map_err(|e| Error::Decode(format!("bad address in cache: {e}")))
}

fn parse_bytes(s: &str) -> Result<Bytes> {
    Bytes::from_str(s).map_err(|e| Error::Decode(format!("bad data in cache: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROW TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, FromRow)]
struct BlockRow {
    chain_id: i64,
    hash: String,
    parent_hash: String,
    number: i64,
    timestamp: i64,
}

impl TryFrom<BlockRow> for CachedBlock {
    type Error = Error;

    fn try_from(row: BlockRow) -> Result<Self> {
        Ok(Self {
            chain_id: ChainId::new(row.chain_id as u64),
            hash: parse_b256(&row.hash)?,
            parent_hash: parse_b256(&row.parent_hash)?,
            number: BlockNumber::new(row.number as u64),
            timestamp: row.timestamp as u64,
        })
    }
}

#[derive(Debug, FromRow)]
struct LogRow {
    chain_id: i64,
    block_hash: String,
    log_index: i64,
    address: String,
    block_number: i64,
    topic0: Option<String>,
    topic1: Option<String>,
    topic2: Option<String>,
    topic3: Option<String>,
    data: String,
    tx_hash: String,
    tx_index: i64,
}

impl TryFrom<LogRow> for CachedLog {
    type Error = Error;

    fn try_from(row: LogRow) -> Result<Self> {
        let mut topics = Vec::with_capacity(4);
        for topic in [&row.topic0, &row.topic1, &row.topic2, &row.topic3] {
            match topic {
                Some(t) => topics.push(parse_b256(t)?),
                None => break,
            }
        }
        Ok(Self {
            chain_id: ChainId::new(row.chain_id as u64),
            address: parse_address(&row.address)?,
            block_hash: parse_b256(&row.block_hash)?,
            block_number: BlockNumber::new(row.block_number as u64),
            log_index: LogIndex::new(row.log_index as u64),
            topics,
            data: parse_bytes(&row.data)?,
            transaction_hash: parse_b256(&row.tx_hash)?,
            transaction_index: row.tx_index as u64,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// SQL-backed cache store (SQLite or PostgreSQL via the `Any` driver).
#[derive(Debug, Clone)]
pub struct SqlCacheStore {
    pool: AnyPool,
    /// Per-fingerprint merge locks; interval read-merge-write must not race.
    interval_locks: Arc<parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SqlCacheStore {
    /// Connect to the cache database.
    ///
    /// For SQLite URLs, the parent directory is created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] when the connection cannot be established.
    #[instrument]
    pub async fn connect(url: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();

        if let Some(path) = url.strip_prefix("sqlite://") {
            let path = path.split('?').next().unwrap_or(path);
            if path != ":memory:" {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::Config(format!("cache directory: {e}")))?;
                }
            }
        }

        // An in-memory SQLite database exists per connection; the pool must
        // not fan out or connections would see different databases.
        let max_connections = if url.contains(":memory:") { 1 } else { 8 };
        let pool = AnyPoolOptions::new().max_connections(max_connections).connect(url).await?;
        info!(backend = url.split(':').next().unwrap_or("?"), "connected to cache store");

        Ok(Self { pool, interval_locks: Arc::new(parking_lot::Mutex::new(HashMap::new())) })
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &AnyPool {
        &self.pool
    }

    fn interval_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.interval_locks.lock();
        locks.entry(key.to_owned()).or_default().clone()
    }

    /// Retry a write a few times before letting it become fatal. Transient
    /// pool and lock contention errors clear on their own; anything that
    /// survives the budget is a real failure.
    async fn with_write_retry<T, F, Fut>(&self, op: &'static str, attempt_fn: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>> + Send,
    {
        const WRITE_ATTEMPTS: u32 = 3;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(error @ Error::Cache(_)) if attempt < WRITE_ATTEMPTS => {
                    tracing::warn!(op, attempt, error = %error, "cache write failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(50 * u64::from(attempt)))
                        .await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn insert_block_tx<'a>(
        tx: &mut sqlx::Transaction<'a, sqlx::Any>,
        block: &CachedBlock,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO blocks (chain_id, hash, parent_hash, number, timestamp)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (chain_id, hash) DO NOTHING",
        )
        .bind(block.chain_id.value() as i64)
        .bind(hex_b256(&block.hash))
        .bind(hex_b256(&block.parent_hash))
        .bind(i64::from(block.number))
        .bind(block.timestamp as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_log_tx<'a>(
        tx: &mut sqlx::Transaction<'a, sqlx::Any>,
        log: &CachedLog,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO logs (chain_id, block_hash, log_index, address, block_number,
                               topic0, topic1, topic2, topic3, data, tx_hash, tx_index)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (chain_id, block_hash, log_index) DO NOTHING",
        )
        .bind(log.chain_id.value() as i64)
        .bind(hex_b256(&log.block_hash))
        .bind(log.log_index.value() as i64)
        .bind(hex_address(&log.address))
        .bind(i64::from(log.block_number))
        .bind(log.topics.first().map(hex_b256))
        .bind(log.topics.get(1).map(hex_b256))
        .bind(log.topics.get(2).map(hex_b256))
        .bind(log.topics.get(3).map(hex_b256))
        .bind(hex_bytes(&log.data))
        .bind(hex_b256(&log.transaction_hash))
        .bind(log.transaction_index as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_transaction_tx<'a>(
        tx: &mut sqlx::Transaction<'a, sqlx::Any>,
        transaction: &CachedTransaction,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO transactions (chain_id, hash, block_hash, block_number, tx_index)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (chain_id, hash) DO NOTHING",
        )
        .bind(transaction.chain_id.value() as i64)
        .bind(hex_b256(&transaction.hash))
        .bind(hex_b256(&transaction.block_hash))
        .bind(i64::from(transaction.block_number))
        .bind(transaction.index as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Merge `range` into the stored interval set inside an open transaction.
    async fn merge_interval_tx<'a>(
        tx: &mut sqlx::Transaction<'a, sqlx::Any>,
        chain_id: ChainId,
        fingerprint: &SourceFingerprint,
        range: BlockRange,
    ) -> Result<()> {
        let rows = sqlx::query(
            "SELECT from_block, to_block FROM intervals
             WHERE chain_id = $1 AND source_fingerprint = $2",
        )
        .bind(chain_id.value() as i64)
        .bind(fingerprint.as_str())
        .fetch_all(&mut **tx)
        .await?;

        let mut set = IntervalSet::from_ranges(
            rows.iter()
                .map(|row| {
                    let from: i64 = row.get("from_block");
                    let to: i64 = row.get("to_block");
                    BlockRange::new(from as u64, to as u64)
                })
                .collect(),
        );
        set.insert(range);

        sqlx::query("DELETE FROM intervals WHERE chain_id = $1 AND source_fingerprint = $2")
            .bind(chain_id.value() as i64)
            .bind(fingerprint.as_str())
            .execute(&mut **tx)
            .await?;

        for merged in set.ranges() {
            sqlx::query(
                "INSERT INTO intervals (chain_id, source_fingerprint, from_block, to_block)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(chain_id.value() as i64)
            .bind(fingerprint.as_str())
            .bind(i64::from(merged.from))
            .bind(i64::from(merged.to))
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for SqlCacheStore {
    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("cache schema ready");
        Ok(())
    }

    async fn insert_block(&self, block: &CachedBlock) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_block_tx(&mut tx, block).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_logs(&self, logs: &[CachedLog]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for log in logs {
            Self::insert_log_tx(&mut tx, log).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_transactions(&self, transactions: &[CachedTransaction]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for transaction in transactions {
            Self::insert_transaction_tx(&mut tx, transaction).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip_all, fields(chain = %chain_id, range = %range, logs = logs.len()))]
    async fn commit_slice(
        &self,
        chain_id: ChainId,
        fingerprint: &SourceFingerprint,
        range: BlockRange,
        logs: &[CachedLog],
        blocks: &[CachedBlock],
        transactions: &[CachedTransaction],
    ) -> Result<()> {
        let lock = self.interval_lock(fingerprint.as_str());
        let _guard = lock.lock().await;

        self.with_write_retry("commit_slice", || async move {
            let mut tx = self.pool.begin().await?;
            for block in blocks {
                Self::insert_block_tx(&mut tx, block).await?;
            }
            for log in logs {
                Self::insert_log_tx(&mut tx, log).await?;
            }
            for transaction in transactions {
                Self::insert_transaction_tx(&mut tx, transaction).await?;
            }
            Self::merge_interval_tx(&mut tx, chain_id, fingerprint, range).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        debug!("slice committed");
        Ok(())
    }

    async fn record_interval(
        &self,
        chain_id: ChainId,
        fingerprint: &SourceFingerprint,
        range: BlockRange,
    ) -> Result<()> {
        let lock = self.interval_lock(fingerprint.as_str());
        let _guard = lock.lock().await;

        self.with_write_retry("record_interval", || async move {
            let mut tx = self.pool.begin().await?;
            Self::merge_interval_tx(&mut tx, chain_id, fingerprint, range).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn cached_intervals(
        &self,
        chain_id: ChainId,
        fingerprint: &SourceFingerprint,
    ) -> Result<IntervalSet> {
        let rows = sqlx::query(
            "SELECT from_block, to_block FROM intervals
             WHERE chain_id = $1 AND source_fingerprint = $2
             ORDER BY from_block",
        )
        .bind(chain_id.value() as i64)
        .bind(fingerprint.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(IntervalSet::from_ranges(
            rows.iter()
                .map(|row| {
                    let from: i64 = row.get("from_block");
                    let to: i64 = row.get("to_block");
                    BlockRange::new(from as u64, to as u64)
                })
                .collect(),
        ))
    }

    async fn get_logs(&self, chain_id: ChainId, filter: &LogFilter) -> Result<Vec<CachedLog>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT chain_id, block_hash, log_index, address, block_number,
                    topic0, topic1, topic2, topic3, data, tx_hash, tx_index
             FROM logs
             WHERE chain_id = $1 AND block_number >= $2 AND block_number <= $3
             ORDER BY block_number, log_index",
        )
        .bind(chain_id.value() as i64)
        .bind(i64::from(filter.from_block))
        .bind(i64::from(filter.to_block))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        for row in rows {
            let log: CachedLog = row.try_into()?;
            if filter.matches(log.address, &log.topics, log.block_number) {
                out.push(log);
            }
        }
        Ok(out)
    }

    async fn get_block(&self, chain_id: ChainId, hash: B256) -> Result<Option<CachedBlock>> {
        let row = sqlx::query_as::<_, BlockRow>(
            "SELECT chain_id, hash, parent_hash, number, timestamp
             FROM blocks WHERE chain_id = $1 AND hash = $2",
        )
        .bind(chain_id.value() as i64)
        .bind(hex_b256(&hash))
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    #[instrument(skip(self), fields(chain = %chain_id, block = %block))]
    async fn delete_from_block(&self, chain_id: ChainId, block: BlockNumber) -> Result<()> {
        let chain = chain_id.value() as i64;
        let number = i64::from(block);

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM logs WHERE chain_id = $1 AND block_number >= $2")
            .bind(chain)
            .bind(number)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM blocks WHERE chain_id = $1 AND number >= $2")
            .bind(chain)
            .bind(number)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM transactions WHERE chain_id = $1 AND block_number >= $2")
            .bind(chain)
            .bind(number)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM intervals WHERE chain_id = $1 AND from_block >= $2")
            .bind(chain)
            .bind(number)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE intervals SET to_block = $2 - 1
             WHERE chain_id = $1 AND to_block >= $2 AND from_block < $2",
        )
        .bind(chain)
        .bind(number)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("purged cache from block");
        Ok(())
    }

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkpoints (chain_id, source_name, block_number, log_index)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (chain_id, source_name) DO UPDATE SET
                 block_number = excluded.block_number,
                 log_index = excluded.log_index",
        )
        .bind(checkpoint.chain_id.value() as i64)
        .bind(checkpoint.source_name.as_str())
        .bind(i64::from(checkpoint.block_number))
        .bind(checkpoint.log_index.value() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        chain_id: ChainId,
        source_name: &str,
    ) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT block_number, log_index FROM checkpoints
             WHERE chain_id = $1 AND source_name = $2",
        )
        .bind(chain_id.value() as i64)
        .bind(source_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let block: i64 = row.get("block_number");
            let log: i64 = row.get("log_index");
            Checkpoint {
                chain_id,
                source_name: source_name.to_owned(),
                block_number: BlockNumber::new(block as u64),
                log_index: LogIndex::new(log as u64),
            }
        }))
    }

    async fn delete_checkpoint(&self, chain_id: ChainId, source_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE chain_id = $1 AND source_name = $2")
            .bind(chain_id.value() as i64)
            .bind(source_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_log_before(
        &self,
        chain_id: ChainId,
        filter: &LogFilter,
        before: BlockNumber,
    ) -> Result<Option<(BlockNumber, LogIndex)>> {
        let bounded = LogFilter {
            from_block: BlockNumber::ZERO,
            to_block: before.prev(),
            ..filter.clone()
        };
        if before == BlockNumber::ZERO {
            return Ok(None);
        }
        let logs = self.get_logs(chain_id, &bounded).await?;
        Ok(logs.last().map(|log| (log.block_number, log.log_index)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn memory_store() -> SqlCacheStore {
        let store = SqlCacheStore::connect("sqlite://:memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn sample_block(number: u64, tag: u8) -> CachedBlock {
        CachedBlock {
            chain_id: ChainId::new(1),
            hash: B256::from([tag; 32]),
            parent_hash: B256::from([tag.wrapping_sub(1); 32]),
            number: BlockNumber::new(number),
            timestamp: number * 12,
        }
    }

    fn sample_log(block: &CachedBlock, index: u64) -> CachedLog {
        CachedLog {
            chain_id: block.chain_id,
            address: Address::from([0x01; 20]),
            block_hash: block.hash,
            block_number: block.number,
            log_index: LogIndex::new(index),
            topics: vec![B256::from([0xEE; 32])],
            data: Bytes::from(vec![0u8; 32]),
            transaction_hash: B256::from([0xFE; 32]),
            transaction_index: 0,
        }
    }

    fn full_range() -> LogFilter {
        LogFilter {
            from_block: BlockNumber::ZERO,
            to_block: BlockNumber::new(u64::MAX),
            ..LogFilter::default()
        }
    }

    #[tokio::test]
    async fn inserts_are_idempotent() {
        let store = memory_store().await;
        let block = sample_block(100, 0xAA);
        let log = sample_log(&block, 0);

        store.insert_block(&block).await.unwrap();
        store.insert_block(&block).await.unwrap();
        store.insert_logs(&[log.clone(), log.clone()]).await.unwrap();
        store.insert_logs(&[log]).await.unwrap();

        let logs = store.get_logs(ChainId::new(1), &full_range()).await.unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn slice_commit_is_atomic_and_merges_intervals() {
        let store = memory_store().await;
        let fp = SourceFingerprint::from_raw("test-source");
        let block = sample_block(100, 0xAA);
        let log = sample_log(&block, 0);
        let tx = log.transaction();

        store
            .commit_slice(
                ChainId::new(1),
                &fp,
                BlockRange::new(100, 150),
                &[log],
                std::slice::from_ref(&block),
                &[tx],
            )
            .await
            .unwrap();
        store
            .commit_slice(ChainId::new(1), &fp, BlockRange::new(151, 200), &[], &[], &[])
            .await
            .unwrap();

        let intervals = store.cached_intervals(ChainId::new(1), &fp).await.unwrap();
        assert_eq!(intervals.ranges(), &[BlockRange::new(100, 200)]);
    }

    #[tokio::test]
    async fn delete_from_block_truncates_everything() {
        let store = memory_store().await;
        let fp = SourceFingerprint::from_raw("test-source");
        let chain = ChainId::new(1);

        let b100 = sample_block(100, 0xAA);
        let b101 = sample_block(101, 0xBB);
        store
            .commit_slice(
                chain,
                &fp,
                BlockRange::new(100, 101),
                &[sample_log(&b100, 0), sample_log(&b101, 0)],
                &[b100.clone(), b101.clone()],
                &[],
            )
            .await
            .unwrap();

        store.delete_from_block(chain, BlockNumber::new(101)).await.unwrap();

        assert!(store.get_block(chain, b101.hash).await.unwrap().is_none());
        assert!(store.get_block(chain, b100.hash).await.unwrap().is_some());
        let logs = store.get_logs(chain, &full_range()).await.unwrap();
        assert_eq!(logs.len(), 1);
        let intervals = store.cached_intervals(chain, &fp).await.unwrap();
        assert_eq!(intervals.ranges(), &[BlockRange::new(100, 100)]);
    }

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let store = memory_store().await;
        let chain = ChainId::new(1);
        assert!(store.get_checkpoint(chain, "erc20").await.unwrap().is_none());

        let cp = Checkpoint {
            chain_id: chain,
            source_name: "erc20".into(),
            block_number: BlockNumber::new(102),
            log_index: LogIndex::new(0),
        };
        store.put_checkpoint(&cp).await.unwrap();
        assert_eq!(store.get_checkpoint(chain, "erc20").await.unwrap(), Some(cp.clone()));

        let advanced = Checkpoint { block_number: BlockNumber::new(110), ..cp };
        store.put_checkpoint(&advanced).await.unwrap();
        assert_eq!(
            store.get_checkpoint(chain, "erc20").await.unwrap().unwrap().block_number,
            BlockNumber::new(110)
        );

        store.delete_checkpoint(chain, "erc20").await.unwrap();
        assert!(store.get_checkpoint(chain, "erc20").await.unwrap().is_none());
    }
}
