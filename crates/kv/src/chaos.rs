//! Chaos injection wrapper for [`KeyValueService`] replicas.
//!
//! [`ChaosKeyValueService`] wraps any replica and injects configurable
//! failures: a hard fault (error or timeout), random errors, latency, and
//! range cursors that break after a number of rows.

use rand::Rng;
use ringkv_common::{
    Cell, ColumnSelection, KeyValueService, KvCursor, KvError, RangeRequest, RowCursor,
    RowResult, TimestampsByCell, Value,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// A persistent fault applied to every call until [`ChaosKeyValueService::recover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosFault {
    /// Fail immediately with an RPC error.
    Error,
    /// Wait out the configured latency, then fail with `Timeout`.
    Timeout,
}

/// Configuration for replica chaos injection.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of returning an error \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Fixed latency injected before forwarding.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
    /// Hard fault, if any.
    pub fault: Option<ChaosFault>,
    /// Range cursors fail after yielding this many rows.
    pub cursor_failure_after: Option<usize>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            fault: None,
            cursor_failure_after: None,
        }
    }
}

/// A [`KeyValueService`] wrapper that injects chaos.
pub struct ChaosKeyValueService<S: KeyValueService> {
    inner: Arc<S>,
    config: Arc<RwLock<ChaosConfig>>,
    completed: Arc<AtomicUsize>,
}

impl<S: KeyValueService> std::fmt::Debug for ChaosKeyValueService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosKeyValueService")
            .field("completed", &self.completed_calls())
            .finish_non_exhaustive()
    }
}

impl<S: KeyValueService> ChaosKeyValueService<S> {
    pub fn new(inner: S, config: ChaosConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            config: Arc::new(RwLock::new(config)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The wrapped replica, bypassing chaos.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Apply a hard fault to every subsequent call.
    pub async fn fail(&self, fault: ChaosFault) {
        self.config.write().await.fault = Some(fault);
    }

    /// Clear the hard fault.
    pub async fn recover(&self) {
        self.config.write().await.fault = None;
    }

    /// Dynamically update the random failure rate.
    pub async fn set_failure_rate(&self, rate: f64) {
        self.config.write().await.failure_rate = rate;
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.config.write().await.latency = latency;
    }

    /// Make range cursors opened from now on fail after `rows` rows.
    pub async fn fail_cursors_after(&self, rows: Option<usize>) {
        self.config.write().await.cursor_failure_after = rows;
    }

    /// Calls that ran to completion against the inner replica.
    pub fn completed_calls(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Apply chaos checks: returns Err if the request should fail.
    async fn maybe_fail(&self) -> Result<(), KvError> {
        let (delay, failure_rate, fault) = {
            let config = self.config.read().await;
            let jitter_ms = if config.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64)
            };
            let delay = config.latency + Duration::from_millis(jitter_ms);
            (delay, config.failure_rate, config.fault)
        };

        if fault == Some(ChaosFault::Error) {
            return Err(KvError::Rpc("chaos: replica marked as failed".into()));
        }

        // Inject latency
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if fault == Some(ChaosFault::Timeout) {
            return Err(KvError::Timeout);
        }

        // Random failure
        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(KvError::Rpc("chaos: random failure".into()));
        }

        Ok(())
    }

    async fn call<T>(&self, op: impl Future<Output = Result<T, KvError>>) -> Result<T, KvError> {
        self.maybe_fail().await?;
        let result = op.await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn wrap_cursor<T: Send + 'static>(&self, cursor: RowCursor<T>) -> RowCursor<T> {
        match self.config.read().await.cursor_failure_after {
            Some(rows) => Box::new(ChaosCursor {
                inner: cursor,
                remaining: rows,
            }),
            None => cursor,
        }
    }
}

/// Yields `remaining` rows from the inner cursor, then fails.
struct ChaosCursor<T> {
    inner: RowCursor<T>,
    remaining: usize,
}

#[async_trait::async_trait]
impl<T: Send + 'static> KvCursor<RowResult<T>> for ChaosCursor<T> {
    async fn next(&mut self) -> Result<Option<RowResult<T>>, KvError> {
        if self.remaining == 0 {
            return Err(KvError::Rpc("chaos: cursor failed mid-stream".into()));
        }
        self.remaining -= 1;
        self.inner.next().await
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

#[async_trait::async_trait]
impl<S: KeyValueService> KeyValueService for ChaosKeyValueService<S> {
    async fn get_rows(
        &self,
        table: &str,
        rows: &[Vec<u8>],
        columns: &ColumnSelection,
        timestamp: i64,
    ) -> Result<HashMap<Cell, Value>, KvError> {
        self.call(self.inner.get_rows(table, rows, columns, timestamp))
            .await
    }

    async fn get(
        &self,
        table: &str,
        timestamp_by_cell: &HashMap<Cell, i64>,
    ) -> Result<HashMap<Cell, Value>, KvError> {
        self.call(self.inner.get(table, timestamp_by_cell)).await
    }

    async fn get_latest_timestamps(
        &self,
        table: &str,
        timestamp_by_cell: &HashMap<Cell, i64>,
    ) -> Result<HashMap<Cell, i64>, KvError> {
        self.call(self.inner.get_latest_timestamps(table, timestamp_by_cell))
            .await
    }

    async fn get_all_timestamps(
        &self,
        table: &str,
        cells: &HashSet<Cell>,
        timestamp: i64,
    ) -> Result<TimestampsByCell, KvError> {
        self.call(self.inner.get_all_timestamps(table, cells, timestamp))
            .await
    }

    async fn get_range(
        &self,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<Value>, KvError> {
        let cursor = self
            .call(self.inner.get_range(table, range, timestamp))
            .await?;
        Ok(self.wrap_cursor(cursor).await)
    }

    async fn get_range_with_history(
        &self,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<BTreeSet<Value>>, KvError> {
        let cursor = self
            .call(self.inner.get_range_with_history(table, range, timestamp))
            .await?;
        Ok(self.wrap_cursor(cursor).await)
    }

    async fn get_range_of_timestamps(
        &self,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<BTreeSet<i64>>, KvError> {
        let cursor = self
            .call(self.inner.get_range_of_timestamps(table, range, timestamp))
            .await?;
        Ok(self.wrap_cursor(cursor).await)
    }

    async fn put(
        &self,
        table: &str,
        values: &HashMap<Cell, Vec<u8>>,
        timestamp: i64,
    ) -> Result<(), KvError> {
        self.call(self.inner.put(table, values, timestamp)).await
    }

    async fn put_with_timestamps(
        &self,
        table: &str,
        values: &[(Cell, Value)],
    ) -> Result<(), KvError> {
        self.call(self.inner.put_with_timestamps(table, values))
            .await
    }

    async fn put_unless_exists(
        &self,
        table: &str,
        values: &HashMap<Cell, Vec<u8>>,
    ) -> Result<(), KvError> {
        self.call(self.inner.put_unless_exists(table, values)).await
    }

    async fn delete(&self, table: &str, keys: &[(Cell, i64)]) -> Result<(), KvError> {
        self.call(self.inner.delete(table, keys)).await
    }

    async fn add_garbage_collection_sentinel_values(
        &self,
        table: &str,
        cells: &HashSet<Cell>,
    ) -> Result<(), KvError> {
        self.call(self.inner.add_garbage_collection_sentinel_values(table, cells))
            .await
    }

    async fn create_table(&self, table: &str, max_value_size: usize) -> Result<(), KvError> {
        self.call(self.inner.create_table(table, max_value_size))
            .await
    }

    async fn drop_table(&self, table: &str) -> Result<(), KvError> {
        self.call(self.inner.drop_table(table)).await
    }

    async fn truncate_table(&self, table: &str) -> Result<(), KvError> {
        self.call(self.inner.truncate_table(table)).await
    }

    async fn get_all_table_names(&self) -> Result<BTreeSet<String>, KvError> {
        self.call(self.inner.get_all_table_names()).await
    }

    async fn get_metadata_for_table(&self, table: &str) -> Result<Vec<u8>, KvError> {
        self.call(self.inner.get_metadata_for_table(table)).await
    }

    async fn put_metadata_for_table(&self, table: &str, metadata: &[u8]) -> Result<(), KvError> {
        self.call(self.inner.put_metadata_for_table(table, metadata))
            .await
    }

    async fn get_metadata_for_tables(&self) -> Result<HashMap<String, Vec<u8>>, KvError> {
        self.call(self.inner.get_metadata_for_tables()).await
    }

    async fn compact_internally(&self, table: &str) -> Result<(), KvError> {
        self.call(self.inner.compact_internally(table)).await
    }

    async fn initialize_from_fresh_instance(&self) -> Result<(), KvError> {
        self.call(self.inner.initialize_from_fresh_instance()).await
    }

    async fn close(&self) -> Result<(), KvError> {
        self.call(self.inner.close()).await
    }

    async fn teardown(&self) -> Result<(), KvError> {
        self.call(self.inner.teardown()).await
    }
}

// ────────────────────────── Tests ──────────────────────────
