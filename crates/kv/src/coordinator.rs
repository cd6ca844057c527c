//! Partitioned coordinator: serves the key-value contract by fanning each
//! logical operation out to replicas.
//!
//! For every quorum operation the coordinator:
//! 1. Snapshots the partition map and groups the keys by replica
//! 2. Builds a [`QuorumTracker`] over the operation's tracking units
//! 3. Spawns one task per (replica, key subset) and registers it against
//!    the units it carries
//! 4. Drains completions in completion order, merging successes and
//!    failing fast once any unit can no longer reach quorum
//! 5. Cancels outstanding tasks: always for reads, only on failure for writes
//!
//! Table and metadata operations skip quorum: writes are broadcast to every
//! replica and reads fall back from replica to replica.

use crate::batch::LiveRowScan;
use crate::merge;
use crate::partition_map::{PartitionMap, Replica};
use crate::provider::PartitionMapProvider;
use crate::quorum::{PendingRef, QuorumParameters, QuorumRequestParameters, QuorumTracker};
use crate::range::{LatestValue, PartitionedRangeScan, RowMerge, TimestampSet, ValueHistory};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use ringkv_common::{
    Cell, ColumnSelection, KeyValueService, KvError, RangeRequest, RowCursor, TimestampsByCell,
    Value,
};
use ringkv_config::{CoordinatorConfig, ScanConfig};
use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::task::AbortHandle;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Task handles
// ---------------------------------------------------------------------------

/// A spawned replica call, identified by its submission ticket.
#[derive(Debug)]
struct TaskRef {
    ticket: usize,
    abort: AbortHandle,
}

impl PartialEq for TaskRef {
    fn eq(&self, other: &Self) -> bool {
        self.ticket == other.ticket
    }
}

impl Eq for TaskRef {}

impl Hash for TaskRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ticket.hash(state);
    }
}

impl Borrow<usize> for TaskRef {
    fn borrow(&self) -> &usize {
        &self.ticket
    }
}

impl PendingRef for TaskRef {
    fn cancel(&self) {
        self.abort.abort();
    }
}

/// Aborts every held task when dropped.
#[derive(Debug, Default)]
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Outstanding calls are cancelled once a verdict is reached or the
    /// request is dropped.
    Read,
    /// Outstanding calls keep running after success.
    Write,
}

#[derive(Debug, Clone, Copy)]
struct RequestContext<'a> {
    operation: &'static str,
    table: &'a str,
    request_id: Uuid,
    mode: Mode,
}

/// One replica call, given the replica's service and its share of the keys.
type ReplicaCall<K, T> =
    Box<dyn Fn(Arc<dyn KeyValueService>, Vec<K>) -> BoxFuture<'static, Result<T, KvError>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Key-value service over a partitioned, replicated set of endpoints.
///
/// Generic over `M: PartitionMap` so tests can route with simple doubles;
/// deployments use [`crate::ring::HashRingPartitionMap`].
pub struct PartitionedKeyValueService<M: PartitionMap> {
    quorum: QuorumParameters,
    scan: ScanConfig,
    partition_map: PartitionMapProvider<M>,
}

impl<M: PartitionMap> std::fmt::Debug for PartitionedKeyValueService<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedKeyValueService")
            .field("quorum", &self.quorum)
            .field("scan", &self.scan)
            .finish_non_exhaustive()
    }
}

impl<M: PartitionMap> PartitionedKeyValueService<M> {
    pub fn new(quorum: QuorumParameters, partition_map: M) -> Self {
        Self {
            quorum,
            scan: ScanConfig::default(),
            partition_map: PartitionMapProvider::new(partition_map),
        }
    }

    /// Build a coordinator from validated configuration.
    pub fn from_config(config: &CoordinatorConfig, partition_map: M) -> Result<Self, KvError> {
        config
            .validate()
            .map_err(|e| KvError::InvalidConfig(e.to_string()))?;
        let quorum = QuorumParameters::try_from(&config.quorum)?;
        Ok(Self {
            quorum,
            scan: config.scan.clone(),
            partition_map: PartitionMapProvider::new(partition_map),
        })
    }

    pub fn quorum_parameters(&self) -> QuorumParameters {
        self.quorum
    }

    pub fn scan_config(&self) -> &ScanConfig {
        &self.scan
    }

    /// The partition map new operations will route with.
    pub async fn partition_map(&self) -> Arc<M> {
        self.partition_map.snapshot().await
    }

    /// Install a strictly newer partition map. In-flight operations keep the
    /// snapshot they started with.
    pub async fn update_partition_map(&self, map: M) -> Result<(), KvError> {
        self.partition_map.update(map).await
    }

    /// Scan `range` for live rows with adaptive page sizing.
    pub fn live_rows(
        self: &Arc<Self>,
        table: &str,
        range: RangeRequest,
        timestamp: i64,
    ) -> Result<LiveRowScan<Self>, KvError> {
        LiveRowScan::new(self.clone(), table, range, timestamp, &self.scan)
    }

    fn context<'a>(&self, operation: &'static str, table: &'a str, mode: Mode) -> RequestContext<'a> {
        RequestContext {
            operation,
            table,
            request_id: Uuid::new_v4(),
            mode,
        }
    }

    // -----------------------------------------------------------------------
    // Quorum fan-out
    // -----------------------------------------------------------------------

    /// Run one call per `(replica, keys)` group and drain completions into
    /// `acc` until every unit has a verdict.
    #[allow(clippy::too_many_arguments)]
    async fn execute<K, U, T, A>(
        &self,
        ctx: RequestContext<'_>,
        params: QuorumRequestParameters,
        units: impl IntoIterator<Item = U>,
        plan: Vec<(Replica, Vec<K>)>,
        unit_of: impl Fn(&K) -> U,
        call: ReplicaCall<K, T>,
        mut acc: A,
        merge: impl Fn(&mut A, T),
    ) -> Result<A, KvError>
    where
        U: Eq + Hash + Clone,
        T: Send + 'static,
    {
        let _timer = ringkv_metrics::start_request_timer(ctx.operation);
        let mut tracker: QuorumTracker<TaskRef, U> = QuorumTracker::of(units, params);

        let mut pending = FuturesUnordered::new();
        // Reads abandoned mid-flight take their replica calls down with them.
        let mut abandon = AbortOnDrop::default();
        for (ticket, (replica, keys)) in plan.into_iter().enumerate() {
            let covered: Vec<U> = keys.iter().map(&unit_of).collect();
            let replica_id = replica.id().to_string();
            let handle = tokio::spawn(call(replica.service().clone(), keys));
            if ctx.mode == Mode::Read {
                abandon.0.push(handle.abort_handle());
            }
            tracker.register_ref(
                TaskRef {
                    ticket,
                    abort: handle.abort_handle(),
                },
                covered,
            );
            pending.push(handle.map(move |joined| (ticket, replica_id, joined)));
        }

        let mut successes = 0usize;
        while !tracker.finished() {
            let Some((ticket, replica, joined)) = pending.next().await else {
                ringkv_metrics::metrics()
                    .quorum_failures
                    .with_label_values(&[ctx.operation])
                    .inc();
                return Err(KvError::InsufficientReplicas {
                    operation: ctx.operation,
                    needed: params.success_factor(),
                    got: successes,
                });
            };
            if !tracker.is_outstanding(&ticket) {
                continue;
            }

            let result = joined
                .map_err(|e| KvError::TaskFailed(e.to_string()))
                .and_then(|r| r);
            match result {
                Ok(partial) => {
                    merge(&mut acc, partial);
                    tracker.handle_success(&ticket);
                    successes += 1;
                }
                Err(error) => {
                    tracker.handle_failure(&ticket);
                    if tracker.failed() {
                        tracing::warn!(
                            operation = ctx.operation,
                            table = ctx.table,
                            replica = %replica,
                            request_id = %ctx.request_id,
                            error = %error,
                            "quorum unreachable"
                        );
                        ringkv_metrics::metrics()
                            .quorum_failures
                            .with_label_values(&[ctx.operation])
                            .inc();
                        cancel_outstanding(&mut tracker);
                        return Err(KvError::InsufficientConsistency {
                            operation: ctx.operation,
                            table: ctx.table.to_string(),
                            source: Box::new(error),
                        });
                    }
                    tracing::warn!(
                        operation = ctx.operation,
                        table = ctx.table,
                        replica = %replica,
                        request_id = %ctx.request_id,
                        error = %error,
                        "absorbed replica failure"
                    );
                    ringkv_metrics::metrics()
                        .absorbed_replica_failures
                        .with_label_values(&[ctx.operation])
                        .inc();
                }
            }
        }

        match ctx.mode {
            Mode::Read => cancel_outstanding(&mut tracker),
            Mode::Write => {
                tracker.cancel(false);
            }
        }
        Ok(acc)
    }

    // -----------------------------------------------------------------------
    // Broadcast and fallback
    // -----------------------------------------------------------------------

    /// Apply a side effect on every replica in turn; the first error aborts.
    async fn broadcast<F, Fut>(&self, operation: &'static str, call: F) -> Result<(), KvError>
    where
        F: Fn(Arc<dyn KeyValueService>) -> Fut,
        Fut: Future<Output = Result<(), KvError>>,
    {
        let _timer = ringkv_metrics::start_request_timer(operation);
        let map = self.partition_map.snapshot().await;
        for replica in map.list_replicas() {
            if let Err(error) = call(replica.service().clone()).await {
                tracing::warn!(
                    operation,
                    replica = %replica.id(),
                    error = %error,
                    "broadcast failed"
                );
                return Err(error);
            }
        }
        Ok(())
    }

    /// Try each replica in turn until one answers; propagate the last error
    /// if none does.
    async fn retry_until_success<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, KvError>
    where
        F: Fn(Arc<dyn KeyValueService>) -> Fut,
        Fut: Future<Output = Result<T, KvError>>,
    {
        let _timer = ringkv_metrics::start_request_timer(operation);
        let map = self.partition_map.snapshot().await;
        let mut last_error = None;
        for replica in map.list_replicas() {
            match call(replica.service().clone()).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    tracing::warn!(
                        operation,
                        replica = %replica.id(),
                        error = %error,
                        "fallback read failed, trying next replica"
                    );
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or(KvError::NoReplicas(operation)))
    }

    async fn range_scan<S: RowMerge>(
        &self,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<S::Payload>, KvError> {
        ringkv_metrics::metrics()
            .requests
            .with_label_values(&[S::OPERATION])
            .inc();
        let map = self.partition_map.snapshot().await;
        let plan = map.plan_range_read(table, range);
        Ok(Box::new(PartitionedRangeScan::<S>::new(table, timestamp, plan)))
    }
}

fn cancel_outstanding<U: Eq + Hash + Clone>(tracker: &mut QuorumTracker<TaskRef, U>) {
    let cancelled = tracker.cancel(true);
    if cancelled > 0 {
        ringkv_metrics::metrics()
            .cancelled_tasks
            .inc_by(cancelled as u64);
    }
}

fn entries<K: Clone, V: Clone>(map: &HashMap<K, V>) -> Vec<(K, V)> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn first_cell<T>(entry: &(Cell, T)) -> Cell {
    entry.0.clone()
}

// ---------------------------------------------------------------------------
// KeyValueService
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl<M: PartitionMap> KeyValueService for PartitionedKeyValueService<M> {
    async fn get_rows(
        &self,
        table: &str,
        rows: &[Vec<u8>],
        columns: &ColumnSelection,
        timestamp: i64,
    ) -> Result<HashMap<Cell, Value>, KvError> {
        let map = self.partition_map.snapshot().await;
        let plan = map.plan_cell_read(table, rows.iter().cloned());
        let owned_table = table.to_string();
        let columns = columns.clone();
        let call: ReplicaCall<Vec<u8>, HashMap<Cell, Value>> = Box::new(move |service, rows| {
            let table = owned_table.clone();
            let columns = columns.clone();
            async move { service.get_rows(&table, &rows, &columns, timestamp).await }.boxed()
        });
        self.execute(
            self.context("get_rows", table, Mode::Read),
            self.quorum.read_request_parameters(),
            rows.iter().cloned(),
            plan,
            Vec::<u8>::clone,
            call,
            HashMap::new(),
            merge::merge_latest_values,
        )
        .await
    }

    async fn get(
        &self,
        table: &str,
        timestamp_by_cell: &HashMap<Cell, i64>,
    ) -> Result<HashMap<Cell, Value>, KvError> {
        let map = self.partition_map.snapshot().await;
        let plan = map.plan_cell_read(table, entries(timestamp_by_cell));
        let owned_table = table.to_string();
        let call: ReplicaCall<(Cell, i64), HashMap<Cell, Value>> = Box::new(move |service, keys| {
            let table = owned_table.clone();
            async move {
                let request: HashMap<Cell, i64> = keys.into_iter().collect();
                service.get(&table, &request).await
            }
            .boxed()
        });
        self.execute(
            self.context("get", table, Mode::Read),
            self.quorum.read_request_parameters(),
            timestamp_by_cell.keys().cloned(),
            plan,
            first_cell,
            call,
            HashMap::new(),
            merge::merge_latest_values,
        )
        .await
    }

    async fn get_latest_timestamps(
        &self,
        table: &str,
        timestamp_by_cell: &HashMap<Cell, i64>,
    ) -> Result<HashMap<Cell, i64>, KvError> {
        let map = self.partition_map.snapshot().await;
        let plan = map.plan_cell_read(table, entries(timestamp_by_cell));
        let owned_table = table.to_string();
        let call: ReplicaCall<(Cell, i64), HashMap<Cell, i64>> = Box::new(move |service, keys| {
            let table = owned_table.clone();
            async move {
                let request: HashMap<Cell, i64> = keys.into_iter().collect();
                service.get_latest_timestamps(&table, &request).await
            }
            .boxed()
        });
        self.execute(
            self.context("get_latest_timestamps", table, Mode::Read),
            self.quorum.read_request_parameters(),
            timestamp_by_cell.keys().cloned(),
            plan,
            first_cell,
            call,
            HashMap::new(),
            merge::merge_latest_timestamps,
        )
        .await
    }

    async fn get_all_timestamps(
        &self,
        table: &str,
        cells: &HashSet<Cell>,
        timestamp: i64,
    ) -> Result<TimestampsByCell, KvError> {
        let map = self.partition_map.snapshot().await;
        let plan = map.plan_cell_read(table, cells.iter().cloned());
        let owned_table = table.to_string();
        let call: ReplicaCall<Cell, TimestampsByCell> = Box::new(move |service, keys| {
            let table = owned_table.clone();
            async move {
                let request: HashSet<Cell> = keys.into_iter().collect();
                service.get_all_timestamps(&table, &request, timestamp).await
            }
            .boxed()
        });
        self.execute(
            self.context("get_all_timestamps", table, Mode::Read),
            self.quorum.no_failure_request_parameters(),
            cells.iter().cloned(),
            plan,
            Cell::clone,
            call,
            HashMap::new(),
            merge::merge_all_timestamps,
        )
        .await
    }

    async fn get_range(
        &self,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<Value>, KvError> {
        self.range_scan::<LatestValue>(table, range, timestamp).await
    }

    async fn get_range_with_history(
        &self,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<BTreeSet<Value>>, KvError> {
        self.range_scan::<ValueHistory>(table, range, timestamp).await
    }

    async fn get_range_of_timestamps(
        &self,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<BTreeSet<i64>>, KvError> {
        self.range_scan::<TimestampSet>(table, range, timestamp).await
    }

    async fn put(
        &self,
        table: &str,
        values: &HashMap<Cell, Vec<u8>>,
        timestamp: i64,
    ) -> Result<(), KvError> {
        let map = self.partition_map.snapshot().await;
        let plan = map.plan_cell_write(table, entries(values));
        let owned_table = table.to_string();
        let call: ReplicaCall<(Cell, Vec<u8>), ()> = Box::new(move |service, keys| {
            let table = owned_table.clone();
            async move {
                let request: HashMap<Cell, Vec<u8>> = keys.into_iter().collect();
                service.put(&table, &request, timestamp).await
            }
            .boxed()
        });
        self.execute(
            self.context("put", table, Mode::Write),
            self.quorum.write_request_parameters(),
            values.keys().cloned(),
            plan,
            first_cell,
            call,
            (),
            merge::merge_nothing,
        )
        .await
    }

    async fn put_with_timestamps(
        &self,
        table: &str,
        values: &[(Cell, Value)],
    ) -> Result<(), KvError> {
        let map = self.partition_map.snapshot().await;
        let plan = map.plan_cell_write(table, values.iter().cloned());
        let owned_table = table.to_string();
        let call: ReplicaCall<(Cell, Value), ()> = Box::new(move |service, keys| {
            let table = owned_table.clone();
            async move { service.put_with_timestamps(&table, &keys).await }.boxed()
        });
        self.execute(
            self.context("put_with_timestamps", table, Mode::Write),
            self.quorum.write_request_parameters(),
            values.iter().cloned(),
            plan,
            <(Cell, Value)>::clone,
            call,
            (),
            merge::merge_nothing,
        )
        .await
    }

    async fn put_unless_exists(
        &self,
        table: &str,
        values: &HashMap<Cell, Vec<u8>>,
    ) -> Result<(), KvError> {
        let map = self.partition_map.snapshot().await;
        let plan = map.plan_cell_write(table, entries(values));
        let owned_table = table.to_string();
        let call: ReplicaCall<(Cell, Vec<u8>), ()> = Box::new(move |service, keys| {
            let table = owned_table.clone();
            async move {
                let request: HashMap<Cell, Vec<u8>> = keys.into_iter().collect();
                service.put_unless_exists(&table, &request).await
            }
            .boxed()
        });
        self.execute(
            self.context("put_unless_exists", table, Mode::Write),
            self.quorum.write_request_parameters(),
            values.keys().cloned(),
            plan,
            first_cell,
            call,
            (),
            merge::merge_nothing,
        )
        .await
    }

    async fn delete(&self, table: &str, keys: &[(Cell, i64)]) -> Result<(), KvError> {
        let map = self.partition_map.snapshot().await;
        let plan = map.plan_cell_write(table, keys.iter().cloned());
        let owned_table = table.to_string();
        let call: ReplicaCall<(Cell, i64), ()> = Box::new(move |service, keys| {
            let table = owned_table.clone();
            async move { service.delete(&table, &keys).await }.boxed()
        });
        self.execute(
            self.context("delete", table, Mode::Write),
            self.quorum.no_failure_request_parameters(),
            keys.iter().cloned(),
            plan,
            <(Cell, i64)>::clone,
            call,
            (),
            merge::merge_nothing,
        )
        .await
    }

    async fn add_garbage_collection_sentinel_values(
        &self,
        table: &str,
        cells: &HashSet<Cell>,
    ) -> Result<(), KvError> {
        let map = self.partition_map.snapshot().await;
        let plan = map.plan_cell_write(table, cells.iter().cloned());
        let owned_table = table.to_string();
        let call: ReplicaCall<Cell, ()> = Box::new(move |service, keys| {
            let table = owned_table.clone();
            async move {
                let request: HashSet<Cell> = keys.into_iter().collect();
                service
                    .add_garbage_collection_sentinel_values(&table, &request)
                    .await
            }
            .boxed()
        });
        self.execute(
            self.context("add_garbage_collection_sentinel_values", table, Mode::Write),
            self.quorum.write_request_parameters(),
            cells.iter().cloned(),
            plan,
            Cell::clone,
            call,
            (),
            merge::merge_nothing,
        )
        .await
    }

    // -- tables and metadata ------------------------------------------------

    async fn create_table(&self, table: &str, max_value_size: usize) -> Result<(), KvError> {
        self.broadcast("create_table", move |s| async move {
            s.create_table(table, max_value_size).await
        })
        .await
    }

    async fn drop_table(&self, table: &str) -> Result<(), KvError> {
        self.broadcast("drop_table", move |s| async move { s.drop_table(table).await })
            .await
    }

    async fn truncate_table(&self, table: &str) -> Result<(), KvError> {
        self.broadcast("truncate_table", move |s| async move { s.truncate_table(table).await })
            .await
    }

    async fn get_all_table_names(&self) -> Result<BTreeSet<String>, KvError> {
        self.retry_until_success("get_all_table_names", move |s| async move {
            s.get_all_table_names().await
        })
        .await
    }

    async fn get_metadata_for_table(&self, table: &str) -> Result<Vec<u8>, KvError> {
        self.retry_until_success("get_metadata_for_table", move |s| async move {
            s.get_metadata_for_table(table).await
        })
        .await
    }

    async fn put_metadata_for_table(&self, table: &str, metadata: &[u8]) -> Result<(), KvError> {
        self.broadcast("put_metadata_for_table", move |s| async move {
            s.put_metadata_for_table(table, metadata).await
        })
        .await
    }

    async fn get_metadata_for_tables(&self) -> Result<HashMap<String, Vec<u8>>, KvError> {
        self.retry_until_success("get_metadata_for_tables", move |s| async move {
            s.get_metadata_for_tables().await
        })
        .await
    }

    // -- lifecycle ------------------------------------------------------------

    async fn compact_internally(&self, table: &str) -> Result<(), KvError> {
        self.broadcast("compact_internally", move |s| async move {
            s.compact_internally(table).await
        })
        .await
    }

    async fn initialize_from_fresh_instance(&self) -> Result<(), KvError> {
        self.broadcast("initialize_from_fresh_instance", move |s| async move {
            s.initialize_from_fresh_instance().await
        })
        .await
    }

    async fn close(&self) -> Result<(), KvError> {
        self.broadcast("close", move |s| async move { s.close().await })
            .await
    }

    async fn teardown(&self) -> Result<(), KvError> {
        self.broadcast("teardown", move |s| async move { s.teardown().await })
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaos::{ChaosConfig, ChaosFault, ChaosKeyValueService};
    use crate::ring::HashRingPartitionMap;
    use ringkv_common::read_range;
    use ringkv_storage::MemoryKeyValueService;

    const T: &str = "tbl";

    type Chaos = Arc<ChaosKeyValueService<MemoryKeyValueService>>;

    /// `n` chaos-wrapped replicas, all owning every row (one token each, rf = n).
    async fn cluster(
        n: usize,
        read: usize,
        write: usize,
    ) -> (PartitionedKeyValueService<HashRingPartitionMap>, Vec<Chaos>) {
        let mut handles = Vec::new();
        let mut replicas = Vec::new();
        for i in 0..n {
            let chaos = Arc::new(ChaosKeyValueService::new(
                MemoryKeyValueService::new(),
                ChaosConfig::default(),
            ));
            replicas.push(Replica::new(format!("r{}", i), chaos.clone()));
            handles.push(chaos);
        }
        let map = HashRingPartitionMap::evenly_spaced(1, n, replicas).unwrap();
        let kvs = PartitionedKeyValueService::new(QuorumParameters::new(n, read, write).unwrap(), map);
        kvs.create_table(T, 1024).await.unwrap();
        (kvs, handles)
    }

    fn cell(row: &str) -> Cell {
        Cell::new(row.as_bytes().to_vec(), b"c".to_vec())
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (kvs, _) = cluster(3, 2, 2).await;
        kvs.put(T, &HashMap::from([(cell("a"), b"v".to_vec())]), 5)
            .await
            .unwrap();

        let got = kvs.get(T, &HashMap::from([(cell("a"), 6)])).await.unwrap();
        assert_eq!(got[&cell("a")], Value::new(b"v".to_vec(), 5));

        let latest = kvs
            .get_latest_timestamps(T, &HashMap::from([(cell("a"), 100)]))
            .await
            .unwrap();
        assert_eq!(latest[&cell("a")], 5);
    }

    #[tokio::test]
    async fn test_zero_units_finish_immediately() {
        let (kvs, _) = cluster(3, 2, 2).await;
        assert!(kvs.get(T, &HashMap::new()).await.unwrap().is_empty());
        kvs.put(T, &HashMap::new(), 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_merges_newest_version_across_replicas() {
        let (kvs, replicas) = cluster(3, 2, 2).await;
        // Only r2 saw the newer write; r0 is down, so r1 and r2 form the quorum.
        for (i, r) in replicas.iter().enumerate() {
            let ts = if i == 2 { 9 } else { 3 };
            r.inner()
                .put(T, &HashMap::from([(cell("a"), format!("v{}", ts).into_bytes())]), ts)
                .await
                .unwrap();
        }
        replicas[0].fail(ChaosFault::Error).await;

        let rows = vec![b"a".to_vec()];
        let got = kvs.get_rows(T, &rows, &ColumnSelection::All, 100).await.unwrap();
        assert_eq!(got[&cell("a")], Value::new(b"v9".to_vec(), 9));
    }

    #[tokio::test]
    async fn test_read_absorbs_one_failure() {
        let (kvs, replicas) = cluster(3, 2, 2).await;
        kvs.put(T, &HashMap::from([(cell("a"), b"v".to_vec())]), 5)
            .await
            .unwrap();
        replicas[1].fail(ChaosFault::Error).await;

        let got = kvs.get(T, &HashMap::from([(cell("a"), 6)])).await.unwrap();
        assert_eq!(got[&cell("a")].contents(), b"v");
    }

    #[tokio::test]
    async fn test_all_timestamps_tolerates_no_failure() {
        let (kvs, replicas) = cluster(3, 2, 2).await;
        replicas[0].fail(ChaosFault::Error).await;

        let err = kvs
            .get_all_timestamps(T, &HashSet::from([cell("a")]), 10)
            .await
            .unwrap_err();
        match err {
            KvError::InsufficientConsistency { operation, source, .. } => {
                assert_eq!(operation, "get_all_timestamps");
                assert!(matches!(*source, KvError::Rpc(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_tolerates_no_failure() {
        let (kvs, replicas) = cluster(3, 2, 2).await;
        replicas[2].fail(ChaosFault::Error).await;
        let err = kvs.delete(T, &[(cell("a"), 1)]).await.unwrap_err();
        assert!(err.is_quorum_failure());
    }

    #[tokio::test]
    async fn test_put_unless_exists_conflict_is_quorum_failure() {
        let (kvs, _) = cluster(3, 2, 2).await;
        let values = HashMap::from([(cell("a"), b"first".to_vec())]);
        kvs.put_unless_exists(T, &values).await.unwrap();

        let err = kvs.put_unless_exists(T, &values).await.unwrap_err();
        match err {
            KvError::InsufficientConsistency { source, .. } => {
                assert!(matches!(*source, KvError::KeyAlreadyExists(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_too_few_replicas_is_insufficient() {
        // The ring only holds one endpoint while quorum expects three replicas.
        let replica = Replica::new("only", Arc::new(MemoryKeyValueService::new()));
        let map = HashRingPartitionMap::evenly_spaced(1, 3, vec![replica]).unwrap();
        let kvs = PartitionedKeyValueService::new(QuorumParameters::new(3, 2, 2).unwrap(), map);
        kvs.create_table(T, 16).await.unwrap();

        let err = kvs.get(T, &HashMap::from([(cell("a"), 1)])).await.unwrap_err();
        assert!(matches!(
            err,
            KvError::InsufficientReplicas { needed: 2, got: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_sentinels_and_put_with_timestamps() {
        let (kvs, _) = cluster(3, 2, 2).await;
        kvs.put_with_timestamps(T, &[(cell("a"), Value::new(b"x".to_vec(), 4))])
            .await
            .unwrap();
        kvs.add_garbage_collection_sentinel_values(T, &HashSet::from([cell("b")]))
            .await
            .unwrap();

        let got = kvs
            .get(T, &HashMap::from([(cell("a"), 10), (cell("b"), 10)]))
            .await
            .unwrap();
        assert_eq!(got[&cell("a")].timestamp(), 4);
        assert_eq!(got[&cell("b")], Value::sentinel());

        let stamps = kvs
            .get_all_timestamps(T, &HashSet::from([cell("a")]), 10)
            .await
            .unwrap();
        assert_eq!(stamps[&cell("a")], BTreeSet::from([4]));
    }

    #[tokio::test]
    async fn test_range_read_through_coordinator() {
        let (kvs, _) = cluster(3, 2, 2).await;
        let values: HashMap<Cell, Vec<u8>> = ["a", "m", "z"]
            .iter()
            .map(|r| (cell(r), r.as_bytes().to_vec()))
            .collect();
        kvs.put(T, &values, 1).await.unwrap();

        let rows = read_range(&kvs, T, &RangeRequest::all(), 5).await.unwrap();
        let keys: Vec<&[u8]> = rows.iter().map(|r| r.row()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"m".as_slice(), b"z".as_slice()]);

        let pages = kvs
            .get_first_batch_for_ranges(T, &[RangeRequest::all().with_batch_hint(2)], 5)
            .await
            .unwrap();
        assert_eq!(pages.values().next().map(|p| p.results.len()), Some(2));
    }

    #[tokio::test]
    async fn test_metadata_broadcast_and_fallback() {
        let (kvs, replicas) = cluster(3, 2, 2).await;
        kvs.put_metadata_for_table(T, b"meta").await.unwrap();

        replicas[0].fail(ChaosFault::Error).await;
        assert_eq!(kvs.get_metadata_for_table(T).await.unwrap(), b"meta".to_vec());
        // A broadcast write needs every replica.
        assert!(kvs.put_metadata_for_table(T, b"other").await.is_err());

        for r in &replicas {
            r.fail(ChaosFault::Error).await;
        }
        assert!(matches!(
            kvs.get_all_table_names().await,
            Err(KvError::Rpc(_))
        ));
    }

    #[tokio::test]
    async fn test_update_partition_map() {
        let (kvs, _) = cluster(3, 2, 2).await;
        let stale = HashRingPartitionMap::new(1, 3, Vec::new()).unwrap();
        assert!(matches!(
            kvs.update_partition_map(stale).await,
            Err(KvError::VersionTooOld { .. })
        ));

        let newer = HashRingPartitionMap::new(2, 3, Vec::new()).unwrap();
        kvs.update_partition_map(newer).await.unwrap();
        assert_eq!(kvs.partition_map().await.version(), 2);
        assert!(matches!(
            kvs.get_all_table_names().await,
            Err(KvError::NoReplicas(_))
        ));
    }

    #[test]
    fn test_from_config_validates() {
        let map = HashRingPartitionMap::new(1, 3, Vec::new()).unwrap();
        let mut config = CoordinatorConfig::default();
        config.quorum.read_factor = 4;
        assert!(matches!(
            PartitionedKeyValueService::from_config(&config, map),
            Err(KvError::InvalidConfig(_))
        ));

        let map = HashRingPartitionMap::new(1, 3, Vec::new()).unwrap();
        let kvs = PartitionedKeyValueService::from_config(&CoordinatorConfig::default(), map).unwrap();
        assert_eq!(kvs.quorum_parameters().read_factor(), 2);
        assert_eq!(kvs.scan_config().starting_batch_size, 100);
    }

    #[tokio::test]
    async fn test_live_rows_over_coordinator() {
        let (kvs, _) = cluster(3, 2, 2).await;
        let values: HashMap<Cell, Vec<u8>> = (0..30)
            .map(|i| {
                let contents = if i % 3 == 0 { b"x".to_vec() } else { Vec::new() };
                (cell(&format!("row{:02}", i)), contents)
            })
            .collect();
        kvs.put(T, &values, 1).await.unwrap();

        let kvs = Arc::new(kvs);
        let rows = kvs
            .live_rows(T, RangeRequest::all(), 5)
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 10);
    }
}
