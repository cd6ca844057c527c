//! Ranged scan merging across ring sub-ranges.
//!
//! A scan is planned as disjoint sub-ranges in ring order. For the current
//! sub-range one cursor is open per covering replica; rows are produced in
//! key order by repeatedly taking the smallest peeked row and folding in
//! every replica's copy of it. Only when all of a sub-range's cursors are
//! exhausted, failed or closed is the next sub-range opened.
//!
//! Replica cursors that fail to open, or fail mid-stream, are dropped from
//! their sub-range and logged. The scan itself only fails if closed.

use crate::partition_map::{ConsistentRingRangeRequest, Replica};
use futures::future::join_all;
use ringkv_common::{KeyValueService, KvCursor, KvError, RangeRequest, RowCursor, RowResult, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::marker::PhantomData;

// ---------------------------------------------------------------------------
// Merge strategies
// ---------------------------------------------------------------------------

/// How one kind of range read is opened on a replica and how two replicas'
/// payloads for the same cell combine.
#[async_trait::async_trait]
pub trait RowMerge: Send + Sync + 'static {
    type Payload: Send + 'static;

    /// Operation name used in logs.
    const OPERATION: &'static str;

    async fn open(
        service: &dyn KeyValueService,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<Self::Payload>, KvError>;

    fn merge(into: &mut Self::Payload, other: Self::Payload);
}

/// `get_range`: the greatest value per cell.
#[derive(Debug)]
pub struct LatestValue;

#[async_trait::async_trait]
impl RowMerge for LatestValue {
    type Payload = Value;
    const OPERATION: &'static str = "get_range";

    async fn open(
        service: &dyn KeyValueService,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<Value>, KvError> {
        service.get_range(table, range, timestamp).await
    }

    fn merge(into: &mut Value, other: Value) {
        if other > *into {
            *into = other;
        }
    }
}

/// `get_range_with_history`: every version seen by any replica.
#[derive(Debug)]
pub struct ValueHistory;

#[async_trait::async_trait]
impl RowMerge for ValueHistory {
    type Payload = BTreeSet<Value>;
    const OPERATION: &'static str = "get_range_with_history";

    async fn open(
        service: &dyn KeyValueService,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<BTreeSet<Value>>, KvError> {
        service.get_range_with_history(table, range, timestamp).await
    }

    fn merge(into: &mut BTreeSet<Value>, other: BTreeSet<Value>) {
        into.extend(other);
    }
}

/// `get_range_of_timestamps`: every timestamp seen by any replica.
#[derive(Debug)]
pub struct TimestampSet;

#[async_trait::async_trait]
impl RowMerge for TimestampSet {
    type Payload = BTreeSet<i64>;
    const OPERATION: &'static str = "get_range_of_timestamps";

    async fn open(
        service: &dyn KeyValueService,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<BTreeSet<i64>>, KvError> {
        service.get_range_of_timestamps(table, range, timestamp).await
    }

    fn merge(into: &mut BTreeSet<i64>, other: BTreeSet<i64>) {
        into.extend(other);
    }
}

// ---------------------------------------------------------------------------
// Peeking cursor
// ---------------------------------------------------------------------------

/// A replica cursor with one row of lookahead.
pub struct PeekingCursor<T> {
    replica: String,
    inner: RowCursor<T>,
    peeked: Option<RowResult<T>>,
    done: bool,
}

impl<T: Send> PeekingCursor<T> {
    pub fn new(replica: impl Into<String>, inner: RowCursor<T>) -> Self {
        Self {
            replica: replica.into(),
            inner,
            peeked: None,
            done: false,
        }
    }

    pub fn replica(&self) -> &str {
        &self.replica
    }

    /// Row key of the next row, fetching it if needed.
    pub async fn peek_row(&mut self) -> Result<Option<&[u8]>, KvError> {
        if self.peeked.is_none() && !self.done {
            match self.inner.next().await? {
                Some(row) => self.peeked = Some(row),
                None => self.done = true,
            }
        }
        Ok(self.peeked.as_ref().map(RowResult::row))
    }

    /// Take the row last returned by [`peek_row`](Self::peek_row).
    pub fn take(&mut self) -> Option<RowResult<T>> {
        self.peeked.take()
    }

    pub async fn close(&mut self) {
        self.peeked = None;
        self.done = true;
        self.inner.close().await;
    }
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

/// A lazy, forward-only scan over a planned set of ring sub-ranges.
pub struct PartitionedRangeScan<S: RowMerge> {
    table: String,
    timestamp: i64,
    request_id: String,
    pending: VecDeque<(ConsistentRingRangeRequest, Vec<Replica>)>,
    open: Vec<PeekingCursor<S::Payload>>,
    closed: bool,
    _strategy: PhantomData<fn() -> S>,
}

impl<S: RowMerge> PartitionedRangeScan<S> {
    pub fn new(
        table: impl Into<String>,
        timestamp: i64,
        plan: Vec<(ConsistentRingRangeRequest, Vec<Replica>)>,
    ) -> Self {
        Self {
            table: table.into(),
            timestamp,
            request_id: uuid::Uuid::new_v4().to_string(),
            pending: plan.into(),
            open: Vec::new(),
            closed: false,
            _strategy: PhantomData,
        }
    }

    /// Sub-ranges not yet opened.
    pub fn remaining_sub_ranges(&self) -> usize {
        self.pending.len()
    }

    /// Open one cursor per replica of the next sub-range.
    async fn open_sub_range(&mut self, sub: ConsistentRingRangeRequest, replicas: Vec<Replica>) {
        let table = self.table.as_str();
        let range = sub.range();
        let timestamp = self.timestamp;
        let opened = join_all(replicas.iter().map(|replica| async move {
            let cursor = S::open(replica.service().as_ref(), table, range, timestamp).await;
            (replica.id().to_string(), cursor)
        }))
        .await;

        for (replica, cursor) in opened {
            match cursor {
                Ok(cursor) => self.open.push(PeekingCursor::new(replica, cursor)),
                Err(e) => self.drop_replica(&replica, "open", &e),
            }
        }
    }

    fn drop_replica(&self, replica: &str, stage: &'static str, error: &KvError) {
        tracing::warn!(
            operation = S::OPERATION,
            table = %self.table,
            replica = %replica,
            request_id = %self.request_id,
            stage,
            error = %error,
            "dropping replica from sub-range"
        );
        ringkv_metrics::metrics().range_subfetch_failures.inc();
    }

    /// Smallest peeked row among open cursors, dropping exhausted and failed ones.
    async fn smallest_row(&mut self) -> Option<Vec<u8>> {
        let mut smallest: Option<Vec<u8>> = None;
        let mut i = 0;
        while i < self.open.len() {
            let peeked = self.open[i].peek_row().await.map(|row| row.map(<[u8]>::to_vec));
            match peeked {
                Ok(Some(row)) => {
                    if smallest.as_ref().map_or(true, |s| row < *s) {
                        smallest = Some(row);
                    }
                    i += 1;
                }
                Ok(None) => {
                    let mut cursor = self.open.remove(i);
                    cursor.close().await;
                }
                Err(e) => {
                    let mut cursor = self.open.remove(i);
                    self.drop_replica(cursor.replica(), "read", &e);
                    cursor.close().await;
                }
            }
        }
        smallest
    }
}

#[async_trait::async_trait]
impl<S: RowMerge> KvCursor<RowResult<S::Payload>> for PartitionedRangeScan<S> {
    async fn next(&mut self) -> Result<Option<RowResult<S::Payload>>, KvError> {
        loop {
            if self.closed {
                return Ok(None);
            }
            if self.open.is_empty() {
                let Some((sub, replicas)) = self.pending.pop_front() else {
                    return Ok(None);
                };
                self.open_sub_range(sub, replicas).await;
                continue;
            }
            let Some(row) = self.smallest_row().await else {
                continue;
            };

            let mut columns: BTreeMap<Vec<u8>, S::Payload> = BTreeMap::new();
            for cursor in &mut self.open {
                if cursor.peeked.as_ref().map(RowResult::row) != Some(row.as_slice()) {
                    continue;
                }
                let Some(copy) = cursor.take() else {
                    continue;
                };
                let (_, replica_columns) = copy.into_parts();
                for (column, payload) in replica_columns {
                    match columns.get_mut(&column) {
                        Some(existing) => S::merge(existing, payload),
                        None => {
                            columns.insert(column, payload);
                        }
                    }
                }
            }
            return Ok(Some(RowResult::new(row, columns)));
        }
    }

    async fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
        for cursor in &mut self.open {
            cursor.close().await;
        }
        self.open.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaos::{ChaosConfig, ChaosKeyValueService};
    use ringkv_common::{collect_cursor, Cell};
    use ringkv_storage::MemoryKeyValueService;
    use std::collections::HashMap;
    use std::sync::Arc;

    const T: &str = "tbl";

    async fn replica_with(id: &str, rows: &[(&str, i64, &str)]) -> (Replica, Arc<ChaosKeyValueService<MemoryKeyValueService>>) {
        let kvs = MemoryKeyValueService::new();
        kvs.create_table(T, 1024).await.unwrap();
        for (row, ts, contents) in rows {
            let values = HashMap::from([(Cell::new(row.as_bytes().to_vec(), b"c".to_vec()), contents.as_bytes().to_vec())]);
            kvs.put(T, &values, *ts).await.unwrap();
        }
        let chaos = Arc::new(ChaosKeyValueService::new(kvs, ChaosConfig::default()));
        (Replica::new(id, chaos.clone()), chaos)
    }

    fn sub(start: &str, end: &str) -> ConsistentRingRangeRequest {
        ConsistentRingRangeRequest::new(RangeRequest::new(start.as_bytes().to_vec(), end.as_bytes().to_vec()), start.as_bytes().to_vec())
    }

    fn row_keys<P>(rows: &[RowResult<P>]) -> Vec<String> {
        rows.iter().map(|r| String::from_utf8_lossy(r.row()).into_owned()).collect()
    }

    #[tokio::test]
    async fn test_merges_replicas_and_dedupes_rows() {
        let (r1, _) = replica_with("r1", &[("a", 1, "old"), ("b", 1, "b")]).await;
        let (r2, _) = replica_with("r2", &[("a", 2, "new"), ("c", 1, "c")]).await;

        let mut scan = PartitionedRangeScan::<LatestValue>::new(T, 10, vec![(sub("", ""), vec![r1, r2])]);
        let rows = collect_cursor(&mut scan).await.unwrap();

        assert_eq!(row_keys(&rows), vec!["a", "b", "c"]);
        assert_eq!(rows[0].get(b"c"), Some(&Value::new(b"new".to_vec(), 2)));
    }

    #[tokio::test]
    async fn test_sub_ranges_consumed_in_order() {
        // Each replica holds rows on both sides; the sub-range bounds decide what is read.
        let data = [("a", 1, "a"), ("m", 1, "m"), ("z", 1, "z")];
        let (r1, _) = replica_with("r1", &data).await;
        let (r2, _) = replica_with("r2", &data).await;

        let plan = vec![(sub("", "m"), vec![r1.clone()]), (sub("m", ""), vec![r2])];
        let mut scan = PartitionedRangeScan::<LatestValue>::new(T, 10, plan);
        let rows = collect_cursor(&mut scan).await.unwrap();
        assert_eq!(row_keys(&rows), vec!["a", "m", "z"]);
    }

    #[tokio::test]
    async fn test_failed_open_is_soft() {
        let (good, _) = replica_with("good", &[("a", 1, "a")]).await;
        let (bad, bad_chaos) = replica_with("bad", &[("b", 1, "b")]).await;
        bad_chaos.fail(crate::chaos::ChaosFault::Error).await;

        let mut scan = PartitionedRangeScan::<LatestValue>::new(T, 10, vec![(sub("", ""), vec![good, bad])]);
        let rows = collect_cursor(&mut scan).await.unwrap();
        assert_eq!(row_keys(&rows), vec!["a"]);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_drops_replica() {
        let (r1, _) = replica_with("r1", &[("a", 1, "a"), ("b", 1, "b"), ("c", 1, "c")]).await;
        let (r2, flaky) = replica_with("r2", &[("a", 1, "a"), ("d", 1, "d")]).await;
        flaky.fail_cursors_after(Some(1)).await;

        let mut scan = PartitionedRangeScan::<LatestValue>::new(T, 10, vec![(sub("", ""), vec![r1, r2])]);
        let rows = collect_cursor(&mut scan).await.unwrap();
        // "d" lived only on the replica that failed.
        assert_eq!(row_keys(&rows), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_history_and_timestamp_merges() {
        let (r1, _) = replica_with("r1", &[("a", 1, "x"), ("a", 3, "y")]).await;
        let (r2, _) = replica_with("r2", &[("a", 3, "y"), ("a", 5, "z")]).await;

        let plan = vec![(sub("", ""), vec![r1.clone(), r2.clone()])];
        let mut hist = PartitionedRangeScan::<ValueHistory>::new(T, 10, plan.clone());
        let rows = collect_cursor(&mut hist).await.unwrap();
        assert_eq!(rows[0].get(b"c").map(BTreeSet::len), Some(3));

        let mut stamps = PartitionedRangeScan::<TimestampSet>::new(T, 10, plan);
        let rows = collect_cursor(&mut stamps).await.unwrap();
        assert_eq!(rows[0].get(b"c"), Some(&BTreeSet::from([1, 3, 5])));
    }

    #[tokio::test]
    async fn test_close_stops_the_scan() {
        let (r1, _) = replica_with("r1", &[("a", 1, "a"), ("b", 1, "b")]).await;
        let (r2, _) = replica_with("r2", &[("x", 1, "x")]).await;

        let plan = vec![(sub("", "m"), vec![r1]), (sub("m", ""), vec![r2])];
        let mut scan = PartitionedRangeScan::<LatestValue>::new(T, 10, plan);
        assert!(scan.next().await.unwrap().is_some());
        assert_eq!(scan.remaining_sub_ranges(), 1);

        scan.close().await;
        assert_eq!(scan.remaining_sub_ranges(), 0);
        assert!(scan.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_plan() {
        let mut scan = PartitionedRangeScan::<LatestValue>::new(T, 10, Vec::new());
        assert!(scan.next().await.unwrap().is_none());
    }
}
