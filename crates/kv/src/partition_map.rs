//! The routing contract between the coordinator and the partition layer.

use ringkv_common::{Cell, KeyValueService, RangeRequest};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A replica endpoint: a stable identity plus the service that reaches it.
#[derive(Clone)]
pub struct Replica {
    id: String,
    service: Arc<dyn KeyValueService>,
}

impl Replica {
    pub fn new(id: impl Into<String>, service: Arc<dyn KeyValueService>) -> Self {
        Self {
            id: id.into(),
            service,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &Arc<dyn KeyValueService> {
        &self.service
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Replica").field(&self.id).finish()
    }
}

impl PartialEq for Replica {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Replica {}

impl Hash for Replica {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// One contiguous slice of a scan, owned by a single ring position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistentRingRangeRequest {
    range: RangeRequest,
    owner_token: Vec<u8>,
}

impl ConsistentRingRangeRequest {
    pub fn new(range: RangeRequest, owner_token: impl Into<Vec<u8>>) -> Self {
        Self {
            range,
            owner_token: owner_token.into(),
        }
    }

    pub fn range(&self) -> &RangeRequest {
        &self.range
    }

    pub fn owner_token(&self) -> &[u8] {
        &self.owner_token
    }
}

/// A sub-range of a scan together with the replicas covering it.
pub type RangePlan = Vec<(ConsistentRingRangeRequest, Vec<Replica>)>;

/// Anything the partition map can route by row key.
pub trait RowKeyed {
    fn row_key(&self) -> &[u8];
}

impl RowKeyed for Cell {
    fn row_key(&self) -> &[u8] {
        self.row()
    }
}

impl RowKeyed for Vec<u8> {
    fn row_key(&self) -> &[u8] {
        self
    }
}

impl<T> RowKeyed for (Cell, T) {
    fn row_key(&self) -> &[u8] {
        self.0.row()
    }
}

/// Maps rows and ranges of a table to the replicas responsible for them.
///
/// Implementations are immutable snapshots; a newer map replaces the old one
/// wholesale through [`crate::provider::PartitionMapProvider`].
pub trait PartitionMap: Send + Sync + 'static {
    /// Monotonic version of this snapshot.
    fn version(&self) -> u64;

    /// Replicas responsible for `row`, in preference order.
    fn replicas_for_row(&self, table: &str, row: &[u8]) -> Vec<Replica>;

    /// Split `range` into disjoint sub-ranges in ring order, each with its
    /// covering replicas. Together the sub-ranges cover `range` exactly.
    fn plan_range_read(&self, table: &str, range: &RangeRequest) -> RangePlan;

    /// Every known replica, for broadcast and fallback operations.
    fn list_replicas(&self) -> Vec<Replica>;

    /// Group read keys by the replicas that must serve them.
    fn plan_cell_read<K>(&self, table: &str, keys: impl IntoIterator<Item = K>) -> Vec<(Replica, Vec<K>)>
    where
        K: RowKeyed + Clone,
        Self: Sized,
    {
        group_by_replica(keys, |row| self.replicas_for_row(table, row))
    }

    /// Group written keys by the replicas that must apply them.
    fn plan_cell_write<K>(&self, table: &str, keys: impl IntoIterator<Item = K>) -> Vec<(Replica, Vec<K>)>
    where
        K: RowKeyed + Clone,
        Self: Sized,
    {
        group_by_replica(keys, |row| self.replicas_for_row(table, row))
    }
}

/// Assign each key to every replica `route` returns for its row. Groups come
/// back ordered by replica id.
pub fn group_by_replica<K: RowKeyed + Clone>(
    keys: impl IntoIterator<Item = K>,
    route: impl Fn(&[u8]) -> Vec<Replica>,
) -> Vec<(Replica, Vec<K>)> {
    let mut groups: BTreeMap<String, (Replica, Vec<K>)> = BTreeMap::new();
    for key in keys {
        for replica in route(key.row_key()) {
            groups
                .entry(replica.id().to_string())
                .or_insert_with(|| (replica, Vec::new()))
                .1
                .push(key.clone());
        }
    }
    groups.into_values().collect()
}
