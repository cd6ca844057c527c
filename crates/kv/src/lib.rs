//! Partitioned, replicated key-value coordination.
//!
//! Provides: quorum parameters and per-key quorum tracking, a pluggable
//! partition map (with a consistent-hash ring implementation), a coordinator
//! that fans each operation out to replicas and merges their answers, a
//! merged multi-replica range scan, and an adaptively sized batch iterator.

pub mod batch;
pub mod chaos;
pub mod coordinator;
pub mod merge;
pub mod partition_map;
pub mod provider;
pub mod quorum;
pub mod range;
pub mod ring;

pub use batch::{BatchProvider, BatchSizeIncreasingIterator, LiveRowScan, RangeBatchProvider};
pub use coordinator::PartitionedKeyValueService;
pub use partition_map::{ConsistentRingRangeRequest, PartitionMap, RangePlan, Replica};
pub use provider::PartitionMapProvider;
pub use quorum::{QuorumParameters, QuorumRequestParameters, QuorumTracker};
pub use range::PartitionedRangeScan;
pub use ring::HashRingPartitionMap;
