//! ringkv-common: shared types for the ringkv project.
//!
//! Provides the cell/value data model, row-key ranges, the
//! [`KeyValueService`] contract spoken by every replica, closable
//! cursors for range reads, and the [`KvError`] taxonomy.

pub mod cell;
pub mod cursor;
pub mod range;
pub mod service;

pub use cell::{Cell, ColumnSelection, RowResult, Value, SENTINEL_TIMESTAMP};
pub use cursor::{collect_cursor, KvCursor, RowCursor, VecCursor};
pub use range::{next_lexicographic_key, Page, RangeRequest};
pub use service::{read_range, KeyValueService, TimestampsByCell};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("replica call failed: {0}")]
    Rpc(String),

    #[error("timeout")]
    Timeout,

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("key already exists: {0}")]
    KeyAlreadyExists(Cell),

    #[error("value of {size} bytes exceeds table limit of {limit} bytes")]
    ValueTooLarge { size: usize, limit: usize },

    /// The replica holds a newer partition map than the caller routed with.
    #[error("partition map version {used} is older than replica's {current}")]
    VersionTooOld { used: u64, current: u64 },

    #[error("replica task failed: {0}")]
    TaskFailed(String),

    #[error("invalid quorum parameters: {0}")]
    InvalidQuorum(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no replicas available for {0}")]
    NoReplicas(&'static str),

    /// Every replica call finished without the request reaching a verdict.
    #[error("{operation}: not enough replicas: need {needed}, got {got}")]
    InsufficientReplicas {
        operation: &'static str,
        needed: usize,
        got: usize,
    },

    /// A tracking unit crossed its failure threshold.
    #[error("{operation} on table {table}: quorum unreachable")]
    InsufficientConsistency {
        operation: &'static str,
        table: String,
        #[source]
        source: Box<KvError>,
    },
}

impl KvError {
    /// Whether this error reports a quorum-level failure rather than a single replica's.
    pub fn is_quorum_failure(&self) -> bool {
        matches!(
            self,
            Self::InsufficientConsistency { .. } | Self::InsufficientReplicas { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_insufficient_consistency_keeps_cause() {
        let err = KvError::InsufficientConsistency {
            operation: "put",
            table: "t".into(),
            source: Box::new(KvError::Timeout),
        };
        assert!(err.is_quorum_failure());
        assert!(err.to_string().contains("put"));
        let cause = err.source().expect("wrapped cause");
        assert_eq!(cause.to_string(), "timeout");
    }

    #[test]
    fn test_replica_errors_are_not_quorum_failures() {
        assert!(!KvError::Rpc("boom".into()).is_quorum_failure());
        assert!(!KvError::VersionTooOld { used: 1, current: 2 }.is_quorum_failure());
    }
}
