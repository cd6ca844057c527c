//! Consistent-hash ring placement.
//!
//! Tokens are byte strings compared in key order. A row belongs to the
//! greatest token `<=` the row, wrapping around to the last token for rows
//! sorting before the first one. Its replicas are the first
//! `replication_factor` distinct endpoints walking clockwise from there.

use crate::partition_map::{ConsistentRingRangeRequest, PartitionMap, RangePlan, Replica};
use ringkv_common::{KvError, RangeRequest};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Distinct single-byte tokens available to [`HashRingPartitionMap::evenly_spaced`].
pub const MAX_EVENLY_SPACED: usize = 256;

#[derive(Debug, Clone)]
pub struct HashRingPartitionMap {
    version: u64,
    replication_factor: usize,
    ring: BTreeMap<Vec<u8>, Replica>,
}

impl HashRingPartitionMap {
    /// Build a ring from explicit `(token, endpoint)` pairs. An endpoint may own
    /// several tokens.
    pub fn new(
        version: u64,
        replication_factor: usize,
        tokens: impl IntoIterator<Item = (Vec<u8>, Replica)>,
    ) -> Result<Self, KvError> {
        if replication_factor == 0 {
            return Err(KvError::InvalidQuorum(
                "replication factor must be > 0".into(),
            ));
        }
        Ok(Self {
            version,
            replication_factor,
            ring: tokens.into_iter().collect(),
        })
    }

    /// Place `replicas` at evenly spaced single-byte tokens, in order.
    /// At most [`MAX_EVENLY_SPACED`] replicas fit.
    pub fn evenly_spaced(
        version: u64,
        replication_factor: usize,
        replicas: impl IntoIterator<Item = Replica>,
    ) -> Result<Self, KvError> {
        let replicas: Vec<Replica> = replicas.into_iter().collect();
        if replicas.len() > MAX_EVENLY_SPACED {
            return Err(KvError::InvalidConfig(format!(
                "{} replicas exceed the {} single-byte tokens",
                replicas.len(),
                MAX_EVENLY_SPACED
            )));
        }
        let n = replicas.len().max(1);
        let tokens = replicas
            .into_iter()
            .enumerate()
            .map(|(i, r)| (vec![(i * 256 / n) as u8], r));
        Self::new(version, replication_factor, tokens)
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Number of tokens on the ring.
    pub fn token_count(&self) -> usize {
        self.ring.len()
    }

    /// The token owning `row`, or `None` on an empty ring.
    pub fn owner_token(&self, row: &[u8]) -> Option<&[u8]> {
        self.ring
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(row)))
            .next_back()
            .or_else(|| self.ring.iter().next_back())
            .map(|(token, _)| token.as_slice())
    }

    /// Distinct endpoints clockwise from `token`, at most `replication_factor`.
    fn replicas_from(&self, token: &[u8]) -> Vec<Replica> {
        let mut out: Vec<Replica> = Vec::with_capacity(self.replication_factor);
        let clockwise = self
            .ring
            .range::<[u8], _>((Bound::Included(token), Bound::Unbounded))
            .chain(
                self.ring
                    .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(token))),
            );
        for (_, replica) in clockwise {
            if out.len() == self.replication_factor {
                break;
            }
            if !out.contains(replica) {
                out.push(replica.clone());
            }
        }
        out
    }
}

impl PartitionMap for HashRingPartitionMap {
    fn version(&self) -> u64 {
        self.version
    }

    fn replicas_for_row(&self, _table: &str, row: &[u8]) -> Vec<Replica> {
        match self.owner_token(row) {
            Some(token) => self.replicas_from(token),
            None => Vec::new(),
        }
    }

    fn plan_range_read(&self, _table: &str, range: &RangeRequest) -> RangePlan {
        let tokens: Vec<&[u8]> = self.ring.keys().map(Vec::as_slice).collect();
        let (Some(first), Some(last)) = (tokens.first(), tokens.last()) else {
            return Vec::new();
        };

        let mut plan = Vec::new();
        // Rows before the first token wrap around to the last one.
        if !first.is_empty() {
            if let Some(sub) = range.clamp(b"", first) {
                plan.push((
                    ConsistentRingRangeRequest::new(sub, last.to_vec()),
                    self.replicas_from(last),
                ));
            }
        }
        for (i, token) in tokens.iter().enumerate() {
            let end: &[u8] = tokens.get(i + 1).copied().unwrap_or(b"");
            if let Some(sub) = range.clamp(token, end) {
                plan.push((
                    ConsistentRingRangeRequest::new(sub, token.to_vec()),
                    self.replicas_from(token),
                ));
            }
        }
        plan
    }

    fn list_replicas(&self) -> Vec<Replica> {
        let mut out: Vec<Replica> = Vec::new();
        for replica in self.ring.values() {
            if !out.contains(replica) {
                out.push(replica.clone());
            }
        }
        out
    }
}
