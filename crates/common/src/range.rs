//! Row-key ranges and result pages.

use crate::cell::ColumnSelection;
use serde::{Deserialize, Serialize};

/// The smallest key strictly greater than `key` in lexicographic byte order.
pub fn next_lexicographic_key(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// A forward scan over rows in `[start_inclusive, end_exclusive)`.
///
/// An empty bound is unbounded on that side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeRequest {
    start_inclusive: Vec<u8>,
    end_exclusive: Vec<u8>,
    columns: ColumnSelection,
    batch_hint: Option<usize>,
}

impl RangeRequest {
    /// Every row of the table.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(start_inclusive: impl Into<Vec<u8>>, end_exclusive: impl Into<Vec<u8>>) -> Self {
        Self {
            start_inclusive: start_inclusive.into(),
            end_exclusive: end_exclusive.into(),
            ..Self::default()
        }
    }

    pub fn with_columns(mut self, columns: ColumnSelection) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_batch_hint(mut self, batch_hint: usize) -> Self {
        self.batch_hint = Some(batch_hint);
        self
    }

    pub fn start_inclusive(&self) -> &[u8] {
        &self.start_inclusive
    }

    pub fn end_exclusive(&self) -> &[u8] {
        &self.end_exclusive
    }

    pub fn columns(&self) -> &ColumnSelection {
        &self.columns
    }

    pub fn batch_hint(&self) -> Option<usize> {
        self.batch_hint
    }

    pub fn is_unbounded_above(&self) -> bool {
        self.end_exclusive.is_empty()
    }

    pub fn contains(&self, row: &[u8]) -> bool {
        row >= self.start_inclusive.as_slice()
            && (self.is_unbounded_above() || row < self.end_exclusive.as_slice())
    }

    /// Whether no row can satisfy the range.
    pub fn is_empty(&self) -> bool {
        !self.is_unbounded_above() && self.start_inclusive >= self.end_exclusive
    }

    /// Restrict this range to `[start, end)` (empty `end` = unbounded),
    /// keeping columns and batch hint. Returns `None` if nothing remains.
    pub fn clamp(&self, start: &[u8], end: &[u8]) -> Option<Self> {
        let start_inclusive = self.start_inclusive.as_slice().max(start).to_vec();
        let end_exclusive = match (self.end_exclusive.is_empty(), end.is_empty()) {
            (true, true) => Vec::new(),
            (true, false) => end.to_vec(),
            (false, true) => self.end_exclusive.clone(),
            (false, false) => self.end_exclusive.as_slice().min(end).to_vec(),
        };
        let clamped = Self {
            start_inclusive,
            end_exclusive,
            columns: self.columns.clone(),
            batch_hint: self.batch_hint,
        };
        (!clamped.is_empty()).then_some(clamped)
    }

    /// The same range resumed just after `row`.
    pub fn resume_after(&self, row: &[u8]) -> Self {
        let mut resumed = self.clone();
        resumed.start_inclusive = next_lexicographic_key(row);
        resumed
    }
}

/// A page of results plus the token to resume after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub results: Vec<T>,
    /// Resume token (the next start key) if more results may follow.
    pub next_token: Option<Vec<u8>>,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.next_token.is_some()
    }
}
