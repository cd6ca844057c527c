//! Cells, timestamped values and row results.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Timestamp written by garbage-collection sentinels; sorts before every real write.
pub const SENTINEL_TIMESTAMP: i64 = -1;

// ---------------------------------------------------------------------------
// Cell
// ---------------------------------------------------------------------------

/// A (row, column) coordinate. Ordered lexicographically by row, then column.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    row: Vec<u8>,
    column: Vec<u8>,
}

impl Cell {
    pub fn new(row: impl Into<Vec<u8>>, column: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            column: column.into(),
        }
    }

    pub fn row(&self) -> &[u8] {
        &self.row
    }

    pub fn column(&self) -> &[u8] {
        &self.column
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cell({})", self)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", hex::encode(&self.row), hex::encode(&self.column))
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Cell contents stamped with the timestamp they were written at.
///
/// Values are totally ordered by timestamp and then by contents, so "the
/// greater value" is well defined even when two replicas disagree on the
/// contents written at one timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Value {
    contents: Vec<u8>,
    timestamp: i64,
}

impl Value {
    pub fn new(contents: impl Into<Vec<u8>>, timestamp: i64) -> Self {
        Self {
            contents: contents.into(),
            timestamp,
        }
    }

    /// The empty value written by garbage-collection sentinels.
    pub fn sentinel() -> Self {
        Self::new(Vec::new(), SENTINEL_TIMESTAMP)
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn into_contents(self) -> Vec<u8> {
        self.contents
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.contents.cmp(&other.contents))
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// ColumnSelection
// ---------------------------------------------------------------------------

/// Which columns of a row a read should return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnSelection {
    #[default]
    All,
    Columns(BTreeSet<Vec<u8>>),
}

impl ColumnSelection {
    pub fn columns<I, C>(columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        Self::Columns(columns.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, column: &[u8]) -> bool {
        match self {
            Self::All => true,
            Self::Columns(columns) => columns.contains(column),
        }
    }
}

// ---------------------------------------------------------------------------
// RowResult
// ---------------------------------------------------------------------------

/// One row of a range scan: the row key plus a per-column payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowResult<T> {
    row: Vec<u8>,
    columns: BTreeMap<Vec<u8>, T>,
}

impl<T> RowResult<T> {
    pub fn new(row: impl Into<Vec<u8>>, columns: BTreeMap<Vec<u8>, T>) -> Self {
        Self {
            row: row.into(),
            columns,
        }
    }

    pub fn row(&self) -> &[u8] {
        &self.row
    }

    pub fn columns(&self) -> &BTreeMap<Vec<u8>, T> {
        &self.columns
    }

    pub fn get(&self, column: &[u8]) -> Option<&T> {
        self.columns.get(column)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate `(Cell, payload)` pairs in column order.
    pub fn cells(&self) -> impl Iterator<Item = (Cell, &T)> + '_ {
        self.columns
            .iter()
            .map(move |(column, payload)| (Cell::new(self.row.clone(), column.clone()), payload))
    }

    pub fn into_parts(self) -> (Vec<u8>, BTreeMap<Vec<u8>, T>) {
        (self.row, self.columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_ordering_row_then_column() {
        let a = Cell::new(b"a".to_vec(), b"z".to_vec());
        let b = Cell::new(b"b".to_vec(), b"a".to_vec());
        let c = Cell::new(b"b".to_vec(), b"b".to_vec());
        assert!(a < b);
        assert!(b < c);
        // Shorter prefix sorts first.
        assert!(Cell::new(b"a".to_vec(), b"".to_vec()) < Cell::new(b"a\0".to_vec(), b"".to_vec()));
    }

    #[test]
    fn test_value_ordering_timestamp_first() {
        let older = Value::new(b"zzz".to_vec(), 1);
        let newer = Value::new(b"aaa".to_vec(), 2);
        assert!(older < newer);

        let tie_low = Value::new(b"a".to_vec(), 5);
        let tie_high = Value::new(b"b".to_vec(), 5);
        assert!(tie_low < tie_high);
        assert_eq!(tie_low.clone().max(tie_high.clone()), tie_high);
    }

    #[test]
    fn test_sentinel_sorts_before_real_writes() {
        assert!(Value::sentinel() < Value::new(Vec::new(), 0));
        assert!(Value::sentinel().contents().is_empty());
    }

    #[test]
    fn test_column_selection() {
        let all = ColumnSelection::All;
        assert!(all.contains(b"anything"));

        let some = ColumnSelection::columns([b"c1".to_vec(), b"c2".to_vec()]);
        assert!(some.contains(b"c1"));
        assert!(!some.contains(b"c3"));
    }

    #[test]
    fn test_row_result_cells() {
        let mut columns = BTreeMap::new();
        columns.insert(b"b".to_vec(), 2);
        columns.insert(b"a".to_vec(), 1);
        let row = RowResult::new(b"r".to_vec(), columns);

        let cells: Vec<(Cell, i32)> = row.cells().map(|(c, v)| (c, *v)).collect();
        assert_eq!(cells[0].0, Cell::new(b"r".to_vec(), b"a".to_vec()));
        assert_eq!(cells[1].1, 2);
    }

    #[test]
    fn test_cell_display_is_hex() {
        let cell = Cell::new(vec![0xab, 0xcd], vec![0x01]);
        assert_eq!(cell.to_string(), "abcd/01");
        assert!(format!("{:?}", cell).starts_with("Cell("));
    }
}
