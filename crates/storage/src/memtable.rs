//! In-memory multi-version cell table.
//!
//! Every cell keeps all of its versions, keyed by write timestamp. Reads at
//! timestamp `t` see only versions written strictly before `t`.

use ringkv_common::{Cell, RangeRequest, RowResult, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Versions of one cell: timestamp -> contents.
type Versions = BTreeMap<i64, Vec<u8>>;

#[derive(Debug, Default)]
pub struct Memtable {
    cells: BTreeMap<Cell, Versions>,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one version. Rewriting an existing `(cell, timestamp)` replaces it.
    pub fn put(&mut self, cell: Cell, timestamp: i64, contents: Vec<u8>) {
        self.cells.entry(cell).or_default().insert(timestamp, contents);
    }

    /// Whether the cell has any version at all.
    pub fn contains(&self, cell: &Cell) -> bool {
        self.cells.get(cell).is_some_and(|v| !v.is_empty())
    }

    /// Latest version written before `timestamp`.
    pub fn latest_before(&self, cell: &Cell, timestamp: i64) -> Option<Value> {
        self.cells.get(cell).and_then(|versions| latest(versions, timestamp))
    }

    /// All timestamps written before `timestamp`.
    pub fn timestamps_before(&self, cell: &Cell, timestamp: i64) -> BTreeSet<i64> {
        self.cells
            .get(cell)
            .map(|versions| versions.range(..timestamp).map(|(ts, _)| *ts).collect())
            .unwrap_or_default()
    }

    /// Remove a single version. Returns whether it existed.
    pub fn remove_version(&mut self, cell: &Cell, timestamp: i64) -> bool {
        let Some(versions) = self.cells.get_mut(cell) else {
            return false;
        };
        let removed = versions.remove(&timestamp).is_some();
        if versions.is_empty() {
            self.cells.remove(cell);
        }
        removed
    }

    /// Cells of `row` whose column satisfies `keep`.
    pub fn row_cells<'a>(
        &'a self,
        row: &'a [u8],
        mut keep: impl FnMut(&[u8]) -> bool + 'a,
    ) -> impl Iterator<Item = &'a Cell> + 'a {
        self.cells
            .range(Cell::new(row.to_vec(), Vec::new())..)
            .map(|(cell, _)| cell)
            .take_while(move |cell| cell.row() == row)
            .filter(move |cell| keep(cell.column()))
    }

    /// Rows in `range`, each column projected through `project`. Columns
    /// projecting to `None` are skipped; rows left with no columns are omitted.
    pub fn scan<T>(
        &self,
        range: &RangeRequest,
        timestamp: i64,
        project: impl Fn(&BTreeMap<i64, Vec<u8>>, i64) -> Option<T>,
    ) -> Vec<RowResult<T>> {
        let mut rows: Vec<RowResult<T>> = Vec::new();
        let mut current: Option<(Vec<u8>, BTreeMap<Vec<u8>, T>)> = None;

        let start = Cell::new(range.start_inclusive().to_vec(), Vec::new());
        for (cell, versions) in self.cells.range(start..) {
            if !range.contains(cell.row()) {
                break;
            }
            if !range.columns().contains(cell.column()) {
                continue;
            }
            let Some(payload) = project(versions, timestamp) else {
                continue;
            };
            match current.as_mut() {
                Some((row, columns)) if row.as_slice() == cell.row() => {
                    columns.insert(cell.column().to_vec(), payload);
                }
                _ => {
                    if let Some((row, columns)) = current.take() {
                        rows.push(RowResult::new(row, columns));
                    }
                    let mut columns = BTreeMap::new();
                    columns.insert(cell.column().to_vec(), payload);
                    current = Some((cell.row().to_vec(), columns));
                }
            }
        }
        if let Some((row, columns)) = current {
            rows.push(RowResult::new(row, columns));
        }
        rows
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Number of distinct cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Total number of versions across all cells.
    pub fn total_versions(&self) -> usize {
        self.cells.values().map(BTreeMap::len).sum()
    }
}

/// Latest version strictly before `timestamp`.
pub fn latest(versions: &BTreeMap<i64, Vec<u8>>, timestamp: i64) -> Option<Value> {
    versions
        .range(..timestamp)
        .next_back()
        .map(|(ts, contents)| Value::new(contents.clone(), *ts))
}

/// Every version strictly before `timestamp`.
pub fn history(versions: &BTreeMap<i64, Vec<u8>>, timestamp: i64) -> Option<BTreeSet<Value>> {
    let values: BTreeSet<Value> = versions
        .range(..timestamp)
        .map(|(ts, contents)| Value::new(contents.clone(), *ts))
        .collect();
    (!values.is_empty()).then_some(values)
}

/// Every timestamp strictly before `timestamp`.
pub fn timestamps(versions: &BTreeMap<i64, Vec<u8>>, timestamp: i64) -> Option<BTreeSet<i64>> {
    let stamps: BTreeSet<i64> = versions.range(..timestamp).map(|(ts, _)| *ts).collect();
    (!stamps.is_empty()).then_some(stamps)
}
