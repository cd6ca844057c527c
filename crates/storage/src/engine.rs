//! In-memory replica: a full `KeyValueService` over per-table memtables.

use crate::memtable::{self, Memtable};
use ringkv_common::{
    Cell, ColumnSelection, KeyValueService, KvError, RangeRequest, RowCursor, TimestampsByCell,
    Value, VecCursor,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Debug)]
struct Table {
    max_value_size: usize,
    metadata: Vec<u8>,
    cells: Memtable,
}

impl Table {
    fn new(max_value_size: usize) -> Self {
        Self {
            max_value_size,
            metadata: Vec::new(),
            cells: Memtable::new(),
        }
    }

    fn check_size(&self, contents: &[u8]) -> Result<(), KvError> {
        if contents.len() > self.max_value_size {
            return Err(KvError::ValueTooLarge {
                size: contents.len(),
                limit: self.max_value_size,
            });
        }
        Ok(())
    }
}

/// A single replica holding every table in memory.
///
/// Writes to an unknown table fail with `TableNotFound`; tables must be
/// created first (the coordinator broadcasts table creation to every replica).
#[derive(Debug, Default)]
pub struct MemoryKeyValueService {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryKeyValueService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored versions in `table` (0 if the table is missing).
    pub async fn version_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map_or(0, |t| t.cells.total_versions())
    }

    async fn scan_table<T: Send + 'static>(
        &self,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
        project: impl Fn(&std::collections::BTreeMap<i64, Vec<u8>>, i64) -> Option<T>,
    ) -> Result<RowCursor<T>, KvError> {
        let tables = self.tables.read().await;
        let t = lookup(&tables, table)?;
        let rows = t.cells.scan(range, timestamp, project);
        Ok(Box::new(VecCursor::new(rows)))
    }
}

fn lookup<'a>(tables: &'a HashMap<String, Table>, table: &str) -> Result<&'a Table, KvError> {
    tables
        .get(table)
        .ok_or_else(|| KvError::TableNotFound(table.to_string()))
}

fn lookup_mut<'a>(
    tables: &'a mut HashMap<String, Table>,
    table: &str,
) -> Result<&'a mut Table, KvError> {
    tables
        .get_mut(table)
        .ok_or_else(|| KvError::TableNotFound(table.to_string()))
}

#[async_trait::async_trait]
impl KeyValueService for MemoryKeyValueService {
    async fn get_rows(
        &self,
        table: &str,
        rows: &[Vec<u8>],
        columns: &ColumnSelection,
        timestamp: i64,
    ) -> Result<HashMap<Cell, Value>, KvError> {
        let tables = self.tables.read().await;
        let t = lookup(&tables, table)?;
        let mut result = HashMap::new();
        for row in rows {
            for cell in t.cells.row_cells(row, |column| columns.contains(column)) {
                if let Some(value) = t.cells.latest_before(cell, timestamp) {
                    result.insert(cell.clone(), value);
                }
            }
        }
        Ok(result)
    }

    async fn get(
        &self,
        table: &str,
        timestamp_by_cell: &HashMap<Cell, i64>,
    ) -> Result<HashMap<Cell, Value>, KvError> {
        let tables = self.tables.read().await;
        let t = lookup(&tables, table)?;
        Ok(timestamp_by_cell
            .iter()
            .filter_map(|(cell, ts)| t.cells.latest_before(cell, *ts).map(|v| (cell.clone(), v)))
            .collect())
    }

    async fn get_latest_timestamps(
        &self,
        table: &str,
        timestamp_by_cell: &HashMap<Cell, i64>,
    ) -> Result<HashMap<Cell, i64>, KvError> {
        let tables = self.tables.read().await;
        let t = lookup(&tables, table)?;
        Ok(timestamp_by_cell
            .iter()
            .filter_map(|(cell, ts)| {
                t.cells
                    .latest_before(cell, *ts)
                    .map(|v| (cell.clone(), v.timestamp()))
            })
            .collect())
    }

    async fn get_all_timestamps(
        &self,
        table: &str,
        cells: &HashSet<Cell>,
        timestamp: i64,
    ) -> Result<TimestampsByCell, KvError> {
        let tables = self.tables.read().await;
        let t = lookup(&tables, table)?;
        Ok(cells
            .iter()
            .map(|cell| (cell.clone(), t.cells.timestamps_before(cell, timestamp)))
            .filter(|(_, stamps)| !stamps.is_empty())
            .collect())
    }

    async fn get_range(
        &self,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<Value>, KvError> {
        self.scan_table(table, range, timestamp, memtable::latest).await
    }

    async fn get_range_with_history(
        &self,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<BTreeSet<Value>>, KvError> {
        self.scan_table(table, range, timestamp, memtable::history).await
    }

    async fn get_range_of_timestamps(
        &self,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<BTreeSet<i64>>, KvError> {
        self.scan_table(table, range, timestamp, memtable::timestamps).await
    }

    async fn put(
        &self,
        table: &str,
        values: &HashMap<Cell, Vec<u8>>,
        timestamp: i64,
    ) -> Result<(), KvError> {
        let mut tables = self.tables.write().await;
        let t = lookup_mut(&mut tables, table)?;
        for contents in values.values() {
            t.check_size(contents)?;
        }
        for (cell, contents) in values {
            t.cells.put(cell.clone(), timestamp, contents.clone());
        }
        Ok(())
    }

    async fn put_with_timestamps(
        &self,
        table: &str,
        values: &[(Cell, Value)],
    ) -> Result<(), KvError> {
        let mut tables = self.tables.write().await;
        let t = lookup_mut(&mut tables, table)?;
        for (_, value) in values {
            t.check_size(value.contents())?;
        }
        for (cell, value) in values {
            t.cells
                .put(cell.clone(), value.timestamp(), value.contents().to_vec());
        }
        Ok(())
    }

    async fn put_unless_exists(
        &self,
        table: &str,
        values: &HashMap<Cell, Vec<u8>>,
    ) -> Result<(), KvError> {
        let mut tables = self.tables.write().await;
        let t = lookup_mut(&mut tables, table)?;
        if let Some(existing) = values.keys().find(|cell| t.cells.contains(cell)) {
            return Err(KvError::KeyAlreadyExists(existing.clone()));
        }
        for contents in values.values() {
            t.check_size(contents)?;
        }
        for (cell, contents) in values {
            t.cells.put(cell.clone(), 0, contents.clone());
        }
        Ok(())
    }

    async fn delete(&self, table: &str, keys: &[(Cell, i64)]) -> Result<(), KvError> {
        let mut tables = self.tables.write().await;
        let t = lookup_mut(&mut tables, table)?;
        for (cell, timestamp) in keys {
            t.cells.remove_version(cell, *timestamp);
        }
        Ok(())
    }

    async fn add_garbage_collection_sentinel_values(
        &self,
        table: &str,
        cells: &HashSet<Cell>,
    ) -> Result<(), KvError> {
        let mut tables = self.tables.write().await;
        let t = lookup_mut(&mut tables, table)?;
        let sentinel = Value::sentinel();
        for cell in cells {
            t.cells
                .put(cell.clone(), sentinel.timestamp(), sentinel.contents().to_vec());
        }
        Ok(())
    }

    async fn create_table(&self, table: &str, max_value_size: usize) -> Result<(), KvError> {
        let mut tables = self.tables.write().await;
        tables
            .entry(table.to_string())
            .or_insert_with(|| Table::new(max_value_size));
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<(), KvError> {
        self.tables.write().await.remove(table);
        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> Result<(), KvError> {
        let mut tables = self.tables.write().await;
        lookup_mut(&mut tables, table)?.cells.clear();
        Ok(())
    }

    async fn get_all_table_names(&self) -> Result<BTreeSet<String>, KvError> {
        Ok(self.tables.read().await.keys().cloned().collect())
    }

    async fn get_metadata_for_table(&self, table: &str) -> Result<Vec<u8>, KvError> {
        let tables = self.tables.read().await;
        Ok(lookup(&tables, table)?.metadata.clone())
    }

    async fn put_metadata_for_table(&self, table: &str, metadata: &[u8]) -> Result<(), KvError> {
        let mut tables = self.tables.write().await;
        lookup_mut(&mut tables, table)?.metadata = metadata.to_vec();
        Ok(())
    }

    async fn get_metadata_for_tables(&self) -> Result<HashMap<String, Vec<u8>>, KvError> {
        Ok(self
            .tables
            .read()
            .await
            .iter()
            .map(|(name, t)| (name.clone(), t.metadata.clone()))
            .collect())
    }

    async fn compact_internally(&self, table: &str) -> Result<(), KvError> {
        let tables = self.tables.read().await;
        let t = lookup(&tables, table)?;
        tracing::debug!(
            "compaction is a no-op for in-memory table {} ({} cells)",
            table,
            t.cells.len()
        );
        Ok(())
    }

    async fn initialize_from_fresh_instance(&self) -> Result<(), KvError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), KvError> {
        Ok(())
    }

    async fn teardown(&self) -> Result<(), KvError> {
        self.tables.write().await.clear();
        Ok(())
    }
}
