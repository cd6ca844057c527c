//! The key-value contract implemented by every replica endpoint and by the
//! partitioned coordinator itself.

use crate::cell::{Cell, ColumnSelection, RowResult, Value};
use crate::cursor::{collect_cursor, RowCursor};
use crate::range::{next_lexicographic_key, Page, RangeRequest};
use crate::KvError;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Timestamps of every version of each cell.
pub type TimestampsByCell = HashMap<Cell, BTreeSet<i64>>;

/// Batch size used by `get_first_batch_for_ranges` when a range carries no hint.
pub const DEFAULT_FIRST_BATCH_SIZE: usize = 100;

/// Key-value storage verbs over named tables of multi-version cells.
///
/// Reads at timestamp `t` observe versions written strictly before `t`.
#[async_trait::async_trait]
pub trait KeyValueService: Send + Sync + 'static {
    // -- point reads --------------------------------------------------------

    /// Latest visible value of every selected cell in `rows`.
    async fn get_rows(
        &self,
        table: &str,
        rows: &[Vec<u8>],
        columns: &ColumnSelection,
        timestamp: i64,
    ) -> Result<HashMap<Cell, Value>, KvError>;

    /// Latest value of each cell visible at its requested timestamp.
    async fn get(
        &self,
        table: &str,
        timestamp_by_cell: &HashMap<Cell, i64>,
    ) -> Result<HashMap<Cell, Value>, KvError>;

    /// Timestamp of the latest version of each cell visible at its requested timestamp.
    async fn get_latest_timestamps(
        &self,
        table: &str,
        timestamp_by_cell: &HashMap<Cell, i64>,
    ) -> Result<HashMap<Cell, i64>, KvError>;

    /// Timestamps of every version of each cell written before `timestamp`.
    async fn get_all_timestamps(
        &self,
        table: &str,
        cells: &HashSet<Cell>,
        timestamp: i64,
    ) -> Result<TimestampsByCell, KvError>;

    // -- range reads --------------------------------------------------------

    async fn get_range(
        &self,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<Value>, KvError>;

    async fn get_range_with_history(
        &self,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<BTreeSet<Value>>, KvError>;

    async fn get_range_of_timestamps(
        &self,
        table: &str,
        range: &RangeRequest,
        timestamp: i64,
    ) -> Result<RowCursor<BTreeSet<i64>>, KvError>;

    /// First page of each range, read through `get_range`.
    async fn get_first_batch_for_ranges(
        &self,
        table: &str,
        ranges: &[RangeRequest],
        timestamp: i64,
    ) -> Result<HashMap<RangeRequest, Page<RowResult<Value>>>, KvError> {
        let mut pages = HashMap::with_capacity(ranges.len());
        for range in ranges {
            let batch_size = range.batch_hint().unwrap_or(DEFAULT_FIRST_BATCH_SIZE).max(1);
            let mut cursor = self.get_range(table, range, timestamp).await?;
            let mut results = Vec::with_capacity(batch_size);
            // Read one row past the page to learn whether more rows follow.
            let mut has_more = false;
            loop {
                match cursor.next().await {
                    Ok(Some(_)) if results.len() == batch_size => {
                        has_more = true;
                        break;
                    }
                    Ok(Some(row)) => results.push(row),
                    Ok(None) => break,
                    Err(e) => {
                        cursor.close().await;
                        return Err(e);
                    }
                }
            }
            cursor.close().await;

            let next_token = match results.last() {
                Some(last) if has_more => Some(next_lexicographic_key(last.row())),
                _ => None,
            };
            pages.insert(range.clone(), Page { results, next_token });
        }
        Ok(pages)
    }

    // -- writes ---------------------------------------------------------------

    async fn put(
        &self,
        table: &str,
        values: &HashMap<Cell, Vec<u8>>,
        timestamp: i64,
    ) -> Result<(), KvError>;

    async fn put_with_timestamps(&self, table: &str, values: &[(Cell, Value)])
        -> Result<(), KvError>;

    /// Write at timestamp 0, failing with `KeyAlreadyExists` if any cell has a version.
    async fn put_unless_exists(
        &self,
        table: &str,
        values: &HashMap<Cell, Vec<u8>>,
    ) -> Result<(), KvError>;

    async fn multi_put(
        &self,
        values_by_table: &HashMap<String, HashMap<Cell, Vec<u8>>>,
        timestamp: i64,
    ) -> Result<(), KvError> {
        for (table, values) in values_by_table {
            self.put(table, values, timestamp).await?;
        }
        Ok(())
    }

    /// Remove the given `(cell, timestamp)` versions.
    async fn delete(&self, table: &str, keys: &[(Cell, i64)]) -> Result<(), KvError>;

    async fn add_garbage_collection_sentinel_values(
        &self,
        table: &str,
        cells: &HashSet<Cell>,
    ) -> Result<(), KvError>;

    // -- tables and metadata ------------------------------------------------

    async fn create_table(&self, table: &str, max_value_size: usize) -> Result<(), KvError>;

    async fn create_tables(&self, max_value_size_by_table: &HashMap<String, usize>) -> Result<(), KvError> {
        for (table, max_value_size) in max_value_size_by_table {
            self.create_table(table, *max_value_size).await?;
        }
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<(), KvError>;

    async fn truncate_table(&self, table: &str) -> Result<(), KvError>;

    async fn truncate_tables(&self, tables: &HashSet<String>) -> Result<(), KvError> {
        for table in tables {
            self.truncate_table(table).await?;
        }
        Ok(())
    }

    async fn get_all_table_names(&self) -> Result<BTreeSet<String>, KvError>;

    async fn get_metadata_for_table(&self, table: &str) -> Result<Vec<u8>, KvError>;

    async fn put_metadata_for_table(&self, table: &str, metadata: &[u8]) -> Result<(), KvError>;

    async fn get_metadata_for_tables(&self) -> Result<HashMap<String, Vec<u8>>, KvError>;

    async fn put_metadata_for_tables(&self, metadata_by_table: &HashMap<String, Vec<u8>>) -> Result<(), KvError> {
        for (table, metadata) in metadata_by_table {
            self.put_metadata_for_table(table, metadata).await?;
        }
        Ok(())
    }

    // -- lifecycle ------------------------------------------------------------

    async fn compact_internally(&self, table: &str) -> Result<(), KvError>;

    async fn initialize_from_fresh_instance(&self) -> Result<(), KvError>;

    async fn close(&self) -> Result<(), KvError>;

    async fn teardown(&self) -> Result<(), KvError>;
}

/// Read a whole range into memory. Test and tooling convenience.
pub async fn read_range<S: KeyValueService + ?Sized>(
    service: &S,
    table: &str,
    range: &RangeRequest,
    timestamp: i64,
) -> Result<Vec<RowResult<Value>>, KvError> {
    let mut cursor = service.get_range(table, range, timestamp).await?;
    collect_cursor(cursor.as_mut()).await
}
