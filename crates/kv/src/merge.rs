//! Folding partial replica results into one answer.
//!
//! Every merge here is commutative and idempotent over the partial results
//! it receives, so replica arrival order and duplicate deliveries never
//! change the output.

use ringkv_common::{Cell, TimestampsByCell, Value};
use std::collections::HashMap;

/// Keep the greatest value per cell. Values order by timestamp, then contents.
pub fn merge_latest_values(acc: &mut HashMap<Cell, Value>, partial: HashMap<Cell, Value>) {
    for (cell, value) in partial {
        match acc.get_mut(&cell) {
            Some(existing) if *existing >= value => {}
            Some(existing) => *existing = value,
            None => {
                acc.insert(cell, value);
            }
        }
    }
}

/// Keep the maximum timestamp per cell.
pub fn merge_latest_timestamps(acc: &mut HashMap<Cell, i64>, partial: HashMap<Cell, i64>) {
    for (cell, ts) in partial {
        acc.entry(cell)
            .and_modify(|existing| *existing = (*existing).max(ts))
            .or_insert(ts);
    }
}

/// Union the timestamp sets per cell.
pub fn merge_all_timestamps(acc: &mut TimestampsByCell, partial: TimestampsByCell) {
    for (cell, stamps) in partial {
        acc.entry(cell).or_default().extend(stamps);
    }
}

/// Writes carry no payload; success depends only on quorum coverage.
pub fn merge_nothing(_acc: &mut (), _partial: ()) {}
