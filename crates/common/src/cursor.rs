//! Forward-only, closable cursors returned by range reads.

use crate::cell::RowResult;
use crate::KvError;
use std::collections::VecDeque;

/// A pull-based, non-restartable sequence of items.
///
/// Cursors may hold remote resources, so callers must `close` a cursor they
/// stop reading before it is exhausted.
#[async_trait::async_trait]
pub trait KvCursor<T>: Send {
    /// The next item, or `None` once the cursor is exhausted.
    async fn next(&mut self) -> Result<Option<T>, KvError>;

    /// Release any resources held by the cursor. Idempotent.
    async fn close(&mut self);
}

/// A boxed cursor over rows with per-column payload `T`.
pub type RowCursor<T> = Box<dyn KvCursor<RowResult<T>>>;

/// A cursor over an already materialised sequence.
#[derive(Debug)]
pub struct VecCursor<T> {
    items: VecDeque<T>,
}

impl<T> VecCursor<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

#[async_trait::async_trait]
impl<T: Send> KvCursor<T> for VecCursor<T> {
    async fn next(&mut self) -> Result<Option<T>, KvError> {
        Ok(self.items.pop_front())
    }

    async fn close(&mut self) {
        self.items.clear();
    }
}

/// Drain a cursor into a `Vec`, closing it on every exit path.
pub async fn collect_cursor<T: Send>(
    cursor: &mut (dyn KvCursor<T> + '_),
) -> Result<Vec<T>, KvError> {
    let mut out = Vec::new();
    loop {
        match cursor.next().await {
            Ok(Some(item)) => out.push(item),
            Ok(None) => break,
            Err(e) => {
                cursor.close().await;
                return Err(e);
            }
        }
    }
    cursor.close().await;
    Ok(out)
}
