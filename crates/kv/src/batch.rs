//! Adaptive batch sizing for scans over partially deleted data.
//!
//! [`BatchSizeIncreasingIterator`] pages through a [`BatchProvider`]. After
//! each page the caller reports how many of the returned rows were still
//! live; the next page size is scaled by the observed returned/live ratio so
//! that each page trends towards the original number of live rows.

use ringkv_common::{
    next_lexicographic_key, KeyValueService, KvCursor, KvError, RangeRequest, RowResult, Value,
};
use ringkv_config::ScanConfig;
use std::sync::Arc;

/// A source of pages resumable from a continuation token.
#[async_trait::async_trait]
pub trait BatchProvider<T>: Send + Sync {
    /// Open a cursor over items after `last_token` (from the start if `None`),
    /// fetched `batch_size` at a time.
    async fn get_batch(
        &self,
        batch_size: usize,
        last_token: Option<&[u8]>,
    ) -> Result<Box<dyn KvCursor<T>>, KvError>;

    /// Whether any item can follow `last_token`.
    fn has_next(&self, last_token: &[u8]) -> bool;

    /// Continuation token for a non-empty page.
    fn last_token(&self, batch: &[T]) -> Vec<u8>;
}

pub struct BatchSizeIncreasingIterator<T, P> {
    provider: P,
    original_batch_size: usize,
    max_batch_size: usize,
    current: Option<Box<dyn KvCursor<T>>>,
    last_token: Option<Vec<u8>>,
    num_returned: u64,
    num_not_deleted: u64,
    last_batch_size: usize,
    exhausted: bool,
}

impl<T: Send, P: BatchProvider<T>> BatchSizeIncreasingIterator<T, P> {
    pub fn new(
        provider: P,
        original_batch_size: usize,
        max_batch_size: usize,
    ) -> Result<Self, KvError> {
        if original_batch_size == 0 {
            return Err(KvError::InvalidConfig(
                "original batch size must be > 0".into(),
            ));
        }
        Ok(Self {
            provider,
            original_batch_size,
            max_batch_size: max_batch_size.max(1),
            current: None,
            last_token: None,
            num_returned: 0,
            num_not_deleted: 0,
            last_batch_size: original_batch_size,
            exhausted: false,
        })
    }

    /// Report how many rows of the last page were not deleted.
    pub fn mark_num_results_not_deleted(&mut self, results_in_batch: usize) {
        self.num_not_deleted += results_in_batch as u64;
        if self.num_not_deleted > self.num_returned {
            tracing::error!(
                not_deleted = self.num_not_deleted,
                returned = self.num_returned,
                "more rows reported not deleted than were returned"
            );
        }
    }

    pub fn num_returned(&self) -> u64 {
        self.num_returned
    }

    pub fn last_batch_size(&self) -> usize {
        self.last_batch_size
    }

    /// Page size the next fetch would ask for.
    pub fn best_batch_size(&self) -> usize {
        if self.num_returned == 0 {
            return self.original_batch_size;
        }
        let size = if self.num_not_deleted == 0 {
            self.num_returned.saturating_mul(4)
        } else {
            let scaled = (self.original_batch_size as u64).saturating_mul(self.num_returned);
            scaled.div_ceil(self.num_not_deleted)
        };
        size.min(self.max_batch_size as u64) as usize
    }

    async fn update_results_if_needed(&mut self) -> Result<(), KvError> {
        if self.exhausted {
            return Ok(());
        }
        let Some(token) = self.last_token.as_deref() else {
            if self.current.is_none() {
                self.current = Some(self.provider.get_batch(self.original_batch_size, None).await?);
                self.last_batch_size = self.original_batch_size;
            }
            return Ok(());
        };

        if !self.provider.has_next(token) {
            if let Some(mut cursor) = self.current.take() {
                cursor.close().await;
            }
            self.exhausted = true;
            return Ok(());
        }

        let best = self.best_batch_size();
        // Reopen only when the size moved by a factor of two or more.
        if best >= self.last_batch_size * 2 || best <= self.last_batch_size / 2 {
            if let Some(mut cursor) = self.current.take() {
                cursor.close().await;
            }
            self.current = Some(self.provider.get_batch(best, Some(token)).await?);
            self.last_batch_size = best;
        }
        Ok(())
    }

    /// The next page. Empty once the source is exhausted, and on every call after.
    pub async fn get_batch(&mut self) -> Result<Vec<T>, KvError> {
        self.update_results_if_needed().await?;
        let Some(cursor) = self.current.as_mut() else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::with_capacity(self.last_batch_size.min(1024));
        let mut drained = false;
        while batch.len() < self.last_batch_size {
            match cursor.next().await? {
                Some(item) => batch.push(item),
                None => {
                    drained = true;
                    break;
                }
            }
        }
        self.num_returned += batch.len() as u64;
        if !batch.is_empty() {
            self.last_token = Some(self.provider.last_token(&batch));
        }
        if drained {
            self.close().await;
        }
        Ok(batch)
    }

    /// Release the open page. Later calls return empty pages.
    pub async fn close(&mut self) {
        self.exhausted = true;
        if let Some(mut cursor) = self.current.take() {
            cursor.close().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Range pages
// ---------------------------------------------------------------------------

/// Pages of a range read; the token is the last row key returned.
pub struct RangeBatchProvider<S: ?Sized> {
    service: Arc<S>,
    table: String,
    range: RangeRequest,
    timestamp: i64,
}

impl<S: KeyValueService + ?Sized> RangeBatchProvider<S> {
    pub fn new(service: Arc<S>, table: impl Into<String>, range: RangeRequest, timestamp: i64) -> Self {
        Self {
            service,
            table: table.into(),
            range,
            timestamp,
        }
    }
}

#[async_trait::async_trait]
impl<S: KeyValueService + ?Sized> BatchProvider<RowResult<Value>> for RangeBatchProvider<S> {
    async fn get_batch(
        &self,
        batch_size: usize,
        last_token: Option<&[u8]>,
    ) -> Result<Box<dyn KvCursor<RowResult<Value>>>, KvError> {
        let range = match last_token {
            Some(token) => self.range.resume_after(token),
            None => self.range.clone(),
        }
        .with_batch_hint(batch_size);
        self.service.get_range(&self.table, &range, self.timestamp).await
    }

    fn has_next(&self, last_token: &[u8]) -> bool {
        self.range.contains(&next_lexicographic_key(last_token))
    }

    fn last_token(&self, batch: &[RowResult<Value>]) -> Vec<u8> {
        batch.last().map(|row| row.row().to_vec()).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Live-row scan
// ---------------------------------------------------------------------------

/// Whether a row still holds data. Rows whose cells all carry empty
/// contents are deletion markers.
pub fn is_live(row: &RowResult<Value>) -> bool {
    row.columns().values().any(|v| !v.contents().is_empty())
}

/// Scan a range returning only live rows, growing pages past deleted regions.
pub struct LiveRowScan<S: KeyValueService + ?Sized> {
    pages: BatchSizeIncreasingIterator<RowResult<Value>, RangeBatchProvider<S>>,
}

impl<S: KeyValueService + ?Sized> LiveRowScan<S> {
    pub fn new(
        service: Arc<S>,
        table: impl Into<String>,
        range: RangeRequest,
        timestamp: i64,
        config: &ScanConfig,
    ) -> Result<Self, KvError> {
        let provider = RangeBatchProvider::new(service, table, range, timestamp);
        Ok(Self {
            pages: BatchSizeIncreasingIterator::new(
                provider,
                config.starting_batch_size,
                config.max_batch_size,
            )?,
        })
    }

    /// The next non-empty page of live rows, or `None` at the end of the range.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<RowResult<Value>>>, KvError> {
        loop {
            let page = self.pages.get_batch().await?;
            if page.is_empty() {
                return Ok(None);
            }
            let live: Vec<RowResult<Value>> = page.into_iter().filter(is_live).collect();
            self.pages.mark_num_results_not_deleted(live.len());
            if !live.is_empty() {
                return Ok(Some(live));
            }
        }
    }

    /// Drain every live row of the range.
    pub async fn collect(mut self) -> Result<Vec<RowResult<Value>>, KvError> {
        let mut rows = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            rows.extend(batch);
        }
        self.close().await;
        Ok(rows)
    }

    pub async fn close(&mut self) {
        self.pages.close().await;
    }

    /// Size of the page currently being read.
    pub fn current_batch_size(&self) -> usize {
        self.pages.last_batch_size()
    }
}
