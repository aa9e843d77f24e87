//! Batched writes and paged cursors over a [`MergeStore`].

use std::marker::PhantomData;

use sitesync_core::Result;
use tracing::debug;

use crate::merge::{BatchOutcome, MergeStore, WriteOp};
use crate::record::{Record, RecordKey, Scope};

/// Buffers write operations and flushes them once `batch_size` accumulate.
///
/// The remainder must be flushed with [`BulkWriter::finish`] or
/// [`BulkWriter::flush`]; dropping the writer discards pending operations.
pub struct BulkWriter<'a, S, T> {
    store: &'a S,
    batch_size: usize,
    pending: Vec<WriteOp<T>>,
    outcome: BatchOutcome,
    flushes: u64,
}

impl<'a, S: MergeStore, T: Record> BulkWriter<'a, S, T> {
    /// Creates a writer flushing every `batch_size` operations.
    #[must_use]
    pub fn new(store: &'a S, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            batch_size,
            pending: Vec::with_capacity(batch_size),
            outcome: BatchOutcome::default(),
            flushes: 0,
        }
    }

    /// Queues an operation, flushing if the batch is full.
    ///
    /// Returns true if a flush happened.
    ///
    /// # Errors
    ///
    /// Returns the store error of a failed flush.
    pub async fn push(&mut self, op: WriteOp<T>) -> Result<bool> {
        self.pending.push(op);
        if self.pending.len() >= self.batch_size {
            self.flush().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Writes pending operations.
    ///
    /// # Errors
    ///
    /// Returns the store error; the pending operations are dropped.
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let ops = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
        let size = ops.len();
        let outcome = self.store.apply(ops).await?;
        self.flushes += 1;
        debug!(
            table = T::TABLE,
            size,
            written = outcome.written(),
            deleted = outcome.deleted,
            failed = outcome.failures.len(),
            "Flushed bulk batch"
        );
        self.outcome.absorb(outcome);
        Ok(())
    }

    /// Number of queued operations.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Outcome of the batches flushed so far.
    #[must_use]
    pub fn outcome(&self) -> &BatchOutcome {
        &self.outcome
    }

    /// Number of batches flushed so far.
    #[must_use]
    pub const fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Flushes the remainder and returns the accumulated outcome.
    ///
    /// # Errors
    ///
    /// Returns the store error of the final flush.
    pub async fn finish(mut self) -> Result<BatchOutcome> {
        self.flush().await?;
        Ok(self.outcome)
    }
}

/// Streams a scope page by page in key order.
///
/// Only one page is held in memory. Records written behind the cursor are not
/// revisited; records written ahead of it are.
pub struct RecordCursor<'a, S, T> {
    store: &'a S,
    scope: Scope,
    after: Option<RecordKey>,
    page_size: usize,
    exhausted: bool,
    _record: PhantomData<fn() -> T>,
}

impl<'a, S: MergeStore, T: Record> RecordCursor<'a, S, T> {
    /// Opens a cursor over `scope`.
    #[must_use]
    pub fn new(store: &'a S, scope: Scope, page_size: usize) -> Self {
        Self {
            store,
            scope,
            after: None,
            page_size: page_size.max(1),
            exhausted: false,
            _record: PhantomData,
        }
    }

    /// Returns the next page, or `None` once the scope is exhausted.
    ///
    /// # Errors
    ///
    /// Returns the store error of the underlying scan.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<T>>> {
        if self.exhausted {
            return Ok(None);
        }
        let page: Vec<T> =
            self.store.scan(self.scope.clone(), self.after.clone(), self.page_size).await?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                self.after = Some(last.key());
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }
}
