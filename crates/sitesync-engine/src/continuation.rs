//! Request continuation: carrying a previous request's native listing over.

use std::time::Instant;

use sitesync_core::{
    new_id, Error, NativeListingEntry, ReconciliationRequest, RequestStep, Result,
};
use sitesync_store::{MergeStore, ObjectStore, Record, Scope, StorageDriver, WriteOp};
use tracing::info;

use crate::reconciler::{first_error, Reconciler};

/// How rows of the previous request are carried over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContinuationMode {
    /// Relabel: rows keep their ids and move to the new request.
    #[default]
    Replace,
    /// Copy: rows get fresh ids and replace the new request's row for the
    /// same object; the previous request keeps its rows.
    Merge,
}

/// A previous request to continue from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    /// Id of the request whose native listing is carried over.
    pub previous_request_id: String,
    /// How rows are carried over.
    pub mode: ContinuationMode,
}

impl Continuation {
    /// Continue from `previous_request_id` in `mode`.
    #[must_use]
    pub fn new(previous_request_id: impl Into<String>, mode: ContinuationMode) -> Self {
        Self { previous_request_id: previous_request_id.into(), mode }
    }
}

impl<S, D> Reconciler<S, D>
where
    S: MergeStore + ObjectStore,
    D: StorageDriver,
{
    /// Copies the native listing of `previous_request_id` under this request.
    ///
    /// Returns the number of rows carried over.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] when continuing from itself, the store
    /// error that aborted the copy, or [`Error::Stopped`].
    pub async fn continue_from(
        &self,
        request: &mut ReconciliationRequest,
        previous_request_id: &str,
        mode: ContinuationMode,
    ) -> Result<u64> {
        if previous_request_id == request.id {
            return Err(Error::invalid_request("a request cannot continue from itself"));
        }
        let started = Instant::now();
        let mut writer = self.writer::<NativeListingEntry>();

        let pass = self.copy_listing(request, previous_request_id, mode, &mut writer).await;
        let flush = writer.flush().await;
        let outcome = writer.outcome().clone();
        first_error(pass, flush)?;
        let outcome = outcome.into_result()?;

        info!(
            request_id = %request.id,
            previous_request_id,
            ?mode,
            copied = outcome.written(),
            moved = outcome.deleted,
            "Native listing carried over"
        );
        self.complete_step(request, RequestStep::Continued, started).await?;
        Ok(outcome.written())
    }

    async fn copy_listing(
        &self,
        request: &ReconciliationRequest,
        previous_request_id: &str,
        mode: ContinuationMode,
        writer: &mut sitesync_store::BulkWriter<'_, S, NativeListingEntry>,
    ) -> Result<()> {
        let mut cursor =
            self.cursor::<NativeListingEntry>(Scope::request(previous_request_id, &request.bucket));

        while let Some(page) = cursor.next_batch().await? {
            for old in page {
                let mut entry = old.clone();
                entry.request_id = request.id.clone();
                match mode {
                    ContinuationMode::Replace => {
                        writer.push(WriteOp::replace(entry)).await?;
                        writer.push(WriteOp::delete(old.key())).await?;
                    }
                    ContinuationMode::Merge => {
                        entry.id = new_id();
                        writer.push(WriteOp::replace(entry)).await?;
                    }
                }
            }
            self.check_stop(request).await?;
        }
        Ok(())
    }
}
