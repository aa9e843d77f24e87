// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! Cross-site merger and sites listing export.
//!
//! Peers exchange sites listing rows out of band. Incoming rows are re-keyed
//! under the local request and merged per site: the sites an incoming row
//! reports replace ours, other sites are kept. A merge that completes
//! without failures marks the remote sites it carried as done on the request.

use std::collections::BTreeSet;
use std::time::Instant;

use futures::{Stream, StreamExt};
use sitesync_core::{Error, ReconciliationRequest, RequestStep, Result, SitesListingEntry};
use sitesync_store::{
    BatchOutcome, BulkWriter, MergeStore, ObjectStore, RecordCursor, Scope, StorageDriver, WriteOp,
};
use tracing::{info, warn};

use crate::metrics::{record_objects, ObjectSource};
use crate::reconciler::{first_error, Reconciler};

impl<S, D> Reconciler<S, D>
where
    S: MergeStore + ObjectStore,
    D: StorageDriver,
{
    /// Streams the request's sites listing for export to peers.
    pub fn sites_listing(
        &self,
        request: &ReconciliationRequest,
    ) -> RecordCursor<'_, S, SitesListingEntry> {
        self.cursor(Scope::request(&request.id, &request.bucket))
    }

    /// Merges a stream of remote sites listing rows into the request.
    ///
    /// Rows are written in batches. A row that cannot be merged, or a stream
    /// item that is an error, is recorded and the stream continues. The
    /// number of rows merged is added to `checked_remote`. When every item
    /// merged, the remote sites reported by the rows are added to
    /// `context_sites_done`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PartialBatch`] after the stream completes if any item
    /// failed, a store error that aborted the merge, or [`Error::Stopped`].
    pub async fn merge_remote_sites_listing<St>(
        &self,
        request: &mut ReconciliationRequest,
        entries: St,
    ) -> Result<u64>
    where
        St: Stream<Item = Result<SitesListingEntry>> + Send,
    {
        let started = Instant::now();
        let mut writer = self.writer::<SitesListingEntry>();
        let mut rejected = BatchOutcome::default();
        let mut reported = BTreeSet::new();

        let pass =
            self.merge_stream(request, entries, &mut writer, &mut rejected, &mut reported).await;
        let flush = writer.flush().await;
        let mut outcome = writer.outcome().clone();
        outcome.absorb(rejected);

        let merged = outcome.written();
        request.progress.checked_remote += merged;
        self.persist(request).await?;
        record_objects(ObjectSource::FromRemoteSitesListing, merged);
        first_error(pass, flush)?;

        if !outcome.failures.is_empty() {
            warn!(
                request_id = %request.id,
                merged,
                failed = outcome.failures.len(),
                "Remote sites listing merged with failures"
            );
            outcome.into_result()?;
        }

        reported.remove(&request.current_site);
        request.context_sites_done.extend(reported);
        info!(
            request_id = %request.id,
            merged,
            checked_remote = request.progress.checked_remote,
            sites_done = request.context_sites_done.len(),
            "Remote sites listing merged"
        );
        self.complete_step(request, RequestStep::RemoteMerged, started).await?;
        Ok(merged)
    }

    async fn merge_stream<St>(
        &self,
        request: &ReconciliationRequest,
        entries: St,
        writer: &mut BulkWriter<'_, S, SitesListingEntry>,
        rejected: &mut BatchOutcome,
        reported: &mut BTreeSet<String>,
    ) -> Result<()>
    where
        St: Stream<Item = Result<SitesListingEntry>> + Send,
    {
        let mut entries = std::pin::pin!(entries);
        while let Some(item) = entries.next().await {
            let mut entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    rejected.fail("<stream>", e);
                    continue;
                }
            };
            if entry.bucket != request.bucket {
                rejected.fail(
                    format!("{}/{}", entry.bucket, entry.name),
                    Error::invalid_request(format!("row for bucket {}", entry.bucket)),
                );
                continue;
            }
            entry.request_id = request.id.clone();
            reported.extend(entry.local.sites().into_iter().map(str::to_string));
            if writer.push(WriteOp::merge(entry)).await? {
                self.check_stop(request).await?;
            }
        }
        Ok(())
    }
}
