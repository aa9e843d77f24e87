// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! Pre-step cleanup and purge of request rows.

use std::time::Instant;

use sitesync_core::{
    NativeListingEntry, ObjectRecord, ObjectStatus, Rank, ReconciliationRequest, RequestStep,
    Result, SitesActionEntry, SitesListingEntry,
};
use sitesync_store::{
    MergeStore, ObjectStore, ObjectWrite, ProbeOutcome, RecordKey, Scope, StorageDriver, WriteOp,
};
use tracing::{debug, info, warn};

use crate::reconciler::{first_error, Reconciler};

/// What the pre-step cleanup did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// `UNKNOWN` rows deleted.
    pub removed_unknown: u64,
    /// Transitional rows probed on the backend.
    pub probed: u64,
    /// Uploads confirmed present and promoted to `READY`.
    pub confirmed_ready: u64,
    /// Uploads confirmed missing and set to `ERR_UPL`.
    pub confirmed_failed: u64,
    /// Deletes confirmed and set to `DELETED`.
    pub confirmed_deleted: u64,
    /// Probes that failed; their rows were left untouched.
    pub probe_errors: u64,
    /// Native listing rows removed.
    pub native_removed: u64,
}

/// Rows removed by [`Reconciler::purge_request`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    /// Native listing rows.
    pub native: u64,
    /// Sites listing rows.
    pub sites: u64,
    /// Sites action rows.
    pub actions: u64,
}

/// Decision for one authoritative row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowFate {
    Keep(Rank),
    Delete,
    Set(ObjectStatus),
}

const fn is_uploading(status: ObjectStatus) -> bool {
    matches!(status, ObjectStatus::Upload | ObjectStatus::ErrUpl)
}

const fn is_deleting(status: ObjectStatus) -> bool {
    matches!(status, ObjectStatus::Deleting | ObjectStatus::ErrDel)
}

/// Ranks that carry no signal for comparing the two views.
const fn is_signal_free(rank: Rank) -> bool {
    matches!(rank, Rank::Unknown | Rank::ErrUpl | Rank::Deleted | Rank::ErrDel)
}

impl<S, D> Reconciler<S, D>
where
    S: MergeStore + ObjectStore,
    D: StorageDriver,
{
    /// Cleans the authoritative store and native listing before a run.
    ///
    /// Covers every row of the local site in the bucket, whatever the
    /// request's object filter.
    ///
    /// `UNKNOWN` rows are deleted. Rows stuck in a transitional status and
    /// older than the request's `start` (all of them when unset) are probed
    /// on the backend: a present upload becomes `READY`, a missing upload
    /// `ERR_UPL`, a missing delete `DELETED`. A failed probe leaves the row
    /// untouched. Native listing rows of objects whose rank carries no signal
    /// are removed from `previous_request_id`'s listing, or this request's.
    ///
    /// # Errors
    ///
    /// Returns the store error that aborted the cleanup, or
    /// [`sitesync_core::Error::Stopped`].
    pub async fn clean_up_objects_native_listings(
        &self,
        request: &mut ReconciliationRequest,
        previous_request_id: Option<&str>,
    ) -> Result<CleanupSummary> {
        let started = Instant::now();
        let listing_id = previous_request_id.unwrap_or(&request.id).to_string();
        let mut summary = CleanupSummary::default();
        let mut native = self.writer::<NativeListingEntry>();

        let pass = self.clean_objects(request, &listing_id, &mut summary, &mut native).await;
        let flush = native.flush().await;
        summary.native_removed = native.outcome().deleted;
        first_error(pass, flush)?;

        info!(
            request_id = %request.id,
            bucket = %request.bucket,
            dry_run = request.dry_run,
            removed_unknown = summary.removed_unknown,
            probed = summary.probed,
            confirmed_ready = summary.confirmed_ready,
            confirmed_failed = summary.confirmed_failed,
            confirmed_deleted = summary.confirmed_deleted,
            probe_errors = summary.probe_errors,
            native_removed = summary.native_removed,
            "Pre-step cleanup done"
        );
        self.complete_step(request, RequestStep::CleanedUp, started).await?;
        Ok(summary)
    }

    async fn clean_objects(
        &self,
        request: &ReconciliationRequest,
        listing_id: &str,
        summary: &mut CleanupSummary,
        native: &mut sitesync_store::BulkWriter<'_, S, NativeListingEntry>,
    ) -> Result<()> {
        let site = &self.settings.site;
        let page_size = self.settings.batch_size;
        let mut after: Option<String> = None;

        loop {
            let page =
                self.store.scan_objects(site, &request.bucket, after.as_deref(), page_size).await?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            after = Some(last.name.clone());
            let exhausted = page.len() < page_size;

            let mut writes = Vec::new();
            for record in &page {
                let fate = self.decide(request, record, summary).await;
                let rank = match fate {
                    RowFate::Keep(rank) => rank,
                    RowFate::Delete => {
                        writes.push(ObjectWrite::Delete {
                            bucket: record.bucket.clone(),
                            name: record.name.clone(),
                        });
                        Rank::Unknown
                    }
                    RowFate::Set(status) => {
                        writes.push(ObjectWrite::MergeIfExists {
                            bucket: record.bucket.clone(),
                            name: record.name.clone(),
                            status,
                            rank: status.rank(),
                        });
                        status.rank()
                    }
                };
                if is_signal_free(rank) {
                    let key = RecordKey::new(&[listing_id, request.bucket.as_str(), record.name.as_str()]);
                    native.push(WriteOp::delete(key)).await?;
                }
            }

            if request.dry_run {
                debug!(request_id = %request.id, skipped = writes.len(), "Dry run, object repairs not written");
            } else if !writes.is_empty() {
                let outcome = self.store.apply_objects(site, writes).await?;
                summary.removed_unknown += outcome.deleted;
                outcome.into_result()?;
            }
            if exhausted {
                return Ok(());
            }
            self.check_stop(request).await?;
        }
    }

    async fn decide(
        &self,
        request: &ReconciliationRequest,
        record: &ObjectRecord,
        summary: &mut CleanupSummary,
    ) -> RowFate {
        if record.status == ObjectStatus::Unknown {
            return RowFate::Delete;
        }
        let transitional = is_uploading(record.status) || is_deleting(record.status);
        let stale = request.start.map_or(true, |start| record.creation < start);
        if !transitional || !stale {
            return RowFate::Keep(record.rank);
        }

        summary.probed += 1;
        match self.driver.probe(&record.bucket, &record.name).await {
            Ok(ProbeOutcome::Found) if is_uploading(record.status) => {
                summary.confirmed_ready += 1;
                RowFate::Set(ObjectStatus::Ready)
            }
            // Still present while deleting: the delete remains pending.
            Ok(ProbeOutcome::Found) => RowFate::Keep(record.rank),
            Ok(ProbeOutcome::NotFound) if is_uploading(record.status) => {
                summary.confirmed_failed += 1;
                RowFate::Set(ObjectStatus::ErrUpl)
            }
            Ok(ProbeOutcome::NotFound) => {
                summary.confirmed_deleted += 1;
                RowFate::Set(ObjectStatus::Deleted)
            }
            Err(e) => {
                summary.probe_errors += 1;
                warn!(
                    bucket = %record.bucket,
                    name = %record.name,
                    error = %e,
                    "Probe failed, row left untouched"
                );
                RowFate::Keep(record.rank)
            }
        }
    }

    /// Deletes the request's sites action rows once consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn clean_sites_action(&self, request: &ReconciliationRequest) -> Result<u64> {
        let removed = self
            .store
            .delete_scope::<SitesActionEntry>(Scope::request(&request.id, &request.bucket))
            .await?;
        debug!(request_id = %request.id, removed, "Sites actions cleaned");
        Ok(removed)
    }

    /// Deletes every listing row of the request. The request itself is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn purge_request(&self, request: &mut ReconciliationRequest) -> Result<PurgeSummary> {
        let started = Instant::now();
        let scope = Scope::request(&request.id, &request.bucket);
        let summary = PurgeSummary {
            native: self.store.delete_scope::<NativeListingEntry>(scope.clone()).await?,
            sites: self.store.delete_scope::<SitesListingEntry>(scope.clone()).await?,
            actions: self.store.delete_scope::<SitesActionEntry>(scope).await?,
        };
        info!(
            request_id = %request.id,
            native = summary.native,
            sites = summary.sites,
            actions = summary.actions,
            "Request rows purged"
        );
        self.complete_step(request, RequestStep::Purged, started).await?;
        Ok(summary)
    }
}
