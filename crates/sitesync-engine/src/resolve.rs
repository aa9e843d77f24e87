// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! Local convergence resolver.
//!
//! For every native listing entry the resolver compares the authoritative
//! view (`db`) with the backend view (`driver`), repairs the authoritative
//! row where they disagree, and records the local site's canonical claim in
//! the sites listing.
//!
//! | db            | driver  | authoritative repair              | claim                 |
//! |---------------|---------|-----------------------------------|-----------------------|
//! | absent        | present | insert `READY`/`TO_UPDATE`        | `TO_UPDATE`           |
//! | `UNKNOWN`     | absent  | none                              | `UNKNOWN`             |
//! | upload-like   | absent  | `UPLOAD`/`TO_UPDATE` if it exists | `UPLOAD`              |
//! | delete-like   | absent  | `DELETED` if it exists            | `DELETED`             |
//! | `UNKNOWN`     | present | none                              | `READY`, latest event |
//! | upload-like   | present | `READY` unless already            | `READY`, latest event |
//! | delete-like   | present | `DELETING` unless already         | `DELETING`, latest    |
//!
//! Finalization then keeps only claims that are converged signals.

use std::time::Instant;

use sitesync_core::{
    NativeListingEntry, ObjectRecord, ObjectStatus, Rank, ReconciliationRequest, RequestStep,
    Result, SingleSiteObject, SitesListingEntry,
};
use sitesync_store::{
    BatchOutcome, BulkWriter, MergeStore, ObjectStore, ObjectWrite, Record, Scope, StorageDriver,
    WriteOp,
};
use tracing::{debug, info, trace};

use crate::reconciler::{first_error, Reconciler};

/// Result of resolving one native listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Resolution {
    /// Repair of the authoritative row.
    pub repair: Option<ObjectWrite>,
    /// Canonical claim of the local site.
    pub claim: Option<SingleSiteObject>,
}

/// Counts of a resolver run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveSummary {
    /// Native listing entries read.
    pub entries: u64,
    /// Sites listing rows written.
    pub claims: u64,
    /// Authoritative rows repaired.
    pub repaired: u64,
}

fn merge_to(entry: &NativeListingEntry, status: ObjectStatus, rank: Rank) -> ObjectWrite {
    ObjectWrite::MergeIfExists { bucket: entry.bucket.clone(), name: entry.name.clone(), status, rank }
}

/// Resolves one entry for `site`. Views of other sites are ignored.
#[must_use]
pub fn resolve_entry(site: &str, entry: &NativeListingEntry) -> Resolution {
    let db = entry.db.as_ref().filter(|d| d.site == site);
    let driver = entry.driver.as_ref().filter(|d| d.site == site);

    match (db, driver) {
        (None, Some(driver)) => Resolution {
            repair: Some(ObjectWrite::InsertIfAbsent(
                ObjectRecord::new(site, &entry.bucket, &entry.name, ObjectStatus::Ready, driver.event)
                    .with_rank(Rank::ToUpdate),
            )),
            claim: Some(SingleSiteObject::new(site, Rank::ToUpdate, driver.event)),
        },
        (Some(db), None) => {
            let (repair, rank) = match db.rank {
                Rank::Unknown => (None, Rank::Unknown),
                rank if rank.is_upload_like() => {
                    (Some(merge_to(entry, ObjectStatus::Upload, Rank::ToUpdate)), Rank::Upload)
                }
                _ => (Some(merge_to(entry, ObjectStatus::Deleted, Rank::Deleted)), Rank::Deleted),
            };
            Resolution { repair, claim: Some(SingleSiteObject::new(site, rank, db.event)) }
        }
        (Some(db), Some(driver)) => {
            let repair = match db.rank {
                Rank::Upload | Rank::ErrUpl | Rank::ToUpdate => {
                    Some(merge_to(entry, ObjectStatus::Ready, Rank::Ready))
                }
                Rank::Deleted | Rank::ErrDel => {
                    Some(merge_to(entry, ObjectStatus::Deleting, Rank::Deleting))
                }
                Rank::Unknown | Rank::Ready | Rank::Deleting => None,
            };
            let rank = if db.rank.is_delete_like() { Rank::Deleting } else { Rank::Ready };
            let event = if db.event >= driver.event { db.event } else { driver.event };
            Resolution { repair, claim: Some(SingleSiteObject::new(site, rank, event)) }
        }
        (None, None) => Resolution::default(),
    }
}

/// Rewrites the local site's pending deletes to `DELETED` and drops every
/// claim that is not a converged signal. Returns true if anything changed.
#[must_use]
pub fn finalize_entry(site: &str, entry: &mut SitesListingEntry) -> bool {
    let before = entry.local.clone();
    entry.local.rewrite(site, |r| matches!(r, Rank::Deleting | Rank::ErrDel), Rank::Deleted);
    entry.local.retain(|_, rank| rank.is_converged_signal());
    entry.local != before
}

impl<S, D> Reconciler<S, D>
where
    S: MergeStore + ObjectStore,
    D: StorageDriver,
{
    /// Resolves every native listing entry of the request.
    ///
    /// Claims are merged into the sites listing per site, so running the
    /// resolver again over the same native listing yields the same rows.
    /// In a dry run the authoritative store is not repaired.
    ///
    /// # Errors
    ///
    /// Returns the store error that aborted the run, or
    /// [`sitesync_core::Error::Stopped`].
    pub async fn compare_native_listing(
        &self,
        request: &mut ReconciliationRequest,
    ) -> Result<ResolveSummary> {
        let started = Instant::now();
        let mut summary = ResolveSummary::default();
        let mut sites = self.writer::<SitesListingEntry>();

        let pass = self.resolve_all(request, &mut summary, &mut sites).await;
        let flush = sites.flush().await;
        summary.claims = sites.outcome().written();
        first_error(pass, flush)?;
        sites.outcome().clone().into_result()?;

        info!(
            request_id = %request.id,
            entries = summary.entries,
            claims = summary.claims,
            repaired = summary.repaired,
            dry_run = request.dry_run,
            "Native listing resolved"
        );
        self.complete_step(request, RequestStep::Resolved, started).await?;
        Ok(summary)
    }

    async fn resolve_all(
        &self,
        request: &ReconciliationRequest,
        summary: &mut ResolveSummary,
        sites: &mut BulkWriter<'_, S, SitesListingEntry>,
    ) -> Result<()> {
        let site = self.settings.site.as_str();
        let mut cursor =
            self.cursor::<NativeListingEntry>(Scope::request(&request.id, &request.bucket));

        while let Some(page) = cursor.next_batch().await? {
            let mut repairs = Vec::new();
            for entry in &page {
                summary.entries += 1;
                let resolution = resolve_entry(site, entry);
                let Some(claim) = resolution.claim else {
                    trace!(key = %entry.key(), "Native entry carries no local view");
                    continue;
                };
                repairs.extend(resolution.repair);
                let row = SitesListingEntry::single(&request.id, &request.bucket, &entry.name, claim);
                sites.push(WriteOp::merge(row)).await?;
            }
            summary.repaired += self.repair(request, repairs).await?.written();
            self.check_stop(request).await?;
        }
        Ok(())
    }

    pub(crate) async fn repair(
        &self,
        request: &ReconciliationRequest,
        repairs: Vec<ObjectWrite>,
    ) -> Result<BatchOutcome> {
        if repairs.is_empty() {
            return Ok(BatchOutcome::default());
        }
        if request.dry_run {
            debug!(request_id = %request.id, skipped = repairs.len(), "Dry run, repairs not written");
            return Ok(BatchOutcome::default());
        }
        self.store.apply_objects(&self.settings.site, repairs).await?.into_result()
    }

    /// Reduces the sites listing to converged signals.
    ///
    /// The local site's `DELETING`/`ERR_DEL` claims become `DELETED`, claims
    /// at `UNKNOWN`, `UPLOAD`, `ERR_UPL`, `DELETING` or `ERR_DEL` are removed,
    /// and rows left without claims are deleted. The number of rows holding a
    /// claim of the local site is stored in `checked`.
    ///
    /// # Errors
    ///
    /// Returns the store error that aborted the run, or
    /// [`sitesync_core::Error::Stopped`].
    pub async fn finalize_sites_listing(&self, request: &mut ReconciliationRequest) -> Result<u64> {
        let started = Instant::now();
        let mut writer = self.writer::<SitesListingEntry>();
        let mut checked = 0u64;

        let pass = self.finalize_all(request, &mut checked, &mut writer).await;
        let flush = writer.flush().await;
        first_error(pass, flush)?;
        let outcome = writer.outcome().clone().into_result()?;

        request.progress.checked = checked;
        info!(
            request_id = %request.id,
            checked,
            rewritten = outcome.updated,
            removed = outcome.deleted,
            "Sites listing finalized"
        );
        self.complete_step(request, RequestStep::Finalized, started).await?;
        Ok(checked)
    }

    async fn finalize_all(
        &self,
        request: &ReconciliationRequest,
        checked: &mut u64,
        writer: &mut BulkWriter<'_, S, SitesListingEntry>,
    ) -> Result<()> {
        let site = self.settings.site.as_str();
        let mut cursor =
            self.cursor::<SitesListingEntry>(Scope::request(&request.id, &request.bucket));

        while let Some(page) = cursor.next_batch().await? {
            for mut entry in page {
                if finalize_entry(site, &mut entry) {
                    let op = if entry.local.is_empty() {
                        WriteOp::delete(entry.key())
                    } else {
                        WriteOp::replace(entry.clone())
                    };
                    writer.push(op).await?;
                }
                if entry.local.contains(site) {
                    *checked += 1;
                }
            }
            self.check_stop(request).await?;
        }
        Ok(())
    }
}
