//! Driver refresh: promote repaired rows with the backend's metadata.

use std::time::Instant;

use sitesync_core::{
    NativeListingEntry, Rank, ReconciliationRequest, RequestStep, Result, SingleSiteObject,
    SitesListingEntry,
};
use sitesync_store::{
    BulkWriter, MergeStore, ObjectStore, ObjectWrite, Scope, StorageDriver, WriteOp,
};
use tracing::{debug, info, warn};

use crate::metrics::{record_objects, ObjectSource};
use crate::reconciler::{first_error, Reconciler};
use crate::resolve::resolve_entry;

/// Returns true if the resolver left this entry's authoritative row under repair.
fn needs_refresh(site: &str, entry: &NativeListingEntry) -> bool {
    let local_driver = entry.driver.as_ref().is_some_and(|d| d.site == site);
    let repairable_db = match &entry.db {
        None => true,
        Some(db) => matches!(db.rank, Rank::Upload | Rank::ErrUpl | Rank::ToUpdate),
    };
    local_driver && repairable_db
}

impl<S, D> Reconciler<S, D>
where
    S: MergeStore + ObjectStore,
    D: StorageDriver,
{
    /// Reads backend metadata for every entry under repair and promotes it.
    ///
    /// The authoritative row becomes `READY` with the backend's creation time,
    /// size and hash; the native entry's `db` view and the local claim follow.
    /// A missing object or a failing backend leaves the entry untouched.
    ///
    /// # Errors
    ///
    /// Returns the store error that aborted the run, or
    /// [`sitesync_core::Error::Stopped`].
    pub async fn refresh_from_driver(&self, request: &mut ReconciliationRequest) -> Result<u64> {
        let started = Instant::now();
        let mut native = self.writer::<NativeListingEntry>();
        let mut sites = self.writer::<SitesListingEntry>();
        let mut refreshed = 0u64;

        let pass = self.refresh_all(request, &mut refreshed, &mut native, &mut sites).await;
        let flush = first_error(native.flush().await, sites.flush().await);
        first_error(pass, flush)?;
        native.outcome().clone().into_result()?;
        sites.outcome().clone().into_result()?;

        record_objects(ObjectSource::UpdateFromDriver, refreshed);
        info!(request_id = %request.id, refreshed, "Rows refreshed from driver");
        self.complete_step(request, RequestStep::Refreshed, started).await?;
        Ok(refreshed)
    }

    async fn refresh_all(
        &self,
        request: &ReconciliationRequest,
        refreshed: &mut u64,
        native: &mut BulkWriter<'_, S, NativeListingEntry>,
        sites: &mut BulkWriter<'_, S, SitesListingEntry>,
    ) -> Result<()> {
        let site = self.settings.site.as_str();
        let mut cursor =
            self.cursor::<NativeListingEntry>(Scope::request(&request.id, &request.bucket));

        while let Some(page) = cursor.next_batch().await? {
            let mut repairs = Vec::new();
            for mut entry in page.into_iter().filter(|e| needs_refresh(site, e)) {
                let meta = match self.driver.get_metadata(&entry.bucket, &entry.name).await {
                    Ok(meta) => meta,
                    Err(e) if e.is_not_found() => {
                        debug!(name = %entry.name, "Object vanished before refresh");
                        continue;
                    }
                    Err(e) => {
                        warn!(name = %entry.name, error = %e, "Metadata read failed, row left untouched");
                        continue;
                    }
                };

                repairs.push(ObjectWrite::UpdateFromDriver {
                    bucket: entry.bucket.clone(),
                    name: entry.name.clone(),
                    creation: meta.creation,
                    size: meta.size,
                    hash: meta.hash,
                });
                entry.db = Some(SingleSiteObject::new(site, Rank::Ready, meta.creation));
                if let Some(claim) = resolve_entry(site, &entry).claim {
                    let row =
                        SitesListingEntry::single(&request.id, &request.bucket, &entry.name, claim);
                    sites.push(WriteOp::merge(row)).await?;
                }
                native.push(WriteOp::merge(entry)).await?;
                *refreshed += 1;
            }
            self.repair(request, repairs).await?;
            self.check_stop(request).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    #[test]
    fn test_needs_refresh() {
        let t = Utc.timestamp_opt(1, 0).unwrap();
        let driver = SingleSiteObject::new("a", Rank::Ready, t);
        let mut entry = NativeListingEntry::from_driver("r", "b", "o", driver);
        assert!(needs_refresh("a", &entry));
        assert!(!needs_refresh("z", &entry));

        entry.db = Some(SingleSiteObject::new("a", Rank::ToUpdate, t));
        assert!(needs_refresh("a", &entry));
        entry.db = Some(SingleSiteObject::new("a", Rank::Ready, t));
        assert!(!needs_refresh("a", &entry));

        entry.driver = None;
        entry.db = Some(SingleSiteObject::new("a", Rank::Upload, t));
        assert!(!needs_refresh("a", &entry));
    }
}
