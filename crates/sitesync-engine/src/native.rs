// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! Native listing builder.
//!
//! Two passes fill the request's native listing for the local site: the db
//! pass copies the authoritative store's view, the driver pass the physical
//! backend's view. Rows are merged by `(request, bucket, name)`.

use std::time::Instant;

use sitesync_core::{
    NativeListingEntry, ObjectFilter, Rank, ReconciliationRequest, RequestStep, Result,
    SingleSiteObject,
};
use sitesync_store::{BulkWriter, MergeStore, ObjectListing, ObjectStore, StorageDriver, WriteOp};
use tracing::{debug, info};

use crate::metrics::{record_objects, ObjectSource};
use crate::reconciler::{first_error, Reconciler};

impl<S, D> Reconciler<S, D>
where
    S: MergeStore + ObjectStore,
    D: StorageDriver,
{
    /// Scans the authoritative store for the local site into the native listing.
    ///
    /// Each matching row sets the entry's `db` view; a delete-like rank also
    /// clears a stale `driver` view. The number of rows written is stored in
    /// `checked_db`, also when the pass fails midway.
    ///
    /// # Errors
    ///
    /// Returns the store error that aborted the pass, or [`sitesync_core::Error::Stopped`].
    pub async fn save_native_listing_db(&self, request: &mut ReconciliationRequest) -> Result<u64> {
        let started = Instant::now();
        let filter = request.filter_or_default();
        let mut writer = self.writer::<NativeListingEntry>();

        let pass = self.scan_db(request, &filter, &mut writer).await;
        let flush = writer.flush().await;
        let outcome = writer.outcome().clone();

        request.progress.checked_db = outcome.written();
        self.persist(request).await?;
        record_objects(ObjectSource::FromDb, outcome.written());
        first_error(pass, flush)?;
        outcome.into_result()?;

        info!(request_id = %request.id, checked_db = request.progress.checked_db, "Native listing db pass done");
        self.complete_step(request, RequestStep::NativeDb, started).await?;
        Ok(request.progress.checked_db)
    }

    async fn scan_db(
        &self,
        request: &ReconciliationRequest,
        filter: &ObjectFilter,
        writer: &mut BulkWriter<'_, S, NativeListingEntry>,
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

            for record in page.into_iter().filter(|r| filter.matches(r)) {
                let db = SingleSiteObject::new(site.as_str(), record.rank, record.creation);
                let entry =
                    NativeListingEntry::from_db(&request.id, &request.bucket, record.name, db);
                writer.push(WriteOp::merge(entry)).await?;
            }
            if exhausted {
                return Ok(());
            }
            self.check_stop(request).await?;
        }
    }

    /// Lists the physical backend into the native listing.
    ///
    /// Each object sets the entry's `driver` view to `READY` at its creation
    /// time. The listing is closed on every exit path. The number of rows
    /// written is stored in `checked_driver`, also when the pass fails midway.
    ///
    /// # Errors
    ///
    /// Returns the driver or store error that aborted the pass, or
    /// [`sitesync_core::Error::Stopped`].
    pub async fn save_native_listing_driver(
        &self,
        request: &mut ReconciliationRequest,
    ) -> Result<u64> {
        let started = Instant::now();
        let filter = request.filter_or_default();
        let mut listing = self
            .driver
            .list_objects(
                &request.bucket,
                filter.name_prefix.as_deref(),
                filter.creation_after,
                filter.creation_before,
            )
            .await?;
        let mut writer = self.writer::<NativeListingEntry>();

        let pass = self.drain_listing(request, listing.as_mut(), &mut writer).await;
        listing.close().await;
        let flush = writer.flush().await;
        let outcome = writer.outcome().clone();

        request.progress.checked_driver = outcome.written();
        self.persist(request).await?;
        record_objects(ObjectSource::FromDriver, outcome.written());
        first_error(pass, flush)?;
        outcome.into_result()?;

        info!(
            request_id = %request.id,
            checked_driver = request.progress.checked_driver,
            "Native listing driver pass done"
        );
        self.complete_step(request, RequestStep::NativeDriver, started).await?;
        Ok(request.progress.checked_driver)
    }

    async fn drain_listing(
        &self,
        request: &ReconciliationRequest,
        listing: &mut dyn ObjectListing,
        writer: &mut BulkWriter<'_, S, NativeListingEntry>,
    ) -> Result<()> {
        while let Some(object) = listing.next().await? {
            let driver =
                SingleSiteObject::new(self.settings.site.as_str(), Rank::Ready, object.creation);
            let entry =
                NativeListingEntry::from_driver(&request.id, &request.bucket, object.name, driver);
            if writer.push(WriteOp::merge(entry)).await? {
                debug!(request_id = %request.id, flushes = writer.flushes(), "Driver listing batch written");
                self.check_stop(request).await?;
            }
        }
        Ok(())
    }
}
