// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! The reconciler: shared context of every reconciliation step.

use std::sync::Arc;
use std::time::Instant;

use sitesync_core::{Config, Error, ReconciliationRequest, RequestStep, Result};
use sitesync_store::{
    BulkWriter, MergeStore, ObjectStore, Record, RecordCursor, RequestStore, Scope, StorageDriver,
};
use tracing::info;

use crate::metrics::record_step;

/// Tuning of a [`Reconciler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Name of the local site.
    pub site: String,
    /// Operations buffered before a bulk write is flushed.
    pub batch_size: usize,
    /// Run the driver refresh step.
    pub refresh_from_driver: bool,
    /// Every site of the deployment, used when a request names none.
    pub sites: Vec<String>,
}

impl ReconcileSettings {
    /// Settings for `site` with default tuning.
    #[must_use]
    pub fn new(site: impl Into<String>) -> Self {
        Self { site: site.into(), batch_size: 1000, refresh_from_driver: false, sites: Vec::new() }
    }

    /// Settings taken from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            site: config.site.clone(),
            batch_size: config.reconcile.batch_size,
            refresh_from_driver: config.reconcile.refresh_from_driver,
            sites: config.reconcile.sites.clone(),
        }
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Enables the driver refresh step.
    #[must_use]
    pub fn with_refresh(mut self) -> Self {
        self.refresh_from_driver = true;
        self
    }

    /// Sets the deployment's site set.
    #[must_use]
    pub fn with_sites<I, T>(mut self, sites: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.sites = sites.into_iter().map(Into::into).collect();
        self
    }
}

/// Runs reconciliation steps for one site against a store and a driver.
///
/// Steps run sequentially per request. Every write is a keyed idempotent
/// merge, so a step interrupted by an error or a stop can be run again.
pub struct Reconciler<S, D> {
    pub(crate) store: Arc<S>,
    pub(crate) driver: Arc<D>,
    pub(crate) settings: ReconcileSettings,
}

impl<S, D> Reconciler<S, D>
where
    S: MergeStore + ObjectStore,
    D: StorageDriver,
{
    /// Creates a reconciler.
    pub fn new(store: Arc<S>, driver: Arc<D>, settings: ReconcileSettings) -> Self {
        Self { store, driver, settings }
    }

    /// The listing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The storage driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The settings.
    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    pub(crate) fn writer<T: Record>(&self) -> BulkWriter<'_, S, T> {
        BulkWriter::new(&*self.store, self.settings.batch_size)
    }

    pub(crate) fn cursor<T: Record>(&self, scope: Scope) -> RecordCursor<'_, S, T> {
        RecordCursor::new(&*self.store, scope, self.settings.batch_size)
    }

    /// Fails with [`Error::Stopped`] if a stop was requested, locally or in
    /// the persisted copy of the request.
    pub(crate) async fn check_stop(&self, request: &ReconciliationRequest) -> Result<()> {
        let stopped = match request.stop {
            Some(_) => true,
            None => match self.store.load_request(&request.id).await {
                Ok(stored) => stored.is_stopped(),
                Err(Error::NotFound(_)) => false,
                Err(e) => return Err(e),
            },
        };
        if stopped {
            info!(request_id = %request.id, "Request stop observed");
            return Err(Error::Stopped { request_id: request.id.clone() });
        }
        Ok(())
    }

    /// Saves the request, keeping a stop set concurrently in the store.
    pub(crate) async fn persist(&self, request: &mut ReconciliationRequest) -> Result<()> {
        if request.stop.is_none() {
            match self.store.load_request(&request.id).await {
                Ok(stored) => request.stop = stored.stop,
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.store.save_request(request).await
    }

    /// Records `step` as completed and persists the request.
    pub(crate) async fn complete_step(
        &self,
        request: &mut ReconciliationRequest,
        step: RequestStep,
        started: Instant,
    ) -> Result<()> {
        request.step = request.step.max(step);
        self.persist(request).await?;
        let elapsed = started.elapsed();
        record_step(step.as_str(), elapsed);
        info!(
            request_id = %request.id,
            bucket = %request.bucket,
            step = step.as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Reconciliation step completed"
        );
        Ok(())
    }
}

/// Returns the first error of a step and of its final flush, in that order.
pub(crate) fn first_error(pass: Result<()>, flush: Result<()>) -> Result<()> {
    pass.and(flush)
}
