//! Ordered local steps of a reconciliation request.

use std::time::Instant;

use sitesync_core::{ReconciliationRequest, RequestStep, Result};
use sitesync_store::{MergeStore, ObjectStore, StorageDriver};
use tracing::{debug, info};

use crate::continuation::Continuation;
use crate::reconciler::Reconciler;

/// A step of the local half of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalStep {
    /// Pre-step cleanup of the authoritative store.
    CleanUp,
    /// Carry over a previous request's native listing.
    Continue,
    /// Database pass of the native listing builder.
    NativeDb,
    /// Driver pass of the native listing builder.
    NativeDriver,
    /// Local convergence resolver.
    Resolve,
    /// Optional metadata refresh from the driver.
    Refresh,
    /// Sites listing finalization.
    Finalize,
}

/// Local steps in execution order.
pub const LOCAL_STEPS: [LocalStep; 7] = [
    LocalStep::CleanUp,
    LocalStep::Continue,
    LocalStep::NativeDb,
    LocalStep::NativeDriver,
    LocalStep::Resolve,
    LocalStep::Refresh,
    LocalStep::Finalize,
];

impl LocalStep {
    /// The request step recorded once this step completes.
    #[must_use]
    pub const fn completes(self) -> RequestStep {
        match self {
            Self::CleanUp => RequestStep::CleanedUp,
            Self::Continue => RequestStep::Continued,
            Self::NativeDb => RequestStep::NativeDb,
            Self::NativeDriver => RequestStep::NativeDriver,
            Self::Resolve => RequestStep::Resolved,
            Self::Refresh => RequestStep::Refreshed,
            Self::Finalize => RequestStep::Finalized,
        }
    }
}

impl<S, D> Reconciler<S, D>
where
    S: MergeStore + ObjectStore,
    D: StorageDriver,
{
    /// Runs the local steps of `request`, skipping those already completed.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing step, or
    /// [`sitesync_core::Error::Stopped`].
    pub async fn run_local(&self, request: &mut ReconciliationRequest) -> Result<()> {
        self.run_steps(request, None).await
    }

    /// Runs the local steps of `request`, carrying over the native listing of
    /// a previous request first.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing step, or
    /// [`sitesync_core::Error::Stopped`].
    pub async fn run_continued(
        &self,
        request: &mut ReconciliationRequest,
        continuation: &Continuation,
    ) -> Result<()> {
        self.run_steps(request, Some(continuation)).await
    }

    async fn run_steps(
        &self,
        request: &mut ReconciliationRequest,
        continuation: Option<&Continuation>,
    ) -> Result<()> {
        let started = Instant::now();
        self.persist(request).await?;
        info!(
            request_id = %request.id,
            bucket = %request.bucket,
            site = %self.settings.site,
            dry_run = request.dry_run,
            "Local reconciliation started"
        );

        for step in LOCAL_STEPS {
            if request.has_completed(step.completes()) {
                debug!(request_id = %request.id, ?step, "Step already completed");
                continue;
            }
            self.check_stop(request).await?;

            match step {
                LocalStep::CleanUp => {
                    let previous = continuation.map(|c| c.previous_request_id.as_str());
                    self.clean_up_objects_native_listings(request, previous).await?;
                }
                LocalStep::Continue => match continuation {
                    Some(c) => {
                        self.continue_from(request, &c.previous_request_id, c.mode).await?;
                    }
                    None => continue,
                },
                LocalStep::NativeDb => {
                    self.save_native_listing_db(request).await?;
                }
                LocalStep::NativeDriver => {
                    self.save_native_listing_driver(request).await?;
                }
                LocalStep::Resolve => {
                    self.compare_native_listing(request).await?;
                }
                LocalStep::Refresh if self.settings.refresh_from_driver => {
                    self.refresh_from_driver(request).await?;
                }
                LocalStep::Refresh => continue,
                LocalStep::Finalize => {
                    self.finalize_sites_listing(request).await?;
                }
            }
        }

        info!(
            request_id = %request.id,
            checked = request.progress.checked,
            checked_db = request.progress.checked_db,
            checked_driver = request.progress.checked_driver,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Local reconciliation finished"
        );
        Ok(())
    }
}
