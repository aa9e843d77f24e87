//! Persistence of reconciliation requests.

use async_trait::async_trait;
use chrono::Utc;
use sitesync_core::{Error, ReconciliationRequest, Result};

use crate::batch::RecordCursor;
use crate::merge::{MergeStore, WriteOp};
use crate::record::{RecordKey, Scope};

/// Saves and loads requests. Implemented for every [`MergeStore`].
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Saves the request, replacing any previous version.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    async fn save_request(&self, request: &ReconciliationRequest) -> Result<()>;

    /// Loads a request by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no such request exists.
    async fn load_request(&self, id: &str) -> Result<ReconciliationRequest>;

    /// Marks a request as stopped and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no such request exists.
    async fn stop_request(&self, id: &str) -> Result<ReconciliationRequest>;

    /// Lists requests, optionally restricted to one bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    async fn list_requests(&self, bucket: Option<&str>) -> Result<Vec<ReconciliationRequest>>;
}

#[async_trait]
impl<S: MergeStore> RequestStore for S {
    async fn save_request(&self, request: &ReconciliationRequest) -> Result<()> {
        self.apply(vec![WriteOp::replace(request.clone())]).await?.into_result()?;
        Ok(())
    }

    async fn load_request(&self, id: &str) -> Result<ReconciliationRequest> {
        self.get(RecordKey::new(&[id]))
            .await?
            .ok_or_else(|| Error::not_found(format!("request {id}")))
    }

    async fn stop_request(&self, id: &str) -> Result<ReconciliationRequest> {
        let mut request = self.load_request(id).await?;
        if request.stop.is_none() {
            request.stop = Some(Utc::now());
            self.save_request(&request).await?;
        }
        Ok(request)
    }

    async fn list_requests(&self, bucket: Option<&str>) -> Result<Vec<ReconciliationRequest>> {
        let mut cursor = RecordCursor::<S, ReconciliationRequest>::new(self, Scope::all(), 256);
        let mut out = Vec::new();
        while let Some(page) = cursor.next_batch().await? {
            out.extend(page.into_iter().filter(|r| bucket.map_or(true, |b| r.bucket == b)));
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}
