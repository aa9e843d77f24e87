// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation requests.
//!
//! A request is one reconciliation run over one bucket, optionally narrowed
//! by an [`ObjectFilter`]. It records the last completed step and running
//! counters so that a caller can inspect progress and resume. Requests are
//! never deleted; only their listing rows are purged.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filter::ObjectFilter;
use crate::types::new_id;

/// Last completed step of a request, in pipeline order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RequestStep {
    /// Nothing ran yet.
    #[default]
    Created,
    /// Pre-step cleanup of the authoritative store and native listing.
    CleanedUp,
    /// Native listing copied from a previous request.
    Continued,
    /// Authoritative store scanned into the native listing.
    NativeDb,
    /// Storage backend listed into the native listing.
    NativeDriver,
    /// Local convergence resolved into the sites listing.
    Resolved,
    /// Repaired rows refreshed from backend metadata.
    Refreshed,
    /// Sites listing reduced to converged signals.
    Finalized,
    /// Remote sites listings merged.
    RemoteMerged,
    /// Sites actions computed.
    Planned,
    /// Listing rows purged.
    Purged,
}

impl RequestStep {
    /// Returns the step name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::CleanedUp => "cleaned_up",
            Self::Continued => "continued",
            Self::NativeDb => "native_db",
            Self::NativeDriver => "native_driver",
            Self::Resolved => "resolved",
            Self::Refreshed => "refreshed",
            Self::Finalized => "finalized",
            Self::RemoteMerged => "remote_merged",
            Self::Planned => "planned",
            Self::Purged => "purged",
        }
    }
}

/// Running counters of a request. Each reflects durably written rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestProgress {
    /// Sites listing rows holding a claim of the local site after finalization.
    pub checked: u64,
    /// Native listing rows written by the db pass.
    pub checked_db: u64,
    /// Native listing rows written by the driver pass.
    pub checked_driver: u64,
    /// Remote sites listing rows merged, accumulated across merges.
    pub checked_remote: u64,
    /// Sites action rows emitted.
    pub actions: u64,
}

/// One reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationRequest {
    /// Unique request id.
    pub id: String,
    /// Caller identity, informational.
    pub client_id: Option<String>,
    /// Bucket under reconciliation.
    pub bucket: String,
    /// Optional object filter.
    pub filter: Option<ObjectFilter>,
    /// Site that asked for the run.
    pub from_site: String,
    /// Site executing the local steps.
    pub current_site: String,
    /// Every site known to hold the bucket. Empty means unknown.
    pub context_sites: Vec<String>,
    /// Remote sites whose sites listing has been merged.
    #[serde(default)]
    pub context_sites_done: BTreeSet<String>,
    /// Rows in transitional statuses older than this are probed by the cleanup.
    pub start: Option<DateTime<Utc>>,
    /// Compute listings without writing to the authoritative store.
    pub dry_run: bool,
    /// Last completed step.
    pub step: RequestStep,
    /// Progress counters.
    pub progress: RequestProgress,
    /// Set when the request should stop at the next batch boundary.
    pub stop: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ReconciliationRequest {
    /// Creates a request for `bucket` executed by `site`.
    #[must_use]
    pub fn new(bucket: impl Into<String>, site: impl Into<String>) -> Self {
        let site = site.into();
        Self {
            id: new_id(),
            client_id: None,
            bucket: bucket.into(),
            filter: None,
            from_site: site.clone(),
            current_site: site,
            context_sites: Vec::new(),
            context_sites_done: BTreeSet::new(),
            start: None,
            dry_run: false,
            step: RequestStep::Created,
            progress: RequestProgress::default(),
            stop: None,
            created_at: Utc::now(),
        }
    }

    /// Uses an explicit id, typically one shared by every participating site.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Narrows the request with a filter.
    #[must_use]
    pub fn with_filter(mut self, filter: ObjectFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the known site set.
    #[must_use]
    pub fn with_context_sites<I, S>(mut self, sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context_sites = sites.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the cut-off for probing transitional rows.
    #[must_use]
    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    /// Marks the request as a dry run.
    #[must_use]
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Sets the site that asked for the run.
    #[must_use]
    pub fn from_site(mut self, site: impl Into<String>) -> Self {
        self.from_site = site.into();
        self
    }

    /// Returns true if a stop was requested.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stop.is_some()
    }

    /// Returns true if `step` has already completed.
    #[must_use]
    pub fn has_completed(&self, step: RequestStep) -> bool {
        self.step >= step
    }

    /// Known remote sites whose sites listing has not been merged yet.
    #[must_use]
    pub fn pending_sites(&self) -> Vec<&str> {
        self.context_sites
            .iter()
            .map(String::as_str)
            .filter(|s| *s != self.current_site && !self.context_sites_done.contains(*s))
            .collect()
    }

    /// The filter, or an empty one.
    #[must_use]
    pub fn filter_or_default(&self) -> ObjectFilter {
        self.filter.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request_defaults() {
        let req = ReconciliationRequest::new("photos", "site-a");
        assert_eq!(req.step, RequestStep::Created);
        assert_eq!(req.from_site, "site-a");
        assert_eq!(req.current_site, "site-a");
        assert!(!req.is_stopped());
        assert_eq!(req.progress, RequestProgress::default());
        assert_eq!(req.id.len(), 32);
    }

    #[test]
    fn test_pending_sites_skip_local_and_merged() {
        let mut req = ReconciliationRequest::new("b", "a").with_context_sites(["a", "b", "c"]);
        assert_eq!(req.pending_sites(), vec!["b", "c"]);
        req.context_sites_done.insert("c".to_string());
        assert_eq!(req.pending_sites(), vec!["b"]);
    }

    #[test]
    fn test_steps_are_ordered() {
        let mut req = ReconciliationRequest::new("b", "a");
        req.step = RequestStep::Resolved;
        assert!(req.has_completed(RequestStep::NativeDb));
        assert!(req.has_completed(RequestStep::Resolved));
        assert!(!req.has_completed(RequestStep::Finalized));
    }

    #[test]
    fn test_builder() {
        let req = ReconciliationRequest::new("b", "a")
            .with_id("shared")
            .with_context_sites(["a", "b", "c"])
            .dry_run();
        assert_eq!(req.id, "shared");
        assert_eq!(req.context_sites.len(), 3);
        assert!(req.dry_run);
    }
}
