// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! Action planner.
//!
//! For every object of the sites listing the planner picks the winning claim:
//! the most recent upload (`READY` or `TO_UPDATE`) against the most recent
//! `DELETED`, the upload winning ties. Sites whose claim differs from the
//! winner, and known sites that reported nothing, must act.

use std::collections::BTreeSet;
use std::time::Instant;

use sitesync_core::{Rank, ReconciliationRequest, RequestStep, Result, SitesActionEntry, SitesListingEntry};
use sitesync_store::{BulkWriter, MergeStore, ObjectStore, RecordCursor, Scope, StorageDriver, WriteOp};
use tracing::info;

use crate::metrics::{record_objects, ObjectSource};
use crate::reconciler::{first_error, Reconciler};

/// Whether the reported sites of an object cover every known site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// Every known site reported.
    Full,
    /// Some known sites never reported.
    Partial,
}

/// Counts of a planner run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    /// Sites listing rows read.
    pub entries: u64,
    /// Rows where every known site reported.
    pub full: u64,
    /// Rows where some known site never reported.
    pub partial: u64,
    /// Action rows emitted.
    pub actions: u64,
}

/// Coverage of `entry` against `all_sites`. An empty site set is always full.
#[must_use]
pub fn coverage(entry: &SitesListingEntry, all_sites: &BTreeSet<String>) -> Coverage {
    if all_sites.iter().all(|site| entry.local.contains(site)) {
        Coverage::Full
    } else {
        Coverage::Partial
    }
}

/// Plans the convergence of one object, `None` when nothing must change.
///
/// `need_action_from` names the site holding the winning claim, also when a
/// delete beats an older upload. It is empty when no site holds an upload
/// candidate at all.
#[must_use]
pub fn plan_entry(entry: &SitesListingEntry, all_sites: &BTreeSet<String>) -> Option<SitesActionEntry> {
    // Ordered by latest event, then lowest rank, then site name.
    let claims = entry.local.to_vec();
    let max_upload = claims.iter().find(|c| c.rank.is_upload_candidate());
    let max_delete = claims.iter().find(|c| c.rank == Rank::Deleted);

    let (need_action, origin) = match (max_upload, max_delete) {
        (Some(upload), Some(delete)) if upload.event >= delete.event => (upload.rank, Some(upload)),
        (Some(_), Some(delete)) => (delete.rank, Some(delete)),
        (Some(upload), None) => (upload.rank, Some(upload)),
        (None, Some(_)) => (Rank::Deleted, None),
        (None, None) => return None,
    };

    let mut sites: BTreeSet<&str> = claims
        .iter()
        .filter(|c| c.rank != need_action)
        .map(|c| c.site.as_str())
        .collect();
    if coverage(entry, all_sites) == Coverage::Partial {
        sites.extend(all_sites.iter().map(String::as_str).filter(|s| !entry.local.contains(s)));
    }
    if sites.is_empty() {
        return None;
    }

    Some(SitesActionEntry {
        request_id: entry.request_id.clone(),
        bucket: entry.bucket.clone(),
        name: entry.name.clone(),
        need_action,
        need_action_from: origin.map(|c| c.site.clone()).into_iter().collect(),
        sites: sites.into_iter().map(String::from).collect(),
    })
}

impl<S, D> Reconciler<S, D>
where
    S: MergeStore + ObjectStore,
    D: StorageDriver,
{
    /// Site set an object must converge on for this request: the request's
    /// context sites, else the configured sites, else empty.
    #[must_use]
    pub fn known_sites(&self, request: &ReconciliationRequest) -> BTreeSet<String> {
        let sites = if request.context_sites.is_empty() {
            &self.settings.sites
        } else {
            &request.context_sites
        };
        sites.iter().cloned().collect()
    }

    /// Computes the sites actions of the request.
    ///
    /// Previous action rows of the request are replaced. The number of rows
    /// emitted is stored in `actions`.
    ///
    /// # Errors
    ///
    /// Returns the store error that aborted the run, or
    /// [`sitesync_core::Error::Stopped`].
    pub async fn compute_actions(&self, request: &mut ReconciliationRequest) -> Result<PlanSummary> {
        let started = Instant::now();
        let scope = Scope::request(&request.id, &request.bucket);
        self.store.delete_scope::<SitesActionEntry>(scope).await?;

        let all_sites = self.known_sites(request);
        let mut summary = PlanSummary::default();
        let mut writer = self.writer::<SitesActionEntry>();

        let pass = self.plan_all(request, &all_sites, &mut summary, &mut writer).await;
        let flush = writer.flush().await;
        let outcome = writer.outcome().clone();

        summary.actions = outcome.written();
        request.progress.actions = summary.actions;
        self.persist(request).await?;
        record_objects(ObjectSource::ToActions, summary.actions);
        first_error(pass, flush)?;
        outcome.into_result()?;

        info!(
            request_id = %request.id,
            entries = summary.entries,
            full = summary.full,
            partial = summary.partial,
            actions = summary.actions,
            known_sites = all_sites.len(),
            "Sites actions computed"
        );
        self.complete_step(request, RequestStep::Planned, started).await?;
        Ok(summary)
    }

    async fn plan_all(
        &self,
        request: &ReconciliationRequest,
        all_sites: &BTreeSet<String>,
        summary: &mut PlanSummary,
        writer: &mut BulkWriter<'_, S, SitesActionEntry>,
    ) -> Result<()> {
        let mut cursor =
            self.cursor::<SitesListingEntry>(Scope::request(&request.id, &request.bucket));

        while let Some(page) = cursor.next_batch().await? {
            for entry in &page {
                summary.entries += 1;
                match coverage(entry, all_sites) {
                    Coverage::Full => summary.full += 1,
                    Coverage::Partial => summary.partial += 1,
                }
                if let Some(action) = plan_entry(entry, all_sites) {
                    writer.push(WriteOp::replace(action)).await?;
                }
            }
            self.check_stop(request).await?;
        }
        Ok(())
    }

    /// Streams the request's sites actions to their consumers.
    pub fn sites_actions(
        &self,
        request: &ReconciliationRequest,
    ) -> RecordCursor<'_, S, SitesActionEntry> {
        self.cursor(Scope::request(&request.id, &request.bucket))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use sitesync_core::SingleSiteObject;

    use super::*;

    fn listing(claims: &[(&str, Rank, i64)]) -> SitesListingEntry {
        let mut entry = SitesListingEntry {
            request_id: "r".to_string(),
            bucket: "b".to_string(),
            name: "o".to_string(),
            local: Default::default(),
        };
        for (site, rank, t) in claims {
            entry.local.insert(SingleSiteObject::new(*site, *rank, Utc.timestamp_opt(*t, 0).unwrap()));
        }
        entry
    }

    fn sites(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_converged_emits_nothing() {
        let entry = listing(&[("a", Rank::Ready, 1), ("b", Rank::Ready, 5), ("c", Rank::Ready, 3)]);
        assert!(plan_entry(&entry, &sites(&["a", "b", "c"])).is_none());

        let deleted = listing(&[("a", Rank::Deleted, 1), ("b", Rank::Deleted, 2)]);
        assert!(plan_entry(&deleted, &sites(&["a", "b"])).is_none());
    }

    #[test]
    fn test_unknown_sites_must_act() {
        let entry = listing(&[("a", Rank::Ready, 1)]);
        let action = plan_entry(&entry, &sites(&["a", "b", "c"])).unwrap();
        assert_eq!(action.need_action, Rank::Ready);
        assert_eq!(action.need_action_from, vec!["a"]);
        assert_eq!(action.sites, vec!["b", "c"]);
    }

    #[test]
    fn test_newer_delete_wins_with_origin() {
        let entry = listing(&[("a", Rank::Ready, 5), ("b", Rank::Deleted, 9)]);
        let action = plan_entry(&entry, &sites(&["a", "b"])).unwrap();
        assert_eq!(action.need_action, Rank::Deleted);
        assert_eq!(action.need_action_from, vec!["b"]);
        assert_eq!(action.sites, vec!["a"]);
    }

    #[test]
    fn test_upload_wins_ties() {
        let entry = listing(&[("a", Rank::Ready, 7), ("b", Rank::Deleted, 7)]);
        let action = plan_entry(&entry, &sites(&["a", "b"])).unwrap();
        assert_eq!(action.need_action, Rank::Ready);
        assert_eq!(action.sites, vec!["b"]);
    }

    #[test]
    fn test_to_update_winner_flags_ready_sites() {
        let entry = listing(&[("a", Rank::ToUpdate, 9), ("b", Rank::Ready, 2)]);
        let action = plan_entry(&entry, &sites(&["a", "b"])).unwrap();
        assert_eq!(action.need_action, Rank::ToUpdate);
        assert_eq!(action.sites, vec!["b"]);
    }

    #[test]
    fn test_delete_without_upload_has_no_origin() {
        let entry = listing(&[("a", Rank::Deleted, 4)]);
        let action = plan_entry(&entry, &sites(&["a", "b"])).unwrap();
        assert_eq!(action.need_action, Rank::Deleted);
        assert!(action.need_action_from.is_empty());
        assert_eq!(action.sites, vec!["b"]);
    }

    #[test]
    fn test_no_candidates_no_action() {
        let entry = listing(&[("a", Rank::Upload, 9)]);
        assert!(plan_entry(&entry, &sites(&["a", "b"])).is_none());
    }

    #[test]
    fn test_empty_site_set_is_full_coverage() {
        let entry = listing(&[("a", Rank::Ready, 1)]);
        assert_eq!(coverage(&entry, &BTreeSet::new()), Coverage::Full);
        assert!(plan_entry(&entry, &BTreeSet::new()).is_none());
    }
}
