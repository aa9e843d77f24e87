// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for the reconciliation engine.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use futures::stream;
use sitesync_core::{
    Error, NativeListingEntry, ObjectFilter, ObjectRecord, ObjectStatus, Rank, ReconciliationRequest,
    RequestStep, Result, SingleSiteObject, SitesActionEntry, SitesListingEntry,
};
use sitesync_engine::{
    plan_entry, resolve_entry, Continuation, ContinuationMode, ReconcileSettings, Reconciler,
};
use sitesync_store::{
    MemoryDriver, MergeStore, ObjectStore, RecordKey, RedbStore, RequestStore, Scope,
    StorageObject, WriteOp,
};

const BUCKET: &str = "photos";

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

struct Site {
    store: Arc<RedbStore>,
    driver: Arc<MemoryDriver>,
    reconciler: Reconciler<RedbStore, MemoryDriver>,
}

impl Site {
    fn new(settings: ReconcileSettings) -> Self {
        let store = Arc::new(RedbStore::open_in_memory().unwrap());
        let driver = Arc::new(MemoryDriver::new());
        let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&driver), settings);
        Self { store, driver, reconciler }
    }

    /// Site `name` with tiny batches so every pass flushes several times.
    fn named(name: &str) -> Self {
        Self::new(ReconcileSettings::new(name).with_batch_size(2))
    }

    fn request(&self) -> ReconciliationRequest {
        ReconciliationRequest::new(BUCKET, &self.reconciler.settings().site)
    }

    async fn put_row(&self, name: &str, status: ObjectStatus, creation: i64) {
        let site = self.reconciler.settings().site.clone();
        self.store.put_object(ObjectRecord::new(site, BUCKET, name, status, at(creation))).await.unwrap();
    }

    fn put_file(&self, name: &str, creation: i64) {
        self.driver.put(StorageObject::new(BUCKET, name, at(creation), 42));
    }

    async fn row(&self, name: &str) -> Option<ObjectRecord> {
        let site = &self.reconciler.settings().site;
        self.store.get_object(site, BUCKET, name).await.unwrap()
    }

    async fn sites_row(&self, request: &ReconciliationRequest, name: &str) -> Option<SitesListingEntry> {
        let key = RecordKey::new(&[request.id.as_str(), BUCKET, name]);
        self.store.get::<SitesListingEntry>(key).await.unwrap()
    }

    async fn native_row(&self, request_id: &str, name: &str) -> Option<NativeListingEntry> {
        let key = RecordKey::new(&[request_id, BUCKET, name]);
        self.store.get::<NativeListingEntry>(key).await.unwrap()
    }

    async fn build_and_resolve(&self, request: &mut ReconciliationRequest) {
        self.reconciler.save_native_listing_db(request).await.unwrap();
        self.reconciler.save_native_listing_driver(request).await.unwrap();
        self.reconciler.compare_native_listing(request).await.unwrap();
    }

    async fn actions(&self, request: &ReconciliationRequest) -> Vec<SitesActionEntry> {
        let mut cursor = self.reconciler.sites_actions(request);
        let mut out = Vec::new();
        while let Some(page) = cursor.next_batch().await.unwrap() {
            out.extend(page);
        }
        out
    }
}

fn listing_row(request_id: &str, name: &str, claims: &[(&str, Rank, i64)]) -> SitesListingEntry {
    SitesListingEntry {
        request_id: request_id.to_string(),
        bucket: BUCKET.to_string(),
        name: name.to_string(),
        local: claims.iter().map(|(site, rank, t)| SingleSiteObject::new(*site, *rank, at(*t))).collect(),
    }
}

#[tokio::test]
async fn test_missing_file_then_found_converges_to_ready() {
    let a = Site::named("A");
    a.put_row("o1", ObjectStatus::Ready, 10).await;

    let mut first = a.request();
    a.build_and_resolve(&mut first).await;

    let row = a.row("o1").await.unwrap();
    assert_eq!(row.status, ObjectStatus::Upload);
    assert_eq!(row.rank, Rank::ToUpdate);
    let claim = a.sites_row(&first, "o1").await.unwrap().local.get("A").unwrap();
    assert_eq!((claim.rank, claim.event), (Rank::Upload, at(10)));

    a.put_file("o1", 25);
    let mut second = a.request();
    a.build_and_resolve(&mut second).await;

    let row = a.row("o1").await.unwrap();
    assert_eq!(row.status, ObjectStatus::Ready);
    assert_eq!(row.rank, Rank::Ready);
    let claim = a.sites_row(&second, "o1").await.unwrap().local.get("A").unwrap();
    assert_eq!((claim.rank, claim.event), (Rank::Ready, at(25)));
}

#[tokio::test]
async fn test_newer_delete_wins_with_deleting_site_as_origin() {
    let central = Site::new(ReconcileSettings::new("A").with_sites(["A", "B"]));
    let mut request = central.request();
    central
        .store
        .apply(vec![WriteOp::replace(listing_row(
            &request.id,
            "o2",
            &[("A", Rank::Ready, 5), ("B", Rank::Deleted, 9)],
        ))])
        .await
        .unwrap();

    let summary = central.reconciler.compute_actions(&mut request).await.unwrap();
    assert_eq!(summary.actions, 1);
    assert_eq!(request.progress.actions, 1);

    let actions = central.actions(&request).await;
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].need_action, Rank::Deleted);
    assert_eq!(actions[0].need_action_from, vec!["B"]);
    assert_eq!(actions[0].sites, vec!["A"]);
}

#[tokio::test]
async fn test_resolver_is_idempotent() {
    let a = Site::named("A");
    a.put_row("both", ObjectStatus::Upload, 3).await;
    a.put_row("db-only", ObjectStatus::Ready, 4).await;
    a.put_row("gone", ObjectStatus::Deleting, 5).await;
    a.put_file("both", 6);
    a.put_file("driver-only", 7);

    let mut request = a.request();
    a.build_and_resolve(&mut request).await;
    let mut first = Vec::new();
    for name in ["both", "db-only", "gone", "driver-only"] {
        first.push(a.sites_row(&request, name).await.unwrap());
    }

    a.reconciler.compare_native_listing(&mut request).await.unwrap();
    for (name, before) in ["both", "db-only", "gone", "driver-only"].into_iter().zip(first) {
        let after = a.sites_row(&request, name).await.unwrap();
        assert_eq!(after, before, "{name} changed on rerun");
        assert_eq!(after.local.len(), 1);
    }
}

#[test]
fn test_both_views_present_yield_ready_or_deleting_at_latest_event() {
    let ranks = [
        Rank::Unknown,
        Rank::Upload,
        Rank::Ready,
        Rank::ErrUpl,
        Rank::Deleting,
        Rank::Deleted,
        Rank::ErrDel,
        Rank::ToUpdate,
    ];
    for rank in ranks {
        for (db_t, driver_t) in [(1, 2), (2, 1), (3, 3)] {
            let mut entry = NativeListingEntry::from_driver(
                "r",
                BUCKET,
                "o",
                SingleSiteObject::new("A", Rank::Ready, at(driver_t)),
            );
            entry.db = Some(SingleSiteObject::new("A", rank, at(db_t)));

            let claim = resolve_entry("A", &entry).claim.unwrap();
            assert!(matches!(claim.rank, Rank::Ready | Rank::Deleting), "{rank:?} gave {:?}", claim.rank);
            assert_eq!(claim.event, at(db_t.max(driver_t)));
        }
    }
}

#[tokio::test]
async fn test_remote_merge_replaces_site_in_place_and_appends_new_sites() {
    let central = Site::named("A");
    let mut request = central.request();
    central
        .store
        .apply(vec![WriteOp::replace(listing_row(
            &request.id,
            "o",
            &[("A", Rank::Ready, 5), ("X", Rank::Ready, 1)],
        ))])
        .await
        .unwrap();

    let incoming: Vec<Result<SitesListingEntry>> = vec![
        Ok(listing_row("peer-request", "o", &[("X", Rank::Deleted, 7)])),
        Ok(listing_row("peer-request", "o", &[("Y", Rank::Ready, 3)])),
    ];
    let merged = central
        .reconciler
        .merge_remote_sites_listing(&mut request, stream::iter(incoming))
        .await
        .unwrap();
    assert_eq!(merged, 2);
    assert_eq!(request.progress.checked_remote, 2);

    let local = central.sites_row(&request, "o").await.unwrap().local;
    assert_eq!(local.len(), 3);
    assert_eq!(local.get("A").unwrap(), SingleSiteObject::new("A", Rank::Ready, at(5)));
    assert_eq!(local.get("X").unwrap(), SingleSiteObject::new("X", Rank::Deleted, at(7)));
    assert_eq!(local.get("Y").unwrap(), SingleSiteObject::new("Y", Rank::Ready, at(3)));
}

#[tokio::test]
async fn test_converged_objects_emit_no_action() {
    let central = Site::new(ReconcileSettings::new("A").with_sites(["A", "B", "C"]));
    let mut request = central.request();
    central
        .store
        .apply(vec![
            WriteOp::replace(listing_row(
                &request.id,
                "ready",
                &[("A", Rank::Ready, 1), ("B", Rank::Ready, 4), ("C", Rank::Ready, 2)],
            )),
            WriteOp::replace(listing_row(
                &request.id,
                "deleted",
                &[("A", Rank::Deleted, 1), ("B", Rank::Deleted, 4), ("C", Rank::Deleted, 2)],
            )),
        ])
        .await
        .unwrap();

    let summary = central.reconciler.compute_actions(&mut request).await.unwrap();
    assert_eq!(summary.entries, 2);
    assert_eq!(summary.full, 2);
    assert_eq!(summary.actions, 0);
    assert!(central.actions(&request).await.is_empty());
}

#[tokio::test]
async fn test_sites_that_never_reported_must_act() {
    let central = Site::named("A");
    let mut request = central.request().with_context_sites(["A", "B", "C"]);
    central
        .store
        .apply(vec![WriteOp::replace(listing_row(&request.id, "o", &[("A", Rank::Ready, 1)]))])
        .await
        .unwrap();

    let summary = central.reconciler.compute_actions(&mut request).await.unwrap();
    assert_eq!(summary.partial, 1);

    let actions = central.actions(&request).await;
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].need_action, Rank::Ready);
    assert_eq!(actions[0].need_action_from, vec!["A"]);
    assert_eq!(actions[0].sites, vec!["B", "C"]);

    let all: BTreeSet<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
    let row = central.sites_row(&request, "o").await.unwrap();
    assert_eq!(plan_entry(&row, &all).as_ref(), actions.first());
}

#[tokio::test]
async fn test_planner_replaces_previous_actions() {
    let central = Site::new(ReconcileSettings::new("A").with_sites(["A", "B"]));
    let mut request = central.request();
    let row = listing_row(&request.id, "o", &[("A", Rank::Ready, 1)]);
    central.store.apply(vec![WriteOp::replace(row)]).await.unwrap();
    central.reconciler.compute_actions(&mut request).await.unwrap();
    assert_eq!(central.actions(&request).await.len(), 1);

    let converged = listing_row(&request.id, "o", &[("A", Rank::Ready, 1), ("B", Rank::Ready, 2)]);
    central.store.apply(vec![WriteOp::replace(converged)]).await.unwrap();
    central.reconciler.compute_actions(&mut request).await.unwrap();
    assert!(central.actions(&request).await.is_empty());
    assert_eq!(request.progress.actions, 0);
}

#[tokio::test]
async fn test_stop_aborts_at_batch_boundary() {
    let a = Site::named("A");
    for i in 0..6 {
        a.put_row(&format!("o{i}"), ObjectStatus::Ready, i).await;
    }
    let mut request = a.request();
    a.store.save_request(&request).await.unwrap();
    a.store.stop_request(&request.id).await.unwrap();

    let err = a.reconciler.save_native_listing_db(&mut request).await.unwrap_err();
    assert!(err.is_stopped(), "unexpected error: {err}");
    assert!(request.is_stopped());
    assert_eq!(request.progress.checked_db, 2);

    let stored = a.store.load_request(&request.id).await.unwrap();
    assert_eq!(stored.progress.checked_db, 2);
    assert!(!stored.has_completed(RequestStep::NativeDb));
}

#[tokio::test]
async fn test_run_local_refuses_stopped_request() {
    let a = Site::named("A");
    let mut request = a.request();
    a.store.save_request(&request).await.unwrap();
    a.store.stop_request(&request.id).await.unwrap();

    let err = a.reconciler.run_local(&mut request).await.unwrap_err();
    assert!(matches!(err, Error::Stopped { .. }));
    assert_eq!(request.step, RequestStep::Created);
}

#[tokio::test]
async fn test_driver_listing_closed_on_error() {
    let a = Site::named("A");
    for name in ["a", "b", "c", "d"] {
        a.put_file(name, 1);
    }
    a.driver.fail_on(BUCKET, "c");

    let mut request = a.request();
    let err = a.reconciler.save_native_listing_driver(&mut request).await.unwrap_err();
    assert!(matches!(err, Error::Driver(_)), "unexpected error: {err}");
    assert_eq!(a.driver.opened_listings(), 1);
    assert_eq!(a.driver.closed_listings(), 1);

    assert_eq!(request.progress.checked_driver, 2);
    assert!(a.native_row(&request.id, "b").await.is_some());
    assert!(a.native_row(&request.id, "d").await.is_none());
    assert!(!request.has_completed(RequestStep::NativeDriver));
}

#[tokio::test]
async fn test_remote_merge_aggregates_item_failures() {
    let central = Site::named("A");
    let mut request = central.request();
    let mut foreign = listing_row("peer", "elsewhere", &[("B", Rank::Ready, 1)]);
    foreign.bucket = "other-bucket".to_string();

    let incoming: Vec<Result<SitesListingEntry>> = vec![
        Ok(listing_row("peer", "o1", &[("B", Rank::Ready, 1)])),
        Err(Error::driver("peer connection reset")),
        Ok(foreign),
        Ok(listing_row("peer", "o2", &[("B", Rank::Deleted, 2)])),
        Ok(listing_row("peer", "o3", &[("B", Rank::Ready, 3)])),
    ];
    let err = central
        .reconciler
        .merge_remote_sites_listing(&mut request, stream::iter(incoming))
        .await
        .unwrap_err();
    match err {
        Error::PartialBatch { failed, .. } => assert_eq!(failed, 2),
        other => panic!("unexpected error: {other}"),
    }
    assert!(request.context_sites_done.is_empty());

    assert_eq!(request.progress.checked_remote, 3);
    for name in ["o1", "o2", "o3"] {
        assert!(central.sites_row(&request, name).await.is_some(), "{name} not merged");
    }
    assert!(!request.has_completed(RequestStep::RemoteMerged));
    let stored = central.store.load_request(&request.id).await.unwrap();
    assert_eq!(stored.progress.checked_remote, 3);
}

#[tokio::test]
async fn test_continuation_replace_moves_rows() {
    let a = Site::named("A");
    for name in ["x", "y", "z"] {
        a.put_row(name, ObjectStatus::Ready, 1).await;
    }
    let mut previous = a.request();
    a.reconciler.save_native_listing_db(&mut previous).await.unwrap();
    let old_id = a.native_row(&previous.id, "x").await.unwrap().id;

    let mut next = a.request();
    let copied = a
        .reconciler
        .continue_from(&mut next, &previous.id, ContinuationMode::Replace)
        .await
        .unwrap();
    assert_eq!(copied, 3);
    assert!(next.has_completed(RequestStep::Continued));

    let old_scope = Scope::request(&previous.id, BUCKET);
    assert_eq!(a.store.count::<NativeListingEntry>(old_scope).await.unwrap(), 0);
    let moved = a.native_row(&next.id, "x").await.unwrap();
    assert_eq!(moved.id, old_id);
    assert_eq!(moved.request_id, next.id);
}

#[tokio::test]
async fn test_continuation_merge_copies_with_fresh_ids() {
    let a = Site::named("A");
    for name in ["x", "y", "z"] {
        a.put_row(name, ObjectStatus::Ready, 1).await;
    }
    let mut previous = a.request();
    a.reconciler.save_native_listing_db(&mut previous).await.unwrap();

    let mut next = a.request();
    let copied = a
        .reconciler
        .continue_from(&mut next, &previous.id, ContinuationMode::Merge)
        .await
        .unwrap();
    assert_eq!(copied, 3);

    let old_scope = Scope::request(&previous.id, BUCKET);
    assert_eq!(a.store.count::<NativeListingEntry>(old_scope).await.unwrap(), 3);
    let old = a.native_row(&previous.id, "y").await.unwrap();
    let new = a.native_row(&next.id, "y").await.unwrap();
    assert_ne!(old.id, new.id);
    assert_eq!(old.db, new.db);

    let own_id = next.id.clone();
    let err = a
        .reconciler
        .continue_from(&mut next, &own_id, ContinuationMode::Merge)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn test_run_continued_keeps_carried_rows() {
    let a = Site::named("A");
    a.put_row("kept", ObjectStatus::Ready, 1).await;
    a.put_file("kept", 1);
    let mut previous = a.request();
    a.reconciler.run_local(&mut previous).await.unwrap();

    let mut next = a.request();
    let continuation = Continuation::new(previous.id.clone(), ContinuationMode::Replace);
    a.reconciler.run_continued(&mut next, &continuation).await.unwrap();

    assert!(next.has_completed(RequestStep::Finalized));
    assert!(a.native_row(&previous.id, "kept").await.is_none());
    let claim = a.sites_row(&next, "kept").await.unwrap().local.get("A").unwrap();
    assert_eq!(claim.rank, Rank::Ready);
}

#[tokio::test]
async fn test_cleanup_probes_transitional_rows() {
    let a = Site::named("A");
    a.put_row("unknown", ObjectStatus::Unknown, 1).await;
    a.put_row("uploaded", ObjectStatus::Upload, 1).await;
    a.put_row("upload-lost", ObjectStatus::Upload, 1).await;
    a.put_row("delete-done", ObjectStatus::Deleting, 1).await;
    a.put_row("delete-pending", ObjectStatus::Deleting, 1).await;
    a.put_row("unreachable", ObjectStatus::ErrUpl, 1).await;
    a.put_row("fresh-upload", ObjectStatus::Upload, 50).await;
    a.put_row("ready", ObjectStatus::Ready, 1).await;
    a.put_file("uploaded", 1);
    a.put_file("delete-pending", 1);
    a.driver.fail_on(BUCKET, "unreachable");

    let mut request = a.request().with_start(at(10));
    let summary = a.reconciler.clean_up_objects_native_listings(&mut request, None).await.unwrap();

    assert_eq!(summary.removed_unknown, 1);
    assert_eq!(summary.probed, 5);
    assert_eq!(summary.confirmed_ready, 1);
    assert_eq!(summary.confirmed_failed, 1);
    assert_eq!(summary.confirmed_deleted, 1);
    assert_eq!(summary.probe_errors, 1);

    assert!(a.row("unknown").await.is_none());
    assert_eq!(a.row("uploaded").await.unwrap().status, ObjectStatus::Ready);
    assert_eq!(a.row("upload-lost").await.unwrap().status, ObjectStatus::ErrUpl);
    assert_eq!(a.row("delete-done").await.unwrap().status, ObjectStatus::Deleted);
    assert_eq!(a.row("delete-pending").await.unwrap().status, ObjectStatus::Deleting);
    assert_eq!(a.row("unreachable").await.unwrap().status, ObjectStatus::ErrUpl);
    assert_eq!(a.row("fresh-upload").await.unwrap().status, ObjectStatus::Upload);
    assert_eq!(a.row("ready").await.unwrap().status, ObjectStatus::Ready);
    assert!(request.has_completed(RequestStep::CleanedUp));
}

#[tokio::test]
async fn test_cleanup_ignores_request_filter() {
    let a = Site::named("A");
    a.put_row("unknown", ObjectStatus::Unknown, 1).await;
    a.put_row("upload-lost", ObjectStatus::Upload, 1).await;
    a.put_row("ready", ObjectStatus::Ready, 1).await;

    let mut request = a
        .request()
        .with_filter(ObjectFilter::prefix("ready").with_statuses([ObjectStatus::Ready]))
        .with_start(at(10));
    let summary = a.reconciler.clean_up_objects_native_listings(&mut request, None).await.unwrap();

    assert_eq!(summary.removed_unknown, 1);
    assert_eq!(summary.probed, 1);
    assert!(a.row("unknown").await.is_none());
    assert_eq!(a.row("upload-lost").await.unwrap().status, ObjectStatus::ErrUpl);
    assert_eq!(a.row("ready").await.unwrap().status, ObjectStatus::Ready);
}

#[tokio::test]
async fn test_unknown_row_with_file_is_not_repaired() {
    let a = Site::named("A");
    a.put_row("unknown", ObjectStatus::Unknown, 3).await;
    a.put_file("unknown", 6);

    let mut request = a.request();
    a.build_and_resolve(&mut request).await;

    let row = a.row("unknown").await.unwrap();
    assert_eq!((row.status, row.rank), (ObjectStatus::Unknown, Rank::Unknown));
    let claim = a.sites_row(&request, "unknown").await.unwrap().local.get("A").unwrap();
    assert_eq!((claim.rank, claim.event), (Rank::Ready, at(6)));
}

#[tokio::test]
async fn test_cleanup_removes_signal_free_native_rows() {
    let a = Site::named("A");
    a.put_row("ready", ObjectStatus::Ready, 1).await;
    a.put_row("failed", ObjectStatus::ErrUpl, 1).await;
    a.put_row("deleted", ObjectStatus::Deleted, 1).await;
    let mut previous = a.request();
    a.reconciler.save_native_listing_db(&mut previous).await.unwrap();

    let mut next = a.request().with_start(at(0));
    let summary = a
        .reconciler
        .clean_up_objects_native_listings(&mut next, Some(previous.id.as_str()))
        .await
        .unwrap();

    assert_eq!(summary.native_removed, 2);
    assert!(a.native_row(&previous.id, "ready").await.is_some());
    assert!(a.native_row(&previous.id, "failed").await.is_none());
    assert!(a.native_row(&previous.id, "deleted").await.is_none());
}

#[tokio::test]
async fn test_dry_run_leaves_authoritative_rows_alone() {
    let a = Site::named("A");
    a.put_row("db-only", ObjectStatus::Ready, 4).await;
    a.put_row("pending", ObjectStatus::Upload, 1).await;
    a.put_file("driver-only", 7);

    let mut request = a.request().dry_run();
    a.reconciler.run_local(&mut request).await.unwrap();

    let row = a.row("db-only").await.unwrap();
    assert_eq!((row.status, row.rank), (ObjectStatus::Ready, Rank::Ready));
    assert_eq!(a.row("pending").await.unwrap().status, ObjectStatus::Upload);
    assert!(a.row("driver-only").await.is_none());

    let claim = a.sites_row(&request, "driver-only").await.unwrap().local.get("A").unwrap();
    assert_eq!(claim.rank, Rank::ToUpdate);
    assert!(request.has_completed(RequestStep::Finalized));
}

#[tokio::test]
async fn test_finalize_keeps_converged_signals_only() {
    let a = Site::named("A");
    a.put_row("lost", ObjectStatus::Ready, 1).await;
    a.put_row("removing", ObjectStatus::Deleting, 2).await;
    a.put_row("ok", ObjectStatus::Ready, 3).await;
    a.put_file("ok", 3);

    let mut request = a.request();
    a.reconciler.run_local(&mut request).await.unwrap();

    assert!(a.sites_row(&request, "lost").await.is_none());
    let removing = a.sites_row(&request, "removing").await.unwrap().local.get("A").unwrap();
    assert_eq!(removing.rank, Rank::Deleted);
    let ok = a.sites_row(&request, "ok").await.unwrap().local.get("A").unwrap();
    assert_eq!(ok.rank, Rank::Ready);
    assert_eq!(request.progress.checked, 2);
}

#[tokio::test]
async fn test_refresh_promotes_driver_only_objects() {
    let a = Site::new(ReconcileSettings::new("A").with_batch_size(2).with_refresh());
    a.driver.put(StorageObject::new(BUCKET, "found", at(8), 1024).with_hash("abc"));
    a.put_row("repairing", ObjectStatus::Upload, 2).await;
    a.put_file("repairing", 6);

    let mut request = a.request();
    a.reconciler.run_local(&mut request).await.unwrap();
    assert!(request.has_completed(RequestStep::Refreshed));

    let row = a.row("found").await.unwrap();
    assert_eq!((row.status, row.rank), (ObjectStatus::Ready, Rank::Ready));
    assert_eq!(row.size, 1024);
    assert_eq!(row.hash.as_deref(), Some("abc"));
    assert_eq!(row.creation, at(8));

    let claim = a.sites_row(&request, "found").await.unwrap().local.get("A").unwrap();
    assert_eq!((claim.rank, claim.event), (Rank::Ready, at(8)));
    let claim = a.sites_row(&request, "repairing").await.unwrap().local.get("A").unwrap();
    assert_eq!(claim.rank, Rank::Ready);
}

#[tokio::test]
async fn test_run_local_is_resumable() {
    let a = Site::named("A");
    a.put_row("o", ObjectStatus::Ready, 1).await;
    a.put_file("o", 1);

    let mut request = a.request();
    a.reconciler.save_native_listing_db(&mut request).await.unwrap();
    assert_eq!(request.step, RequestStep::NativeDb);

    a.reconciler.run_local(&mut request).await.unwrap();
    assert_eq!(request.step, RequestStep::Finalized);
    assert_eq!(request.progress.checked_db, 1);
    assert_eq!(request.progress.checked_driver, 1);

    let before = a.sites_row(&request, "o").await.unwrap();
    a.reconciler.run_local(&mut request).await.unwrap();
    assert_eq!(a.sites_row(&request, "o").await.unwrap(), before);
}

#[tokio::test]
async fn test_two_sites_exchange_and_plan() {
    let a = Site::named("A");
    let b = Site::named("B");
    a.put_row("shared", ObjectStatus::Ready, 1).await;
    a.put_file("shared", 1);
    a.put_row("only-a", ObjectStatus::Ready, 2).await;
    a.put_file("only-a", 2);
    b.put_row("shared", ObjectStatus::Ready, 3).await;
    b.put_file("shared", 3);

    let id = "shared-request";
    let mut at_a = a.request().with_id(id).with_context_sites(["A", "B"]);
    let mut at_b = b.request().with_id(id).with_context_sites(["A", "B"]);
    a.reconciler.run_local(&mut at_a).await.unwrap();
    b.reconciler.run_local(&mut at_b).await.unwrap();

    let mut exported: Vec<Result<SitesListingEntry>> = Vec::new();
    let mut cursor = b.reconciler.sites_listing(&at_b);
    while let Some(page) = cursor.next_batch().await.unwrap() {
        exported.extend(page.into_iter().map(Ok));
    }
    assert_eq!(at_a.pending_sites(), vec!["B"]);
    a.reconciler.merge_remote_sites_listing(&mut at_a, stream::iter(exported)).await.unwrap();
    assert!(at_a.context_sites_done.contains("B"));
    assert!(!at_a.context_sites_done.contains("A"));
    assert!(at_a.pending_sites().is_empty());
    let stored = a.store.load_request(id).await.unwrap();
    assert_eq!(stored.context_sites_done, at_a.context_sites_done);
    a.reconciler.compute_actions(&mut at_a).await.unwrap();

    let actions = a.actions(&at_a).await;
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].name, "only-a");
    assert_eq!(actions[0].need_action_from, vec!["A"]);
    assert_eq!(actions[0].sites, vec!["B"]);

    let purged = a.reconciler.purge_request(&mut at_a).await.unwrap();
    assert_eq!(purged.native, 2);
    assert_eq!(purged.sites, 2);
    assert_eq!(purged.actions, 1);
    assert_eq!(at_a.step, RequestStep::Purged);
    assert!(a.actions(&at_a).await.is_empty());
    assert!(a.store.load_request(id).await.is_ok());
}

#[tokio::test]
async fn test_on_disk_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sitesync.redb");
    let request_id;
    {
        let store = Arc::new(RedbStore::open(&path).unwrap());
        let driver = Arc::new(MemoryDriver::new());
        driver.put(StorageObject::new(BUCKET, "o", at(5), 1));
        store
            .put_object(ObjectRecord::new("A", BUCKET, "o", ObjectStatus::Ready, at(5)))
            .await
            .unwrap();
        let reconciler = Reconciler::new(store, driver, ReconcileSettings::new("A"));
        let mut request = ReconciliationRequest::new(BUCKET, "A");
        reconciler.run_local(&mut request).await.unwrap();
        request_id = request.id;
    }

    let store = RedbStore::open(&path).unwrap();
    let request = store.load_request(&request_id).await.unwrap();
    assert_eq!(request.step, RequestStep::Finalized);
    assert_eq!(request.progress.checked, 1);
    let key = RecordKey::new(&[request_id.as_str(), BUCKET, "o"]);
    let row = store.get::<SitesListingEntry>(key).await.unwrap().unwrap();
    assert_eq!(row.local.get("A").unwrap().rank, Rank::Ready);
}
