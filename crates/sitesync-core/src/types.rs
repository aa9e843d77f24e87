// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! Records produced and exchanged by reconciliation steps.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rank::{ObjectStatus, Rank};

/// A site's claim about an object's status and when that claim was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleSiteObject {
    /// Site that made the claim.
    pub site: String,
    /// Claimed rank.
    pub rank: Rank,
    /// Time the claim was recorded.
    pub event: DateTime<Utc>,
}

impl SingleSiteObject {
    /// Creates a new claim.
    #[must_use]
    pub fn new(site: impl Into<String>, rank: Rank, event: DateTime<Utc>) -> Self {
        Self { site: site.into(), rank, event }
    }
}

/// One site's view of an object within a request: what the authoritative
/// store says (`db`) and what the physical backend says (`driver`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeListingEntry {
    /// Row identifier. Kept stable when the row is merged.
    pub id: String,
    /// Owning request.
    pub request_id: String,
    /// Bucket name.
    pub bucket: String,
    /// Object name.
    pub name: String,
    /// Authoritative store view.
    pub db: Option<SingleSiteObject>,
    /// Physical backend view.
    pub driver: Option<SingleSiteObject>,
}

impl NativeListingEntry {
    /// Creates an entry carrying only the authoritative view.
    #[must_use]
    pub fn from_db(
        request_id: impl Into<String>,
        bucket: impl Into<String>,
        name: impl Into<String>,
        db: SingleSiteObject,
    ) -> Self {
        Self {
            id: new_id(),
            request_id: request_id.into(),
            bucket: bucket.into(),
            name: name.into(),
            db: Some(db),
            driver: None,
        }
    }

    /// Creates an entry carrying only the backend view.
    #[must_use]
    pub fn from_driver(
        request_id: impl Into<String>,
        bucket: impl Into<String>,
        name: impl Into<String>,
        driver: SingleSiteObject,
    ) -> Self {
        Self {
            id: new_id(),
            request_id: request_id.into(),
            bucket: bucket.into(),
            name: name.into(),
            db: None,
            driver: Some(driver),
        }
    }

    /// Folds an incoming observation into this entry.
    ///
    /// A present `db` replaces ours, and a delete-like `db` invalidates any
    /// driver observation. A present `driver` replaces ours. The row id is kept.
    pub fn merge_from(&mut self, incoming: NativeListingEntry) {
        if let Some(db) = incoming.db {
            if db.rank.is_delete_like() {
                self.driver = None;
            }
            self.db = Some(db);
        }
        if let Some(driver) = incoming.driver {
            self.driver = Some(driver);
        }
    }
}

/// Rank and event of one site inside [`SiteStatuses`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SiteClaim {
    rank: Rank,
    event: DateTime<Utc>,
}

/// Per-site canonical statuses of one object, at most one per site.
///
/// Serialized as a list sorted by most recent event first, then rank, then
/// site name, so equal contents always encode identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<SingleSiteObject>", into = "Vec<SingleSiteObject>")]
pub struct SiteStatuses {
    claims: BTreeMap<String, SiteClaim>,
}

impl SiteStatuses {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a claim, replacing any earlier claim of the same site.
    pub fn insert(&mut self, claim: SingleSiteObject) {
        self.claims.insert(claim.site, SiteClaim { rank: claim.rank, event: claim.event });
    }

    /// Replaces the claims of every site present in `other`, keeps the rest.
    pub fn merge(&mut self, other: SiteStatuses) {
        self.claims.extend(other.claims);
    }

    /// Returns the claim of `site`.
    #[must_use]
    pub fn get(&self, site: &str) -> Option<SingleSiteObject> {
        self.claims.get(site).map(|c| SingleSiteObject::new(site, c.rank, c.event))
    }

    /// Removes the claim of `site`.
    pub fn remove(&mut self, site: &str) -> Option<SingleSiteObject> {
        self.claims.remove(site).map(|c| SingleSiteObject::new(site, c.rank, c.event))
    }

    /// Keeps only the claims for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, Rank) -> bool) {
        self.claims.retain(|site, c| keep(site, c.rank));
    }

    /// Rewrites the rank of `site` if its claim satisfies `when`.
    pub fn rewrite(&mut self, site: &str, when: impl Fn(Rank) -> bool, to: Rank) -> bool {
        match self.claims.get_mut(site) {
            Some(claim) if when(claim.rank) => {
                claim.rank = to;
                true
            }
            _ => false,
        }
    }

    /// Number of sites with a claim.
    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Returns true if no site has a claim.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Returns true if `site` has a claim.
    #[must_use]
    pub fn contains(&self, site: &str) -> bool {
        self.claims.contains_key(site)
    }

    /// Names of the sites with a claim.
    #[must_use]
    pub fn sites(&self) -> BTreeSet<&str> {
        self.claims.keys().map(String::as_str).collect()
    }

    /// Claims in serialization order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<SingleSiteObject> {
        let mut out: Vec<SingleSiteObject> = self
            .claims
            .iter()
            .map(|(site, c)| SingleSiteObject::new(site.clone(), c.rank, c.event))
            .collect();
        out.sort_by(|a, b| {
            b.event.cmp(&a.event).then(a.rank.cmp(&b.rank)).then_with(|| a.site.cmp(&b.site))
        });
        out
    }
}

impl From<Vec<SingleSiteObject>> for SiteStatuses {
    /// Later elements win over earlier ones for the same site.
    fn from(list: Vec<SingleSiteObject>) -> Self {
        let mut statuses = Self::new();
        for claim in list {
            statuses.insert(claim);
        }
        statuses
    }
}

impl From<SiteStatuses> for Vec<SingleSiteObject> {
    fn from(statuses: SiteStatuses) -> Self {
        statuses.to_vec()
    }
}

impl FromIterator<SingleSiteObject> for SiteStatuses {
    fn from_iter<I: IntoIterator<Item = SingleSiteObject>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

/// Canonical per-site statuses of one object, aggregated across sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SitesListingEntry {
    /// Owning request.
    pub request_id: String,
    /// Bucket name.
    pub bucket: String,
    /// Object name.
    pub name: String,
    /// One claim per reporting site.
    pub local: SiteStatuses,
}

impl SitesListingEntry {
    /// Creates an entry holding a single claim.
    #[must_use]
    pub fn single(
        request_id: impl Into<String>,
        bucket: impl Into<String>,
        name: impl Into<String>,
        claim: SingleSiteObject,
    ) -> Self {
        let mut local = SiteStatuses::new();
        local.insert(claim);
        Self { request_id: request_id.into(), bucket: bucket.into(), name: name.into(), local }
    }

    /// Merges another entry for the same object: its sites replace ours in
    /// place, sites it does not mention are kept.
    pub fn merge_from(&mut self, incoming: SitesListingEntry) {
        self.local.merge(incoming.local);
    }
}

/// Convergence target of one divergent object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SitesActionEntry {
    /// Owning request.
    pub request_id: String,
    /// Bucket name.
    pub bucket: String,
    /// Object name.
    pub name: String,
    /// Rank every site should converge to.
    pub need_action: Rank,
    /// Sites currently holding the winning claim.
    pub need_action_from: Vec<String>,
    /// Sites that must act, sorted.
    pub sites: Vec<String>,
}

/// A row of the authoritative object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRecord {
    /// Site owning the row.
    pub site: String,
    /// Bucket name.
    pub bucket: String,
    /// Object name.
    pub name: String,
    /// Persisted lifecycle status.
    pub status: ObjectStatus,
    /// Reconciliation bookkeeping rank, may be `TO_UPDATE`.
    pub rank: Rank,
    /// Creation time.
    pub creation: DateTime<Utc>,
    /// Expiration time.
    pub expires: Option<DateTime<Utc>>,
    /// Size in bytes.
    pub size: u64,
    /// Content hash.
    pub hash: Option<String>,
    /// User metadata.
    pub metadata: BTreeMap<String, String>,
}

impl ObjectRecord {
    /// Creates a row whose rank mirrors its status.
    #[must_use]
    pub fn new(
        site: impl Into<String>,
        bucket: impl Into<String>,
        name: impl Into<String>,
        status: ObjectStatus,
        creation: DateTime<Utc>,
    ) -> Self {
        Self {
            site: site.into(),
            bucket: bucket.into(),
            name: name.into(),
            status,
            rank: status.rank(),
            creation,
            expires: None,
            size: 0,
            hash: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Sets the size.
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Sets the bookkeeping rank.
    #[must_use]
    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self
    }

    /// Sets the expiration time.
    #[must_use]
    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Adds a metadata pair.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Generates a fresh unique row or request identifier.
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_native_merge_replaces_db_and_clears_driver_on_delete() {
        let db = SingleSiteObject::new("a", Rank::Ready, at(1));
        let mut entry = NativeListingEntry::from_db("r", "b", "o", db);
        let id = entry.id.clone();
        entry.merge_from(NativeListingEntry::from_driver(
            "r",
            "b",
            "o",
            SingleSiteObject::new("a", Rank::Ready, at(2)),
        ));
        assert!(entry.driver.is_some());

        entry.merge_from(NativeListingEntry::from_db(
            "r",
            "b",
            "o",
            SingleSiteObject::new("a", Rank::Deleting, at(3)),
        ));
        assert_eq!(entry.db.as_ref().map(|d| d.rank), Some(Rank::Deleting));
        assert!(entry.driver.is_none());
        assert_eq!(entry.id, id);
    }

    #[test]
    fn test_native_merge_keeps_driver_on_upload_db() {
        let mut entry = NativeListingEntry::from_driver(
            "r",
            "b",
            "o",
            SingleSiteObject::new("a", Rank::Ready, at(2)),
        );
        entry.merge_from(NativeListingEntry::from_db(
            "r",
            "b",
            "o",
            SingleSiteObject::new("a", Rank::Upload, at(1)),
        ));
        assert!(entry.db.is_some());
        assert!(entry.driver.is_some());
    }

    #[test]
    fn test_site_statuses_replace_in_place_and_append() {
        let mut entry =
            SitesListingEntry::single("r", "b", "o", SingleSiteObject::new("x", Rank::Ready, at(1)));
        entry.local.insert(SingleSiteObject::new("z", Rank::Deleted, at(2)));

        entry.merge_from(SitesListingEntry::single(
            "r",
            "b",
            "o",
            SingleSiteObject::new("x", Rank::Deleted, at(5)),
        ));
        assert_eq!(entry.local.len(), 2);
        assert_eq!(entry.local.get("x").map(|c| c.rank), Some(Rank::Deleted));
        assert_eq!(entry.local.get("z").map(|c| c.event), Some(at(2)));

        entry.merge_from(SitesListingEntry::single(
            "r",
            "b",
            "o",
            SingleSiteObject::new("y", Rank::Ready, at(3)),
        ));
        assert_eq!(entry.local.len(), 3);
        assert_eq!(entry.local.get("x").map(|c| c.rank), Some(Rank::Deleted));
    }

    #[test]
    fn test_site_statuses_ordering_is_stable() {
        let statuses: SiteStatuses = vec![
            SingleSiteObject::new("b", Rank::Ready, at(1)),
            SingleSiteObject::new("a", Rank::Ready, at(1)),
            SingleSiteObject::new("c", Rank::Deleted, at(9)),
        ]
        .into_iter()
        .collect();
        let sites: Vec<String> = statuses.to_vec().into_iter().map(|c| c.site).collect();
        assert_eq!(sites, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_site_statuses_dedupe_on_decode() {
        let json = r#"[
            {"site":"a","rank":1,"event":"1970-01-01T00:00:01Z"},
            {"site":"a","rank":2,"event":"1970-01-01T00:00:02Z"}
        ]"#;
        let statuses: SiteStatuses = serde_json::from_str(json).unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses.get("a").map(|c| c.rank), Some(Rank::Ready));
    }

    #[test]
    fn test_exchanged_field_names() {
        let entry = SitesActionEntry {
            request_id: "r".to_string(),
            bucket: "b".to_string(),
            name: "o".to_string(),
            need_action: Rank::Deleted,
            need_action_from: vec!["b".to_string()],
            sites: vec!["a".to_string()],
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["requestId"], "r");
        assert_eq!(json["needAction"], 5);
        assert_eq!(json["needActionFrom"][0], "b");
    }

    #[test]
    fn test_rewrite_only_when_predicate_holds() {
        let mut statuses = SiteStatuses::new();
        statuses.insert(SingleSiteObject::new("a", Rank::Deleting, at(1)));
        assert!(!statuses.rewrite("a", |r| r == Rank::Ready, Rank::Deleted));
        assert!(statuses.rewrite("a", Rank::is_delete_like, Rank::Deleted));
        assert_eq!(statuses.get("a").map(|c| c.rank), Some(Rank::Deleted));
        assert!(!statuses.rewrite("missing", Rank::is_delete_like, Rank::Deleted));
    }
}
