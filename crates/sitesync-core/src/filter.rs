//! Object filters applied by the authoritative store scan.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rank::ObjectStatus;
use crate::types::ObjectRecord;

/// Restricts a reconciliation request to a subset of a bucket.
///
/// Every bound that is set must hold for a row to match. The driver pass only
/// honours `name_prefix`, `creation_after` and `creation_before`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectFilter {
    /// Object name prefix.
    pub name_prefix: Option<String>,
    /// Accepted statuses. Empty accepts all.
    pub statuses: Vec<ObjectStatus>,
    /// Created strictly before.
    pub creation_before: Option<DateTime<Utc>>,
    /// Created at or after.
    pub creation_after: Option<DateTime<Utc>>,
    /// Expires strictly before.
    pub expires_before: Option<DateTime<Utc>>,
    /// Expires at or after.
    pub expires_after: Option<DateTime<Utc>>,
    /// Size strictly less than.
    pub size_less_than: Option<u64>,
    /// Size strictly greater than.
    pub size_greater_than: Option<u64>,
    /// Metadata pairs that must all be present with equal values.
    pub metadata: BTreeMap<String, String>,
}

impl ObjectFilter {
    /// Filter on a name prefix.
    #[must_use]
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self { name_prefix: Some(prefix.into()), ..Self::default() }
    }

    /// Restricts to the given statuses.
    #[must_use]
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = ObjectStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    /// Restricts to a creation window `[after, before)`.
    #[must_use]
    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.creation_after = after;
        self.creation_before = before;
        self
    }

    /// Returns true if `name` passes the prefix bound.
    #[must_use]
    pub fn matches_name(&self, name: &str) -> bool {
        self.name_prefix.as_deref().map_or(true, |p| name.starts_with(p))
    }

    /// Returns true if `creation` passes the creation window.
    #[must_use]
    pub fn matches_creation(&self, creation: DateTime<Utc>) -> bool {
        self.creation_after.map_or(true, |t| creation >= t)
            && self.creation_before.map_or(true, |t| creation < t)
    }

    /// Returns true if `record` satisfies every bound.
    #[must_use]
    pub fn matches(&self, record: &ObjectRecord) -> bool {
        if !self.matches_name(&record.name) || !self.matches_creation(record.creation) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if self.expires_before.is_some() || self.expires_after.is_some() {
            let Some(expires) = record.expires else {
                return false;
            };
            if self.expires_before.is_some_and(|t| expires >= t)
                || self.expires_after.is_some_and(|t| expires < t)
            {
                return false;
            }
        }
        if self.size_less_than.is_some_and(|n| record.size >= n)
            || self.size_greater_than.is_some_and(|n| record.size <= n)
        {
            return false;
        }
        self.metadata.iter().all(|(k, v)| record.metadata.get(k) == Some(v))
    }
}
