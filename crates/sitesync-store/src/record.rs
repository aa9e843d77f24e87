//! Keyed records and key scopes.
//!
//! Every record lives in one table and is addressed by a composite key whose
//! parts are joined with `\0`. A [`Scope`] selects all keys sharing leading
//! parts, e.g. every row of one request and bucket.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sitesync_core::{
    NativeListingEntry, ObjectRecord, ReconciliationRequest, SitesActionEntry, SitesListingEntry,
};

const SEP: char = '\0';

/// Composite key of a record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    joined: String,
    parts: usize,
}

impl RecordKey {
    /// Joins key parts.
    #[must_use]
    pub fn new(parts: &[&str]) -> Self {
        Self { joined: parts.join("\0"), parts: parts.len() }
    }

    /// The encoded key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.joined
    }

    /// Checks that no part is empty or contains the separator.
    ///
    /// # Errors
    ///
    /// Returns a description of the offending key.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let parts: Vec<&str> = self.joined.split(SEP).collect();
        if parts.len() != self.parts || parts.iter().any(|p| p.is_empty()) {
            return Err(format!("invalid key {:?}", self.joined.replace(SEP, "/")));
        }
        Ok(())
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.joined.replace(SEP, "/"))
    }
}

/// A contiguous key range sharing leading key parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    prefix: String,
}

impl Scope {
    /// Every key starting with `parts`.
    #[must_use]
    pub fn new(parts: &[&str]) -> Self {
        let mut prefix = parts.join("\0");
        prefix.push(SEP);
        Self { prefix }
    }

    /// Every key of the table.
    #[must_use]
    pub fn all() -> Self {
        Self { prefix: String::new() }
    }

    /// Rows owned by one request for one bucket.
    #[must_use]
    pub fn request(request_id: &str, bucket: &str) -> Self {
        Self::new(&[request_id, bucket])
    }

    /// Inclusive lower bound.
    #[must_use]
    pub fn start(&self) -> &str {
        &self.prefix
    }

    /// Exclusive upper bound, `None` when unbounded.
    #[must_use]
    pub fn end(&self) -> Option<String> {
        let head = self.prefix.strip_suffix(SEP)?;
        Some(format!("{head}\x01"))
    }

    /// Returns true if `key` falls inside the scope.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
    }
}

/// A value stored in a [`crate::MergeStore`].
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Table holding records of this type.
    const TABLE: &'static str;

    /// Composite key of this record.
    fn key(&self) -> RecordKey;

    /// Folds `incoming` into this record for [`crate::OnMatch::Merge`].
    fn merge(&mut self, incoming: Self) {
        *self = incoming;
    }
}

/// Every table a store must create.
pub const TABLES: [&str; 5] = [
    NativeListingEntry::TABLE,
    SitesListingEntry::TABLE,
    SitesActionEntry::TABLE,
    ObjectRecord::TABLE,
    ReconciliationRequest::TABLE,
];

impl Record for NativeListingEntry {
    const TABLE: &'static str = "native_listing";

    fn key(&self) -> RecordKey {
        RecordKey::new(&[self.request_id.as_str(), self.bucket.as_str(), self.name.as_str()])
    }

    fn merge(&mut self, incoming: Self) {
        self.merge_from(incoming);
    }
}

impl Record for SitesListingEntry {
    const TABLE: &'static str = "sites_listing";

    fn key(&self) -> RecordKey {
        RecordKey::new(&[self.request_id.as_str(), self.bucket.as_str(), self.name.as_str()])
    }

    fn merge(&mut self, incoming: Self) {
        self.merge_from(incoming);
    }
}

impl Record for SitesActionEntry {
    const TABLE: &'static str = "sites_action";

    fn key(&self) -> RecordKey {
        RecordKey::new(&[self.request_id.as_str(), self.bucket.as_str(), self.name.as_str()])
    }
}

impl Record for ObjectRecord {
    const TABLE: &'static str = "objects";

    fn key(&self) -> RecordKey {
        RecordKey::new(&[self.site.as_str(), self.bucket.as_str(), self.name.as_str()])
    }
}

impl Record for ReconciliationRequest {
    const TABLE: &'static str = "requests";

    fn key(&self) -> RecordKey {
        RecordKey::new(&[self.id.as_str()])
    }
}
