// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! Storage drivers: the physical backend as seen by the reconciliation engine.
//!
//! The engine only lists, probes and reads metadata. Listings are forward
//! cursors that must be closed on every exit path.

mod local;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use local::LocalFsDriver;
pub use memory::MemoryDriver;

/// A specialized `Result` type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Errors raised by a storage driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The object does not exist. A signal, not a failure.
    #[error("object not found: {bucket}/{name}")]
    NotFound {
        /// Bucket name.
        bucket: String,
        /// Object name.
        name: String,
    },

    /// The backend cannot be reached or refused the operation.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure.
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(bucket: &str, name: &str) -> Self {
        Self::NotFound { bucket: bucket.to_string(), name: name.to_string() }
    }

    /// Returns true for [`DriverError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<DriverError> for sitesync_core::Error {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::NotFound { bucket, name } => Self::NotFound(format!("{bucket}/{name}")),
            DriverError::Io(e) => Self::Io(e),
            other => Self::driver(other),
        }
    }
}

/// Outcome of a successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The object exists physically.
    Found,
    /// The object does not exist physically.
    NotFound,
}

/// Metadata of one physical object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageObject {
    /// Bucket name.
    pub bucket: String,
    /// Object name.
    pub name: String,
    /// Creation time.
    pub creation: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
    /// Content hash, if the backend keeps one.
    pub hash: Option<String>,
    /// Backend-side metadata.
    pub metadata: BTreeMap<String, String>,
}

impl StorageObject {
    /// Creates an object description.
    #[must_use]
    pub fn new(
        bucket: impl Into<String>,
        name: impl Into<String>,
        creation: DateTime<Utc>,
        size: u64,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
            creation,
            size,
            hash: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Sets the hash.
    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

/// A forward cursor over a bucket listing.
#[async_trait]
pub trait ObjectListing: Send {
    /// Returns the next object, `None` at the end.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails mid-listing.
    async fn next(&mut self) -> DriverResult<Option<StorageObject>>;

    /// Releases backend resources. Calling it twice is harmless.
    async fn close(&mut self);
}

/// The physical storage backend of one site.
#[async_trait]
pub trait StorageDriver: Send + Sync + 'static {
    /// Lists `bucket`, optionally restricted to a name prefix and a creation
    /// window `[from, to)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing cannot be opened.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> DriverResult<Box<dyn ObjectListing>>;

    /// Checks whether an object exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot answer.
    async fn probe(&self, bucket: &str, name: &str) -> DriverResult<ProbeOutcome>;

    /// Reads the metadata of an object.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotFound`] if it does not exist.
    async fn get_metadata(&self, bucket: &str, name: &str) -> DriverResult<StorageObject>;
}

/// Returns true if `creation` lies in `[from, to)`.
pub(crate) fn in_window(
    creation: DateTime<Utc>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> bool {
    from.map_or(true, |t| creation >= t) && to.map_or(true, |t| creation < t)
}
