// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! The authoritative object store.
//!
//! Rows are owned by the accessor service; the engine only reads them and
//! applies the narrow repairs of [`ObjectWrite`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sitesync_core::{ObjectRecord, ObjectStatus, Rank, Result};

use crate::merge::BatchOutcome;

/// A repair applied to one authoritative row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectWrite {
    /// Set status and rank if the row exists, otherwise do nothing.
    MergeIfExists {
        /// Bucket name.
        bucket: String,
        /// Object name.
        name: String,
        /// New status.
        status: ObjectStatus,
        /// New bookkeeping rank.
        rank: Rank,
    },
    /// Insert the row unless one already exists.
    InsertIfAbsent(ObjectRecord),
    /// Promote an existing row to `READY` with the backend's metadata.
    UpdateFromDriver {
        /// Bucket name.
        bucket: String,
        /// Object name.
        name: String,
        /// Creation time reported by the backend.
        creation: DateTime<Utc>,
        /// Size reported by the backend.
        size: u64,
        /// Hash reported by the backend, kept unchanged if `None`.
        hash: Option<String>,
    },
    /// Delete the row.
    Delete {
        /// Bucket name.
        bucket: String,
        /// Object name.
        name: String,
    },
}

/// Authoritative object rows of every site, keyed by `(site, bucket, name)`.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Writes a row as the accessor would.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    async fn put_object(&self, record: ObjectRecord) -> Result<()>;

    /// Fetches one row.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    async fn get_object(&self, site: &str, bucket: &str, name: &str)
        -> Result<Option<ObjectRecord>>;

    /// Returns up to `limit` rows of `bucket` for `site` in name order,
    /// strictly after `after`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    async fn scan_objects(
        &self,
        site: &str,
        bucket: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ObjectRecord>>;

    /// Applies repairs to rows of `site` in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    async fn apply_objects(&self, site: &str, writes: Vec<ObjectWrite>) -> Result<BatchOutcome>;

    /// Sets status and rank of an existing row. Returns true if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    async fn merge_if_exists(
        &self,
        site: &str,
        bucket: &str,
        name: &str,
        status: ObjectStatus,
        rank: Rank,
    ) -> Result<bool> {
        let write = ObjectWrite::MergeIfExists {
            bucket: bucket.to_string(),
            name: name.to_string(),
            status,
            rank,
        };
        Ok(self.apply_objects(site, vec![write]).await?.updated > 0)
    }

    /// Inserts a row unless one exists. Returns true if inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    async fn insert_if_absent(&self, record: ObjectRecord) -> Result<bool> {
        let site = record.site.clone();
        Ok(self.apply_objects(&site, vec![ObjectWrite::InsertIfAbsent(record)]).await?.inserted
            > 0)
    }

    /// Promotes an existing row with backend metadata. Returns true if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    async fn update_from_driver(
        &self,
        site: &str,
        bucket: &str,
        name: &str,
        creation: DateTime<Utc>,
        size: u64,
        hash: Option<String>,
    ) -> Result<bool> {
        let write = ObjectWrite::UpdateFromDriver {
            bucket: bucket.to_string(),
            name: name.to_string(),
            creation,
            size,
            hash,
        };
        Ok(self.apply_objects(site, vec![write]).await?.updated > 0)
    }

    /// Deletes rows by name. Returns how many existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    async fn delete_many(&self, site: &str, bucket: &str, names: Vec<String>) -> Result<u64> {
        let writes = names
            .into_iter()
            .map(|name| ObjectWrite::Delete { bucket: bucket.to_string(), name })
            .collect();
        Ok(self.apply_objects(site, writes).await?.deleted)
    }
}
