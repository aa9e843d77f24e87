// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! The bulk merge store abstraction.
//!
//! Reconciliation steps never read-modify-write records themselves. They
//! submit batches of keyed [`WriteOp`]s whose policy tells the store what to
//! do when the key exists and when it does not. A batch is applied in one
//! transaction; an item that cannot be applied on its own (bad key, corrupt
//! stored value) is reported in [`BatchOutcome::failures`] without failing
//! the rest of the batch.

use async_trait::async_trait;
use sitesync_core::{Error, Result};

use crate::record::{Record, RecordKey, Scope};

/// What to do when the key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnMatch {
    /// Overwrite the stored record.
    Replace,
    /// Fold the incoming record into the stored one with [`Record::merge`].
    Merge,
    /// Leave the stored record untouched.
    KeepExisting,
}

/// What to do when the key does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnMissing {
    /// Insert the incoming record.
    Insert,
    /// Drop the incoming record.
    Discard,
}

/// One keyed write.
#[derive(Debug, Clone)]
pub enum WriteOp<T> {
    /// Conditional upsert.
    Upsert {
        /// Incoming record.
        record: T,
        /// Policy when the key exists.
        on_match: OnMatch,
        /// Policy when the key is missing.
        on_missing: OnMissing,
    },
    /// Remove the key if present.
    Delete(RecordKey),
}

impl<T: Record> WriteOp<T> {
    /// Insert or overwrite.
    #[must_use]
    pub fn replace(record: T) -> Self {
        Self::Upsert { record, on_match: OnMatch::Replace, on_missing: OnMissing::Insert }
    }

    /// Insert or merge.
    #[must_use]
    pub fn merge(record: T) -> Self {
        Self::Upsert { record, on_match: OnMatch::Merge, on_missing: OnMissing::Insert }
    }

    /// Merge only if the key exists.
    #[must_use]
    pub fn merge_if_exists(record: T) -> Self {
        Self::Upsert { record, on_match: OnMatch::Merge, on_missing: OnMissing::Discard }
    }

    /// Insert only if the key is missing.
    #[must_use]
    pub fn insert_if_absent(record: T) -> Self {
        Self::Upsert { record, on_match: OnMatch::KeepExisting, on_missing: OnMissing::Insert }
    }

    /// Delete by key.
    #[must_use]
    pub fn delete(key: RecordKey) -> Self {
        Self::Delete(key)
    }

    /// Key this operation targets.
    #[must_use]
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Upsert { record, .. } => record.key(),
            Self::Delete(key) => key.clone(),
        }
    }
}

/// An item of a batch that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Key of the failed item, as displayed.
    pub key: String,
    /// Reason it failed.
    pub reason: String,
}

/// Result of applying one or more batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Records inserted under a new key.
    pub inserted: u64,
    /// Stored records replaced or merged.
    pub updated: u64,
    /// Operations that left the store untouched by policy.
    pub skipped: u64,
    /// Keys removed.
    pub deleted: u64,
    /// Items that could not be applied.
    pub failures: Vec<ItemFailure>,
}

impl BatchOutcome {
    /// Records inserted or updated.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.inserted + self.updated
    }

    /// Adds the counts of `other` to this outcome.
    pub fn absorb(&mut self, other: BatchOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.deleted += other.deleted;
        self.failures.extend(other.failures);
    }

    /// Records a failed item.
    pub fn fail(&mut self, key: impl ToString, reason: impl ToString) {
        self.failures.push(ItemFailure { key: key.to_string(), reason: reason.to_string() });
    }

    /// Turns recorded failures into a single aggregated error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PartialBatch`] if any item failed.
    pub fn into_result(self) -> Result<Self> {
        match self.failures.first() {
            None => Ok(self),
            Some(first) => Err(Error::PartialBatch {
                failed: self.failures.len(),
                first: format!("{}: {}", first.key, first.reason),
            }),
        }
    }
}

/// Key-addressed persistence with conditional bulk upserts and paged scans.
///
/// Scans return records in key order. Paging with `after` resumes strictly
/// after the given key, so callers can stream a scope in bounded pages while
/// writing to it.
#[async_trait]
pub trait MergeStore: Send + Sync + 'static {
    /// Applies a batch of operations in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the transaction fails. Per-item failures
    /// are reported in the outcome instead.
    async fn apply<T: Record>(&self, ops: Vec<WriteOp<T>>) -> Result<BatchOutcome>;

    /// Fetches one record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] on read failure.
    async fn get<T: Record>(&self, key: RecordKey) -> Result<Option<T>>;

    /// Returns up to `limit` records of `scope` ordered by key, strictly after `after`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] on read or decode failure.
    async fn scan<T: Record>(
        &self,
        scope: Scope,
        after: Option<RecordKey>,
        limit: usize,
    ) -> Result<Vec<T>>;

    /// Counts the records of `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] on read failure.
    async fn count<T: Record>(&self, scope: Scope) -> Result<u64>;

    /// Deletes every record of `scope`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the transaction fails.
    async fn delete_scope<T: Record>(&self, scope: Scope) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_absorb_and_written() {
        let mut total = BatchOutcome { inserted: 2, updated: 1, ..BatchOutcome::default() };
        total.absorb(BatchOutcome { inserted: 1, skipped: 4, ..BatchOutcome::default() });
        assert_eq!(total.written(), 4);
        assert_eq!(total.skipped, 4);
        assert!(total.into_result().is_ok());
    }

    #[test]
    fn test_outcome_failures_aggregate() {
        let mut outcome = BatchOutcome::default();
        outcome.fail("r/b/x", "invalid key");
        outcome.fail("r/b/y", "decode");
        match outcome.into_result() {
            Err(Error::PartialBatch { failed, first }) => {
                assert_eq!(failed, 2);
                assert_eq!(first, "r/b/x: invalid key");
            }
            other => panic!("expected partial batch, got {other:?}"),
        }
    }
}
