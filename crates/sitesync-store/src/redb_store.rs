// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! redb-backed implementation of every store contract.
//!
//! Each record type has its own table of `&str -> &[u8]`, keys are composite
//! strings built by [`RecordKey`], values are bincode-encoded records.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, Durability, ReadableDatabase, ReadableTable, Table, TableDefinition};
use sitesync_core::{db_err, ObjectRecord, ObjectStatus, Rank, Result};
use tracing::debug;

use crate::merge::{BatchOutcome, MergeStore, OnMatch, OnMissing, WriteOp};
use crate::object::{ObjectStore, ObjectWrite};
use crate::record::{Record, RecordKey, Scope, TABLES};

type RecordTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

const fn table_def(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// Reads and decodes the record stored under `key`.
///
/// The outer result is the storage error, the inner one the decode error.
fn read_stored<T: Record>(
    table: &RecordTable<'_>,
    key: &RecordKey,
) -> Result<Option<std::result::Result<T, bincode::Error>>> {
    Ok(table.get(key.as_str()).map_err(db_err)?.map(|v| bincode::deserialize::<T>(v.value())))
}

/// Encodes and writes `record`, recording an item failure if it cannot be encoded.
fn write_record<T: Record>(
    table: &mut RecordTable<'_>,
    key: &RecordKey,
    record: &T,
    outcome: &mut BatchOutcome,
) -> Result<bool> {
    match bincode::serialize(record) {
        Ok(bytes) => {
            table.insert(key.as_str(), bytes.as_slice()).map_err(db_err)?;
            Ok(true)
        }
        Err(e) => {
            outcome.fail(key, format!("encode failed: {e}"));
            Ok(false)
        }
    }
}

fn apply_op<T: Record>(
    table: &mut RecordTable<'_>,
    op: WriteOp<T>,
    outcome: &mut BatchOutcome,
) -> Result<()> {
    let (record, on_match, on_missing) = match op {
        WriteOp::Delete(key) => {
            if table.remove(key.as_str()).map_err(db_err)?.is_some() {
                outcome.deleted += 1;
            } else {
                outcome.skipped += 1;
            }
            return Ok(());
        }
        WriteOp::Upsert { record, on_match, on_missing } => (record, on_match, on_missing),
    };

    let key = record.key();
    if let Err(reason) = key.validate() {
        outcome.fail(&key, reason);
        return Ok(());
    }

    let (next, inserted) = match (read_stored::<T>(table, &key)?, on_match) {
        (None, _) => match on_missing {
            OnMissing::Insert => (record, true),
            OnMissing::Discard => {
                outcome.skipped += 1;
                return Ok(());
            }
        },
        (Some(_), OnMatch::KeepExisting) => {
            outcome.skipped += 1;
            return Ok(());
        }
        (Some(_), OnMatch::Replace) => (record, false),
        (Some(Ok(mut existing)), OnMatch::Merge) => {
            existing.merge(record);
            (existing, false)
        }
        (Some(Err(e)), OnMatch::Merge) => {
            outcome.fail(&key, format!("stored value unreadable: {e}"));
            return Ok(());
        }
    };

    if write_record(table, &key, &next, outcome)? {
        if inserted {
            outcome.inserted += 1;
        } else {
            outcome.updated += 1;
        }
    }
    Ok(())
}

/// Applies `change` to the stored record under `key`, if any.
fn modify_existing<T: Record>(
    table: &mut RecordTable<'_>,
    key: &RecordKey,
    outcome: &mut BatchOutcome,
    change: impl FnOnce(&mut T),
) -> Result<()> {
    match read_stored::<T>(table, key)? {
        None => outcome.skipped += 1,
        Some(Err(e)) => outcome.fail(key, format!("stored value unreadable: {e}")),
        Some(Ok(mut record)) => {
            change(&mut record);
            if write_record(table, key, &record, outcome)? {
                outcome.updated += 1;
            }
        }
    }
    Ok(())
}

/// redb-based store for listings, requests and authoritative objects.
pub struct RedbStore {
    db: Arc<Database>,
    durability: Durability,
}

impl RedbStore {
    /// Open or create a redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        debug!(?path, "Opening redb listing store");
        let db = Database::create(path).map_err(db_err)?;
        Self::init(db, Durability::Immediate)
    }

    /// Open an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(db_err)?;
        Self::init(db, Durability::None)
    }

    fn init(db: Database, durability: Durability) -> Result<Self> {
        // Tables must exist before the first read transaction.
        {
            let txn = db.begin_write().map_err(db_err)?;
            for name in TABLES {
                let _ = txn.open_table(table_def(name)).map_err(db_err)?;
            }
            txn.commit().map_err(db_err)?;
        }
        Ok(Self { db: Arc::new(db), durability })
    }

    fn object_key(site: &str, bucket: &str, name: &str) -> RecordKey {
        RecordKey::new(&[site, bucket, name])
    }
}

#[async_trait]
impl MergeStore for RedbStore {
    async fn apply<T: Record>(&self, ops: Vec<WriteOp<T>>) -> Result<BatchOutcome> {
        if ops.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let db = Arc::clone(&self.db);
        let durability = self.durability;

        tokio::task::spawn_blocking(move || {
            let mut txn = db.begin_write().map_err(db_err)?;
            let mut outcome = BatchOutcome::default();

            {
                let mut table = txn.open_table(table_def(T::TABLE)).map_err(db_err)?;
                for op in ops {
                    apply_op(&mut table, op, &mut outcome)?;
                }
            }

            txn.set_durability(durability).map_err(db_err)?;
            txn.commit().map_err(db_err)?;
            Ok(outcome)
        })
        .await
        .map_err(db_err)?
    }

    async fn get<T: Record>(&self, key: RecordKey) -> Result<Option<T>> {
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(table_def(T::TABLE)).map_err(db_err)?;
            match table.get(key.as_str()).map_err(db_err)? {
                Some(value) => Ok(Some(bincode::deserialize(value.value()).map_err(db_err)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(db_err)?
    }

    async fn scan<T: Record>(
        &self,
        scope: Scope,
        after: Option<RecordKey>,
        limit: usize,
    ) -> Result<Vec<T>> {
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(table_def(T::TABLE)).map_err(db_err)?;

            let after = after.map(|k| k.as_str().to_string());
            let start = match &after {
                Some(k) if k.as_str() > scope.start() => k.clone(),
                _ => scope.start().to_string(),
            };
            let end = scope.end();
            let range = match end.as_deref() {
                Some(end) => table.range(start.as_str()..end),
                None => table.range(start.as_str()..),
            }
            .map_err(db_err)?;

            let mut records = Vec::with_capacity(limit.min(1024));
            for entry in range {
                if records.len() >= limit {
                    break;
                }
                let (key, value) = entry.map_err(db_err)?;
                if after.as_deref() == Some(key.value()) {
                    continue;
                }
                records.push(bincode::deserialize::<T>(value.value()).map_err(db_err)?);
            }
            Ok(records)
        })
        .await
        .map_err(db_err)?
    }

    async fn count<T: Record>(&self, scope: Scope) -> Result<u64> {
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(table_def(T::TABLE)).map_err(db_err)?;
            let end = scope.end();
            let range = match end.as_deref() {
                Some(end) => table.range(scope.start()..end),
                None => table.range(scope.start()..),
            }
            .map_err(db_err)?;

            let mut count = 0u64;
            for entry in range {
                entry.map_err(db_err)?;
                count += 1;
            }
            Ok(count)
        })
        .await
        .map_err(db_err)?
    }

    async fn delete_scope<T: Record>(&self, scope: Scope) -> Result<u64> {
        let db = Arc::clone(&self.db);
        let durability = self.durability;

        tokio::task::spawn_blocking(move || {
            let mut txn = db.begin_write().map_err(db_err)?;
            let removed;

            {
                let mut table = txn.open_table(table_def(T::TABLE)).map_err(db_err)?;
                let end = scope.end();
                let keys: Vec<String> = {
                    let range = match end.as_deref() {
                        Some(end) => table.range(scope.start()..end),
                        None => table.range(scope.start()..),
                    }
                    .map_err(db_err)?;
                    let mut keys = Vec::new();
                    for entry in range {
                        let (key, _) = entry.map_err(db_err)?;
                        keys.push(key.value().to_string());
                    }
                    keys
                };
                for key in &keys {
                    table.remove(key.as_str()).map_err(db_err)?;
                }
                removed = keys.len() as u64;
            }

            txn.set_durability(durability).map_err(db_err)?;
            txn.commit().map_err(db_err)?;
            Ok(removed)
        })
        .await
        .map_err(db_err)?
    }
}

#[async_trait]
impl ObjectStore for RedbStore {
    async fn put_object(&self, record: ObjectRecord) -> Result<()> {
        self.apply(vec![WriteOp::replace(record)]).await?.into_result()?;
        Ok(())
    }

    async fn get_object(
        &self,
        site: &str,
        bucket: &str,
        name: &str,
    ) -> Result<Option<ObjectRecord>> {
        self.get(Self::object_key(site, bucket, name)).await
    }

    async fn scan_objects(
        &self,
        site: &str,
        bucket: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ObjectRecord>> {
        let after = after.map(|name| Self::object_key(site, bucket, name));
        self.scan(Scope::new(&[site, bucket]), after, limit).await
    }

    async fn apply_objects(&self, site: &str, writes: Vec<ObjectWrite>) -> Result<BatchOutcome> {
        if writes.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let site = site.to_string();
        let db = Arc::clone(&self.db);
        let durability = self.durability;

        tokio::task::spawn_blocking(move || {
            let mut txn = db.begin_write().map_err(db_err)?;
            let mut outcome = BatchOutcome::default();

            {
                let mut table = txn.open_table(table_def(ObjectRecord::TABLE)).map_err(db_err)?;
                for write in writes {
                    match write {
                        ObjectWrite::MergeIfExists { bucket, name, status, rank } => {
                            let key = Self::object_key(&site, &bucket, &name);
                            modify_existing(&mut table, &key, &mut outcome, |r: &mut ObjectRecord| {
                                r.status = status;
                                r.rank = rank;
                            })?;
                        }
                        ObjectWrite::UpdateFromDriver { bucket, name, creation, size, hash } => {
                            let key = Self::object_key(&site, &bucket, &name);
                            modify_existing(&mut table, &key, &mut outcome, |r: &mut ObjectRecord| {
                                r.status = ObjectStatus::Ready;
                                r.rank = Rank::Ready;
                                r.creation = creation;
                                r.size = size;
                                if hash.is_some() {
                                    r.hash = hash;
                                }
                            })?;
                        }
                        ObjectWrite::InsertIfAbsent(record) => {
                            if record.site != site {
                                outcome.fail(record.key(), format!("row belongs to {}", record.site));
                                continue;
                            }
                            apply_op(&mut table, WriteOp::insert_if_absent(record), &mut outcome)?;
                        }
                        ObjectWrite::Delete { bucket, name } => {
                            let key = Self::object_key(&site, &bucket, &name);
                            apply_op::<ObjectRecord>(&mut table, WriteOp::delete(key), &mut outcome)?;
                        }
                    }
                }
            }

            txn.set_durability(durability).map_err(db_err)?;
            txn.commit().map_err(db_err)?;
            Ok(outcome)
        })
        .await
        .map_err(db_err)?
    }
}
