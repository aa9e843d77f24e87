// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! Persistence for the sitesync reconciliation engine.
//!
//! This crate provides:
//! - The bulk merge store abstraction every reconciliation step writes through
//! - A redb implementation, on disk or in memory
//! - The authoritative object store and request store contracts
//! - Storage drivers listing and probing the physical backend

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod driver;
pub mod merge;
pub mod object;
pub mod record;
pub mod redb_store;
pub mod request;

pub use batch::{BulkWriter, RecordCursor};
pub use driver::{
    DriverError, DriverResult, LocalFsDriver, MemoryDriver, ObjectListing, ProbeOutcome,
    StorageDriver, StorageObject,
};
pub use merge::{BatchOutcome, ItemFailure, MergeStore, OnMatch, OnMissing, WriteOp};
pub use object::{ObjectStore, ObjectWrite};
pub use record::{Record, RecordKey, Scope};
pub use redb_store::RedbStore;
pub use request::RequestStore;
