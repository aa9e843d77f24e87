//! Core types and utilities for the sitesync reconciliation engine.
//!
//! This crate provides the building blocks shared by every sitesync component:
//! - The rank table ordering object lifecycle statuses
//! - Listing records exchanged between reconciliation steps and sites
//! - The reconciliation request and its progress counters
//! - Configuration management and error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod filter;
pub mod rank;
pub mod request;
pub mod types;

pub use config::{Config, DriverConfig, LogFormat, LoggingConfig, ReconcileConfig, StoreConfig};
pub use error::{db_err, Error, Result};
pub use filter::ObjectFilter;
pub use rank::{ObjectStatus, Rank, TO_UPDATE_RANK};
pub use request::{ReconciliationRequest, RequestProgress, RequestStep};
pub use types::{
    new_id, NativeListingEntry, ObjectRecord, SingleSiteObject, SiteStatuses, SitesActionEntry,
    SitesListingEntry,
};
