// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! Multi-site object reconciliation engine.
//!
//! A [`Reconciler`] drives one site's half of a reconciliation request:
//! - Cleanup of stale rows in the authoritative object store
//! - The native listing, built from the database and the storage driver
//! - Local convergence into the site's claim in the sites listing
//!
//! Sites then exchange sites listings. The central steps merge remote rows
//! and plan the sites actions that converge every site on one state.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cleanup;
pub mod continuation;
pub mod metrics;
pub mod native;
pub mod pipeline;
pub mod planner;
pub mod reconciler;
pub mod refresh;
pub mod remote;
pub mod resolve;

pub use cleanup::{CleanupSummary, PurgeSummary};
pub use continuation::{Continuation, ContinuationMode};
pub use metrics::{init_metrics, ObjectSource};
pub use pipeline::{LocalStep, LOCAL_STEPS};
pub use planner::{coverage, plan_entry, Coverage, PlanSummary};
pub use reconciler::{ReconcileSettings, Reconciler};
pub use resolve::{finalize_entry, resolve_entry, Resolution, ResolveSummary};
