// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation metrics.
//!
//! The library only records; installing an exporter is up to the binary.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Rows counted by [`record_objects`], by origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectSource {
    /// Authoritative store rows scanned into the native listing.
    FromDb,
    /// Backend objects listed into the native listing.
    FromDriver,
    /// Authoritative rows refreshed from backend metadata.
    UpdateFromDriver,
    /// Remote sites listing rows merged.
    FromRemoteSitesListing,
    /// Sites action rows emitted.
    ToActions,
}

impl ObjectSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::FromDb => "from_db",
            Self::FromDriver => "from_driver",
            Self::UpdateFromDriver => "update_from_driver",
            Self::FromRemoteSitesListing => "from_remote_sites_listing",
            Self::ToActions => "to_actions",
        }
    }

    const fn stage(self) -> &'static str {
        match self {
            Self::FromRemoteSitesListing | Self::ToActions => "central",
            _ => "local",
        }
    }
}

/// Initialize reconciliation metric descriptions (call once at startup).
pub fn init_metrics() {
    describe_counter!(
        "sitesync_reconcile_objects_total",
        "Rows processed by reconciliation steps, by stage and source"
    );
    describe_counter!("sitesync_reconcile_steps_total", "Reconciliation steps completed");
    describe_histogram!(
        "sitesync_reconcile_step_duration_seconds",
        "Duration of reconciliation steps in seconds"
    );
}

/// Counts rows processed from `source`.
pub fn record_objects(source: ObjectSource, count: u64) {
    counter!(
        "sitesync_reconcile_objects_total",
        "step" => source.stage(),
        "source" => source.as_str()
    )
    .increment(count);
}

/// Records a completed step and its duration.
pub fn record_step(step: &'static str, elapsed: Duration) {
    counter!("sitesync_reconcile_steps_total", "step" => step).increment(1);
    histogram!("sitesync_reconcile_step_duration_seconds", "step" => step)
        .record(elapsed.as_secs_f64());
}
