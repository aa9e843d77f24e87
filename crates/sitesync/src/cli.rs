//! Command line interface definition.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

/// Sitesync: reconciles object listings across storage sites.
#[derive(Parser)]
#[command(name = "sitesync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the local reconciliation steps for a bucket.
    Run(RunArgs),
    /// Write a request's sites listing as JSON lines for peers.
    Export(ExportArgs),
    /// Merge a peer's exported sites listing into a request.
    Merge(MergeArgs),
    /// Compute the sites actions of a request.
    Plan(RequestArgs),
    /// Write a request's sites actions as JSON lines.
    Actions(ActionsArgs),
    /// Delete a request's listing rows.
    Purge(RequestArgs),
    /// Ask a running request to stop at its next batch boundary.
    Stop(RequestArgs),
    /// List reconciliation requests.
    Status(StatusArgs),
    /// Print version information.
    Version,
}

/// Arguments for the run command.
#[derive(Args)]
pub struct RunArgs {
    /// Bucket to reconcile.
    pub bucket: String,

    /// Request id, shared by every participating site. Resumes the request
    /// if it already exists.
    #[arg(long)]
    pub request_id: Option<String>,

    /// Only reconcile objects whose name starts with this prefix.
    #[arg(long)]
    pub prefix: Option<String>,

    /// Only reconcile objects created at or after this time (RFC 3339).
    #[arg(long)]
    pub created_after: Option<DateTime<Utc>>,

    /// Only reconcile objects created before this time (RFC 3339).
    #[arg(long)]
    pub created_before: Option<DateTime<Utc>>,

    /// Sites the objects must converge on. Defaults to the configured sites.
    #[arg(long = "site", value_name = "SITE")]
    pub sites: Vec<String>,

    /// Rows in a transitional status older than this are probed (RFC 3339).
    #[arg(long)]
    pub start: Option<DateTime<Utc>>,

    /// Compute listings without repairing the object store.
    #[arg(long)]
    pub dry_run: bool,

    /// Carry over the native listing of a previous request.
    #[arg(long, value_name = "REQUEST_ID")]
    pub continue_from: Option<String>,

    /// Copy the previous request's rows instead of moving them.
    #[arg(long, requires = "continue_from")]
    pub keep_previous: bool,
}

/// Arguments naming one request.
#[derive(Args)]
pub struct RequestArgs {
    /// Request id.
    pub request_id: String,
}

/// Arguments for the export command.
#[derive(Args)]
pub struct ExportArgs {
    /// Request id.
    pub request_id: String,

    /// Output file. Defaults to stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for the merge command.
#[derive(Args)]
pub struct MergeArgs {
    /// Request id.
    pub request_id: String,

    /// JSON lines file exported by a peer.
    pub input: PathBuf,
}

/// Arguments for the actions command.
#[derive(Args)]
pub struct ActionsArgs {
    /// Request id.
    pub request_id: String,

    /// Output file. Defaults to stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Delete the actions once written.
    #[arg(long)]
    pub consume: bool,
}

/// Arguments for the status command.
#[derive(Args)]
pub struct StatusArgs {
    /// Only list requests of this bucket.
    #[arg(short, long)]
    pub bucket: Option<String>,

    /// Output format (text, json).
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Output format for CLI commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}
