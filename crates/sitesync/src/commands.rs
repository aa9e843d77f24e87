//! Command handlers.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use futures::{stream, Stream};
use sitesync_core::{Config, Error, ObjectFilter, ReconciliationRequest, SitesListingEntry};
use sitesync_engine::{Continuation, ContinuationMode, ReconcileSettings, Reconciler};
use sitesync_store::{LocalFsDriver, Record, RecordCursor, RedbStore, RequestStore};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::info;

use crate::cli::{ActionsArgs, ExportArgs, MergeArgs, OutputFormat, RequestArgs, RunArgs, StatusArgs};

/// Store, driver and reconciler of the local site.
pub struct Context {
    store: Arc<RedbStore>,
    reconciler: Reconciler<RedbStore, LocalFsDriver>,
}

impl Context {
    /// Opens the listing store and the local-filesystem driver named in `config`.
    pub fn open(config: &Config) -> Result<Self> {
        if let Some(parent) = config.store.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }
        let store = Arc::new(
            RedbStore::open(&config.store.path).context("Failed to open listing store")?,
        );
        let driver = Arc::new(LocalFsDriver::new(&config.driver.root));
        let reconciler =
            Reconciler::new(Arc::clone(&store), driver, ReconcileSettings::from_config(config));
        info!(
            site = %config.site,
            store = %config.store.path.display(),
            driver_root = %config.driver.root.display(),
            "Sitesync context opened"
        );
        Ok(Self { store, reconciler })
    }

    async fn request(&self, id: &str) -> Result<ReconciliationRequest> {
        self.store.load_request(id).await.with_context(|| format!("Failed to load request {id}"))
    }
}

fn new_request(ctx: &Context, args: &RunArgs) -> ReconciliationRequest {
    let mut request = ReconciliationRequest::new(&args.bucket, &ctx.reconciler.settings().site);
    if args.prefix.is_some() || args.created_after.is_some() || args.created_before.is_some() {
        let filter = ObjectFilter { name_prefix: args.prefix.clone(), ..ObjectFilter::default() }
            .created_between(args.created_after, args.created_before);
        request = request.with_filter(filter);
    }
    if !args.sites.is_empty() {
        request = request.with_context_sites(args.sites.iter().cloned());
    }
    if let Some(start) = args.start {
        request = request.with_start(start);
    }
    if args.dry_run {
        request = request.dry_run();
    }
    request
}

/// Runs the local steps, creating the request or resuming it.
pub async fn run(ctx: &Context, args: RunArgs) -> Result<()> {
    let mut request = match &args.request_id {
        Some(id) => match ctx.store.load_request(id).await {
            Ok(existing) => {
                if existing.bucket != args.bucket {
                    bail!("request {id} reconciles bucket {}, not {}", existing.bucket, args.bucket);
                }
                info!(request_id = %id, step = existing.step.as_str(), "Resuming request");
                existing
            }
            Err(Error::NotFound(_)) => new_request(ctx, &args).with_id(id.clone()),
            Err(e) => return Err(e).context("Failed to load request"),
        },
        None => new_request(ctx, &args),
    };

    let outcome = match args.continue_from {
        Some(previous) => {
            let mode =
                if args.keep_previous { ContinuationMode::Merge } else { ContinuationMode::Replace };
            let continuation = Continuation::new(previous, mode);
            ctx.reconciler.run_continued(&mut request, &continuation).await
        }
        None => ctx.reconciler.run_local(&mut request).await,
    };
    outcome.with_context(|| format!("Reconciliation of request {} failed", request.id))?;

    let p = &request.progress;
    println!(
        "{} step={} checked_db={} checked_driver={} checked={}",
        request.id,
        request.step.as_str(),
        p.checked_db,
        p.checked_driver,
        p.checked
    );
    Ok(())
}

async fn open_output(path: Option<&Path>) -> Result<BufWriter<Box<dyn AsyncWrite + Unpin + Send>>> {
    let sink: Box<dyn AsyncWrite + Unpin + Send> = match path {
        Some(path) => Box::new(
            File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };
    Ok(BufWriter::new(sink))
}

/// Writes every record of the cursor as one JSON object per line.
async fn write_lines<T: Record>(
    mut cursor: RecordCursor<'_, RedbStore, T>,
    out: &mut BufWriter<Box<dyn AsyncWrite + Unpin + Send>>,
) -> Result<u64> {
    let mut written = 0u64;
    while let Some(page) = cursor.next_batch().await? {
        for record in page {
            let mut line = serde_json::to_vec(&record).context("Failed to encode row")?;
            line.push(b'\n');
            out.write_all(&line).await.context("Failed to write row")?;
            written += 1;
        }
    }
    out.flush().await.context("Failed to flush output")?;
    Ok(written)
}

/// Exports the sites listing of a request for peers.
pub async fn export(ctx: &Context, args: ExportArgs) -> Result<()> {
    let request = ctx.request(&args.request_id).await?;
    let mut out = open_output(args.output.as_deref()).await?;
    let written = write_lines(ctx.reconciler.sites_listing(&request), &mut out).await?;
    info!(request_id = %request.id, written, "Sites listing exported");
    Ok(())
}

/// Reads JSON lines into sites listing rows. Blank lines are skipped; a read
/// error ends the stream.
fn read_entries(file: File) -> impl Stream<Item = sitesync_core::Result<SitesListingEntry>> + Send {
    let lines = BufReader::new(file).lines();
    stream::unfold(Some(lines), |state| async move {
        let mut lines = state?;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let entry = serde_json::from_str(&line)
                        .map_err(|e| Error::Serialization(e.to_string()));
                    return Some((entry, Some(lines)));
                }
                Ok(None) => return None,
                Err(e) => return Some((Err(Error::Io(e)), None)),
            }
        }
    })
}

/// Merges a peer's sites listing into a request.
pub async fn merge(ctx: &Context, args: MergeArgs) -> Result<()> {
    let mut request = ctx.request(&args.request_id).await?;
    let file = File::open(&args.input)
        .await
        .with_context(|| format!("Failed to open {}", args.input.display()))?;
    let outcome = ctx.reconciler.merge_remote_sites_listing(&mut request, read_entries(file)).await;
    let merged = outcome.with_context(|| format!("Merge into request {} failed", request.id))?;
    println!("{} merged={merged} checked_remote={}", request.id, request.progress.checked_remote);
    Ok(())
}

/// Computes the sites actions of a request.
pub async fn plan(ctx: &Context, args: RequestArgs) -> Result<()> {
    let mut request = ctx.request(&args.request_id).await?;
    let outcome = ctx.reconciler.compute_actions(&mut request).await;
    let summary = outcome.with_context(|| format!("Planning request {} failed", request.id))?;
    println!(
        "{} entries={} full={} partial={} actions={}",
        request.id, summary.entries, summary.full, summary.partial, summary.actions
    );
    Ok(())
}

/// Writes the sites actions of a request, deleting them if consumed.
pub async fn actions(ctx: &Context, args: ActionsArgs) -> Result<()> {
    let request = ctx.request(&args.request_id).await?;
    let mut out = open_output(args.output.as_deref()).await?;
    let written = write_lines(ctx.reconciler.sites_actions(&request), &mut out).await?;
    info!(request_id = %request.id, written, "Sites actions written");
    if args.consume {
        ctx.reconciler.clean_sites_action(&request).await?;
    }
    Ok(())
}

/// Deletes the listing rows of a request.
pub async fn purge(ctx: &Context, args: RequestArgs) -> Result<()> {
    let mut request = ctx.request(&args.request_id).await?;
    let summary = ctx.reconciler.purge_request(&mut request).await?;
    println!(
        "{} native={} sites={} actions={}",
        request.id, summary.native, summary.sites, summary.actions
    );
    Ok(())
}

/// Flags a request as stopped.
pub async fn stop(ctx: &Context, args: RequestArgs) -> Result<()> {
    let request = ctx
        .store
        .stop_request(&args.request_id)
        .await
        .with_context(|| format!("Failed to stop request {}", args.request_id))?;
    info!(request_id = %request.id, "Stop requested");
    Ok(())
}

/// Lists requests.
pub async fn status(ctx: &Context, args: StatusArgs) -> Result<()> {
    let requests = ctx.store.list_requests(args.bucket.as_deref()).await?;
    match args.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&requests)?);
        }
        OutputFormat::Text => {
            println!(
                "{:<34} {:<16} {:<14} {:>10} {:>8} {:<8} PENDING",
                "ID", "BUCKET", "STEP", "CHECKED", "ACTIONS", "STOPPED"
            );
            for r in &requests {
                let pending = r.pending_sites();
                println!(
                    "{:<34} {:<16} {:<14} {:>10} {:>8} {:<8} {}",
                    r.id,
                    r.bucket,
                    r.step.as_str(),
                    r.progress.checked,
                    r.progress.actions,
                    if r.is_stopped() { "yes" } else { "no" },
                    if pending.is_empty() { "-".to_string() } else { pending.join(",") }
                );
            }
        }
    }
    Ok(())
}
