//! photosync: backs up a local photo library to a self-hosted media server.
//!
//! A replica of the server's asset list is kept in SQLite so "is this photo
//! already backed up?" is answered from content hashes without a round trip.
//! Uploads run as host-managed jobs that are created, retried and
//! acknowledged by short, restartable background invocations.

#![warn(clippy::all)]

mod cli;
mod config;
mod dedup;
mod hashing;
mod library;
mod remote;
pub mod retry;
mod shutdown;
mod state;
mod sync;
#[cfg(test)]
mod testutil;
mod types;
mod upload;

use std::collections::HashSet;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use fs4::fs_std::FileExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::Config;
use dedup::{DedupResolver, SyncStatus};
use hashing::HashStore;
use library::{FsLibrary, PhotoInventory};
use remote::{AssetServerFactory, HttpAssetServerFactory, ServerEndpoint};
use state::{
    HashCache, ServerIndex, SqliteHashCache, SqliteServerIndex, SqliteUploadHistory, UploadHistory,
};
use sync::{SyncCoordinator, SyncOutcome, SyncProgress};
use types::StateScope;
use upload::{
    CredentialProvider, DestinationBuilder, LocalUploadHost, ProcessOutcome, StaticCredentials,
    UploadJobManager,
};

/// The stores every library-facing command works against.
struct Stores {
    inventory: Arc<FsLibrary>,
    history: Arc<SqliteUploadHistory>,
    hash_cache: Arc<SqliteHashCache>,
    index: Arc<SqliteServerIndex>,
    hashes: Arc<HashStore>,
}

impl Stores {
    async fn open(config: &Config) -> anyhow::Result<Self> {
        let root = config.require_library()?;
        let inventory = Arc::new(
            FsLibrary::open(root)
                .await
                .with_context(|| format!("Failed to open library at {}", root.display()))?,
        );
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create data directory: {}",
                    config.data_dir.display()
                )
            })?;
        let history = Arc::new(SqliteUploadHistory::open(&config.db_path).await?);
        let hash_cache = Arc::new(SqliteHashCache::open(&config.db_path).await?);
        let index = Arc::new(SqliteServerIndex::open(&config.db_path).await?);
        let hashes = Arc::new(HashStore::new(
            hash_cache.clone(),
            inventory.clone(),
            config.hash_chunk_size,
        ));
        tracing::debug!(db = %config.db_path.display(), "State database opened");
        Ok(Self {
            inventory,
            history,
            hash_cache,
            index,
            hashes,
        })
    }

    fn resolver(&self, config: &Config) -> DedupResolver {
        DedupResolver::new(
            self.hashes.clone(),
            self.index.clone(),
            self.history.clone(),
            self.inventory.clone(),
            config.dedup_batch_size,
        )
    }
}

/// Spinner fed by sync progress callbacks.
///
/// Returns `ProgressBar::hidden()` when the user passed `--no-progress-bar` or
/// stdout is not a TTY.
fn create_spinner(no_progress_bar: bool) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {spinner} {msg}")
            .expect("valid template"),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

async fn run_sync(
    config: &Config,
    args: cli::SyncArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let server_url = config.require_server_url()?;
    let api_key = config.api_key()?;

    // Statuses are only refreshed when a library is configured.
    let stores = match config.library {
        Some(_) => Some(Stores::open(config).await?),
        None => None,
    };
    let index: Arc<dyn ServerIndex> = match &stores {
        Some(stores) => stores.index.clone() as Arc<dyn ServerIndex>,
        None => {
            tokio::fs::create_dir_all(&config.data_dir).await?;
            Arc::new(SqliteServerIndex::open(&config.db_path).await?)
        }
    };

    let coordinator = SyncCoordinator::new(
        Arc::new(HttpAssetServerFactory::new(config.http_timeout)),
        index,
        config.sync_page_size,
        config.retry.clone(),
    );

    let pb = create_spinner(config.no_progress_bar);
    let on_progress = |p: SyncProgress| {
        let mode = p.sync_type.map(|t| format!(" ({t})")).unwrap_or_default();
        pb.set_message(format!("{}{}: {} assets", p.phase.label(), mode, p.fetched));
    };

    let outcome = coordinator
        .sync(server_url, &api_key, args.full, &on_progress, cancel)
        .await;
    pb.finish_and_clear();

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) if e.is_auth() => {
            return Err(anyhow::Error::new(e)
                .context("The server rejected the API key; check --api-key or PHOTOSYNC_API_KEY"));
        }
        Err(e) => return Err(e.into()),
    };

    match outcome {
        SyncOutcome::Completed(report) => {
            println!("{report}");
            if let Some(stores) = stores {
                let resolver = stores.resolver(config);
                resolver.refresh_all().await;
                let processed = resolver.refresh_after_sync(cancel).await;
                tracing::debug!(
                    checked = processed.checked,
                    failed = processed.failed,
                    "Re-checked assets after sync"
                );
                println!();
                println!("Library status:");
                println!("{}", resolver.status_counts());
            }
        }
        SyncOutcome::Skipped => println!("A sync is already running."),
    }
    Ok(())
}

async fn run_scan(
    config: &Config,
    args: cli::ScanArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let stores = Stores::open(config).await?;
    let ids = stores.inventory.all_asset_ids().await?;

    if args.prune {
        let live: HashSet<String> = ids.iter().cloned().collect();
        let uploads = stores.history.remove_orphans(&live).await?;
        let hashes = stores.hash_cache.remove_orphans(&live).await?;
        println!("Pruned {uploads} upload records and {hashes} cached hashes");
    }

    let resolver = stores.resolver(config);
    resolver.refresh_all().await;
    let started = Instant::now();
    let report = resolver.start_background_processing(&ids, cancel).await;
    tracing::info!(
        assets = ids.len(),
        hashed = report.hashed,
        checked = report.checked,
        failed = report.failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Scan finished"
    );
    if report.cancelled {
        println!("Scan interrupted; the next scan resumes where this one stopped.");
    }

    println!("Library status ({} assets):", ids.len());
    println!("{}", resolver.status_counts());
    Ok(())
}

async fn run_process(
    config: &Config,
    args: cli::ProcessArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let server_url = config.require_server_url()?;
    let relay_url = config.require_relay_url()?;
    let api_key = config.api_key()?;
    let stores = Stores::open(config).await?;

    // Overlapping invocations would race on job creation.
    let lock_path = config.lock_path.clone();
    let _lock = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::create(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another photosync process is running (lock: {})",
                lock_path.display()
            )
        })?;
        Ok::<std::fs::File, anyhow::Error>(file)
    })
    .await??;

    let budget = shutdown::budget_token(cancel, config.background_budget);

    let device_id = config::load_or_create_device_id(&config.data_dir)?;
    let credentials: Arc<dyn CredentialProvider> = Arc::new(StaticCredentials::new(api_key.clone()));
    let destinations = DestinationBuilder::new(relay_url, device_id, credentials.clone())?;
    let server = HttpAssetServerFactory::new(config.http_timeout)
        .connect(&ServerEndpoint::new(server_url, &api_key)?)?;

    let client = reqwest::Client::builder()
        .connect_timeout(config.http_timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let host = Arc::new(
        LocalUploadHost::open(
            &config.db_path,
            stores.inventory.clone(),
            client,
            credentials,
            config.max_outstanding_jobs,
        )
        .await?,
    );

    let manager = UploadJobManager::new(
        host.clone(),
        stores.inventory.clone(),
        stores.hashes.clone(),
        stores.history.clone(),
        stores.index.clone(),
        server,
        destinations,
    )
    .with_config(config.upload_job_config());

    let outcome = manager.process(&budget).await?;
    let report = outcome.report();
    println!(
        "Jobs: {} created, {} resubmitted, {} dropped, {} acknowledged",
        report.created, report.resubmitted, report.dropped, report.acknowledged
    );
    println!(
        "Skipped: {} already on server, {} unreadable",
        report.already_on_server, report.unreadable
    );
    if !report.acknowledged_assets.is_empty() {
        let resolver = stores.resolver(config);
        for asset_id in &report.acknowledged_assets {
            resolver.on_upload_completed(asset_id).await;
        }
        let backed_up = report
            .acknowledged_assets
            .iter()
            .filter(|id| resolver.status(id) == SyncStatus::Uploaded)
            .count();
        println!(
            "Backed up: {backed_up} of {} assets with newly recorded uploads",
            report.acknowledged_assets.len()
        );
    }
    match outcome {
        ProcessOutcome::Finished(_) => {}
        ProcessOutcome::StillProcessing(_) => {
            println!("Job queue is full; remaining resources wait for the next run.")
        }
        ProcessOutcome::Cancelled(_) => {
            println!("Stopped early; the next run picks up from here.");
            return Ok(());
        }
    }

    if args.no_transfer || budget.is_cancelled() {
        return Ok(());
    }
    let transfers = host
        .run_transfers(config.transfer_concurrency, &budget)
        .await?;
    println!(
        "Transfers: {} completed, {} failed, {} interrupted",
        transfers.completed, transfers.failed, transfers.interrupted
    );
    let queue = host.summary().await?;
    println!("Jobs outstanding: {}", queue.outstanding());
    Ok(())
}

async fn run_status(config: &Config) -> anyhow::Result<()> {
    let db_path = &config.db_path;

    if !db_path.exists() {
        println!("No state database found at {}", db_path.display());
        println!("Run a sync first to create the database.");
        return Ok(());
    }

    let history = SqliteUploadHistory::open(db_path).await?;
    let hash_cache = SqliteHashCache::open(db_path).await?;
    let index = SqliteServerIndex::open(db_path).await?;
    let hashes = hash_cache.summary().await?;
    let jobs = LocalUploadHost::summary_at(db_path).await?;

    println!("State Database: {}", db_path.display());
    println!();
    println!("Server index:");
    println!("  Assets:        {}", index.count().await?);
    match index.sync_metadata().await? {
        Some(meta) => {
            println!(
                "  Last sync:     {} ({})",
                meta.last_sync_time.format("%Y-%m-%d %H:%M:%S UTC"),
                meta.last_sync_type
            );
            println!("  Server user:   {}", meta.user_id);
        }
        None => println!("  Last sync:     never"),
    }
    println!();
    println!("Local library:");
    println!("  Uploaded:      {}", history.count().await?);
    println!("  Hashed:        {}", hashes.hashed);
    println!("  Unchecked:     {}", hashes.unchecked);
    println!("  On server:     {}", hashes.on_server);
    println!();
    println!("Upload jobs:");
    println!("  Pending:       {}", jobs.pending);
    println!("  Uploading:     {}", jobs.uploading);
    println!("  Completed:     {}", jobs.completed);
    println!("  Failed:        {}", jobs.failed);
    println!("  Outstanding:   {}", jobs.outstanding());

    Ok(())
}

/// Empty one store. Returns rows removed.
async fn clear_store(db_path: &std::path::Path, scope: StateScope) -> anyhow::Result<u64> {
    let removed = match scope {
        StateScope::Index => {
            let index = SqliteServerIndex::open(db_path).await?;
            let count = index.count().await?;
            index.clear().await?;
            count
        }
        StateScope::Hashes => SqliteHashCache::open(db_path).await?.clear().await?,
        StateScope::Uploads => SqliteUploadHistory::open(db_path).await?.clear().await?,
    };
    tracing::info!(store = scope.label(), removed, "Cleared store");
    Ok(removed)
}

async fn run_reset_state(config: &Config, args: cli::ResetStateArgs) -> anyhow::Result<()> {
    let db_path = &config.db_path;

    if !db_path.exists() {
        println!("No state database found at {}", db_path.display());
        return Ok(());
    }

    if !args.yes {
        match args.only {
            Some(scope) => println!("This will clear the {} in:", scope.label()),
            None => println!("This will delete the state database at:"),
        }
        println!("  {}", db_path.display());
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    if let Some(scope) = args.only {
        let removed = clear_store(db_path, scope).await?;
        println!("Cleared the {} ({removed} rows).", scope.label());
        return Ok(());
    }

    std::fs::remove_file(db_path)?;
    println!("State database deleted.");

    let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
    let _ = std::fs::remove_file(db_path.with_extension("db-shm"));

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let config = Config::from_cli(&cli)?;
    tracing::debug!(?config, "Resolved configuration");

    match cli.command {
        Command::Status => run_status(&config).await,
        Command::ResetState(args) => run_reset_state(&config, args).await,
        command => {
            let shutdown_token = shutdown::install_signal_handler();
            match command {
                Command::Sync(args) => run_sync(&config, args, &shutdown_token).await,
                Command::Scan(args) => run_scan(&config, args, &shutdown_token).await,
                Command::Process(args) => run_process(&config, args, &shutdown_token).await,
                Command::Status | Command::ResetState(_) => Ok(()),
            }
        }
    }
}
