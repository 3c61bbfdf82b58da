use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::cli::{Cli, Command};
use crate::remote::client::normalize_server_url;
use crate::retry::RetryConfig;

const DB_FILE: &str = "photosync.db";
const LOCK_FILE: &str = "photosync.lock";
const DEVICE_ID_FILE: &str = "device_id";

const DEFAULT_BUDGET_SECS: u64 = 30;
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Application configuration.
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub lock_path: PathBuf,
    pub library: Option<PathBuf>,
    /// Normalized to end in `/api`.
    pub server_url: Option<String>,
    pub api_key: Option<String>,
    pub relay_url: Option<String>,

    pub retry: RetryConfig,
    pub http_timeout: Duration,
    pub checksum_timeout: Duration,
    pub background_budget: Duration,

    pub discovery_ceiling: usize,
    pub discovery_scan_limit: usize,
    pub discovery_page_size: usize,
    pub hash_chunk_size: usize,
    pub dedup_batch_size: usize,
    pub sync_page_size: usize,
    pub max_outstanding_jobs: usize,
    pub transfer_concurrency: usize,

    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("library", &self.library)
            .field("server_url", &self.server_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("relay_url", &self.relay_url)
            .field("background_budget", &self.background_budget)
            .finish_non_exhaustive()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let data_dir = expand_tilde(&cli.data_dir);
        let conn = &cli.connection;

        let server_url = conn
            .server_url
            .as_deref()
            .map(normalize_server_url)
            .transpose()?;
        let api_key = conn
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        let background_budget = match &cli.command {
            Command::Process(args) => Duration::from_secs(args.budget_secs.max(1)),
            _ => Duration::from_secs(DEFAULT_BUDGET_SECS),
        };

        let defaults = crate::upload::UploadJobConfig::default();

        Ok(Self {
            db_path: data_dir.join(DB_FILE),
            lock_path: data_dir.join(LOCK_FILE),
            data_dir,
            library: conn.library.as_deref().map(expand_tilde),
            server_url,
            api_key,
            relay_url: conn.relay_url.clone(),
            retry: RetryConfig::default(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            checksum_timeout: defaults.checksum_timeout,
            background_budget,
            discovery_ceiling: defaults.discovery_ceiling,
            discovery_scan_limit: defaults.discovery_scan_limit,
            discovery_page_size: defaults.discovery_page_size,
            hash_chunk_size: crate::hashing::DEFAULT_CHUNK_SIZE,
            dedup_batch_size: crate::dedup::DEFAULT_BATCH_SIZE,
            sync_page_size: crate::sync::DEFAULT_PAGE_SIZE,
            max_outstanding_jobs: crate::upload::local_host::DEFAULT_MAX_OUTSTANDING,
            transfer_concurrency: crate::upload::local_host::DEFAULT_TRANSFER_CONCURRENCY,
            no_progress_bar: cli.no_progress_bar,
        })
    }

    pub fn upload_job_config(&self) -> crate::upload::UploadJobConfig {
        crate::upload::UploadJobConfig {
            discovery_ceiling: self.discovery_ceiling,
            discovery_scan_limit: self.discovery_scan_limit,
            discovery_page_size: self.discovery_page_size,
            checksum_timeout: self.checksum_timeout,
        }
    }

    pub fn require_library(&self) -> anyhow::Result<&Path> {
        self.library
            .as_deref()
            .context("--library (or PHOTOSYNC_LIBRARY) is required for this command")
    }

    pub fn require_server_url(&self) -> anyhow::Result<&str> {
        self.server_url
            .as_deref()
            .context("--server-url (or PHOTOSYNC_SERVER_URL) is required for this command")
    }

    pub fn require_relay_url(&self) -> anyhow::Result<&str> {
        self.relay_url
            .as_deref()
            .context("--relay-url (or PHOTOSYNC_RELAY_URL) is required for this command")
    }

    /// The configured API key, prompting for one on an interactive terminal.
    pub fn api_key(&self) -> anyhow::Result<String> {
        if let Some(key) = &self.api_key {
            return Ok(key.clone());
        }
        if !std::io::stdin().is_terminal() {
            anyhow::bail!("--api-key (or PHOTOSYNC_API_KEY) is required when not running interactively");
        }
        let key = tokio::task::block_in_place(|| rpassword::prompt_password("Server API key: "))
            .context("Failed to read API key")?;
        let key = key.trim().to_string();
        if key.is_empty() {
            anyhow::bail!("API key is empty");
        }
        Ok(key)
    }
}

/// Durable identifier for this installation, created on first use.
pub fn load_or_create_device_id(data_dir: &Path) -> anyhow::Result<String> {
    let path = data_dir.join(DEVICE_ID_FILE);
    match std::fs::read_to_string(&path) {
        Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    }

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&path, &id).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!(device_id = %id, "Generated device id");
    Ok(id)
}
