use clap::{Args, Parser, Subcommand};

use crate::types::{LogLevel, StateScope};

#[derive(Parser, Debug)]
#[command(
    name = "photosync",
    about = "Back up a local photo library to a self-hosted media server"
)]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Directory holding the state database, device id and lock file
    #[arg(long, env = "PHOTOSYNC_DATA_DIR", default_value = "~/.photosync", global = true)]
    pub data_dir: String,

    /// Log level (RUST_LOG overrides this)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    /// Disable the progress bar
    #[arg(long, global = true)]
    pub no_progress_bar: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Media server base URL (`/api` is appended when missing)
    #[arg(long, env = "PHOTOSYNC_SERVER_URL", global = true)]
    pub server_url: Option<String>,

    /// Media server API key (if not provided, will prompt).
    /// WARNING: passing via --api-key is visible in process listings.
    /// Prefer the PHOTOSYNC_API_KEY environment variable instead.
    #[arg(long, env = "PHOTOSYNC_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    /// Upload relay URL that receives raw resource bytes
    #[arg(long, env = "PHOTOSYNC_RELAY_URL", global = true)]
    pub relay_url: Option<String>,

    /// Root directory of the local photo library
    #[arg(long, env = "PHOTOSYNC_LIBRARY", global = true)]
    pub library: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bring the local server index up to date
    Sync(SyncArgs),
    /// Hash the library and resolve each asset's backup status
    Scan(ScanArgs),
    /// Run one background upload invocation
    Process(ProcessArgs),
    /// Show what the state database knows
    Status,
    /// Delete the state database, or clear one store in it
    ResetState(ResetStateArgs),
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Ignore the previous sync and list every server asset
    #[arg(long)]
    pub full: bool,
}

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Drop upload and hash records for assets no longer in the library first
    #[arg(long)]
    pub prune: bool,
}

#[derive(Args, Debug)]
pub struct ProcessArgs {
    /// Wall-clock budget for the whole invocation
    #[arg(long, default_value_t = 30)]
    pub budget_secs: u64,

    /// Only manage jobs; leave transfers to another driver
    #[arg(long)]
    pub no_transfer: bool,
}

#[derive(Args, Debug)]
pub struct ResetStateArgs {
    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,

    /// Clear only this store and keep the rest of the database
    #[arg(long, value_enum)]
    pub only: Option<StateScope>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_process_with_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "photosync",
            "process",
            "--budget-secs",
            "10",
            "--server-url",
            "https://photos.example.com",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert_eq!(
            cli.connection.server_url.as_deref(),
            Some("https://photos.example.com")
        );
        match cli.command {
            Command::Process(args) => {
                assert_eq!(args.budget_secs, 10);
                assert!(!args.no_transfer);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_sync_full() {
        let cli = Cli::try_parse_from(["photosync", "sync", "--full"]).unwrap();
        assert!(matches!(cli.command, Command::Sync(SyncArgs { full: true })));
    }

    #[test]
    fn test_parse_reset_state_only() {
        let cli = Cli::try_parse_from(["photosync", "reset-state", "--only", "index", "--yes"])
            .unwrap();
        match cli.command {
            Command::ResetState(args) => {
                assert!(args.yes);
                assert_eq!(args.only, Some(StateScope::Index));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["photosync"]).is_err());
    }
}
