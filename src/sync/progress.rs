use crate::state::SyncType;

/// Stage of a running sync, reported in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Connecting,
    FetchingUser,
    FetchingPartners,
    FetchingAssets,
    ApplyingChanges,
    Finalizing,
    Complete,
}

impl SyncPhase {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting to server",
            Self::FetchingUser => "Fetching account",
            Self::FetchingPartners => "Fetching partner accounts",
            Self::FetchingAssets => "Fetching assets",
            Self::ApplyingChanges => "Applying changes",
            Self::Finalizing => "Finalizing",
            Self::Complete => "Sync complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    /// Known once the mode is chosen.
    pub sync_type: Option<SyncType>,
    /// Running count of remote assets received.
    pub fetched: u64,
}

impl SyncProgress {
    pub(crate) fn new(phase: SyncPhase) -> Self {
        Self {
            phase,
            sync_type: None,
            fetched: 0,
        }
    }
}

/// Summary of a completed sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub sync_type: SyncType,
    pub total_assets: u64,
    pub upserted_count: u64,
    pub deleted_count: u64,
}

impl std::fmt::Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} sync: {} upserted, {} deleted, {} assets indexed",
            self.sync_type, self.upserted_count, self.deleted_count, self.total_assets
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another sync was already running; nothing was done.
    Skipped,
}
