use crate::state::HashCacheRecord;

/// Per-asset backup state shown to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncStatus {
    /// No hash and no upload record yet.
    Pending,
    /// Hashing in flight. Never persisted.
    Processing,
    /// Hashed, server confirmation unresolved.
    Checking,
    Uploaded,
    /// Checked against a synced index and confirmed absent.
    NotUploaded,
    /// Hashing or checking failed.
    Error,
}

impl SyncStatus {
    pub const ALL: [SyncStatus; 6] = [
        SyncStatus::Pending,
        SyncStatus::Processing,
        SyncStatus::Checking,
        SyncStatus::Uploaded,
        SyncStatus::NotUploaded,
        SyncStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Checking => "checking",
            Self::Uploaded => "uploaded",
            Self::NotUploaded => "not-uploaded",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about one asset when deriving its status.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusInputs<'a> {
    pub has_raw: bool,
    pub hash: Option<&'a HashCacheRecord>,
    /// Upload history holds the primary (or video) resource.
    pub primary_uploaded: bool,
    pub raw_uploaded: bool,
    pub in_flight: bool,
    pub failed: bool,
}

/// Derive an asset's status.
///
/// A resource counts as uploaded when this device uploaded it or the server
/// confirmed holding it. Assets with a RAW resource need both resources
/// covered.
pub fn derive_status(inputs: &StatusInputs<'_>) -> SyncStatus {
    let primary_on_server = inputs.hash.is_some_and(|h| h.primary_on_server);
    let raw_on_server = inputs.hash.is_some_and(|h| h.raw_on_server);

    let primary_done = inputs.primary_uploaded || primary_on_server;
    let raw_done = !inputs.has_raw || inputs.raw_uploaded || raw_on_server;
    if primary_done && raw_done {
        return SyncStatus::Uploaded;
    }
    if inputs.failed {
        return SyncStatus::Error;
    }
    if inputs.in_flight {
        return SyncStatus::Processing;
    }
    match inputs.hash {
        None => SyncStatus::Pending,
        Some(record) if needs_check(record, inputs.has_raw) => SyncStatus::Checking,
        Some(_) => SyncStatus::NotUploaded,
    }
}

/// Like [`HashCacheRecord::needs_check`] but trusting the library's view of
/// whether a RAW resource exists.
fn needs_check(record: &HashCacheRecord, has_raw: bool) -> bool {
    if record.checked_at.is_none() {
        return true;
    }
    has_raw && (record.raw_hash.is_none() || record.raw_checked_at.is_none())
}
