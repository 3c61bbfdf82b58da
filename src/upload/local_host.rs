//! A self-hosted [`UploadHost`]: a durable job queue in SQLite plus a
//! transfer driver that streams resources to a relay URL.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Body, Client};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::destination::{CredentialProvider, UploadDestination, API_KEY_HEADER};
use super::host::{HostError, HostJob, HostJobState, ResourceRef, UploadHost, UploadReceipt};
use crate::library::PhotoInventory;
use crate::state::db::{self, to_millis};
use crate::state::{ResourceKind, StateError};

pub const DEFAULT_MAX_OUTSTANDING: usize = 200;
pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 2;

const BODY_CHUNK_SIZE: usize = 256 * 1024;
const BODY_CHANNEL_DEPTH: usize = 4;

/// Job counts by state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSummary {
    pub pending: u64,
    pub uploading: u64,
    pub completed: u64,
    pub failed: u64,
}

impl HostSummary {
    pub fn outstanding(&self) -> u64 {
        self.pending + self.uploading + self.completed + self.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub completed: usize,
    pub failed: usize,
    pub interrupted: usize,
}

/// The relay's reply to an upload.
#[derive(Debug, Deserialize)]
struct RelayResponse {
    id: String,
    #[serde(default)]
    status: String,
}

struct QueuedJob {
    id: String,
    resource: ResourceRef,
    destination: UploadDestination,
}

enum TransferOutcome {
    Completed(UploadReceipt),
    Failed { retryable: bool, reason: String },
}

pub struct LocalUploadHost {
    conn: Mutex<Connection>,
    path: PathBuf,
    inventory: Arc<dyn PhotoInventory>,
    client: Client,
    /// Supplies the API key at send time; it is never written to `host_jobs`.
    credentials: Arc<dyn CredentialProvider>,
    max_outstanding: usize,
}

impl std::fmt::Debug for LocalUploadHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalUploadHost")
            .field("path", &self.path)
            .field("max_outstanding", &self.max_outstanding)
            .finish_non_exhaustive()
    }
}

fn unavailable(e: StateError) -> HostError {
    HostError::Unavailable(e.to_string())
}

fn state_of(row: &rusqlite::Row<'_>) -> rusqlite::Result<HostJobState> {
    let state: String = row.get(3)?;
    Ok(match state.as_str() {
        "uploading" => HostJobState::Uploading,
        "completed" => HostJobState::Completed(UploadReceipt {
            remote_id: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            is_duplicate: row.get(5)?,
        }),
        "failed" => HostJobState::Failed {
            retryable: row.get(6)?,
            reason: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        },
        _ => HostJobState::Pending,
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<HostJob> {
    let kind: String = row.get(2)?;
    Ok(HostJob {
        id: row.get(0)?,
        resource: ResourceRef {
            asset_id: row.get(1)?,
            kind: ResourceKind::from_str(&kind).unwrap_or(ResourceKind::Primary),
        },
        state: state_of(row)?,
    })
}

fn header_map(headers: &[(String, String)], api_key: &str) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::with_capacity(headers.len() + 1);
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| format!("invalid header name {name}: {e}"))?;
        let value =
            HeaderValue::from_str(value).map_err(|e| format!("invalid value for {name}: {e}"))?;
        map.insert(name, value);
    }
    let mut key =
        HeaderValue::from_str(api_key).map_err(|e| format!("invalid API key header: {e}"))?;
    key.set_sensitive(true);
    map.insert(HeaderName::from_static(API_KEY_HEADER), key);
    Ok(map)
}

/// Destination headers as stored in `host_jobs`, without the credential.
fn persisted_headers(destination: &UploadDestination) -> Result<String, HostError> {
    let headers: Vec<&(String, String)> = destination
        .headers
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case(API_KEY_HEADER))
        .collect();
    serde_json::to_string(&headers).map_err(|e| HostError::Unavailable(e.to_string()))
}

/// Stream a blocking reader as a request body without buffering the file.
fn streaming_body(mut reader: Box<dyn Read + Send>) -> Body {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<std::io::Result<Vec<u8>>>(BODY_CHANNEL_DEPTH);
    tokio::task::spawn_blocking(move || loop {
        let mut buf = vec![0u8; BODY_CHUNK_SIZE];
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                buf.truncate(n);
                if tx.blocking_send(Ok(buf)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    });
    let chunks = stream::poll_fn(move |cx| rx.poll_recv(cx));
    Body::wrap_stream(chunks)
}

impl LocalUploadHost {
    pub async fn open(
        path: &Path,
        inventory: Arc<dyn PhotoInventory>,
        client: Client,
        credentials: Arc<dyn CredentialProvider>,
        max_outstanding: usize,
    ) -> Result<Self, StateError> {
        let conn = db::open_connection(path).await?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            inventory,
            client,
            credentials,
            max_outstanding: max_outstanding.max(1),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory(
        inventory: Arc<dyn PhotoInventory>,
        client: Client,
        credentials: Arc<dyn CredentialProvider>,
        max_outstanding: usize,
    ) -> Result<Self, StateError> {
        Ok(Self {
            conn: Mutex::new(db::open_memory()?),
            path: PathBuf::from(":memory:"),
            inventory,
            client,
            credentials,
            max_outstanding: max_outstanding.max(1),
        })
    }

    pub async fn summary(&self) -> Result<HostSummary, StateError> {
        let conn = db::lock(&self.conn)?;
        query_summary(&conn)
    }

    /// Queue counts read straight from the database, for callers that do not
    /// drive transfers.
    pub async fn summary_at(path: &Path) -> Result<HostSummary, StateError> {
        let conn = db::open_connection(path).await?;
        query_summary(&conn)
    }

    /// Jobs waiting for a transfer. Jobs left `uploading` by an interrupted
    /// run are picked up again.
    fn queued(&self) -> Result<Vec<QueuedJob>, StateError> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, asset_id, resource_type, url, headers FROM host_jobs \
                 WHERE state IN ('pending', 'uploading') ORDER BY created_at, id",
            )
            .map_err(StateError::query)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(StateError::query)?;

        let mut jobs = Vec::new();
        for row in rows {
            let (id, asset_id, kind, url, headers) = row.map_err(StateError::query)?;
            let Some(kind) = ResourceKind::from_str(&kind) else {
                tracing::warn!(job_id = %id, kind = %kind, "Skipping job with unknown resource kind");
                continue;
            };
            let headers: Vec<(String, String)> = match serde_json::from_str(&headers) {
                Ok(headers) => headers,
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Skipping job with unreadable headers");
                    continue;
                }
            };
            jobs.push(QueuedJob {
                id,
                resource: ResourceRef { asset_id, kind },
                destination: UploadDestination { url, headers },
            });
        }
        Ok(jobs)
    }

    fn set_state(&self, job_id: &str, outcome: Option<&TransferOutcome>) -> Result<(), StateError> {
        let conn = db::lock(&self.conn)?;
        let result = match outcome {
            None => conn.execute(
                "UPDATE host_jobs SET state = 'uploading', attempts = attempts + 1 WHERE id = ?1",
                [job_id],
            ),
            Some(TransferOutcome::Completed(receipt)) => conn.execute(
                "UPDATE host_jobs SET state = 'completed', remote_id = ?2, is_duplicate = ?3, last_error = NULL WHERE id = ?1",
                rusqlite::params![job_id, receipt.remote_id, receipt.is_duplicate],
            ),
            Some(TransferOutcome::Failed { retryable, reason }) => conn.execute(
                "UPDATE host_jobs SET state = 'failed', retryable = ?2, last_error = ?3 WHERE id = ?1",
                rusqlite::params![job_id, retryable, reason],
            ),
        };
        result.map_err(StateError::query)?;
        Ok(())
    }

    fn requeue(&self, job_id: &str) -> Result<(), StateError> {
        let conn = db::lock(&self.conn)?;
        conn.execute(
            "UPDATE host_jobs SET state = 'pending' WHERE id = ?1 AND state = 'uploading'",
            [job_id],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    /// Drive queued transfers until the queue drains or `cancel` fires.
    /// Interrupted transfers go back to the queue.
    pub async fn run_transfers(
        &self,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary, StateError> {
        let queued = self.queued()?;
        if queued.is_empty() {
            return Ok(TransferSummary::default());
        }
        tracing::info!(count = queued.len(), "Starting queued transfers");

        let outcomes: Vec<Option<bool>> = stream::iter(queued)
            .take_while(|_| std::future::ready(!cancel.is_cancelled()))
            .map(|job| self.run_one(job, cancel))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut summary = TransferSummary::default();
        for outcome in outcomes {
            match outcome {
                Some(true) => summary.completed += 1,
                Some(false) => summary.failed += 1,
                None => summary.interrupted += 1,
            }
        }
        tracing::info!(
            completed = summary.completed,
            failed = summary.failed,
            interrupted = summary.interrupted,
            "Transfers finished"
        );
        Ok(summary)
    }

    /// `Some(true)` on success, `Some(false)` on failure, `None` if cancelled.
    async fn run_one(&self, job: QueuedJob, cancel: &CancellationToken) -> Option<bool> {
        if let Err(e) = self.set_state(&job.id, None) {
            tracing::warn!(job_id = %job.id, error = %e, "Could not claim job");
            return Some(false);
        }

        let outcome = tokio::select! {
            () = cancel.cancelled() => None,
            outcome = self.transfer(&job) => Some(outcome),
        };
        let Some(outcome) = outcome else {
            if let Err(e) = self.requeue(&job.id) {
                tracing::warn!(job_id = %job.id, error = %e, "Could not requeue interrupted job");
            }
            return None;
        };

        let succeeded = matches!(outcome, TransferOutcome::Completed(_));
        match &outcome {
            TransferOutcome::Completed(receipt) => tracing::debug!(
                job_id = %job.id,
                resource = %job.resource,
                remote_id = %receipt.remote_id,
                duplicate = receipt.is_duplicate,
                "Transfer completed"
            ),
            TransferOutcome::Failed { retryable, reason } => tracing::warn!(
                job_id = %job.id,
                resource = %job.resource,
                retryable,
                reason = %reason,
                "Transfer failed"
            ),
        }
        if let Err(e) = self.set_state(&job.id, Some(&outcome)) {
            tracing::warn!(job_id = %job.id, error = %e, "Could not record transfer result");
        }
        Some(succeeded)
    }

    async fn transfer(&self, job: &QueuedJob) -> TransferOutcome {
        let api_key = match self.credentials.api_key() {
            Ok(api_key) => api_key,
            Err(e) => {
                return TransferOutcome::Failed {
                    retryable: true,
                    reason: e.to_string(),
                }
            }
        };
        let headers = match header_map(&job.destination.headers, &api_key) {
            Ok(headers) => headers,
            Err(reason) => {
                return TransferOutcome::Failed {
                    retryable: false,
                    reason,
                }
            }
        };

        let inventory = self.inventory.clone();
        let resource = job.resource.clone();
        let reader = tokio::task::spawn_blocking(move || {
            inventory.open_resource(&resource.asset_id, resource.kind)
        })
        .await;
        let reader = match reader {
            Ok(Ok(reader)) => reader,
            Ok(Err(e)) => {
                return TransferOutcome::Failed {
                    retryable: false,
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                return TransferOutcome::Failed {
                    retryable: true,
                    reason: e.to_string(),
                }
            }
        };

        let response = self
            .client
            .post(&job.destination.url)
            .headers(headers)
            .body(streaming_body(reader))
            .send()
            .await;
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return TransferOutcome::Failed {
                    retryable: true,
                    reason: e.to_string(),
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            return TransferOutcome::Failed {
                retryable: status.as_u16() == 429 || status.is_server_error(),
                reason: format!("relay returned HTTP {}", status.as_u16()),
            };
        }
        match response.json::<RelayResponse>().await {
            Ok(reply) => TransferOutcome::Completed(UploadReceipt {
                remote_id: reply.id,
                is_duplicate: reply.status.eq_ignore_ascii_case("duplicate"),
            }),
            Err(e) => TransferOutcome::Failed {
                retryable: true,
                reason: format!("unreadable relay response: {e}"),
            },
        }
    }
}

#[async_trait]
impl UploadHost for LocalUploadHost {
    async fn jobs(&self) -> Result<Vec<HostJob>, HostError> {
        let conn = db::lock(&self.conn).map_err(unavailable)?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, asset_id, resource_type, state, remote_id, is_duplicate, retryable, last_error \
                 FROM host_jobs ORDER BY created_at, id",
            )
            .map_err(|e| unavailable(StateError::query(e)))?;
        let jobs = stmt
            .query_map([], row_to_job)
            .map_err(|e| unavailable(StateError::query(e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| unavailable(StateError::query(e)))?;
        Ok(jobs)
    }

    async fn register(
        &self,
        resource: &ResourceRef,
        destination: &UploadDestination,
    ) -> Result<String, HostError> {
        let headers = persisted_headers(destination)?;
        let conn = db::lock(&self.conn).map_err(unavailable)?;

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM host_jobs WHERE asset_id = ?1 AND resource_type = ?2",
                [resource.asset_id.as_str(), resource.kind.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| unavailable(StateError::query(e)))?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let outstanding: i64 = conn
            .query_row("SELECT COUNT(*) FROM host_jobs", [], |row| row.get(0))
            .map_err(|e| unavailable(StateError::query(e)))?;
        let outstanding = outstanding.max(0) as usize;
        if outstanding >= self.max_outstanding {
            return Err(HostError::QuotaExceeded {
                outstanding,
                limit: self.max_outstanding,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO host_jobs (id, asset_id, resource_type, url, headers, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                id,
                resource.asset_id,
                resource.kind.as_str(),
                destination.url,
                headers,
                to_millis(&Utc::now()),
            ],
        )
        .map_err(|e| unavailable(StateError::query(e)))?;
        tracing::debug!(job_id = %id, resource = %resource, "Registered upload job");
        Ok(id)
    }

    async fn resubmit(
        &self,
        job_id: &str,
        destination: &UploadDestination,
    ) -> Result<(), HostError> {
        let headers = persisted_headers(destination)?;
        let conn = db::lock(&self.conn).map_err(unavailable)?;
        let updated = conn
            .execute(
                "UPDATE host_jobs SET url = ?2, headers = ?3, state = 'pending', last_error = NULL \
                 WHERE id = ?1 AND state = 'failed'",
                rusqlite::params![job_id, destination.url, headers],
            )
            .map_err(|e| unavailable(StateError::query(e)))?;
        if updated == 0 {
            return Err(HostError::UnknownJob(job_id.to_string()));
        }
        Ok(())
    }

    async fn acknowledge(&self, job_id: &str) -> Result<(), HostError> {
        let conn = db::lock(&self.conn).map_err(unavailable)?;
        let removed = conn
            .execute("DELETE FROM host_jobs WHERE id = ?1", [job_id])
            .map_err(|e| unavailable(StateError::query(e)))?;
        if removed == 0 {
            tracing::debug!(job_id, "Acknowledged job was already gone");
        }
        Ok(())
    }
}

fn query_summary(conn: &Connection) -> Result<HostSummary, StateError> {
    let mut stmt = conn
        .prepare_cached("SELECT state, COUNT(*) FROM host_jobs GROUP BY state")
        .map_err(StateError::query)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(StateError::query)?;
    let mut summary = HostSummary::default();
    for row in rows {
        let (state, count) = row.map_err(StateError::query)?;
        let count = count.max(0) as u64;
        match state.as_str() {
            "pending" => summary.pending = count,
            "uploading" => summary.uploading = count,
            "completed" => summary.completed = count,
            "failed" => summary.failed = count,
            _ => {}
        }
    }
    Ok(summary)
}
