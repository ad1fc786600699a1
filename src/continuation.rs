//! Checkpoint and continuation persistence.
//!
//! When a run exceeds its time budget (or pauses in manual mode), its full
//! [`PipelineState`] plus a next-step pointer is saved under a short-lived
//! continuation id. A continuation is redeemed exactly once: loading marks it
//! consumed atomically, and a consumed or expired id can never be reused.
//! At most one continuation is active per subject — saving a new one expires
//! any prior active continuation for the same subject.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{ContinuationError, PipelineError};
use crate::orchestrator::state::{NextStep, PipelineState};

/// A redeemed continuation: the saved state and where to pick up.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedContinuation {
    pub state: PipelineState,
    pub next_step: NextStep,
}

fn store_err(e: impl Into<anyhow::Error>) -> PipelineError {
    PipelineError::Store(e.into())
}

fn state_checksum(blob: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(blob.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Synchronous SQLite-backed continuation storage.
pub struct ContinuationDb {
    conn: Connection,
}

impl ContinuationDb {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, PipelineError> {
        let conn = Connection::open(path).map_err(store_err)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self, PipelineError> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), PipelineError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS continuations (
                    id TEXT PRIMARY KEY,
                    subject_id TEXT NOT NULL,
                    next_step TEXT NOT NULL,
                    state TEXT NOT NULL,
                    checksum TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'awaiting',
                    created_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL,
                    consumed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_continuations_subject
                    ON continuations(subject_id, status);
                ",
            )
            .map_err(store_err)?;
        Ok(())
    }

    /// Persist state under a fresh continuation id.
    ///
    /// Any prior active continuation for the same subject is expired first,
    /// so at most one continuation can ever be redeemed per subject.
    pub fn save(
        &self,
        subject_id: &str,
        next_step: NextStep,
        state: &PipelineState,
        ttl: Duration,
    ) -> Result<String, PipelineError> {
        let invalidated = self.invalidate_subject(subject_id)?;
        if invalidated > 0 {
            debug!(subject_id, invalidated, "expired prior continuations");
        }

        let id = Uuid::new_v4().to_string();
        let blob = serde_json::to_string(state).map_err(store_err)?;
        let checksum = state_checksum(&blob);
        let now = Utc::now();
        let expires_at = now
            + chrono::TimeDelta::from_std(ttl)
                .map_err(|e| store_err(anyhow::anyhow!("invalid TTL: {}", e)))?;

        self.conn
            .execute(
                "INSERT INTO continuations (id, subject_id, next_step, state, checksum, status, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'awaiting', ?6, ?7)",
                params![
                    id,
                    subject_id,
                    next_step.to_string(),
                    blob,
                    checksum,
                    now.to_rfc3339(),
                    expires_at.to_rfc3339(),
                ],
            )
            .map_err(store_err)?;

        Ok(id)
    }

    /// Redeem a continuation. Succeeds at most once per id.
    pub fn load(
        &self,
        id: &str,
        subject_id: &str,
    ) -> Result<LoadedContinuation, PipelineError> {
        let row = self
            .conn
            .query_row(
                "SELECT subject_id, next_step, state, checksum, status, expires_at
                 FROM continuations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    PipelineError::Continuation(ContinuationError::NotFound(id.to_string()))
                }
                other => store_err(other),
            })?;

        let (owner, next_step_raw, blob, checksum, status, expires_at_raw) = row;

        if owner != subject_id {
            return Err(ContinuationError::SubjectMismatch {
                id: id.to_string(),
                subject_id: subject_id.to_string(),
            }
            .into());
        }

        match status.as_str() {
            "consumed" => {
                return Err(ContinuationError::Consumed(id.to_string()).into());
            }
            "expired" => {
                return Err(ContinuationError::Expired(id.to_string()).into());
            }
            _ => {}
        }

        let expires_at = DateTime::parse_from_rfc3339(&expires_at_raw)
            .map_err(store_err)?
            .with_timezone(&Utc);
        if expires_at < Utc::now() {
            return Err(ContinuationError::Expired(id.to_string()).into());
        }

        // Mark consumed atomically; a concurrent redeemer loses here.
        let updated = self
            .conn
            .execute(
                "UPDATE continuations SET status = 'consumed', consumed_at = ?2
                 WHERE id = ?1 AND status = 'awaiting'",
                params![id, Utc::now().to_rfc3339()],
            )
            .map_err(store_err)?;
        if updated == 0 {
            return Err(ContinuationError::Consumed(id.to_string()).into());
        }

        if state_checksum(&blob) != checksum {
            return Err(ContinuationError::ChecksumMismatch(id.to_string()).into());
        }

        let state: PipelineState = serde_json::from_str(&blob).map_err(store_err)?;
        let next_step: NextStep = next_step_raw.parse().map_err(store_err)?;

        Ok(LoadedContinuation { state, next_step })
    }

    /// Expire all active continuations for a subject. Returns how many.
    ///
    /// Called when a new run (or a new checkpoint) starts for the subject,
    /// so two concurrent writers can never race on the same artifact.
    pub fn invalidate_subject(&self, subject_id: &str) -> Result<usize, PipelineError> {
        self.conn
            .execute(
                "UPDATE continuations SET status = 'expired'
                 WHERE subject_id = ?1 AND status = 'awaiting'",
                params![subject_id],
            )
            .map_err(store_err)
    }

    /// Mark every TTL-expired continuation as expired. Returns how many.
    pub fn sweep_expired(&self) -> Result<usize, PipelineError> {
        self.conn
            .execute(
                "UPDATE continuations SET status = 'expired'
                 WHERE status = 'awaiting' AND expires_at < ?1",
                params![Utc::now().to_rfc3339()],
            )
            .map_err(store_err)
    }
}

/// Async-safe handle to the continuation database.
///
/// Wraps [`ContinuationDb`] behind `Arc<Mutex>` and runs all access on
/// tokio's blocking thread pool, keeping synchronous SQLite I/O off async
/// worker threads.
#[derive(Clone)]
pub struct ContinuationStore {
    inner: Arc<std::sync::Mutex<ContinuationDb>>,
}

impl ContinuationStore {
    pub fn new(db: ContinuationDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open a store at the given path, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(store_err)?;
        }
        Ok(Self::new(ContinuationDb::new(path)?))
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self, PipelineError> {
        Ok(Self::new(ContinuationDb::new_in_memory()?))
    }

    async fn call<F, R>(&self, f: F) -> Result<R, PipelineError>
    where
        F: FnOnce(&ContinuationDb) -> Result<R, PipelineError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| store_err(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| store_err(anyhow::anyhow!("DB task panicked: {}", e)))?
    }

    pub async fn save(
        &self,
        subject_id: String,
        next_step: NextStep,
        state: PipelineState,
        ttl: Duration,
    ) -> Result<String, PipelineError> {
        self.call(move |db| db.save(&subject_id, next_step, &state, ttl))
            .await
    }

    pub async fn load(
        &self,
        id: String,
        subject_id: String,
    ) -> Result<LoadedContinuation, PipelineError> {
        self.call(move |db| db.load(&id, &subject_id)).await
    }

    pub async fn invalidate_subject(&self, subject_id: String) -> Result<usize, PipelineError> {
        self.call(move |db| db.invalidate_subject(&subject_id)).await
    }

    pub async fn sweep_expired(&self) -> Result<usize, PipelineError> {
        self.call(|db| db.sweep_expired()).await
    }
}
