use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use synod_core::{JobId, JobStatus, ReviewJob, SynodError};

/// Durable SQLite store for [`ReviewJob`] records.
///
/// The full job (timeline, findings, patches, result) is stored as one JSON
/// column; the indexed columns exist for the queries the scheduler and the
/// CLI actually run. The connection is wrapped in a mutex so the store can
/// be shared across workers — every operation is a short transaction.
///
/// # Examples
///
/// ```
/// use synod_server::store::JobStore;
///
/// let store = JobStore::in_memory().unwrap();
/// assert!(store.recent(10).unwrap().is_empty());
/// ```
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Open or create the job database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Database`] if the database cannot be opened or
    /// the schema cannot be created.
    pub fn open(path: &Path) -> Result<Self, SynodError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SynodError::Database(format!("failed to create store directory: {e}"))
                })?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| SynodError::Database(format!("failed to open job store: {e}")))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for tests and one-shot runs).
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Database`] if schema creation fails.
    pub fn in_memory() -> Result<Self, SynodError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SynodError::Database(format!("failed to create in-memory store: {e}")))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), SynodError> {
        self.lock()
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    pr_key TEXT NOT NULL,
                    head_sha TEXT NOT NULL,
                    status TEXT NOT NULL,
                    record TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS jobs_pr_key ON jobs(pr_key);
                CREATE INDEX IF NOT EXISTS jobs_status ON jobs(status);
                ",
            )
            .map_err(|e| SynodError::Database(format!("failed to create schema: {e}")))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; the connection is
        // still usable for independent statements.
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert or replace a job record. Called at every stage boundary.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Database`] on write failure.
    pub fn save(&self, job: &ReviewJob) -> Result<(), SynodError> {
        let record = serde_json::to_string(job)?;
        self.lock()
            .execute(
                "INSERT INTO jobs (id, pr_key, head_sha, status, record, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                     status = excluded.status,
                     record = excluded.record,
                     updated_at = excluded.updated_at",
                params![
                    job.id.as_str(),
                    job.request.pr_key(),
                    job.request.head_sha,
                    job.status.label(),
                    record,
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| SynodError::Database(format!("failed to save job: {e}")))?;
        Ok(())
    }

    /// Load one job by id.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Database`] on query failure and
    /// [`SynodError::Serialization`] when the stored record is corrupt.
    pub fn load(&self, id: &JobId) -> Result<Option<ReviewJob>, SynodError> {
        let record: Option<String> = self
            .lock()
            .query_row(
                "SELECT record FROM jobs WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SynodError::Database(format!("failed to load job: {e}")))?;
        match record {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// The active (non-terminal) job for a PR, if one exists.
    ///
    /// At most one row can match; the scheduler's keyed lock guarantees it.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Database`] on query failure.
    pub fn active_for_pr(&self, pr_key: &str) -> Result<Option<ReviewJob>, SynodError> {
        let record: Option<String> = self
            .lock()
            .query_row(
                "SELECT record FROM jobs
                 WHERE pr_key = ?1
                   AND status NOT IN ('completed', 'failed', 'superseded', 'degraded')
                 ORDER BY created_at DESC
                 LIMIT 1",
                params![pr_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SynodError::Database(format!("failed to query active job: {e}")))?;
        match record {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// The most recent jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Database`] on query failure.
    pub fn recent(&self, limit: usize) -> Result<Vec<ReviewJob>, SynodError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT record FROM jobs ORDER BY created_at DESC LIMIT ?1")
            .map_err(|e| SynodError::Database(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))
            .map_err(|e| SynodError::Database(format!("failed to list jobs: {e}")))?;

        let mut jobs = Vec::new();
        for row in rows {
            let json = row.map_err(|e| SynodError::Database(format!("failed to read row: {e}")))?;
            match serde_json::from_str(&json) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(error = %e, "skipping unreadable job record"),
            }
        }
        Ok(jobs)
    }

    /// Startup recovery: re-enqueue jobs that never started and fail jobs
    /// the previous process died in the middle of.
    ///
    /// Returns the ids of the `queued` jobs to put back on the queue.
    /// Jobs caught mid-stage get an interruption note; a half-run stage is
    /// not resumed.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Database`] on query or write failure.
    pub fn recover(&self) -> Result<Vec<JobId>, SynodError> {
        let mut requeued = Vec::new();
        let mut interrupted = 0usize;
        for mut job in self.non_terminal_jobs()? {
            match job.status {
                JobStatus::Queued => requeued.push(job.id.clone()),
                _ => {
                    let stage = job.status.label().to_string();
                    job.status = JobStatus::Failed;
                    job.updated_at = chrono::Utc::now();
                    job.timeline.push(synod_core::StageRecord {
                        stage: stage
                            .parse()
                            .unwrap_or(synod_core::Stage::Analyzing),
                        attempt: 0,
                        outcome: synod_core::StageOutcome::Failed,
                        detail: Some("interrupted by process restart".into()),
                        started_at: job.updated_at,
                        finished_at: job.updated_at,
                    });
                    self.save(&job)?;
                    interrupted += 1;
                }
            }
        }
        if !requeued.is_empty() || interrupted > 0 {
            info!(
                requeued = requeued.len(),
                interrupted, "recovered job store after restart"
            );
        }
        Ok(requeued)
    }

    fn non_terminal_jobs(&self) -> Result<Vec<ReviewJob>, SynodError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT record FROM jobs
                 WHERE status NOT IN ('completed', 'failed', 'superseded', 'degraded')
                 ORDER BY created_at ASC",
            )
            .map_err(|e| SynodError::Database(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| SynodError::Database(format!("failed to query jobs: {e}")))?;

        let mut jobs = Vec::new();
        for row in rows {
            let json = row.map_err(|e| SynodError::Database(format!("failed to read row: {e}")))?;
            jobs.push(serde_json::from_str(&json)?);
        }
        Ok(jobs)
    }
}
