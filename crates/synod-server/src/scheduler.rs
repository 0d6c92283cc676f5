use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use synod_core::{JobId, JobStatus, ReviewJob, ReviewRequest, SynodError};

use crate::store::JobStore;

/// What the scheduler decided for one submitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// No active job for the PR; a new one was created and enqueued.
    Created(JobId),
    /// An active job for the same head commit already exists; no-op.
    Duplicate(JobId),
    /// A newer commit superseded the active job; the old one was cancelled
    /// and a replacement was enqueued.
    Superseded {
        /// The job that was marked superseded.
        old: JobId,
        /// The freshly enqueued replacement.
        new: JobId,
    },
}

impl SubmitOutcome {
    /// The job that is now active for the PR.
    pub fn job_id(&self) -> &JobId {
        match self {
            SubmitOutcome::Created(id) | SubmitOutcome::Duplicate(id) => id,
            SubmitOutcome::Superseded { new, .. } => new,
        }
    }
}

/// Job deduplicator and dispatcher.
///
/// Enforces single-active-job-per-PR: submissions for the same
/// `(repository, PR)` pair serialize on a keyed async lock, so two
/// concurrent events can never both create an active job. A submission
/// with a new head commit marks the active job `superseded`, triggers its
/// cancellation token, and enqueues a replacement; a submission with the
/// same head commit is an idempotent no-op.
pub struct Scheduler {
    store: JobStore,
    queue: mpsc::Sender<JobId>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    cancellations: Mutex<HashMap<JobId, CancellationToken>>,
}

impl Scheduler {
    /// Create a scheduler that enqueues job ids onto `queue`.
    pub fn new(store: JobStore, queue: mpsc::Sender<JobId>) -> Self {
        Self {
            store,
            queue,
            locks: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// The store this scheduler persists jobs to.
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Submit a review request, deduplicating against the active job.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Database`] on store failures and
    /// [`SynodError::Conflict`] when the worker queue is closed.
    pub async fn submit(&self, request: ReviewRequest) -> Result<SubmitOutcome, SynodError> {
        let pr_key = request.pr_key();
        let lock = self.pr_lock(&pr_key).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.decide(&pr_key, request).await
        };
        drop(lock);
        self.prune_lock(&pr_key).await;
        outcome
    }

    async fn decide(
        &self,
        pr_key: &str,
        request: ReviewRequest,
    ) -> Result<SubmitOutcome, SynodError> {
        let active = self.store.active_for_pr(pr_key)?;
        match active {
            Some(job) if job.request.head_sha == request.head_sha => {
                debug!(pr = %pr_key, job = %job.id, "duplicate event for active head, ignoring");
                Ok(SubmitOutcome::Duplicate(job.id))
            }
            Some(mut stale) => {
                stale.transition(JobStatus::Superseded)?;
                self.store.save(&stale)?;
                self.cancel(&stale.id).await;
                info!(pr = %pr_key, old = %stale.id, sha = %request.head_sha, "superseding stale job");

                let new_id = self.create_and_enqueue(request).await?;
                Ok(SubmitOutcome::Superseded {
                    old: stale.id,
                    new: new_id,
                })
            }
            None => {
                let id = self.create_and_enqueue(request).await?;
                Ok(SubmitOutcome::Created(id))
            }
        }
    }

    /// Put an already-persisted job back on the queue (startup recovery).
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Conflict`] when the worker queue is closed.
    pub async fn enqueue(&self, id: JobId) -> Result<(), SynodError> {
        self.queue
            .send(id)
            .await
            .map_err(|_| SynodError::Conflict("worker queue is closed".into()))
    }

    /// The cancellation token for a job, created on first use.
    ///
    /// Workers race stage execution against this token; [`Scheduler::submit`]
    /// triggers it when a newer commit supersedes the job.
    pub async fn cancellation(&self, id: &JobId) -> CancellationToken {
        let mut tokens = self.cancellations.lock().await;
        tokens.entry(id.clone()).or_default().clone()
    }

    /// Trigger a job's cancellation token, if one was ever handed out.
    pub async fn cancel(&self, id: &JobId) {
        let mut tokens = self.cancellations.lock().await;
        tokens.entry(id.clone()).or_default().cancel();
    }

    /// Drop the cancellation token of a finished job.
    pub async fn release(&self, id: &JobId) {
        self.cancellations.lock().await.remove(id);
    }

    async fn create_and_enqueue(&self, request: ReviewRequest) -> Result<JobId, SynodError> {
        let job = ReviewJob::new(request);
        let id = job.id.clone();
        self.store.save(&job)?;
        self.enqueue(id.clone()).await?;
        debug!(job = %id, "job enqueued");
        Ok(id)
    }

    async fn pr_lock(&self, pr_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(pr_key.to_string()).or_default())
    }

    /// Drop a PR's lock entry once no submission holds it, the same way
    /// `release` prunes cancellation tokens. A strong count above one
    /// means another submission still owns a clone and will prune later.
    async fn prune_lock(&self, pr_key: &str) {
        let mut locks = self.locks.lock().await;
        if locks.get(pr_key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(pr_key);
        }
    }

    #[cfg(test)]
    async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }
}
