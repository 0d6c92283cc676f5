use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use synod_core::{JobId, JobStatus};

use crate::orchestrator::Orchestrator;
use crate::scheduler::Scheduler;

/// Pull jobs off the queue and run them on a bounded pool.
///
/// At most `workers` pipelines run at once; further job ids wait on the
/// semaphore while the queue keeps absorbing submissions. On shutdown the
/// loop stops taking new jobs and drains the in-flight ones, which keep
/// their own cancellation semantics (shutdown is graceful, supersession is
/// not).
pub async fn run_workers(
    orchestrator: Arc<Orchestrator>,
    scheduler: Arc<Scheduler>,
    mut queue: mpsc::Receiver<JobId>,
    workers: usize,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut running = JoinSet::new();

    loop {
        // Reap finished pipelines as we go so the set stays small.
        while let Some(result) = running.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "worker task panicked");
            }
        }

        let id = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let orchestrator = Arc::clone(&orchestrator);
        let scheduler = Arc::clone(&scheduler);
        running.spawn(async move {
            let _permit = permit;
            let cancel = scheduler.cancellation(&id).await;
            match orchestrator.run(&id, cancel).await {
                Ok(status) => {
                    info!(job = %id, status = %status, "job finished");
                }
                Err(e) => {
                    error!(job = %id, error = %e, "pipeline run aborted");
                    mark_failed(&orchestrator, &id);
                }
            }
            scheduler.release(&id).await;
        });
    }

    if !running.is_empty() {
        info!(in_flight = running.len(), "draining in-flight jobs before exit");
    }
    while let Some(result) = running.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "worker task panicked");
        }
    }
}

/// Best-effort terminal transition for a job whose run aborted outside the
/// stage failure policy (store errors, unknown ids).
fn mark_failed(orchestrator: &Orchestrator, id: &JobId) {
    let store = orchestrator.store();
    let job = match store.load(id) {
        Ok(Some(job)) if !job.status.is_terminal() => job,
        Ok(_) => return,
        Err(e) => {
            warn!(job = %id, error = %e, "could not load job to mark it failed");
            return;
        }
    };
    let mut job = job;
    if job.transition(JobStatus::Failed).is_ok() {
        if let Err(e) = store.save(&job) {
            warn!(job = %id, error = %e, "could not persist failed status");
        }
    }
}
