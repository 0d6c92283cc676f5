use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use synod_analysis::AnalysisAgent;
use synod_core::{
    ErrorClass, JobId, JobStatus, PatchValidation, PipelineResult, ReviewJob, SourceFile, Stage,
    StageOutcome, SynodConfig, SynodError, Verdict,
};
use synod_github::{
    check_conclusion, idempotency_marker, render_degraded_comment, render_failure_comment,
    render_review_comment,
};
use synod_patch::{RefactorAgent, TestRunner};
use synod_review::ReviewAgent;

use crate::gateway::ReviewGateway;
use crate::store::JobStore;

/// How one stage attempt sequence ended, after retries.
enum StageEnd<T> {
    /// The stage produced its artifact.
    Done(T),
    /// Retries exhausted or a fatal error; the stage failure policy applies.
    Failed(String),
    /// The job was superseded while the stage was in flight.
    Cancelled,
}

/// The pipeline state machine.
///
/// Drives one job through `analyzing → reviewing → refactoring → testing →
/// commenting`, applying the per-stage retry, timeout, and failure policy.
/// Only the orchestrator mutates the job record; every stage boundary is
/// persisted to the store before the next stage is dispatched, so a restart
/// can tell exactly how far a job got.
///
/// Failure policy per stage:
/// - `analyzing`, `refactoring`, `testing` — non-fatal; the pipeline
///   continues with partial data.
/// - `reviewing` — fatal after retries; the job finishes `degraded` but
///   still comments with an analysis-only body.
/// - `commenting` — fatal after retries; the job is `failed` and a minimal
///   status comment is attempted once.
///
/// Supersession cancels cooperatively: the token is checked between stages
/// and raced against in-flight stage work, and a cancelled job's partial
/// results are discarded.
pub struct Orchestrator {
    config: SynodConfig,
    store: JobStore,
    gateway: Arc<dyn ReviewGateway>,
    analysis: AnalysisAgent,
    reviewer: ReviewAgent,
    refactor: Option<RefactorAgent>,
    tester: TestRunner,
}

impl Orchestrator {
    /// Build the orchestrator with live HTTP-backed agents.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Config`] when the model panel is empty or the
    /// refactor model is not a panel entry.
    pub fn new(
        config: SynodConfig,
        store: JobStore,
        gateway: Arc<dyn ReviewGateway>,
    ) -> Result<Self, SynodError> {
        let reviewer = ReviewAgent::from_config(&config.models)?;
        let refactor = if config.refactor.enabled {
            Some(RefactorAgent::from_config(&config.refactor, &config.models)?)
        } else {
            None
        };
        Ok(Self {
            analysis: AnalysisAgent::new(config.analysis.clone()),
            tester: TestRunner::new(config.sandbox.clone()),
            config,
            store,
            gateway,
            reviewer,
            refactor,
        })
    }

    /// Build the orchestrator over explicit agents. Used by tests to
    /// substitute scripted model panels.
    pub fn with_agents(
        config: SynodConfig,
        store: JobStore,
        gateway: Arc<dyn ReviewGateway>,
        reviewer: ReviewAgent,
        refactor: Option<RefactorAgent>,
    ) -> Self {
        Self {
            analysis: AnalysisAgent::new(config.analysis.clone()),
            tester: TestRunner::new(config.sandbox.clone()),
            config,
            store,
            gateway,
            reviewer,
            refactor,
        }
    }

    /// The store this orchestrator persists to.
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Run one job to a terminal state and return it.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures (unknown job id,
    /// store writes). Stage-level failures are absorbed by the failure
    /// policy and land the job in a terminal state instead.
    pub async fn run(
        &self,
        id: &JobId,
        cancel: CancellationToken,
    ) -> Result<JobStatus, SynodError> {
        let Some(mut job) = self.store.load(id)? else {
            return Err(SynodError::Database(format!("unknown job {id}")));
        };
        if job.status.is_terminal() {
            return Ok(job.status);
        }
        info!(job = %job.id, pr = %job.request.pr_key(), "pipeline run starting");

        let request = job.request.clone();

        // Analyzing: hydrate head content, then run the linters. Non-fatal;
        // a failure here leaves the review to work from the diffs alone.
        if cancel.is_cancelled() {
            return self.conclude_superseded(&mut job);
        }
        let mut files: Vec<SourceFile> = Vec::new();
        let analyzing = {
            let gateway = Arc::clone(&self.gateway);
            let request = request.clone();
            self.run_stage(&mut job, Stage::Analyzing, &cancel, move || {
                let gateway = Arc::clone(&gateway);
                let request = request.clone();
                let analysis = &self.analysis;
                async move {
                    let files = gateway.hydrate(&request).await?;
                    let findings = analysis.run(&files).await?;
                    Ok((files, findings))
                }
            })
            .await?
        };
        match analyzing {
            StageEnd::Done((hydrated, findings)) => {
                files = hydrated;
                job.add_findings(findings);
                self.store.save(&job)?;
            }
            StageEnd::Failed(detail) => {
                warn!(job = %job.id, detail, "analysis unavailable, continuing without findings");
            }
            StageEnd::Cancelled => return self.conclude_superseded(&mut job),
        }

        // Reviewing: fatal after retries, but the job still comments.
        if cancel.is_cancelled() {
            return self.conclude_superseded(&mut job);
        }
        let lint_findings = job.findings.clone();
        let reviewing = {
            let request = request.clone();
            let files = files.clone();
            let lint_findings = lint_findings.clone();
            self.run_stage(&mut job, Stage::Reviewing, &cancel, move || {
                let request = request.clone();
                let files = files.clone();
                let lint_findings = lint_findings.clone();
                let reviewer = &self.reviewer;
                async move { reviewer.run(&request, &files, &lint_findings).await }
            })
            .await?
        };
        match reviewing {
            StageEnd::Done(consensus) => {
                job.consensus = Some(consensus);
                self.store.save(&job)?;
            }
            StageEnd::Failed(detail) => {
                warn!(job = %job.id, detail, "review unavailable, degrading to analysis-only");
                job.degraded = true;
                self.store.save(&job)?;
            }
            StageEnd::Cancelled => return self.conclude_superseded(&mut job),
        }

        // Refactoring and testing only run when there is something fixable.
        let fixable = job
            .consensus
            .as_ref()
            .is_some_and(|c| !c.no_fixable_findings());
        match (&self.refactor, fixable) {
            (Some(refactor), true) => {
                if cancel.is_cancelled() {
                    return self.conclude_superseded(&mut job);
                }
                let consensus = job.consensus.clone();
                let refactoring = {
                    let files = files.clone();
                    self.run_stage(&mut job, Stage::Refactoring, &cancel, move || {
                        let consensus = consensus.clone();
                        let files = files.clone();
                        async move {
                            // Fixable findings imply a consensus exists.
                            let Some(consensus) = consensus else {
                                return Ok(Vec::new());
                            };
                            Ok(refactor.run(&consensus, &files).await)
                        }
                    })
                    .await?
                };
                match refactoring {
                    StageEnd::Done(patches) => {
                        job.patches = patches;
                        self.store.save(&job)?;
                    }
                    StageEnd::Failed(detail) => {
                        warn!(job = %job.id, detail, "patch generation unavailable, continuing");
                    }
                    StageEnd::Cancelled => return self.conclude_superseded(&mut job),
                }

                self.validate_patches(&mut job, &cancel).await?;
                if cancel.is_cancelled() {
                    return self.conclude_superseded(&mut job);
                }
            }
            _ => {
                let note = if job.degraded {
                    "review degraded"
                } else if self.refactor.is_none() {
                    "patch generation disabled"
                } else {
                    "no fixable findings"
                };
                let now = Utc::now();
                job.record_stage(Stage::Refactoring, 0, StageOutcome::Skipped, Some(note.into()), now);
                job.record_stage(Stage::Testing, 0, StageOutcome::Skipped, Some(note.into()), now);
                self.store.save(&job)?;
            }
        }

        // Commenting always runs; even a degraded job surfaces results.
        if cancel.is_cancelled() {
            return self.conclude_superseded(&mut job);
        }
        self.comment_and_finish(&mut job, &cancel).await
    }

    /// Testing stage: each patch is validated in its own disposable
    /// sandbox, so one test run's artifacts never reach the next patch's
    /// verdict. Non-fatal; patches keep whatever validation state they
    /// reached.
    async fn validate_patches(
        &self,
        job: &mut ReviewJob,
        cancel: &CancellationToken,
    ) -> Result<(), SynodError> {
        if job.patches.is_empty() {
            job.record_stage(
                Stage::Testing,
                0,
                StageOutcome::Skipped,
                Some("no candidate patches".into()),
                Utc::now(),
            );
            self.store.save(job)?;
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Ok(());
        }

        let request = job.request.clone();
        let patches = job.patches.clone();
        let testing = self
            .run_stage(job, Stage::Testing, cancel, move || {
                let request = request.clone();
                let mut patches = patches.clone();
                let gateway = Arc::clone(&self.gateway);
                let tester = &self.tester;
                async move {
                    for patch in patches.iter_mut() {
                        // A fresh checkout per patch; the workspace is
                        // dropped (and deleted) after each validation.
                        let workspace = gateway.prepare_workspace(&request).await?;
                        tester.validate(&workspace, patch).await;
                    }
                    Ok(patches)
                }
            })
            .await?;
        match testing {
            StageEnd::Done(validated) => {
                job.patches = validated;
                self.store.save(job)?;
            }
            StageEnd::Failed(detail) => {
                warn!(job = %job.id, detail, "patch validation unavailable");
                for patch in &mut job.patches {
                    if patch.validation == PatchValidation::Pending {
                        patch.validation = PatchValidation::Skipped;
                    }
                }
                self.store.save(job)?;
            }
            StageEnd::Cancelled => {}
        }
        Ok(())
    }

    /// Commenting stage plus terminal transition.
    async fn comment_and_finish(
        &self,
        job: &mut ReviewJob,
        cancel: &CancellationToken,
    ) -> Result<JobStatus, SynodError> {
        let marker = idempotency_marker(job.id.as_str(), Stage::Commenting.label());

        // Opening the fix PR comes first so the comment can link it.
        // Its failure never suppresses the comment.
        let fix_pr_url = if job
            .patches
            .iter()
            .any(|p| p.validation == PatchValidation::Passed)
        {
            match self.gateway.open_fix_pr(&job.request, &job.patches).await {
                Ok(url) => {
                    info!(job = %job.id, url, "fix PR opened");
                    Some(url)
                }
                Err(e) => {
                    warn!(job = %job.id, error = %e, "failed to open fix PR");
                    None
                }
            }
        } else {
            None
        };

        let body = match &job.consensus {
            Some(consensus) => {
                render_review_comment(&marker, consensus, &job.patches, fix_pr_url.as_deref())
            }
            None => render_degraded_comment(&marker, &job.findings),
        };
        let verdict = job
            .consensus
            .as_ref()
            .map(|c| c.verdict)
            .unwrap_or(Verdict::CommentOnly);
        let conclusion = check_conclusion(Some(verdict), job.degraded);
        let summary = match &job.consensus {
            Some(c) => format!("{} findings, verdict {}", c.findings.len(), c.verdict),
            None => "partial results: static analysis only".to_string(),
        };

        let commenting = {
            let request = job.request.clone();
            let marker = marker.clone();
            let body = body.clone();
            let summary = summary.clone();
            self.run_stage(job, Stage::Commenting, cancel, move || {
                let gateway = Arc::clone(&self.gateway);
                let request = request.clone();
                let marker = marker.clone();
                let body = body.clone();
                let summary = summary.clone();
                async move {
                    gateway.publish_comment(&request, &marker, &body).await?;
                    // Check runs need app credentials on some installs.
                    if let Err(e) = gateway.publish_check(&request, conclusion, &summary).await {
                        warn!(error = %e, "failed to create check run");
                    }
                    Ok(())
                }
            })
            .await?
        };

        match commenting {
            StageEnd::Done(()) => {
                job.result = Some(PipelineResult {
                    verdict,
                    comment_body: body,
                    applied_patches: job
                        .patches
                        .iter()
                        .filter(|p| p.validation == PatchValidation::Passed)
                        .map(|p| p.id.clone())
                        .collect(),
                    fix_pr_url,
                    partial: job.degraded,
                });
                let terminal = if job.degraded {
                    JobStatus::Degraded
                } else {
                    JobStatus::Completed
                };
                job.transition(terminal)?;
                self.store.save(job)?;
                info!(job = %job.id, status = %terminal, "pipeline run finished");
                Ok(terminal)
            }
            StageEnd::Failed(detail) => {
                warn!(job = %job.id, detail, "commenting failed, marking job failed");
                self.conclude_failed(job).await
            }
            StageEnd::Cancelled => self.conclude_superseded(job),
        }
    }

    /// Mark the job failed and make one best-effort attempt at a minimal
    /// status comment so the PR is never left without feedback.
    async fn conclude_failed(&self, job: &mut ReviewJob) -> Result<JobStatus, SynodError> {
        job.transition(JobStatus::Failed)?;
        self.store.save(job)?;

        let marker = idempotency_marker(job.id.as_str(), "failed");
        let body = render_failure_comment(&marker);
        if let Err(e) = self
            .gateway
            .publish_comment(&job.request, &marker, &body)
            .await
        {
            warn!(job = %job.id, error = %e, "failed to post status comment");
        }
        Ok(JobStatus::Failed)
    }

    /// Land the job in `superseded`, discarding in-flight results. The
    /// scheduler may already have persisted the transition.
    fn conclude_superseded(&self, job: &mut ReviewJob) -> Result<JobStatus, SynodError> {
        if let Some(stored) = self.store.load(&job.id)? {
            if stored.status == JobStatus::Superseded {
                info!(job = %job.id, "job superseded, discarding in-flight work");
                return Ok(JobStatus::Superseded);
            }
        }
        job.transition(JobStatus::Superseded)?;
        self.store.save(job)?;
        info!(job = %job.id, "job superseded, discarding in-flight work");
        Ok(JobStatus::Superseded)
    }

    /// Drive one stage: transition, then attempt with the configured hard
    /// timeout, retrying transient failures with exponential backoff up to
    /// the attempt cap. Cancellation wins every race.
    async fn run_stage<T, F, Fut>(
        &self,
        job: &mut ReviewJob,
        stage: Stage,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<StageEnd<T>, SynodError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SynodError>>,
    {
        job.transition(stage.status())?;
        self.store.save(job)?;

        let stage_timeout = Duration::from_secs(self.config.retry.stage_timeout_secs);
        loop {
            if cancel.is_cancelled() {
                return Ok(StageEnd::Cancelled);
            }
            let attempt = job.bump_attempt(stage);
            let started = Utc::now();

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Ok(StageEnd::Cancelled),
                result = tokio::time::timeout(stage_timeout, f()) => match result {
                    Err(_) => Err(SynodError::Timeout(format!(
                        "stage {stage} exceeded {}s",
                        stage_timeout.as_secs()
                    ))),
                    Ok(result) => result,
                },
            };

            match outcome {
                Ok(value) => {
                    job.record_stage(stage, attempt, StageOutcome::Succeeded, None, started);
                    self.store.save(job)?;
                    return Ok(StageEnd::Done(value));
                }
                Err(e) if e.class() == ErrorClass::Conflict => {
                    return Ok(StageEnd::Cancelled);
                }
                Err(e) => {
                    let detail = e.to_string();
                    warn!(job = %job.id, stage = stage.label(), attempt, error = %detail, "stage attempt failed");
                    job.record_stage(
                        stage,
                        attempt,
                        StageOutcome::Failed,
                        Some(detail.clone()),
                        started,
                    );
                    self.store.save(job)?;

                    let retryable =
                        e.is_transient() && attempt < self.config.retry.max_attempts;
                    if !retryable {
                        return Ok(StageEnd::Failed(detail));
                    }
                    let delay =
                        Duration::from_secs(self.config.retry.backoff_delay_secs(attempt));
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(StageEnd::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
