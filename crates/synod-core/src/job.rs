use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SynodError;
use crate::types::{ConsensusReview, Finding, Patch, PipelineResult, ReviewRequest};

/// Unique identifier for one pipeline run.
///
/// Derived from the PR coordinates and creation time, so ids are stable
/// for logging and idempotency markers but never collide across runs.
///
/// # Examples
///
/// ```
/// use synod_core::JobId;
///
/// let id = JobId::derive("acme/rocket", 42, "deadbeef", 1_700_000_000_000);
/// assert!(id.as_str().starts_with("job-"));
/// assert_eq!(id.as_str().len(), 16);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wrap an existing id (e.g. read back from the store).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an id from PR coordinates and a creation timestamp.
    pub fn derive(pr_key: &str, number: u64, head_sha: &str, created_at_ms: i64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(pr_key.as_bytes());
        hasher.update(number.to_le_bytes());
        hasher.update(head_sha.as_bytes());
        hasher.update(created_at_ms.to_le_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
        Self(format!("job-{hex}"))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline stages in execution order.
///
/// Stages are the schedulable units of a job; each maps to the working
/// [`JobStatus`] the job holds while the stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Analyzing,
    Reviewing,
    Refactoring,
    Testing,
    Commenting,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 5] = [
        Stage::Analyzing,
        Stage::Reviewing,
        Stage::Refactoring,
        Stage::Testing,
        Stage::Commenting,
    ];

    /// Stable lowercase label, used in logs, timelines, and the store.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Analyzing => "analyzing",
            Stage::Reviewing => "reviewing",
            Stage::Refactoring => "refactoring",
            Stage::Testing => "testing",
            Stage::Commenting => "commenting",
        }
    }

    /// The status a job holds while this stage runs.
    pub fn status(&self) -> JobStatus {
        match self {
            Stage::Analyzing => JobStatus::Analyzing,
            Stage::Reviewing => JobStatus::Reviewing,
            Stage::Refactoring => JobStatus::Refactoring,
            Stage::Testing => JobStatus::Testing,
            Stage::Commenting => JobStatus::Commenting,
        }
    }

    /// The stage after this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Analyzing => Some(Stage::Reviewing),
            Stage::Reviewing => Some(Stage::Refactoring),
            Stage::Refactoring => Some(Stage::Testing),
            Stage::Testing => Some(Stage::Commenting),
            Stage::Commenting => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyzing" => Ok(Stage::Analyzing),
            "reviewing" => Ok(Stage::Reviewing),
            "refactoring" => Ok(Stage::Refactoring),
            "testing" => Ok(Stage::Testing),
            "commenting" => Ok(Stage::Commenting),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

/// Lifecycle state of a [`ReviewJob`].
///
/// Working states advance strictly forward; `Completed`, `Failed`,
/// `Superseded`, and `Degraded` are terminal and absorbing.
///
/// # Examples
///
/// ```
/// use synod_core::JobStatus;
///
/// assert!(JobStatus::Superseded.is_terminal());
/// assert!(JobStatus::Reviewing.is_active());
/// assert_eq!(JobStatus::Queued.label(), "queued");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted and waiting for a worker.
    Queued,
    /// Static analysis in progress.
    Analyzing,
    /// Multi-model AI review in progress.
    Reviewing,
    /// Patch generation in progress.
    Refactoring,
    /// Sandboxed patch validation in progress.
    Testing,
    /// Posting results to the PR.
    Commenting,
    /// Pipeline finished with full results.
    Completed,
    /// Pipeline aborted after exhausting its options.
    Failed,
    /// A newer head commit replaced this job.
    Superseded,
    /// Finished with partial (analysis-only) results.
    Degraded,
}

impl JobStatus {
    /// Stable lowercase label, also the stored representation.
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Analyzing => "analyzing",
            JobStatus::Reviewing => "reviewing",
            JobStatus::Refactoring => "refactoring",
            JobStatus::Testing => "testing",
            JobStatus::Commenting => "commenting",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Superseded => "superseded",
            JobStatus::Degraded => "degraded",
        }
    }

    /// `true` for the four absorbing states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Superseded | JobStatus::Degraded
        )
    }

    /// `true` while the job still owns its PR slot.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Position in the forward pipeline; terminal states have no order.
    fn order(&self) -> Option<u8> {
        match self {
            JobStatus::Queued => Some(0),
            JobStatus::Analyzing => Some(1),
            JobStatus::Reviewing => Some(2),
            JobStatus::Refactoring => Some(3),
            JobStatus::Testing => Some(4),
            JobStatus::Commenting => Some(5),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `to` is legal.
    ///
    /// Rules: terminal states are absorbing; `Failed` and `Superseded` are
    /// reachable from any working state; `Completed` and `Degraded` only
    /// from `Commenting`; working states only move forward (skips allowed).
    pub fn can_transition(&self, to: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            JobStatus::Failed | JobStatus::Superseded => true,
            JobStatus::Completed | JobStatus::Degraded => *self == JobStatus::Commenting,
            _ => match (self.order(), to.order()) {
                (Some(from), Some(target)) => target > from,
                _ => false,
            },
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "analyzing" => Ok(JobStatus::Analyzing),
            "reviewing" => Ok(JobStatus::Reviewing),
            "refactoring" => Ok(JobStatus::Refactoring),
            "testing" => Ok(JobStatus::Testing),
            "commenting" => Ok(JobStatus::Commenting),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "superseded" => Ok(JobStatus::Superseded),
            "degraded" => Ok(JobStatus::Degraded),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// How one stage attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    /// Stage produced its artifact.
    Succeeded,
    /// Stage failed; policy decides what happens next.
    Failed,
    /// Stage was not run (e.g. nothing fixable).
    Skipped,
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Succeeded => write!(f, "succeeded"),
            StageOutcome::Failed => write!(f, "failed"),
            StageOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

/// One entry in a job's append-only stage timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    /// Which stage ran.
    pub stage: Stage,
    /// 1-based attempt number for that stage.
    pub attempt: u32,
    /// How the attempt ended.
    pub outcome: StageOutcome,
    /// Failure reason or skip note, when there is one.
    pub detail: Option<String>,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished.
    pub finished_at: DateTime<Utc>,
}

/// Mutable record of one pipeline run.
///
/// Owns the immutable [`ReviewRequest`], the current [`JobStatus`], an
/// append-only stage timeline, per-stage attempt counters, and the
/// artifacts accumulated by each stage. Only the orchestrator mutates a
/// job; agents receive what they need by value or reference.
///
/// # Examples
///
/// ```
/// use synod_core::{JobStatus, ReviewJob, ReviewRequest};
///
/// let request = ReviewRequest {
///     owner: "acme".into(),
///     repo: "rocket".into(),
///     number: 42,
///     head_sha: "deadbeef".into(),
///     base_branch: "main".into(),
///     head_ref: "feature/thrusters".into(),
///     title: "Add thrusters".into(),
///     changed_files: vec![],
/// };
/// let job = ReviewJob::new(request);
/// assert_eq!(job.status, JobStatus::Queued);
/// assert!(job.timeline.is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewJob {
    /// Unique run identifier.
    pub id: JobId,
    /// The request that started this run.
    pub request: ReviewRequest,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Set when AI review failed and the run continued with partial data.
    #[serde(default)]
    pub degraded: bool,
    /// Append-only, ordered stage history.
    pub timeline: Vec<StageRecord>,
    /// Attempts consumed per stage, keyed by stage label.
    pub attempts: BTreeMap<String, u32>,
    /// Raw findings appended by the analysis and review stages.
    pub findings: Vec<Finding>,
    /// Merged review, once the reviewing stage succeeds.
    pub consensus: Option<ConsensusReview>,
    /// Candidate patches with their validation outcomes.
    pub patches: Vec<Patch>,
    /// Terminal artifact, once commenting runs.
    pub result: Option<PipelineResult>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl ReviewJob {
    /// Create a queued job for `request` with a freshly derived id.
    pub fn new(request: ReviewRequest) -> Self {
        let created_at = Utc::now();
        let id = JobId::derive(
            &request.pr_key(),
            request.number,
            &request.head_sha,
            created_at.timestamp_millis(),
        );
        Self {
            id,
            request,
            status: JobStatus::Queued,
            degraded: false,
            timeline: Vec::new(),
            attempts: BTreeMap::new(),
            findings: Vec::new(),
            consensus: None,
            patches: Vec::new(),
            result: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// Move the job to `to`, enforcing the forward-only transition rules.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Conflict`] when the transition is illegal,
    /// including any transition out of a terminal state.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), SynodError> {
        if !self.status.can_transition(to) {
            return Err(SynodError::Conflict(format!(
                "job {} cannot move {} -> {}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Attempts consumed so far for `stage`.
    pub fn attempt(&self, stage: Stage) -> u32 {
        self.attempts.get(stage.label()).copied().unwrap_or(0)
    }

    /// Increment and return the attempt counter for `stage`.
    pub fn bump_attempt(&mut self, stage: Stage) -> u32 {
        let counter = self.attempts.entry(stage.label().to_string()).or_insert(0);
        *counter += 1;
        self.updated_at = Utc::now();
        *counter
    }

    /// Append a stage record to the timeline.
    pub fn record_stage(
        &mut self,
        stage: Stage,
        attempt: u32,
        outcome: StageOutcome,
        detail: Option<String>,
        started_at: DateTime<Utc>,
    ) {
        self.timeline.push(StageRecord {
            stage,
            attempt,
            outcome,
            detail,
            started_at,
            finished_at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// Append findings from a stage.
    pub fn add_findings(&mut self, findings: impl IntoIterator<Item = Finding>) {
        self.findings.extend(findings);
        self.updated_at = Utc::now();
    }
}
