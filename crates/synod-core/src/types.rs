use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Severity of a single review finding.
///
/// # Examples
///
/// ```
/// use synod_core::Severity;
///
/// let s: Severity = serde_json::from_str("\"error\"").unwrap();
/// assert_eq!(s, Severity::Error);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// A defect that should block the change.
    Error,
    /// A potential issue worth addressing.
    Warning,
    /// Informational observation.
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Severity::Error),
            "warning" => Ok(Severity::Warning),
            "info" => Ok(Severity::Info),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

impl Severity {
    /// Returns `true` if `self` is at least as severe as `threshold`.
    ///
    /// Severity order: Error > Warning > Info.
    ///
    /// # Examples
    ///
    /// ```
    /// use synod_core::Severity;
    ///
    /// assert!(Severity::Error.meets_threshold(Severity::Warning));
    /// assert!(Severity::Warning.meets_threshold(Severity::Warning));
    /// assert!(!Severity::Info.meets_threshold(Severity::Warning));
    /// ```
    pub fn meets_threshold(self, threshold: Severity) -> bool {
        self.rank() <= threshold.rank()
    }

    /// Returns the stricter of two severities.
    ///
    /// # Examples
    ///
    /// ```
    /// use synod_core::Severity;
    ///
    /// assert_eq!(Severity::Warning.max(Severity::Error), Severity::Error);
    /// assert_eq!(Severity::Info.max(Severity::Info), Severity::Info);
    /// ```
    pub fn max(self, other: Severity) -> Severity {
        if other.rank() < self.rank() {
            other
        } else {
            self
        }
    }

    pub(crate) fn rank(self) -> u8 {
        match self {
            Severity::Error => 0,
            Severity::Warning => 1,
            Severity::Info => 2,
        }
    }
}

/// Where a finding came from: a static-analysis tool or an AI model.
///
/// Serializes as `"lint:<tool>"` or `"ai:<model>"` so sources survive
/// round-trips through job records and comment markers.
///
/// # Examples
///
/// ```
/// use synod_core::FindingSource;
///
/// let src: FindingSource = "ai:gpt-4o".parse().unwrap();
/// assert_eq!(src, FindingSource::Ai("gpt-4o".into()));
/// assert_eq!(src.to_string(), "ai:gpt-4o");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FindingSource {
    /// Output of a static-analysis tool, e.g. `lint:pylint`.
    Lint(String),
    /// Output of an AI reviewer model, e.g. `ai:gpt-4o`.
    Ai(String),
}

impl FindingSource {
    /// Returns `true` for AI model sources.
    pub fn is_model(&self) -> bool {
        matches!(self, FindingSource::Ai(_))
    }

    /// The tool or model name without the scheme prefix.
    pub fn name(&self) -> &str {
        match self {
            FindingSource::Lint(name) | FindingSource::Ai(name) => name,
        }
    }
}

impl fmt::Display for FindingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FindingSource::Lint(tool) => write!(f, "lint:{tool}"),
            FindingSource::Ai(model) => write!(f, "ai:{model}"),
        }
    }
}

impl FromStr for FindingSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("lint", tool)) if !tool.is_empty() => Ok(FindingSource::Lint(tool.into())),
            Some(("ai", model)) if !model.is_empty() => Ok(FindingSource::Ai(model.into())),
            _ => Err(format!("unknown finding source: {s}")),
        }
    }
}

impl Serialize for FindingSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FindingSource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How a changed file was altered in the pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// New file in the PR.
    Added,
    /// Existing file changed in place.
    Modified,
    /// File deleted by the PR.
    Removed,
    /// File moved or renamed.
    Renamed,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Added => write!(f, "added"),
            FileStatus::Modified => write!(f, "modified"),
            FileStatus::Removed => write!(f, "removed"),
            FileStatus::Renamed => write!(f, "renamed"),
        }
    }
}

/// One file touched by the pull request, with its unified diff.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use synod_core::{ChangedFile, FileStatus};
///
/// let file = ChangedFile {
///     path: PathBuf::from("app/models.py"),
///     status: FileStatus::Modified,
///     patch: Some("@@ -1 +1 @@\n-import os\n+import sys".into()),
/// };
/// assert_eq!(file.status, FileStatus::Modified);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedFile {
    /// Path relative to the repository root.
    pub path: PathBuf,
    /// How the file was altered.
    pub status: FileStatus,
    /// Per-file unified diff text; `None` for binary files.
    pub patch: Option<String>,
}

/// Canonical, immutable description of one pull-request review run.
///
/// Produced by event intake (webhook mode) or the CLI (one-shot mode);
/// exactly one `ReviewRequest` starts exactly one pipeline run.
///
/// # Examples
///
/// ```
/// use synod_core::ReviewRequest;
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
/// assert_eq!(request.repo_slug(), "acme/rocket");
/// assert_eq!(request.pr_key(), "acme/rocket#42");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    /// Repository owner (user or organization).
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Pull request number.
    pub number: u64,
    /// Head commit SHA the review is pinned to.
    pub head_sha: String,
    /// Base branch the PR targets.
    pub base_branch: String,
    /// Head branch ref of the PR.
    pub head_ref: String,
    /// Pull request title.
    pub title: String,
    /// Files changed by the PR, with per-file diffs.
    pub changed_files: Vec<ChangedFile>,
}

impl ReviewRequest {
    /// `owner/repo` slug.
    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Scheduling key identifying the PR: `owner/repo#number`.
    ///
    /// Deduplication and keyed locking operate on this key, never on the
    /// head SHA.
    pub fn pr_key(&self) -> String {
        format!("{}/{}#{}", self.owner, self.repo, self.number)
    }
}

/// A changed file hydrated with its full content at the head commit.
///
/// Assembled once by the orchestrator (GitHub contents API in server mode,
/// local filesystem in one-shot mode) and shared by the analysis, review,
/// and refactoring stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFile {
    /// Path relative to the repository root.
    pub path: PathBuf,
    /// Full file content at the head commit.
    pub content: String,
}

/// A single static-analysis or AI-review observation.
///
/// Findings are append-only within a job and never mutated after creation.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use synod_core::{Finding, FindingSource, Severity};
///
/// let finding = Finding {
///     source: FindingSource::Lint("pylint".into()),
///     file_path: PathBuf::from("app/models.py"),
///     start_line: 3,
///     end_line: 3,
///     severity: Severity::Warning,
///     message: "W0611: Unused import os".into(),
///     fixable: true,
/// };
/// assert!(finding.fixable);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    /// Which tool or model produced the finding.
    pub source: FindingSource,
    /// Path to the affected file.
    pub file_path: PathBuf,
    /// First affected line (1-based).
    pub start_line: u32,
    /// Last affected line (inclusive).
    pub end_line: u32,
    /// Normalized severity.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// Whether the producer believes this is mechanically fixable.
    #[serde(default)]
    pub fixable: bool,
}

/// Overall verdict of a consensus review.
///
/// # Examples
///
/// ```
/// use synod_core::Verdict;
///
/// let v: Verdict = "request_changes".parse().unwrap();
/// assert_eq!(v, Verdict::RequestChanges);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No findings; the change looks good.
    Approve,
    /// At least one high-agreement error-severity finding.
    RequestChanges,
    /// Findings exist but none meet the blocking threshold.
    CommentOnly,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Approve => write!(f, "approve"),
            Verdict::RequestChanges => write!(f, "request_changes"),
            Verdict::CommentOnly => write!(f, "comment_only"),
        }
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approve" => Ok(Verdict::Approve),
            "request_changes" => Ok(Verdict::RequestChanges),
            "comment_only" => Ok(Verdict::CommentOnly),
            other => Err(format!("unknown verdict: {other}")),
        }
    }
}

/// One merged finding in a consensus review.
///
/// Produced by clustering per-model findings; `agreement_count` is the
/// number of distinct AI models in the cluster. Lint sources corroborate
/// a cluster but do not count toward agreement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusFinding {
    /// Path to the affected file.
    pub file_path: PathBuf,
    /// First affected line (1-based).
    pub start_line: u32,
    /// Last affected line (inclusive).
    pub end_line: u32,
    /// Maximum severity among cluster members.
    pub severity: Severity,
    /// Representative message (from the most severe member).
    pub message: String,
    /// Whether any cluster member marked the finding fixable.
    pub fixable: bool,
    /// Number of distinct AI models that raised the finding.
    pub agreement_count: usize,
    /// All sources that contributed to the cluster.
    pub sources: Vec<FindingSource>,
}

/// Merged multi-model review: deduplicated findings plus an overall verdict.
///
/// Created once per job by the reviewer stage and read-only afterward.
/// The verdict is a pure function of the finding set; recomputing from the
/// same findings in any order yields the same result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusReview {
    /// Merged findings, sorted by severity then agreement.
    pub findings: Vec<ConsensusFinding>,
    /// Overall verdict.
    pub verdict: Verdict,
    /// How many models were asked.
    pub models_queried: usize,
    /// How many models returned a usable response.
    pub models_responded: usize,
}

impl ConsensusReview {
    /// Findings eligible for patch generation.
    pub fn fixable_findings(&self) -> impl Iterator<Item = &ConsensusFinding> {
        self.findings.iter().filter(|f| f.fixable)
    }

    /// `true` when nothing in the review can be auto-fixed.
    pub fn no_fixable_findings(&self) -> bool {
        self.fixable_findings().next().is_none()
    }
}

/// Validation state of a candidate patch.
///
/// `Passed` is only ever set together with a [`TestExecution`] record whose
/// exit code is zero; see [`Patch::record_execution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchValidation {
    /// Not yet validated.
    Pending,
    /// Applied cleanly and the test suite passed.
    Passed,
    /// Failed to apply, or the test suite failed.
    Failed,
    /// Validation was not attempted (stage skipped or disabled).
    Skipped,
}

impl fmt::Display for PatchValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchValidation::Pending => write!(f, "pending"),
            PatchValidation::Passed => write!(f, "passed"),
            PatchValidation::Failed => write!(f, "failed"),
            PatchValidation::Skipped => write!(f, "skipped"),
        }
    }
}

/// Record of one sandboxed test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestExecution {
    /// Command that was executed.
    pub command: String,
    /// Process exit code; `None` when the run timed out.
    pub exit_code: Option<i32>,
    /// Whether the wall-clock timeout expired.
    pub timed_out: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Bounded tail of combined stdout/stderr.
    pub output_tail: String,
}

impl TestExecution {
    /// `true` when the run finished with exit code 0 inside the timeout.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// A candidate fix: one unit diff tied to the finding it addresses.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use synod_core::{ConsensusFinding, Patch, PatchValidation, Severity};
///
/// let finding = ConsensusFinding {
///     file_path: PathBuf::from("app/models.py"),
///     start_line: 3,
///     end_line: 3,
///     severity: Severity::Warning,
///     message: "unused import".into(),
///     fixable: true,
///     agreement_count: 2,
///     sources: vec![],
/// };
/// let patch = Patch::new("p1", finding, "diff text", "gpt-4o");
/// assert_eq!(patch.validation, PatchValidation::Pending);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    /// Stable identifier within the job.
    pub id: String,
    /// The consensus finding this patch addresses.
    pub finding: ConsensusFinding,
    /// Unified diff text.
    pub diff: String,
    /// Model that generated the patch.
    pub provenance: String,
    /// Validation outcome.
    pub validation: PatchValidation,
    /// Test run backing the validation outcome, when one happened.
    pub execution: Option<TestExecution>,
}

impl Patch {
    /// Create a pending patch.
    pub fn new(
        id: impl Into<String>,
        finding: ConsensusFinding,
        diff: impl Into<String>,
        provenance: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            finding,
            diff: diff.into(),
            provenance: provenance.into(),
            validation: PatchValidation::Pending,
            execution: None,
        }
    }

    /// Attach a test execution and derive the validation outcome from it.
    ///
    /// `Passed` can only arise here, so a passed patch always carries an
    /// execution record with exit code 0.
    pub fn record_execution(&mut self, execution: TestExecution) {
        self.validation = if execution.succeeded() {
            PatchValidation::Passed
        } else {
            PatchValidation::Failed
        };
        self.execution = Some(execution);
    }

    /// Mark the patch failed without a test run (e.g. it did not apply).
    pub fn mark_apply_failed(&mut self) {
        self.validation = PatchValidation::Failed;
        self.execution = None;
    }
}

/// Terminal artifact of a pipeline run, consumed by the commenter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    /// Final verdict surfaced to the PR.
    pub verdict: Verdict,
    /// Rendered Markdown comment body.
    pub comment_body: String,
    /// Ids of patches that validated `passed`.
    pub applied_patches: Vec<String>,
    /// URL of the fix PR, when one was opened.
    pub fix_pr_url: Option<String>,
    /// `true` when the run surfaced partial (analysis-only) results.
    pub partial: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_and_threshold() {
        assert!(Severity::Error.meets_threshold(Severity::Error));
        assert!(Severity::Error.meets_threshold(Severity::Info));
        assert!(Severity::Warning.meets_threshold(Severity::Info));
        assert!(!Severity::Info.meets_threshold(Severity::Warning));
        assert!(!Severity::Warning.meets_threshold(Severity::Error));
    }

    #[test]
    fn severity_max_prefers_stricter() {
        assert_eq!(Severity::Info.max(Severity::Warning), Severity::Warning);
        assert_eq!(Severity::Warning.max(Severity::Error), Severity::Error);
        assert_eq!(Severity::Error.max(Severity::Info), Severity::Error);
    }

    #[test]
    fn severity_from_str() {
        assert_eq!("error".parse::<Severity>().unwrap(), Severity::Error);
        assert_eq!("Warning".parse::<Severity>().unwrap(), Severity::Warning);
        assert_eq!("INFO".parse::<Severity>().unwrap(), Severity::Info);
        assert!("critical".parse::<Severity>().is_err());
    }

    #[test]
    fn finding_source_roundtrips() {
        let lint: FindingSource = "lint:pylint".parse().unwrap();
        assert_eq!(lint, FindingSource::Lint("pylint".into()));
        assert_eq!(lint.to_string(), "lint:pylint");
        assert!(!lint.is_model());

        let ai: FindingSource = "ai:claude-sonnet-4".parse().unwrap();
        assert!(ai.is_model());
        assert_eq!(ai.name(), "claude-sonnet-4");
    }

    #[test]
    fn finding_source_rejects_garbage() {
        assert!("pylint".parse::<FindingSource>().is_err());
        assert!("lint:".parse::<FindingSource>().is_err());
        assert!("model:gpt".parse::<FindingSource>().is_err());
    }

    #[test]
    fn finding_source_serializes_as_string() {
        let src = FindingSource::Ai("gpt-4o".into());
        let json = serde_json::to_string(&src).unwrap();
        assert_eq!(json, "\"ai:gpt-4o\"");

        let back: FindingSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn verdict_roundtrips() {
        assert_eq!(
            "request_changes".parse::<Verdict>().unwrap(),
            Verdict::RequestChanges
        );
        assert_eq!(Verdict::CommentOnly.to_string(), "comment_only");
        let json = serde_json::to_string(&Verdict::RequestChanges).unwrap();
        assert_eq!(json, "\"request_changes\"");
    }

    #[test]
    fn request_keys() {
        let request = ReviewRequest {
            owner: "acme".into(),
            repo: "rocket".into(),
            number: 7,
            head_sha: "abc123".into(),
            base_branch: "main".into(),
            head_ref: "fix/fuel".into(),
            title: "Fix fuel gauge".into(),
            changed_files: vec![],
        };
        assert_eq!(request.repo_slug(), "acme/rocket");
        assert_eq!(request.pr_key(), "acme/rocket#7");
    }

    #[test]
    fn finding_serializes_camel_case() {
        let finding = Finding {
            source: FindingSource::Lint("eslint".into()),
            file_path: PathBuf::from("src/app.js"),
            start_line: 10,
            end_line: 12,
            severity: Severity::Error,
            message: "no-undef".into(),
            fixable: false,
        };
        let json = serde_json::to_value(&finding).unwrap();
        assert!(json.get("filePath").is_some());
        assert!(json.get("startLine").is_some());
        assert!(json.get("file_path").is_none());
    }

    #[test]
    fn patch_passed_requires_successful_execution() {
        let finding = ConsensusFinding {
            file_path: PathBuf::from("a.py"),
            start_line: 1,
            end_line: 1,
            severity: Severity::Error,
            message: "broken".into(),
            fixable: true,
            agreement_count: 2,
            sources: vec![],
        };
        let mut patch = Patch::new("p1", finding, "diff", "gpt-4o");
        assert_eq!(patch.validation, PatchValidation::Pending);

        patch.record_execution(TestExecution {
            command: "pytest".into(),
            exit_code: Some(1),
            timed_out: false,
            duration_ms: 420,
            output_tail: "1 failed".into(),
        });
        assert_eq!(patch.validation, PatchValidation::Failed);

        patch.record_execution(TestExecution {
            command: "pytest".into(),
            exit_code: Some(0),
            timed_out: false,
            duration_ms: 380,
            output_tail: "3 passed".into(),
        });
        assert_eq!(patch.validation, PatchValidation::Passed);
        assert!(patch.execution.as_ref().unwrap().succeeded());
    }

    #[test]
    fn timed_out_execution_never_passes() {
        let exec = TestExecution {
            command: "pytest".into(),
            exit_code: None,
            timed_out: true,
            duration_ms: 300_000,
            output_tail: String::new(),
        };
        assert!(!exec.succeeded());
    }

    #[test]
    fn apply_failure_clears_execution() {
        let finding = ConsensusFinding {
            file_path: PathBuf::from("a.py"),
            start_line: 1,
            end_line: 1,
            severity: Severity::Warning,
            message: "m".into(),
            fixable: true,
            agreement_count: 1,
            sources: vec![],
        };
        let mut patch = Patch::new("p2", finding, "diff", "gpt-4o");
        patch.mark_apply_failed();
        assert_eq!(patch.validation, PatchValidation::Failed);
        assert!(patch.execution.is_none());
    }

    #[test]
    fn consensus_review_fixable_filter() {
        let review = ConsensusReview {
            findings: vec![
                ConsensusFinding {
                    file_path: PathBuf::from("a.py"),
                    start_line: 1,
                    end_line: 1,
                    severity: Severity::Error,
                    message: "broken".into(),
                    fixable: false,
                    agreement_count: 2,
                    sources: vec![],
                },
                ConsensusFinding {
                    file_path: PathBuf::from("b.py"),
                    start_line: 5,
                    end_line: 5,
                    severity: Severity::Warning,
                    message: "unused import".into(),
                    fixable: true,
                    agreement_count: 1,
                    sources: vec![],
                },
            ],
            verdict: Verdict::CommentOnly,
            models_queried: 2,
            models_responded: 2,
        };
        assert_eq!(review.fixable_findings().count(), 1);
        assert!(!review.no_fixable_findings());
    }
}
