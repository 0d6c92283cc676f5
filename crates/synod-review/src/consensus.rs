use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use synod_core::{
    ConsensusFinding, ConsensusReview, Finding, FindingSource, ModelsConfig, ReviewRequest,
    Severity, SourceFile, SynodError, Verdict,
};

use crate::client::{ChatMessage, ModelBackend, ModelClient, Role};
use crate::prompt;

/// Line-range slack when deciding whether two findings describe the same
/// location. Models frequently disagree by a line or two on where an issue
/// starts.
const LINE_SLACK: u32 = 2;

/// Reviewer stage: queries the model panel concurrently and merges the
/// responses into a [`ConsensusReview`].
///
/// A model that times out, errors, or returns unparseable output
/// contributes zero findings and is not counted as a responder. The stage
/// only fails when fewer than `min_responders` models produce a usable
/// response.
pub struct ReviewAgent {
    backends: Vec<Arc<dyn ModelBackend>>,
    config: ModelsConfig,
}

impl ReviewAgent {
    /// Build HTTP-backed clients for every configured panel entry.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Model`] if a client cannot be constructed, or
    /// [`SynodError::Config`] when the panel is empty.
    pub fn from_config(config: &ModelsConfig) -> Result<Self, SynodError> {
        if config.entries.is_empty() {
            return Err(SynodError::Config("no review models configured".into()));
        }
        let mut backends: Vec<Arc<dyn ModelBackend>> = Vec::new();
        for entry in &config.entries {
            backends.push(Arc::new(ModelClient::new(entry)?));
        }
        Ok(Self {
            backends,
            config: config.clone(),
        })
    }

    /// Build an agent over arbitrary backends. Used by tests to substitute
    /// scripted panels.
    pub fn with_backends(backends: Vec<Arc<dyn ModelBackend>>, config: ModelsConfig) -> Self {
        Self { backends, config }
    }

    /// Query every panel model concurrently and merge the responses.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Model`] when fewer than the configured minimum
    /// number of models respond usably; the orchestrator retries that with
    /// backoff before degrading the job.
    pub async fn run(
        &self,
        request: &ReviewRequest,
        files: &[SourceFile],
        lint_findings: &[Finding],
    ) -> Result<ConsensusReview, SynodError> {
        let system = prompt::build_system_prompt();
        let user = prompt::build_review_prompt(request, files, lint_findings);
        let models_queried = self.backends.len();

        let mut tasks = JoinSet::new();
        for backend in &self.backends {
            let backend = Arc::clone(backend);
            let messages = vec![
                ChatMessage {
                    role: Role::System,
                    content: system.clone(),
                },
                ChatMessage {
                    role: Role::User,
                    content: user.clone(),
                },
            ];
            tasks.spawn(async move {
                let name = backend.name().to_string();
                let outcome =
                    tokio::time::timeout(backend.call_timeout(), backend.complete(messages)).await;
                (name, outcome)
            });
        }

        let mut models_responded = 0usize;
        let mut model_findings: Vec<Finding> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (name, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "review task aborted");
                    continue;
                }
            };
            match outcome {
                Err(_) => warn!(model = %name, "model call timed out"),
                Ok(Err(e)) => warn!(model = %name, error = %e, "model call failed"),
                Ok(Ok(response)) => match prompt::parse_model_response(&name, &response) {
                    Ok(findings) => {
                        debug!(model = %name, count = findings.len(), "model responded");
                        models_responded += 1;
                        model_findings.extend(findings);
                    }
                    Err(e) => warn!(model = %name, error = %e, "unusable model response"),
                },
            }
        }

        if models_responded < self.config.min_responders {
            return Err(SynodError::Model(format!(
                "{models_responded} of {models_queried} models responded (minimum {})",
                self.config.min_responders
            )));
        }

        Ok(build_consensus(
            &model_findings,
            lint_findings,
            models_queried,
            models_responded,
            &self.config,
        ))
    }
}

/// Merge per-model findings into a consensus review.
///
/// Findings are clustered by (file, overlapping line range, message
/// similarity); each cluster becomes one [`ConsensusFinding`] whose
/// `agreement_count` is the number of distinct models in it. Static
/// analysis findings attach to matching clusters as corroborating sources
/// but never count toward agreement and never form clusters of their own.
///
/// The result is a pure function of the inputs: any permutation of the
/// same finding sets yields the identical review.
pub fn build_consensus(
    model_findings: &[Finding],
    lint_findings: &[Finding],
    models_queried: usize,
    models_responded: usize,
    config: &ModelsConfig,
) -> ConsensusReview {
    let mut ordered: Vec<&Finding> = model_findings.iter().collect();
    ordered.sort_by(|a, b| canonical_order(a, b));

    let mut clusters: Vec<Cluster> = Vec::new();
    for finding in ordered {
        match clusters
            .iter_mut()
            .find(|c| c.accepts(finding, config.similarity_threshold))
        {
            Some(cluster) => cluster.members.push(finding.clone()),
            None => clusters.push(Cluster::new(finding.clone())),
        }
    }

    let mut lints: Vec<&Finding> = lint_findings.iter().collect();
    lints.sort_by(|a, b| canonical_order(a, b));
    for finding in lints {
        if let Some(cluster) = clusters
            .iter_mut()
            .find(|c| c.accepts(finding, config.similarity_threshold))
        {
            cluster.corroborators.push(finding.clone());
        }
    }

    let mut findings: Vec<ConsensusFinding> =
        clusters.into_iter().map(Cluster::into_finding).collect();

    let verdict = if findings
        .iter()
        .any(|f| f.severity == Severity::Error && f.agreement_count >= config.min_agreement)
    {
        Verdict::RequestChanges
    } else if findings.is_empty() {
        Verdict::Approve
    } else {
        Verdict::CommentOnly
    };

    findings.sort_by(|a, b| {
        severity_rank(a.severity)
            .cmp(&severity_rank(b.severity))
            .then(b.agreement_count.cmp(&a.agreement_count))
            .then_with(|| a.file_path.cmp(&b.file_path))
            .then(a.start_line.cmp(&b.start_line))
    });
    findings.truncate(config.max_findings);

    ConsensusReview {
        findings,
        verdict,
        models_queried,
        models_responded,
    }
}

/// One group of findings judged to describe the same issue.
///
/// `members` is never empty; the first member is the anchor every join
/// candidate is compared against.
struct Cluster {
    members: Vec<Finding>,
    corroborators: Vec<Finding>,
}

impl Cluster {
    fn new(anchor: Finding) -> Self {
        Self {
            members: vec![anchor],
            corroborators: Vec::new(),
        }
    }

    fn accepts(&self, finding: &Finding, threshold: f64) -> bool {
        let anchor = &self.members[0];
        anchor.file_path == finding.file_path
            && ranges_overlap(
                anchor.start_line,
                anchor.end_line,
                finding.start_line,
                finding.end_line,
            )
            && message_similarity(&anchor.message, &finding.message) >= threshold
    }

    fn into_finding(self) -> ConsensusFinding {
        let mut severity = self.members[0].severity;
        let mut start_line = self.members[0].start_line;
        let mut end_line = self.members[0].end_line;
        for member in &self.members[1..] {
            severity = severity.max(member.severity);
            start_line = start_line.min(member.start_line);
            end_line = end_line.max(member.end_line);
        }
        for corroborator in &self.corroborators {
            severity = severity.max(corroborator.severity);
        }

        // Representative message: first member at the strictest severity.
        let mut representative = &self.members[0];
        for member in &self.members[1..] {
            if severity_rank(member.severity) < severity_rank(representative.severity) {
                representative = member;
            }
        }

        let models: BTreeSet<&str> = self
            .members
            .iter()
            .filter(|m| m.source.is_model())
            .map(|m| m.source.name())
            .collect();
        let agreement_count = models.len();

        let fixable = self
            .members
            .iter()
            .chain(&self.corroborators)
            .any(|f| f.fixable);

        let mut sources: Vec<FindingSource> = self
            .members
            .iter()
            .chain(&self.corroborators)
            .map(|f| f.source.clone())
            .collect();
        sources.sort_by_key(|s| s.to_string());
        sources.dedup();

        ConsensusFinding {
            file_path: representative.file_path.clone(),
            start_line,
            end_line,
            severity,
            message: representative.message.clone(),
            fixable,
            agreement_count,
            sources,
        }
    }
}

fn canonical_order(a: &Finding, b: &Finding) -> Ordering {
    a.file_path
        .cmp(&b.file_path)
        .then(a.start_line.cmp(&b.start_line))
        .then(a.end_line.cmp(&b.end_line))
        .then(severity_rank(a.severity).cmp(&severity_rank(b.severity)))
        .then_with(|| a.message.cmp(&b.message))
        .then_with(|| a.source.to_string().cmp(&b.source.to_string()))
}

fn severity_rank(s: Severity) -> u8 {
    match s {
        Severity::Error => 0,
        Severity::Warning => 1,
        Severity::Info => 2,
    }
}

/// `true` when the two line ranges touch after widening each by
/// [`LINE_SLACK`] lines.
pub fn ranges_overlap(a_start: u32, a_end: u32, b_start: u32, b_end: u32) -> bool {
    a_start.saturating_sub(LINE_SLACK) <= b_end.saturating_add(LINE_SLACK)
        && b_start.saturating_sub(LINE_SLACK) <= a_end.saturating_add(LINE_SLACK)
}

/// Token-level Jaccard similarity between two finding messages, in
/// `0.0..=1.0`. Case-insensitive; punctuation is ignored.
///
/// # Examples
///
/// ```
/// use synod_review::consensus::message_similarity;
///
/// let s = message_similarity("Unused import os", "unused import: os");
/// assert!(s > 0.9);
/// assert_eq!(message_similarity("unused import", "missing docstring"), 0.0);
/// ```
pub fn message_similarity(a: &str, b: &str) -> f64 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

fn tokenize(s: &str) -> BTreeSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use async_trait::async_trait;
    use synod_core::ChangedFile;
    use synod_core::FileStatus;

    fn model_finding(
        model: &str,
        file: &str,
        line: u32,
        severity: Severity,
        message: &str,
    ) -> Finding {
        Finding {
            source: FindingSource::Ai(model.into()),
            file_path: PathBuf::from(file),
            start_line: line,
            end_line: line,
            severity,
            message: message.into(),
            fixable: false,
        }
    }

    fn lint_finding(tool: &str, file: &str, line: u32, severity: Severity, message: &str) -> Finding {
        Finding {
            source: FindingSource::Lint(tool.into()),
            file_path: PathBuf::from(file),
            start_line: line,
            end_line: line,
            severity,
            message: message.into(),
            fixable: false,
        }
    }

    fn config() -> ModelsConfig {
        ModelsConfig::default()
    }

    #[test]
    fn two_models_same_issue_cluster_together() {
        let findings = vec![
            model_finding("gpt-4o", "app/engine.py", 3, Severity::Warning, "Unused import os"),
            model_finding("claude", "app/engine.py", 3, Severity::Warning, "Unused import os"),
        ];
        let review = build_consensus(&findings, &[], 2, 2, &config());
        assert_eq!(review.findings.len(), 1);
        assert_eq!(review.findings[0].agreement_count, 2);
        assert_eq!(review.findings[0].severity, Severity::Warning);
    }

    #[test]
    fn lint_corroborates_without_counting_as_agreement() {
        let models = vec![
            model_finding("gpt-4o", "app/engine.py", 3, Severity::Warning, "Unused import os"),
            model_finding("claude", "app/engine.py", 3, Severity::Warning, "Unused import os"),
        ];
        let lints = vec![lint_finding(
            "pylint",
            "app/engine.py",
            3,
            Severity::Warning,
            "W0611: Unused import os",
        )];
        let review = build_consensus(&models, &lints, 2, 2, &config());
        assert_eq!(review.findings.len(), 1);
        let finding = &review.findings[0];
        assert_eq!(finding.agreement_count, 2);
        assert!(finding
            .sources
            .contains(&FindingSource::Lint("pylint".into())));
        assert_eq!(review.verdict, Verdict::CommentOnly);
    }

    #[test]
    fn lint_never_forms_its_own_cluster() {
        let lints = vec![lint_finding(
            "pylint",
            "app/engine.py",
            3,
            Severity::Warning,
            "W0611: Unused import os",
        )];
        let review = build_consensus(&[], &lints, 2, 2, &config());
        assert!(review.findings.is_empty());
        assert_eq!(review.verdict, Verdict::Approve);
    }

    #[test]
    fn agreed_error_requests_changes() {
        let findings = vec![
            model_finding("gpt-4o", "app/db.py", 10, Severity::Error, "SQL injection in query"),
            model_finding("claude", "app/db.py", 11, Severity::Error, "SQL injection in query"),
        ];
        let review = build_consensus(&findings, &[], 2, 2, &config());
        assert_eq!(review.verdict, Verdict::RequestChanges);
    }

    #[test]
    fn lone_error_below_agreement_bar_is_comment_only() {
        let findings = vec![model_finding(
            "gpt-4o",
            "app/db.py",
            10,
            Severity::Error,
            "SQL injection in query",
        )];
        let review = build_consensus(&findings, &[], 2, 1, &config());
        assert_eq!(review.findings[0].agreement_count, 1);
        assert_eq!(review.verdict, Verdict::CommentOnly);
    }

    #[test]
    fn no_findings_approves() {
        let review = build_consensus(&[], &[], 3, 3, &config());
        assert_eq!(review.verdict, Verdict::Approve);
        assert!(review.findings.is_empty());
    }

    #[test]
    fn dissimilar_messages_stay_separate() {
        let findings = vec![
            model_finding("gpt-4o", "app/engine.py", 3, Severity::Warning, "Unused import os"),
            model_finding("claude", "app/engine.py", 4, Severity::Warning, "Missing docstring here"),
        ];
        let review = build_consensus(&findings, &[], 2, 2, &config());
        assert_eq!(review.findings.len(), 2);
        assert_eq!(review.findings[0].agreement_count, 1);
    }

    #[test]
    fn nearby_lines_cluster_distant_lines_do_not() {
        let near = vec![
            model_finding("gpt-4o", "a.py", 10, Severity::Info, "shadowed variable name"),
            model_finding("claude", "a.py", 12, Severity::Info, "shadowed variable name"),
        ];
        assert_eq!(build_consensus(&near, &[], 2, 2, &config()).findings.len(), 1);

        let far = vec![
            model_finding("gpt-4o", "a.py", 10, Severity::Info, "shadowed variable name"),
            model_finding("claude", "a.py", 40, Severity::Info, "shadowed variable name"),
        ];
        assert_eq!(build_consensus(&far, &[], 2, 2, &config()).findings.len(), 2);
    }

    #[test]
    fn cluster_takes_max_severity_and_merged_range() {
        let findings = vec![
            model_finding("gpt-4o", "a.py", 10, Severity::Info, "possible race in cache update"),
            Finding {
                end_line: 12,
                ..model_finding("claude", "a.py", 9, Severity::Error, "possible race in cache update")
            },
        ];
        let review = build_consensus(&findings, &[], 2, 2, &config());
        let finding = &review.findings[0];
        assert_eq!(finding.severity, Severity::Error);
        assert_eq!(finding.start_line, 9);
        assert_eq!(finding.end_line, 12);
    }

    #[test]
    fn lint_corroborator_can_raise_severity() {
        let models = vec![model_finding(
            "gpt-4o",
            "a.py",
            5,
            Severity::Info,
            "undefined variable foo",
        )];
        let lints = vec![lint_finding(
            "pylint",
            "a.py",
            5,
            Severity::Error,
            "E0602: undefined variable foo",
        )];
        let review = build_consensus(&models, &lints, 2, 2, &config());
        let finding = &review.findings[0];
        assert_eq!(finding.severity, Severity::Error);
        // Still one model: the lint source must not push this over the bar.
        assert_eq!(finding.agreement_count, 1);
        assert_eq!(review.verdict, Verdict::CommentOnly);
    }

    #[test]
    fn verdict_and_counts_are_order_independent() {
        let findings = vec![
            model_finding("gpt-4o", "a.py", 3, Severity::Warning, "unused import os"),
            model_finding("claude", "a.py", 3, Severity::Warning, "unused import os"),
            model_finding("gpt-4o", "b.py", 20, Severity::Error, "sql injection in query"),
            model_finding("claude", "b.py", 21, Severity::Error, "sql injection in query"),
            model_finding("gpt-4o", "c.py", 7, Severity::Info, "shadowed variable"),
        ];
        let lints = vec![lint_finding("pylint", "a.py", 3, Severity::Warning, "W0611: unused import os")];

        let forward = build_consensus(&findings, &lints, 2, 2, &config());

        let mut reversed = findings.clone();
        reversed.reverse();
        let backward = build_consensus(&reversed, &lints, 2, 2, &config());

        assert_eq!(
            serde_json::to_value(&forward).unwrap(),
            serde_json::to_value(&backward).unwrap()
        );
    }

    #[test]
    fn findings_sorted_by_severity_then_agreement_and_capped() {
        let findings = vec![
            model_finding("gpt-4o", "a.py", 1, Severity::Info, "shadowed variable"),
            model_finding("gpt-4o", "b.py", 2, Severity::Warning, "unclosed file handle"),
            model_finding("claude", "b.py", 2, Severity::Warning, "unclosed file handle"),
            model_finding("gpt-4o", "c.py", 3, Severity::Error, "null deref on miss"),
        ];
        let review = build_consensus(&findings, &[], 2, 2, &config());
        assert_eq!(review.findings[0].severity, Severity::Error);
        assert_eq!(review.findings[1].severity, Severity::Warning);
        assert_eq!(review.findings[1].agreement_count, 2);

        let capped = ModelsConfig {
            max_findings: 2,
            ..config()
        };
        let review = build_consensus(&findings, &[], 2, 2, &capped);
        assert_eq!(review.findings.len(), 2);
        assert_eq!(review.findings[0].severity, Severity::Error);
    }

    #[test]
    fn overlap_respects_slack() {
        assert!(ranges_overlap(10, 10, 12, 12));
        assert!(ranges_overlap(10, 10, 14, 14));
        assert!(!ranges_overlap(10, 10, 15, 15));
        assert!(ranges_overlap(5, 20, 1, 4));
    }

    #[test]
    fn similarity_basics() {
        assert_eq!(message_similarity("unused import os", "Unused import: os"), 1.0);
        assert_eq!(message_similarity("", ""), 1.0);
        assert_eq!(message_similarity("something", ""), 0.0);
        let partial = message_similarity("unused import os", "unused variable os");
        assert!(partial > 0.4 && partial < 0.6);
    }

    struct StubBackend {
        name: String,
        response: Option<String>,
    }

    #[async_trait]
    impl ModelBackend for StubBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(&self, _messages: Vec<ChatMessage>) -> Result<String, SynodError> {
            match &self.response {
                Some(body) => Ok(body.clone()),
                None => Err(SynodError::Model(format!("{} unavailable", self.name))),
            }
        }
    }

    fn stub(name: &str, response: Option<&str>) -> Arc<dyn ModelBackend> {
        Arc::new(StubBackend {
            name: name.into(),
            response: response.map(String::from),
        })
    }

    fn request() -> ReviewRequest {
        ReviewRequest {
            owner: "acme".into(),
            repo: "rocket".into(),
            number: 7,
            head_sha: "abc123".into(),
            base_branch: "main".into(),
            head_ref: "feature/fuel".into(),
            title: "Tune fuel mixture".into(),
            changed_files: vec![ChangedFile {
                path: PathBuf::from("app/engine.py"),
                status: FileStatus::Modified,
                patch: None,
            }],
        }
    }

    const FLAG_LINE_3: &str = r#"{"findings":[
        {"file":"app/engine.py","startLine":3,"severity":"warning","message":"Unused import os"}
    ]}"#;

    #[tokio::test]
    async fn panel_agreement_flows_into_review() {
        let agent = ReviewAgent::with_backends(
            vec![stub("gpt-4o", Some(FLAG_LINE_3)), stub("claude", Some(FLAG_LINE_3))],
            config(),
        );
        let review = agent.run(&request(), &[], &[]).await.unwrap();
        assert_eq!(review.models_queried, 2);
        assert_eq!(review.models_responded, 2);
        assert_eq!(review.findings.len(), 1);
        assert_eq!(review.findings[0].agreement_count, 2);
    }

    #[tokio::test]
    async fn failed_model_contributes_nothing() {
        let agent = ReviewAgent::with_backends(
            vec![stub("gpt-4o", Some(FLAG_LINE_3)), stub("claude", None)],
            config(),
        );
        let review = agent.run(&request(), &[], &[]).await.unwrap();
        assert_eq!(review.models_queried, 2);
        assert_eq!(review.models_responded, 1);
        assert_eq!(review.findings[0].agreement_count, 1);
    }

    #[tokio::test]
    async fn zero_responders_fails_the_stage() {
        let agent = ReviewAgent::with_backends(
            vec![stub("gpt-4o", None), stub("claude", None)],
            config(),
        );
        let result = agent.run(&request(), &[], &[]).await;
        assert!(matches!(result, Err(SynodError::Model(_))));
    }

    #[tokio::test]
    async fn garbage_response_is_not_a_responder() {
        let agent = ReviewAgent::with_backends(
            vec![stub("gpt-4o", Some("I love this PR, ship it"))],
            config(),
        );
        let result = agent.run(&request(), &[], &[]).await;
        assert!(result.is_err());
    }

    #[test]
    fn empty_panel_is_a_config_error() {
        let empty = ModelsConfig {
            entries: Vec::new(),
            ..config()
        };
        let result = ReviewAgent::from_config(&empty);
        assert!(matches!(result, Err(SynodError::Config(_))));
    }
}
