use std::sync::Arc;

use tracing::{debug, warn};

use synod_core::{
    ConsensusFinding, ConsensusReview, ModelsConfig, Patch, RefactorConfig, Severity, SourceFile,
    SynodError,
};
use synod_review::client::{ChatMessage, ModelBackend, ModelClient, Role};

use crate::diff::{apply_file_diff, parse_unified_diff};

const GENERATION_PROMPT: &str = "\
You are a code refactoring assistant. Given a file and one specific issue, \
produce a minimal unified diff that fixes exactly that issue.

Rules:
- Fix only the issue described; leave all other code untouched
- Keep the change as small as possible, close to the flagged lines
- Preserve the original style and formatting
- The patched code must remain syntactically valid
- Use standard unified diff format with `--- a/<path>` and `+++ b/<path>` headers
- Hunk line numbers refer to the original file content given below

Respond with a JSON object:
{
  \"diff\": \"--- a/path\\n+++ b/path\\n@@ ... @@\\n...\"
}

If the issue cannot be fixed safely, return: { \"diff\": \"\" }";

/// Message shapes that experience shows are mechanically fixable even when
/// no model marked the finding as such. Each pattern is an ordered word
/// sequence matched case-insensitively against the message.
const FIXABLE_PATTERNS: &[&[&str]] = &[
    &["missing", "docstring"],
    &["unused", "import"],
    &["unused", "variable"],
    &["trailing", "whitespace"],
    &["line too long"],
    &["missing", "type", "annotation"],
    &["unnecessary", "parentheses"],
    &["unnecessary", "semicolon"],
    &["missing", "final", "newline"],
    &["inconsistent", "indentation"],
    &["use", "instead of"],
    &["simplify", "expression"],
    &["remove", "redundant"],
];

/// `true` when the message matches one of the known fixable shapes.
///
/// # Examples
///
/// ```
/// use synod_patch::generate::is_fixable_message;
///
/// assert!(is_fixable_message("W0611: Unused import os"));
/// assert!(is_fixable_message("Line too long (130 > 100 characters)"));
/// assert!(!is_fixable_message("Null dereference when cache is cold"));
/// ```
pub fn is_fixable_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    FIXABLE_PATTERNS
        .iter()
        .any(|pattern| matches_in_order(&lowered, pattern))
}

fn matches_in_order(message: &str, words: &[&str]) -> bool {
    let mut rest = message;
    for word in words {
        match rest.find(word) {
            Some(idx) => rest = &rest[idx + word.len()..],
            None => return false,
        }
    }
    true
}

/// Pick the findings worth generating patches for, most severe first.
///
/// A finding qualifies when it is explicitly fixable, its message matches a
/// known fixable shape, or at least two models agree on something stronger
/// than informational. The result is capped at `max`.
pub fn select_fixable(review: &ConsensusReview, max: usize) -> Vec<&ConsensusFinding> {
    review
        .findings
        .iter()
        .filter(|f| {
            f.fixable
                || is_fixable_message(&f.message)
                || (f.agreement_count >= 2 && f.severity != Severity::Info)
        })
        .take(max)
        .collect()
}

/// Refactoring stage: asks the generation model for a bounded diff per
/// qualifying finding.
///
/// Individual failures never fail the stage; an empty patch list is a
/// valid outcome. Each invalid diff gets exactly one retry before the
/// finding is dropped.
pub struct RefactorAgent {
    backend: Arc<dyn ModelBackend>,
    max_patches: usize,
}

impl RefactorAgent {
    /// Build the agent from configuration.
    ///
    /// The generation model is `refactor.model` when set, otherwise the
    /// first panel entry.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Config`] when the named model is not in the
    /// panel or the panel is empty, and [`SynodError::Model`] when the
    /// HTTP client cannot be built.
    pub fn from_config(
        refactor: &RefactorConfig,
        models: &ModelsConfig,
    ) -> Result<Self, SynodError> {
        let entry = match &refactor.model {
            Some(name) => models
                .entries
                .iter()
                .find(|e| &e.name == name)
                .ok_or_else(|| {
                    SynodError::Config(format!("refactor model {name:?} is not a panel entry"))
                })?,
            None => models
                .entries
                .first()
                .ok_or_else(|| SynodError::Config("no review models configured".into()))?,
        };
        Ok(Self {
            backend: Arc::new(ModelClient::new(entry)?),
            max_patches: refactor.max_patches,
        })
    }

    /// Build an agent over an arbitrary backend. Used by tests.
    pub fn with_backend(backend: Arc<dyn ModelBackend>, max_patches: usize) -> Self {
        Self {
            backend,
            max_patches,
        }
    }

    /// Generate candidate patches for the review's fixable findings.
    pub async fn run(&self, review: &ConsensusReview, files: &[SourceFile]) -> Vec<Patch> {
        let mut patches = Vec::new();
        for finding in select_fixable(review, self.max_patches) {
            let Some(file) = files.iter().find(|f| f.path == finding.file_path) else {
                debug!(file = %finding.file_path.display(), "no content for finding, skipping");
                continue;
            };
            if let Some(diff) = self.generate_one(finding, file).await {
                patches.push(Patch::new(
                    format!("patch-{}", patches.len() + 1),
                    finding.clone(),
                    diff,
                    self.backend.name(),
                ));
            }
        }
        debug!(count = patches.len(), "patch generation finished");
        patches
    }

    async fn generate_one(&self, finding: &ConsensusFinding, file: &SourceFile) -> Option<String> {
        let messages = vec![
            ChatMessage {
                role: Role::System,
                content: GENERATION_PROMPT.to_string(),
            },
            ChatMessage {
                role: Role::User,
                content: build_patch_prompt(finding, file),
            },
        ];

        for attempt in 1..=2u32 {
            let outcome = tokio::time::timeout(
                self.backend.call_timeout(),
                self.backend.complete(messages.clone()),
            )
            .await;
            let response = match outcome {
                Err(_) => {
                    warn!(model = self.backend.name(), attempt, "patch generation timed out");
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(model = self.backend.name(), attempt, error = %e, "patch generation failed");
                    continue;
                }
                Ok(Ok(response)) => response,
            };

            let Some(diff) = extract_diff(&response) else {
                warn!(attempt, "patch response carried no diff");
                continue;
            };
            match validate_diff(&diff, finding, &file.content) {
                Ok(()) => return Some(diff),
                Err(e) => warn!(attempt, error = %e, "invalid patch discarded"),
            }
        }
        None
    }
}

fn build_patch_prompt(finding: &ConsensusFinding, file: &SourceFile) -> String {
    let lines = if finding.start_line == finding.end_line {
        format!("line {}", finding.start_line)
    } else {
        format!("lines {}-{}", finding.start_line, finding.end_line)
    };
    format!(
        "File: {}\n\nIssue to fix ({lines}): {}\n\nOriginal file content:\n```\n{}\n```",
        file.path.display(),
        finding.message,
        file.content,
    )
}

/// Pull the diff string out of the model's JSON envelope. Returns `None`
/// for unparseable responses or an empty diff.
fn extract_diff(response: &str) -> Option<String> {
    let trimmed = response.trim();
    let cleaned = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    let value: serde_json::Value = serde_json::from_str(cleaned).ok()?;
    let diff = value.get("diff")?.as_str()?.trim();
    if diff.is_empty() {
        None
    } else {
        Some(diff.to_string())
    }
}

/// A candidate diff must parse, touch only the finding's file, and apply
/// cleanly to the current content.
fn validate_diff(
    diff: &str,
    finding: &ConsensusFinding,
    content: &str,
) -> Result<(), SynodError> {
    let files = parse_unified_diff(diff)?;
    if files.is_empty() || files.iter().all(|f| f.hunks.is_empty()) {
        return Err(SynodError::Malformed("diff contains no hunks".into()));
    }
    for file in &files {
        if file.new_path != finding.file_path {
            return Err(SynodError::Malformed(format!(
                "diff touches {} but the finding is in {}",
                file.new_path.display(),
                finding.file_path.display()
            )));
        }
        apply_file_diff(content, file)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use synod_core::{FindingSource, PatchValidation, Verdict};

    fn finding(file: &str, severity: Severity, agreement: usize, message: &str, fixable: bool) -> ConsensusFinding {
        ConsensusFinding {
            file_path: PathBuf::from(file),
            start_line: 2,
            end_line: 2,
            severity,
            message: message.into(),
            fixable,
            agreement_count: agreement,
            sources: vec![FindingSource::Ai("gpt-4o".into())],
        }
    }

    fn review(findings: Vec<ConsensusFinding>) -> ConsensusReview {
        ConsensusReview {
            findings,
            verdict: Verdict::CommentOnly,
            models_queried: 2,
            models_responded: 2,
        }
    }

    #[test]
    fn fixable_message_patterns() {
        assert!(is_fixable_message("W0611: Unused import os"));
        assert!(is_fixable_message("Missing module docstring"));
        assert!(is_fixable_message("line too long (130 > 100)"));
        assert!(is_fixable_message("Use enumerate() instead of manual counter"));
        assert!(!is_fixable_message("SQL injection via string formatting"));
        assert!(!is_fixable_message("import order looks unusual"));
    }

    #[test]
    fn selection_rules() {
        let r = review(vec![
            finding("a.py", Severity::Error, 1, "null deref on cold cache", false),
            finding("b.py", Severity::Warning, 1, "unused import os", false),
            finding("c.py", Severity::Warning, 2, "race condition on shared buffer", false),
            finding("d.py", Severity::Info, 2, "naming could be clearer", false),
            finding("e.py", Severity::Info, 1, "stray note", true),
        ]);
        let selected = select_fixable(&r, 10);
        let paths: Vec<&str> = selected
            .iter()
            .map(|f| f.file_path.to_str().unwrap())
            .collect();
        // a: not fixable by any rule; b: message pattern; c: agreement>=2 and
        // above info; d: agreement>=2 but info; e: explicit flag.
        assert_eq!(paths, vec!["b.py", "c.py", "e.py"]);
    }

    #[test]
    fn selection_respects_cap() {
        let r = review(vec![
            finding("a.py", Severity::Warning, 2, "unused import a", false),
            finding("b.py", Severity::Warning, 2, "unused import b", false),
            finding("c.py", Severity::Warning, 2, "unused import c", false),
        ]);
        assert_eq!(select_fixable(&r, 2).len(), 2);
    }

    #[test]
    fn extract_diff_from_envelope() {
        let diff = extract_diff(r#"{"diff": "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n"}"#);
        assert!(diff.unwrap().starts_with("--- a/x"));

        let fenced = extract_diff("```json\n{\"diff\": \"--- a/x\\n+++ b/x\\n\"}\n```");
        assert!(fenced.is_some());

        assert!(extract_diff(r#"{"diff": ""}"#).is_none());
        assert!(extract_diff("no json here").is_none());
    }

    const FILE_CONTENT: &str = "import os\nimport sys\nprint(sys.argv)\n";

    fn valid_envelope() -> String {
        let diff = "--- a/app.py\n+++ b/app.py\n@@ -1,3 +1,2 @@\n-import os\n import sys\n print(sys.argv)\n";
        serde_json::json!({ "diff": diff }).to_string()
    }

    struct ScriptedBackend {
        responses: Mutex<Vec<Result<String, ()>>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<Result<String, ()>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _messages: Vec<ChatMessage>) -> Result<String, SynodError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(SynodError::Model("script exhausted".into()));
            }
            responses
                .remove(0)
                .map_err(|_| SynodError::Model("scripted failure".into()))
        }
    }

    fn unused_import_review() -> ConsensusReview {
        review(vec![finding(
            "app.py",
            Severity::Warning,
            2,
            "unused import os",
            true,
        )])
    }

    fn source_files() -> Vec<SourceFile> {
        vec![SourceFile {
            path: PathBuf::from("app.py"),
            content: FILE_CONTENT.into(),
        }]
    }

    #[tokio::test]
    async fn generates_pending_patch_from_valid_response() {
        let backend = ScriptedBackend::new(vec![Ok(valid_envelope())]);
        let agent = RefactorAgent::with_backend(backend, 5);
        let patches = agent.run(&unused_import_review(), &source_files()).await;
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].id, "patch-1");
        assert_eq!(patches[0].provenance, "scripted");
        assert_eq!(patches[0].validation, PatchValidation::Pending);
        assert!(patches[0].diff.contains("-import os"));
    }

    #[tokio::test]
    async fn retries_once_after_invalid_diff() {
        let garbage = serde_json::json!({ "diff": "this is not a diff" }).to_string();
        let backend = ScriptedBackend::new(vec![Ok(garbage), Ok(valid_envelope())]);
        let agent = RefactorAgent::with_backend(backend, 5);
        let patches = agent.run(&unused_import_review(), &source_files()).await;
        assert_eq!(patches.len(), 1);
    }

    #[tokio::test]
    async fn drops_finding_after_two_invalid_attempts() {
        let garbage = serde_json::json!({ "diff": "nope" }).to_string();
        let backend = ScriptedBackend::new(vec![Ok(garbage.clone()), Ok(garbage)]);
        let agent = RefactorAgent::with_backend(backend, 5);
        let patches = agent.run(&unused_import_review(), &source_files()).await;
        assert!(patches.is_empty());
    }

    #[tokio::test]
    async fn rejects_diff_touching_another_file() {
        let stray = "--- a/other.py\n+++ b/other.py\n@@ -1 +1 @@\n-x\n+y\n";
        let envelope = serde_json::json!({ "diff": stray }).to_string();
        let backend = ScriptedBackend::new(vec![Ok(envelope.clone()), Ok(envelope)]);
        let agent = RefactorAgent::with_backend(backend, 5);
        let patches = agent.run(&unused_import_review(), &source_files()).await;
        assert!(patches.is_empty());
    }

    #[tokio::test]
    async fn missing_file_content_skips_without_model_call() {
        let backend = ScriptedBackend::new(vec![]);
        let agent = RefactorAgent::with_backend(backend, 5);
        let patches = agent.run(&unused_import_review(), &[]).await;
        assert!(patches.is_empty());
    }

    #[tokio::test]
    async fn model_failure_yields_empty_list_not_error() {
        let backend = ScriptedBackend::new(vec![Err(()), Err(())]);
        let agent = RefactorAgent::with_backend(backend, 5);
        let patches = agent.run(&unused_import_review(), &source_files()).await;
        assert!(patches.is_empty());
    }
}
