use std::fmt::Write as _;
use std::path::PathBuf;

use synod_core::{Finding, FindingSource, ReviewRequest, Severity, SourceFile, SynodError};

const SYSTEM_PROMPT: &str = "\
You are Synod, one reviewer on a panel of independent AI code reviewers. \
Your job is to find genuine bugs, security issues, and significant problems \
in pull request changes.

Rules:
- Only report issues you are confident about
- Reference line numbers in the new version of each file
- Do not speculate about code behavior you cannot verify
- Do not report style or formatting issues unless they create a bug
- Mark a finding fixable only when a small, mechanical patch would resolve it
- Focus on: bugs, security vulnerabilities, logic errors, race conditions, resource leaks

Respond with a JSON object:
{
  \"findings\": [
    {
      \"file\": \"path/to/file.py\",
      \"startLine\": 42,
      \"endLine\": 45,
      \"severity\": \"error\" | \"warning\" | \"info\",
      \"message\": \"Clear explanation of the issue\",
      \"fixable\": false
    }
  ]
}

If you find no issues, return: { \"findings\": [] }";

/// Maximum static-analysis findings echoed into the model context.
const MAX_CONTEXT_FINDINGS: usize = 10;

/// Maximum lines of file content included per changed file.
const MAX_EXCERPT_LINES: usize = 150;

/// Build the system prompt shared by every panel model.
///
/// # Examples
///
/// ```
/// use synod_review::prompt::build_system_prompt;
///
/// let prompt = build_system_prompt();
/// assert!(prompt.contains("Synod"));
/// assert!(prompt.contains("findings"));
/// ```
pub fn build_system_prompt() -> String {
    SYSTEM_PROMPT.to_string()
}

/// Build the user prompt: PR metadata, per-file diffs, static-analysis
/// findings, and truncated file contents.
pub fn build_review_prompt(
    request: &ReviewRequest,
    files: &[SourceFile],
    lint_findings: &[Finding],
) -> String {
    let mut prompt = format!(
        "Pull Request: {}\nRepository: {}\nBase: {} <- {}\n\nFiles changed:\n",
        request.title,
        request.pr_key(),
        request.base_branch,
        request.head_ref,
    );

    for file in &request.changed_files {
        let _ = writeln!(prompt, "\n{} ({})", file.path.display(), file.status);
        if let Some(patch) = &file.patch {
            let _ = writeln!(prompt, "```diff\n{patch}\n```");
        }
    }

    if !lint_findings.is_empty() {
        prompt.push_str("\nStatic analysis findings:\n");
        for finding in lint_findings.iter().take(MAX_CONTEXT_FINDINGS) {
            let _ = writeln!(
                prompt,
                "- {}:{} [{}] {}",
                finding.file_path.display(),
                finding.start_line,
                finding.severity,
                finding.message,
            );
        }
        if lint_findings.len() > MAX_CONTEXT_FINDINGS {
            let _ = writeln!(
                prompt,
                "- and {} more",
                lint_findings.len() - MAX_CONTEXT_FINDINGS
            );
        }
    }

    if !files.is_empty() {
        prompt.push_str("\nFile contents at the head commit:\n");
        for file in files {
            let _ = writeln!(prompt, "\n### {}", file.path.display());
            let _ = writeln!(prompt, "```\n{}\n```", excerpt(&file.content));
        }
    }

    prompt
}

fn excerpt(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() <= MAX_EXCERPT_LINES {
        return content.trim_end().to_string();
    }
    let mut out = lines[..MAX_EXCERPT_LINES].join("\n");
    let _ = write!(out, "\n... ({} more lines)", lines.len() - MAX_EXCERPT_LINES);
    out
}

#[derive(serde::Deserialize)]
struct ModelResponse {
    findings: Vec<ModelFinding>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelFinding {
    file: String,
    start_line: Option<serde_json::Value>,
    end_line: Option<serde_json::Value>,
    severity: String,
    message: String,
    fixable: Option<bool>,
}

/// Parse one model's JSON response into validated [`Finding`]s attributed
/// to `ai:<model>`.
///
/// Handles markdown code fences around the JSON. Entries with a missing or
/// zero line, an unknown severity, or an empty file/message are skipped;
/// `endLine` is clamped to at least `startLine`.
///
/// # Errors
///
/// Returns [`SynodError::Malformed`] when the response is not parseable
/// JSON at all. The caller treats that model as a non-responder; it never
/// fails the review stage by itself.
///
/// # Examples
///
/// ```
/// use synod_review::prompt::parse_model_response;
///
/// let json = r#"{"findings":[]}"#;
/// let findings = parse_model_response("gpt-4o", json).unwrap();
/// assert!(findings.is_empty());
/// ```
pub fn parse_model_response(model: &str, response: &str) -> Result<Vec<Finding>, SynodError> {
    let cleaned = strip_code_fences(response);

    let parsed: ModelResponse = serde_json::from_str(cleaned)
        .map_err(|e| SynodError::Malformed(format!("{model}: unparseable review response: {e}")))?;

    let mut findings = Vec::new();
    for entry in parsed.findings {
        if entry.file.is_empty() || entry.message.is_empty() {
            continue;
        }

        let start_line = match line_number(&entry.start_line) {
            Some(l) => l,
            None => continue,
        };
        let end_line = line_number(&entry.end_line)
            .unwrap_or(start_line)
            .max(start_line);

        let severity = match normalize_severity(&entry.severity) {
            Some(s) => s,
            None => continue,
        };

        findings.push(Finding {
            source: FindingSource::Ai(model.to_string()),
            file_path: PathBuf::from(&entry.file),
            start_line,
            end_line,
            severity,
            message: entry.message,
            fixable: entry.fixable.unwrap_or(false),
        });
    }

    Ok(findings)
}

fn line_number(value: &Option<serde_json::Value>) -> Option<u32> {
    match value {
        Some(serde_json::Value::Number(n)) => {
            let l = n.as_u64()?;
            if l == 0 || l > u64::from(u32::MAX) {
                None
            } else {
                Some(l as u32)
            }
        }
        _ => None,
    }
}

/// Models drift toward a high/medium/low scale no matter what the contract
/// says, so both spellings are accepted.
fn normalize_severity(s: &str) -> Option<Severity> {
    match s.to_lowercase().as_str() {
        "error" | "high" | "critical" => Some(Severity::Error),
        "warning" | "medium" => Some(Severity::Warning),
        "info" | "low" => Some(Severity::Info),
        _ => None,
    }
}

fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        if let Some(inner) = rest.strip_suffix("```") {
            return inner.trim();
        }
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(inner) = rest.strip_suffix("```") {
            return inner.trim();
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use synod_core::{ChangedFile, FileStatus};

    fn make_request() -> ReviewRequest {
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
                patch: Some("@@ -1 +1 @@\n-ratio = 2\n+ratio = 3".into()),
            }],
        }
    }

    fn lint_finding(line: u32, message: &str) -> Finding {
        Finding {
            source: FindingSource::Lint("pylint".into()),
            file_path: PathBuf::from("app/engine.py"),
            start_line: line,
            end_line: line,
            severity: Severity::Warning,
            message: message.into(),
            fixable: false,
        }
    }

    #[test]
    fn system_prompt_contains_contract() {
        let prompt = build_system_prompt();
        assert!(prompt.contains("startLine"));
        assert!(prompt.contains("fixable"));
        assert!(prompt.contains("\"findings\": []"));
    }

    #[test]
    fn review_prompt_includes_metadata_and_diff() {
        let prompt = build_review_prompt(&make_request(), &[], &[]);
        assert!(prompt.contains("Tune fuel mixture"));
        assert!(prompt.contains("acme/rocket#7"));
        assert!(prompt.contains("app/engine.py (modified)"));
        assert!(prompt.contains("+ratio = 3"));
    }

    #[test]
    fn review_prompt_caps_lint_findings() {
        let findings: Vec<Finding> = (1..=14)
            .map(|i| lint_finding(i, &format!("issue {i}")))
            .collect();
        let prompt = build_review_prompt(&make_request(), &[], &findings);
        assert!(prompt.contains("issue 10"));
        assert!(!prompt.contains("issue 11"));
        assert!(prompt.contains("and 4 more"));
    }

    #[test]
    fn review_prompt_truncates_long_files() {
        let content: String = (1..=400).map(|i| format!("line {i}\n")).collect();
        let files = vec![SourceFile {
            path: PathBuf::from("app/engine.py"),
            content,
        }];
        let prompt = build_review_prompt(&make_request(), &files, &[]);
        assert!(prompt.contains("line 150"));
        assert!(!prompt.contains("line 151\n"));
        assert!(prompt.contains("(250 more lines)"));
    }

    #[test]
    fn parse_valid_response() {
        let json = r#"{
            "findings": [
                {
                    "file": "app/engine.py",
                    "startLine": 3,
                    "endLine": 5,
                    "severity": "error",
                    "message": "Division by zero when ratio is 0",
                    "fixable": true
                },
                {
                    "file": "app/pump.py",
                    "startLine": 10,
                    "severity": "warning",
                    "message": "Unclosed file handle"
                }
            ]
        }"#;
        let findings = parse_model_response("gpt-4o", json).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Error);
        assert_eq!(findings[0].start_line, 3);
        assert_eq!(findings[0].end_line, 5);
        assert!(findings[0].fixable);
        assert_eq!(findings[0].source, FindingSource::Ai("gpt-4o".into()));
        assert_eq!(findings[1].end_line, 10);
        assert!(!findings[1].fixable);
    }

    #[test]
    fn parse_with_code_fences() {
        let fenced = "```json\n{\"findings\":[]}\n```";
        let findings = parse_model_response("gpt-4o", fenced).unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn parse_garbage_is_malformed() {
        let result = parse_model_response("gpt-4o", "I love this PR!");
        assert!(matches!(result, Err(SynodError::Malformed(_))));
    }

    #[test]
    fn parse_skips_invalid_entries() {
        let json = r#"{
            "findings": [
                {"file": "a.py", "startLine": 0, "severity": "error", "message": "zero line"},
                {"file": "b.py", "startLine": 5, "severity": "nitpick", "message": "odd severity"},
                {"file": "", "startLine": 5, "severity": "error", "message": "no file"},
                {"file": "c.py", "startLine": 9, "severity": "error", "message": "kept"}
            ]
        }"#;
        let findings = parse_model_response("gpt-4o", json).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].file_path, PathBuf::from("c.py"));
    }

    #[test]
    fn parse_accepts_high_medium_low() {
        let json = r#"{
            "findings": [
                {"file": "a.py", "startLine": 1, "severity": "high", "message": "x"},
                {"file": "a.py", "startLine": 2, "severity": "medium", "message": "y"},
                {"file": "a.py", "startLine": 3, "severity": "low", "message": "z"}
            ]
        }"#;
        let findings = parse_model_response("m", json).unwrap();
        assert_eq!(findings[0].severity, Severity::Error);
        assert_eq!(findings[1].severity, Severity::Warning);
        assert_eq!(findings[2].severity, Severity::Info);
    }

    #[test]
    fn parse_clamps_reversed_range() {
        let json = r#"{
            "findings": [
                {"file": "a.py", "startLine": 8, "endLine": 3, "severity": "info", "message": "x"}
            ]
        }"#;
        let findings = parse_model_response("m", json).unwrap();
        assert_eq!(findings[0].start_line, 8);
        assert_eq!(findings[0].end_line, 8);
    }
}
