//! Parsers for native linter output formats.
//!
//! Each parser turns one tool's raw output into canonical [`Finding`]s with
//! severity normalized through a per-tool mapping table. Parsers are lenient
//! line by line (unrecognized lines are skipped) but report a wholly
//! unusable payload via [`SynodError::Malformed`] so the caller can emit a
//! synthetic finding instead of aborting the stage.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use synod_core::{Finding, FindingSource, Severity, SynodError};

/// Parse pylint text output in `path:line:column: CODE: message` form.
///
/// Severity map: `E`/`F` codes are errors, `W` codes are warnings,
/// everything else (`C`, `R`, `I`) is info. Lines that do not match the
/// format are skipped; an output with no parseable line and no success
/// marker is malformed.
///
/// # Errors
///
/// Returns [`SynodError::Malformed`] when non-empty output contains no
/// recognizable diagnostic line.
pub fn parse_pylint(output: &str, root: &Path) -> Result<Vec<Finding>, SynodError> {
    let mut findings = Vec::new();
    let mut saw_line = false;

    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        saw_line = true;
        if let Some(finding) = parse_pylint_line(line, root) {
            findings.push(finding);
        }
    }

    if findings.is_empty() && saw_line && !looks_like_clean_pylint(output) {
        return Err(SynodError::Malformed(format!(
            "pylint output had no parseable diagnostics: {}",
            truncate(output, 200)
        )));
    }

    Ok(findings)
}

fn parse_pylint_line(line: &str, root: &Path) -> Option<Finding> {
    let mut parts = line.splitn(4, ':');
    let path = parts.next()?.trim();
    let line_num: u32 = parts.next()?.trim().parse().ok()?;
    let _column: u32 = parts.next()?.trim().parse().ok()?;
    let rest = parts.next()?.trim_start();

    let (code, message) = rest.split_once(':')?;
    let code = code.trim();
    if !is_pylint_code(code) {
        return None;
    }
    let message = message.trim();
    if message.is_empty() {
        return None;
    }

    let severity = match code.as_bytes()[0] {
        b'E' | b'F' => Severity::Error,
        b'W' => Severity::Warning,
        _ => Severity::Info,
    };

    Some(Finding {
        source: FindingSource::Lint("pylint".into()),
        file_path: relativize(path, root),
        start_line: line_num,
        end_line: line_num,
        severity,
        message: format!("{code}: {message}"),
        fixable: false,
    })
}

fn is_pylint_code(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() >= 2
        && bytes[0].is_ascii_uppercase()
        && bytes[1..].iter().all(|b| b.is_ascii_digit())
}

fn looks_like_clean_pylint(output: &str) -> bool {
    // A clean run still prints the module header and a 10/10 score line.
    output.contains("Your code has been rated") || output.contains("*****")
}

#[derive(Debug, Deserialize)]
struct EslintFile {
    #[serde(rename = "filePath", default)]
    file_path: String,
    #[serde(default)]
    messages: Vec<EslintMessage>,
}

#[derive(Debug, Deserialize)]
struct EslintMessage {
    #[serde(default)]
    line: u32,
    #[serde(rename = "endLine")]
    end_line: Option<u32>,
    #[serde(default)]
    severity: u8,
    #[serde(rename = "ruleId")]
    rule_id: Option<String>,
    #[serde(default)]
    message: String,
}

/// Parse eslint `--format=json` output.
///
/// Severity map: 2 is an error, 1 a warning, anything else info.
///
/// # Errors
///
/// Returns [`SynodError::Malformed`] when the payload is not a JSON array
/// of file results.
pub fn parse_eslint(output: &str, root: &Path) -> Result<Vec<Finding>, SynodError> {
    let files: Vec<EslintFile> = serde_json::from_str(output.trim()).map_err(|e| {
        SynodError::Malformed(format!(
            "eslint output was not valid JSON: {e} ({})",
            truncate(output, 200)
        ))
    })?;

    let mut findings = Vec::new();
    for file in files {
        for msg in file.messages {
            if msg.message.is_empty() {
                continue;
            }
            let severity = match msg.severity {
                2 => Severity::Error,
                1 => Severity::Warning,
                _ => Severity::Info,
            };
            let start_line = msg.line.max(1);
            let message = match &msg.rule_id {
                Some(rule) if !rule.is_empty() => format!("{rule}: {}", msg.message),
                _ => msg.message.clone(),
            };
            findings.push(Finding {
                source: FindingSource::Lint("eslint".into()),
                file_path: relativize(&file.file_path, root),
                start_line,
                end_line: msg.end_line.unwrap_or(start_line).max(start_line),
                severity,
                message,
                fixable: false,
            });
        }
    }

    Ok(findings)
}

/// Synthetic finding emitted when a tool's output could not be used.
///
/// Analysis never aborts the pipeline on one tool's bad output; the parse
/// failure itself becomes a warning-severity finding attributed to the
/// tool. Lines are 1-based everywhere, so the placeholder range is line 1
/// and the path names the tool rather than a source file.
pub fn synthetic_failure_finding(tool: &str, detail: &str) -> Finding {
    Finding {
        source: FindingSource::Lint(tool.into()),
        file_path: PathBuf::from(tool),
        start_line: 1,
        end_line: 1,
        severity: Severity::Warning,
        message: format!("{tool} output could not be used: {detail}"),
        fixable: false,
    }
}

/// Map a tool-reported path (often under a scratch directory) back to the
/// repository-relative path.
fn relativize(reported: &str, root: &Path) -> PathBuf {
    let path = Path::new(reported);
    match path.strip_prefix(root) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => path.to_path_buf(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pylint_basic_diagnostics() {
        let output = "\
app/models.py:3:0: W0611: Unused import os
app/models.py:10:4: E1101: Instance of 'User' has no 'emali' member
app/util.py:1:0: C0114: Missing module docstring
";
        let findings = parse_pylint(output, Path::new("/tmp/scratch")).unwrap();
        assert_eq!(findings.len(), 3);

        assert_eq!(findings[0].severity, Severity::Warning);
        assert_eq!(findings[0].message, "W0611: Unused import os");
        assert_eq!(findings[0].start_line, 3);
        assert_eq!(findings[0].source, FindingSource::Lint("pylint".into()));

        assert_eq!(findings[1].severity, Severity::Error);
        assert_eq!(findings[2].severity, Severity::Info);
    }

    #[test]
    fn parse_pylint_relativizes_scratch_paths() {
        let output = "/scratch/x1/app/models.py:3:0: W0611: Unused import os";
        let findings = parse_pylint(output, Path::new("/scratch/x1")).unwrap();
        assert_eq!(findings[0].file_path, PathBuf::from("app/models.py"));
    }

    #[test]
    fn parse_pylint_skips_noise_lines() {
        let output = "\
************* Module app.models
app/models.py:3:0: W0611: Unused import os

-----------------------------------
Your code has been rated at 9.33/10
";
        let findings = parse_pylint(output, Path::new("/tmp")).unwrap();
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn parse_pylint_clean_run_is_empty_not_malformed() {
        let output = "\
-------------------------------------------------------------------
Your code has been rated at 10.00/10 (previous run: 9.50/10, +0.50)
";
        let findings = parse_pylint(output, Path::new("/tmp")).unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn parse_pylint_garbage_is_malformed() {
        let err = parse_pylint("segmentation fault (core dumped)", Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, SynodError::Malformed(_)));
    }

    #[test]
    fn parse_pylint_fatal_code_is_error() {
        let output = "app/main.py:1:0: F0001: error while parsing";
        let findings = parse_pylint(output, Path::new("/tmp")).unwrap();
        assert_eq!(findings[0].severity, Severity::Error);
    }

    #[test]
    fn parse_eslint_severity_mapping() {
        let output = r#"[
          {
            "filePath": "/scratch/x2/src/app.js",
            "messages": [
              {"line": 5, "endLine": 5, "severity": 2, "ruleId": "no-undef", "message": "'foo' is not defined."},
              {"line": 9, "severity": 1, "ruleId": "no-unused-vars", "message": "'bar' is assigned a value but never used."}
            ]
          }
        ]"#;
        let findings = parse_eslint(output, Path::new("/scratch/x2")).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Error);
        assert_eq!(findings[0].file_path, PathBuf::from("src/app.js"));
        assert!(findings[0].message.starts_with("no-undef: "));
        assert_eq!(findings[1].severity, Severity::Warning);
        assert_eq!(findings[1].end_line, 9);
    }

    #[test]
    fn parse_eslint_empty_array_is_clean() {
        let findings = parse_eslint("[]", Path::new("/tmp")).unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn parse_eslint_non_json_is_malformed() {
        let err = parse_eslint("npx: command not found", Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, SynodError::Malformed(_)));
    }

    #[test]
    fn parse_eslint_skips_empty_messages() {
        let output = r#"[{"filePath": "a.js", "messages": [{"line": 0, "severity": 3, "message": ""}]}]"#;
        let findings = parse_eslint(output, Path::new("/tmp")).unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn parse_eslint_clamps_line_to_one() {
        let output =
            r#"[{"filePath": "a.js", "messages": [{"line": 0, "severity": 1, "message": "m"}]}]"#;
        let findings = parse_eslint(output, Path::new("/tmp")).unwrap();
        assert_eq!(findings[0].start_line, 1);
        assert_eq!(findings[0].end_line, 1);
    }

    #[test]
    fn synthetic_finding_is_warning_with_tool_source() {
        let finding = synthetic_failure_finding("pylint", "exit status 32");
        assert_eq!(finding.severity, Severity::Warning);
        assert_eq!(finding.source, FindingSource::Lint("pylint".into()));
        assert!(finding.message.contains("exit status 32"));
        // Renders as a real location: tool-attributed path, 1-based line.
        assert_eq!(finding.file_path, PathBuf::from("pylint"));
        assert_eq!(finding.start_line, 1);
        assert_eq!(finding.end_line, 1);
    }
}
