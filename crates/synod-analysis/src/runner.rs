//! Linter invocation over the changed-file set.
//!
//! Changed files are materialized into a scratch directory (their PR-head
//! content, preserving relative paths), then each analysis unit runs as an
//! external process with a bounded timeout. Units execute concurrently;
//! pylint runs one unit per file, eslint one batched unit per job. A unit
//! that fails to spawn, times out, or produces unusable output degrades to
//! a synthetic warning finding instead of failing the stage.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use synod_core::{AnalysisConfig, Finding, Result, SourceFile, SynodError};

use crate::parse::{parse_eslint, parse_pylint, synthetic_failure_finding};

/// Static-analysis tools synod knows how to run and parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintTool {
    Pylint,
    Eslint,
}

impl LintTool {
    /// Tool name as it appears in finding sources and logs.
    pub fn label(&self) -> &'static str {
        match self {
            LintTool::Pylint => "pylint",
            LintTool::Eslint => "eslint",
        }
    }

    /// Pick the tool responsible for a file, by extension.
    pub fn for_path(path: &Path) -> Option<LintTool> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("py") => Some(LintTool::Pylint),
            Some("js") | Some("jsx") | Some("ts") | Some("tsx") => Some(LintTool::Eslint),
            _ => None,
        }
    }
}

/// One schedulable analysis unit: a tool plus the files it covers.
#[derive(Debug, Clone)]
struct AnalysisUnit {
    tool: LintTool,
    files: Vec<PathBuf>,
}

/// Runs static analyzers against changed files and normalizes their output.
///
/// # Examples
///
/// ```
/// use synod_analysis::AnalysisAgent;
/// use synod_core::AnalysisConfig;
///
/// let agent = AnalysisAgent::new(AnalysisConfig::default());
/// let _ = agent;
/// ```
pub struct AnalysisAgent {
    config: AnalysisConfig,
}

impl AnalysisAgent {
    /// Create an agent with the given analysis settings.
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    /// Run all applicable linters over `files` and return the union of
    /// their findings, order-independent.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures (scratch directory
    /// creation, file writes). Tool-level failures degrade to synthetic
    /// findings.
    pub async fn run(&self, files: &[SourceFile]) -> Result<Vec<Finding>> {
        if !self.config.enabled {
            debug!("static analysis disabled, skipping");
            return Ok(Vec::new());
        }

        let kept: Vec<&SourceFile> = files
            .iter()
            .filter(|f| !self.is_excluded(&f.path))
            .collect();
        let units = plan_units(&kept);
        if units.is_empty() {
            return Ok(Vec::new());
        }

        let scratch = tempfile::tempdir()?;
        materialize(scratch.path(), &kept)?;
        let root = scratch.path().to_path_buf();
        let timeout = Duration::from_secs(self.config.tool_timeout_secs);

        let mut tasks = JoinSet::new();
        for unit in units {
            let root = root.clone();
            tasks.spawn(async move { run_unit(unit, root, timeout).await });
        }

        let mut findings = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(unit_findings) => findings.extend(unit_findings),
                Err(e) => warn!(error = %e, "analysis unit task aborted"),
            }
        }

        debug!(count = findings.len(), "static analysis finished");
        Ok(findings)
    }

    fn is_excluded(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        self.config.exclude.iter().any(|pattern| {
            match glob::Pattern::new(pattern) {
                Ok(p) => p.matches(&text),
                Err(e) => {
                    warn!(pattern, error = %e, "ignoring invalid exclude pattern");
                    false
                }
            }
        })
    }
}

/// Group files into analysis units: one unit per Python file, one batched
/// unit for all JavaScript/TypeScript files.
fn plan_units(files: &[&SourceFile]) -> Vec<AnalysisUnit> {
    let mut units = Vec::new();
    let mut eslint_files = Vec::new();

    for file in files {
        match LintTool::for_path(&file.path) {
            Some(LintTool::Pylint) => units.push(AnalysisUnit {
                tool: LintTool::Pylint,
                files: vec![file.path.clone()],
            }),
            Some(LintTool::Eslint) => eslint_files.push(file.path.clone()),
            None => {}
        }
    }

    if !eslint_files.is_empty() {
        units.push(AnalysisUnit {
            tool: LintTool::Eslint,
            files: eslint_files,
        });
    }

    units
}

/// Write the changed files under `root`, preserving relative paths.
fn materialize(root: &Path, files: &[&SourceFile]) -> Result<()> {
    for file in files {
        let dest = root.join(&file.path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, &file.content)?;
    }
    Ok(())
}

/// Run one unit and turn every failure mode into findings.
async fn run_unit(unit: AnalysisUnit, root: PathBuf, timeout: Duration) -> Vec<Finding> {
    let tool = unit.tool;
    let mut command = build_command(&unit, &root);
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return vec![synthetic_failure_finding(
                tool.label(),
                &format!("failed to start: {e}"),
            )];
        }
        Err(_) => {
            return vec![synthetic_failure_finding(
                tool.label(),
                &format!("timed out after {}s", timeout.as_secs()),
            )];
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        // Linters exit non-zero when they find issues, so only an empty
        // stdout makes the exit code meaningful.
        if output.status.success() || tool == LintTool::Pylint {
            return Vec::new();
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        return vec![synthetic_failure_finding(
            tool.label(),
            &format!(
                "exited with {} and no output: {}",
                output.status,
                stderr.trim()
            ),
        )];
    }

    let parsed = match tool {
        LintTool::Pylint => parse_pylint(&stdout, &root),
        LintTool::Eslint => parse_eslint(&stdout, &root),
    };

    match parsed {
        Ok(findings) => findings,
        Err(SynodError::Malformed(detail)) => {
            warn!(tool = tool.label(), %detail, "unparseable linter output");
            vec![synthetic_failure_finding(tool.label(), &detail)]
        }
        Err(e) => {
            warn!(tool = tool.label(), error = %e, "linter parse failure");
            vec![synthetic_failure_finding(tool.label(), &e.to_string())]
        }
    }
}

fn build_command(unit: &AnalysisUnit, root: &Path) -> Command {
    match unit.tool {
        LintTool::Pylint => {
            let mut cmd = Command::new("pylint");
            cmd.arg("--output-format=text")
                .arg("--msg-template={path}:{line}:{column}: {msg_id}: {msg}")
                .arg("--score=n")
                .current_dir(root);
            for file in &unit.files {
                cmd.arg(root.join(file));
            }
            cmd
        }
        LintTool::Eslint => {
            let mut cmd = Command::new("npx");
            cmd.arg("eslint").arg("--format=json").current_dir(root);
            for file in &unit.files {
                cmd.arg(root.join(file));
            }
            cmd
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(path: &str, content: &str) -> SourceFile {
        SourceFile {
            path: PathBuf::from(path),
            content: content.into(),
        }
    }

    #[test]
    fn tool_selection_by_extension() {
        assert_eq!(
            LintTool::for_path(Path::new("app/models.py")),
            Some(LintTool::Pylint)
        );
        assert_eq!(
            LintTool::for_path(Path::new("src/app.jsx")),
            Some(LintTool::Eslint)
        );
        assert_eq!(
            LintTool::for_path(Path::new("src/index.tsx")),
            Some(LintTool::Eslint)
        );
        assert_eq!(LintTool::for_path(Path::new("README.md")), None);
        assert_eq!(LintTool::for_path(Path::new("Makefile")), None);
    }

    #[test]
    fn units_split_python_and_batch_javascript() {
        let files = vec![
            source("a.py", "import os\n"),
            source("b.py", "import sys\n"),
            source("src/app.js", "var x = 1\n"),
            source("src/lib.ts", "let y = 2\n"),
            source("doc.md", "# hi\n"),
        ];
        let refs: Vec<&SourceFile> = files.iter().collect();
        let units = plan_units(&refs);

        let pylint_units: Vec<_> = units
            .iter()
            .filter(|u| u.tool == LintTool::Pylint)
            .collect();
        let eslint_units: Vec<_> = units
            .iter()
            .filter(|u| u.tool == LintTool::Eslint)
            .collect();
        assert_eq!(pylint_units.len(), 2);
        assert_eq!(eslint_units.len(), 1);
        assert_eq!(eslint_units[0].files.len(), 2);
    }

    #[test]
    fn no_lintable_files_yields_no_units() {
        let files = vec![source("README.md", "docs"), source("data.csv", "1,2")];
        let refs: Vec<&SourceFile> = files.iter().collect();
        assert!(plan_units(&refs).is_empty());
    }

    #[test]
    fn materialize_preserves_relative_layout() {
        let scratch = tempfile::tempdir().unwrap();
        let files = vec![
            source("app/models.py", "import os\n"),
            source("src/deep/nested/app.js", "var x;\n"),
        ];
        let refs: Vec<&SourceFile> = files.iter().collect();
        materialize(scratch.path(), &refs).unwrap();

        let written = std::fs::read_to_string(scratch.path().join("app/models.py")).unwrap();
        assert_eq!(written, "import os\n");
        assert!(scratch.path().join("src/deep/nested/app.js").exists());
    }

    #[test]
    fn exclusion_globs_filter_files() {
        let config = AnalysisConfig {
            enabled: true,
            exclude: vec!["migrations/**".into(), "*.generated.js".into()],
            tool_timeout_secs: 120,
        };
        let agent = AnalysisAgent::new(config);
        assert!(agent.is_excluded(Path::new("migrations/0001_init.py")));
        assert!(agent.is_excluded(Path::new("api.generated.js")));
        assert!(!agent.is_excluded(Path::new("app/models.py")));
    }

    #[tokio::test]
    async fn disabled_analysis_returns_no_findings() {
        let agent = AnalysisAgent::new(AnalysisConfig {
            enabled: false,
            ..AnalysisConfig::default()
        });
        let files = vec![source("a.py", "import os\n")];
        let findings = agent.run(&files).await.unwrap();
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn no_matching_files_returns_no_findings() {
        let agent = AnalysisAgent::new(AnalysisConfig::default());
        let files = vec![source("README.md", "# docs\n")];
        let findings = agent.run(&files).await.unwrap();
        assert!(findings.is_empty());
    }
}
