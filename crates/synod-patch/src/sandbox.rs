use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::{debug, warn};

use synod_core::{Patch, PatchValidation, SandboxConfig, SynodError, TestExecution};

use crate::diff::{apply_file_diff, parse_unified_diff, FileDiff};

const OUTPUT_TAIL_BYTES: usize = 4000;

/// Guess the project's test command from well-known manifest files.
///
/// Checked in order: Python (`pytest.ini`, `setup.cfg`, `pyproject.toml`),
/// then `package.json` with a `scripts.test` entry, then `Cargo.toml`.
/// Returns `None` when nothing matches.
pub fn detect_test_command(root: &Path) -> Option<String> {
    for marker in ["pytest.ini", "setup.cfg", "pyproject.toml"] {
        if root.join(marker).is_file() {
            return Some("python -m pytest -x -q".to_string());
        }
    }
    let package_json = root.join("package.json");
    if package_json.is_file() && has_npm_test_script(&package_json) {
        return Some("npm test --silent".to_string());
    }
    if root.join("Cargo.toml").is_file() {
        return Some("cargo test --quiet".to_string());
    }
    None
}

fn has_npm_test_script(path: &Path) -> bool {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return false;
    };
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(manifest) => manifest.get("scripts").and_then(|s| s.get("test")).is_some(),
        // An unparseable manifest still marks an npm project.
        Err(_) => true,
    }
}

/// Throwaway working tree for patch validation.
///
/// The directory is deleted when the workspace is dropped. It is populated
/// either by [`Workspace::checkout`] (clone a remote at a pinned commit) or
/// [`Workspace::copy_local`] (copy a tree already on disk).
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create an empty sandbox directory.
    pub fn new() -> Result<Self, SynodError> {
        let dir = TempDir::new()?;
        Ok(Self { dir })
    }

    /// Absolute path of the sandbox root.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Clone `url` into the sandbox and detach HEAD at `head_sha`.
    ///
    /// The URL may carry embedded credentials, so it is never echoed into
    /// error messages.
    pub fn checkout(&self, url: &str, head_sha: &str) -> Result<(), SynodError> {
        let repo = git2::Repository::clone(url, self.root())
            .map_err(|e| SynodError::Git(format!("failed to clone repository: {e}")))?;
        let oid = git2::Oid::from_str(head_sha)
            .map_err(|e| SynodError::Git(format!("invalid commit id {head_sha}: {e}")))?;
        let commit = repo
            .find_commit(oid)
            .map_err(|e| SynodError::Git(format!("commit {head_sha} not found: {e}")))?;
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force();
        repo.checkout_tree(commit.as_object(), Some(&mut checkout))
            .map_err(|e| SynodError::Git(format!("failed to check out {head_sha}: {e}")))?;
        repo.set_head_detached(oid)
            .map_err(|e| SynodError::Git(format!("failed to detach HEAD at {head_sha}: {e}")))?;
        debug!(head = head_sha, "sandbox checkout complete");
        Ok(())
    }

    /// Copy a local tree into the sandbox, skipping directories named in
    /// `skip`. Returns the number of files copied.
    pub fn copy_local(&self, source: &Path, skip: &[String]) -> Result<usize, SynodError> {
        let skip: Vec<String> = skip.to_vec();
        let walker = ignore::WalkBuilder::new(source)
            .hidden(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .filter_entry(move |entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !skip.iter().any(|s| s == name))
                    .unwrap_or(true)
            })
            .build();

        let mut copied = 0usize;
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let Some(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(source) else {
                continue;
            };
            let target = self.root().join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
        debug!(files = copied, "copied working tree into sandbox");
        Ok(copied)
    }

    /// Apply a patch to the sandbox tree.
    ///
    /// Returns per-file backups for [`Workspace::restore`]. A failure
    /// midway rolls back the files already touched, so the tree is never
    /// left half-patched.
    pub fn apply_patch(&self, patch: &Patch) -> Result<Vec<(PathBuf, Option<String>)>, SynodError> {
        let files = parse_unified_diff(&patch.diff)?;
        if files.is_empty() {
            return Err(SynodError::Malformed("patch contains no file diffs".into()));
        }

        let mut backups: Vec<(PathBuf, Option<String>)> = Vec::new();
        for file in &files {
            match self.apply_one(file) {
                Ok(backup) => backups.push(backup),
                Err(e) => {
                    self.restore(backups);
                    return Err(e);
                }
            }
        }
        Ok(backups)
    }

    fn apply_one(&self, file: &FileDiff) -> Result<(PathBuf, Option<String>), SynodError> {
        let relative = sandbox_relative(target_path(file))?;
        let absolute = self.root().join(relative);

        let original = if absolute.is_file() {
            Some(std::fs::read_to_string(&absolute)?)
        } else {
            None
        };

        if file.is_deleted_file {
            if original.is_none() {
                return Err(SynodError::Malformed(format!(
                    "diff deletes missing file {}",
                    relative.display()
                )));
            }
            std::fs::remove_file(&absolute)?;
            return Ok((absolute, original));
        }

        let base = match &original {
            Some(content) => content.as_str(),
            None if file.is_new_file => "",
            None => return Err(SynodError::FileNotFound(absolute)),
        };
        let patched = apply_file_diff(base, file)?;
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&absolute, patched)?;
        Ok((absolute, original))
    }

    /// Put backed-up files back. `None` content means the file did not
    /// exist before the patch and is removed again.
    pub fn restore(&self, backups: Vec<(PathBuf, Option<String>)>) {
        for (path, original) in backups {
            let result = match original {
                Some(content) => std::fs::write(&path, content),
                None => match std::fs::remove_file(&path) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                },
            };
            if let Err(e) = result {
                warn!(path = %path.display(), error = %e, "failed to restore file after patch run");
            }
        }
    }
}

fn target_path(file: &FileDiff) -> &Path {
    if file.is_deleted_file {
        &file.old_path
    } else {
        &file.new_path
    }
}

/// Reject absolute paths and `..` components before joining onto the
/// sandbox root.
fn sandbox_relative(path: &Path) -> Result<&Path, SynodError> {
    let mut components = path.components().peekable();
    let safe =
        components.peek().is_some() && components.all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(path)
    } else {
        Err(SynodError::Malformed(format!(
            "diff path escapes the sandbox: {}",
            path.display()
        )))
    }
}

/// Testing stage: runs the project's test suite once per candidate patch.
pub struct TestRunner {
    config: SandboxConfig,
}

impl TestRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Validate one patch in its own disposable workspace: apply, run the
    /// suite, record the outcome.
    ///
    /// The workspace must be fresh for each call; test runs leave artifacts
    /// behind (caches, files the suite writes) and nothing here cleans them
    /// up, so sharing a workspace would let one run's leftovers sway the
    /// next patch's verdict. The command is the configured override when
    /// set, otherwise detected from the sandbox tree. With no command at
    /// all the patch is marked `Skipped` and nothing is applied.
    pub async fn validate(&self, workspace: &Workspace, patch: &mut Patch) {
        let command = self
            .config
            .test_command
            .clone()
            .or_else(|| detect_test_command(workspace.root()));

        let Some(command) = command else {
            debug!(patch = %patch.id, "no test command detected, skipping validation");
            patch.validation = PatchValidation::Skipped;
            return;
        };

        if let Err(e) = workspace.apply_patch(patch) {
            warn!(patch = %patch.id, error = %e, "patch did not apply");
            patch.mark_apply_failed();
            return;
        }
        let execution = self.run_tests(workspace.root(), &command).await;
        debug!(
            patch = %patch.id,
            exit = ?execution.exit_code,
            timed_out = execution.timed_out,
            "test run finished"
        );
        patch.record_execution(execution);
    }

    async fn run_tests(&self, root: &Path, command: &str) -> TestExecution {
        let started = Instant::now();
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return TestExecution {
                command: command.to_string(),
                exit_code: None,
                timed_out: false,
                duration_ms: 0,
                output_tail: "empty test command".to_string(),
            };
        };

        let mut child = tokio::process::Command::new(program);
        child
            .args(parts)
            .current_dir(root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let deadline = Duration::from_secs(self.config.test_timeout_secs);
        match tokio::time::timeout(deadline, child.output()).await {
            Err(_) => TestExecution {
                command: command.to_string(),
                exit_code: None,
                timed_out: true,
                duration_ms: started.elapsed().as_millis() as u64,
                output_tail: format!("timed out after {}s", deadline.as_secs()),
            },
            Ok(Err(e)) => TestExecution {
                command: command.to_string(),
                exit_code: None,
                timed_out: false,
                duration_ms: started.elapsed().as_millis() as u64,
                output_tail: format!("failed to start: {e}"),
            },
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                TestExecution {
                    command: command.to_string(),
                    exit_code: output.status.code(),
                    timed_out: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                    output_tail: tail(&combined, OUTPUT_TAIL_BYTES).to_string(),
                }
            }
        }
    }
}

fn tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use synod_core::{ConsensusFinding, FindingSource, Severity};

    fn finding(file: &str) -> ConsensusFinding {
        ConsensusFinding {
            file_path: PathBuf::from(file),
            start_line: 1,
            end_line: 1,
            severity: Severity::Warning,
            message: "unused import os".into(),
            fixable: true,
            agreement_count: 2,
            sources: vec![FindingSource::Ai("gpt-4o".into())],
        }
    }

    fn patch_with_diff(diff: &str) -> Patch {
        Patch::new("patch-1", finding("app.py"), diff, "gpt-4o")
    }

    const APP_CONTENT: &str = "import os\nimport sys\nprint(sys.argv)\n";
    const APP_DIFF: &str =
        "--- a/app.py\n+++ b/app.py\n@@ -1,3 +1,2 @@\n-import os\n import sys\n print(sys.argv)\n";

    fn workspace_with_app() -> Workspace {
        let workspace = Workspace::new().unwrap();
        std::fs::write(workspace.root().join("app.py"), APP_CONTENT).unwrap();
        workspace
    }

    #[test]
    fn detects_pytest_before_npm() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "[tool.pytest]\n").unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"test": "jest"}}"#,
        )
        .unwrap();
        assert_eq!(
            detect_test_command(dir.path()).unwrap(),
            "python -m pytest -x -q"
        );
    }

    #[test]
    fn detects_npm_only_with_test_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"scripts": {}}"#).unwrap();
        assert_eq!(detect_test_command(dir.path()), None);

        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"test": "jest"}}"#,
        )
        .unwrap();
        assert_eq!(detect_test_command(dir.path()).unwrap(), "npm test --silent");
    }

    #[test]
    fn malformed_package_json_still_counts_as_npm() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{not json").unwrap();
        assert_eq!(detect_test_command(dir.path()).unwrap(), "npm test --silent");
    }

    #[test]
    fn detects_cargo_and_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_test_command(dir.path()), None);
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        assert_eq!(detect_test_command(dir.path()).unwrap(), "cargo test --quiet");
    }

    #[test]
    fn copy_local_skips_listed_directories() {
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(source.path().join(".git")).unwrap();
        std::fs::create_dir_all(source.path().join("node_modules/pkg")).unwrap();
        std::fs::create_dir_all(source.path().join("src")).unwrap();
        std::fs::write(source.path().join(".git/config"), "x").unwrap();
        std::fs::write(source.path().join("node_modules/pkg/index.js"), "x").unwrap();
        std::fs::write(source.path().join("app.py"), "print(1)\n").unwrap();
        std::fs::write(source.path().join("src/util.py"), "pass\n").unwrap();

        let workspace = Workspace::new().unwrap();
        let skip = vec![".git".to_string(), "node_modules".to_string()];
        let copied = workspace.copy_local(source.path(), &skip).unwrap();

        assert_eq!(copied, 2);
        assert!(workspace.root().join("app.py").is_file());
        assert!(workspace.root().join("src/util.py").is_file());
        assert!(!workspace.root().join(".git").exists());
        assert!(!workspace.root().join("node_modules").exists());
    }

    #[test]
    fn apply_and_restore_roundtrip() {
        let workspace = workspace_with_app();
        let patch = patch_with_diff(APP_DIFF);

        let backups = workspace.apply_patch(&patch).unwrap();
        let patched = std::fs::read_to_string(workspace.root().join("app.py")).unwrap();
        assert_eq!(patched, "import sys\nprint(sys.argv)\n");

        workspace.restore(backups);
        let restored = std::fs::read_to_string(workspace.root().join("app.py")).unwrap();
        assert_eq!(restored, APP_CONTENT);
    }

    #[test]
    fn failed_apply_leaves_tree_untouched() {
        let workspace = workspace_with_app();
        let patch = patch_with_diff(
            "--- a/app.py\n+++ b/app.py\n@@ -1,1 +1,1 @@\n-not the real line\n+replacement\n",
        );

        assert!(workspace.apply_patch(&patch).is_err());
        let content = std::fs::read_to_string(workspace.root().join("app.py")).unwrap();
        assert_eq!(content, APP_CONTENT);
    }

    #[test]
    fn new_file_patch_creates_and_restore_removes() {
        let workspace = Workspace::new().unwrap();
        let patch =
            patch_with_diff("--- /dev/null\n+++ b/fresh.py\n@@ -0,0 +1,1 @@\n+print(1)\n");

        let backups = workspace.apply_patch(&patch).unwrap();
        assert!(workspace.root().join("fresh.py").is_file());

        workspace.restore(backups);
        assert!(!workspace.root().join("fresh.py").exists());
    }

    #[test]
    fn path_escape_is_rejected() {
        let workspace = workspace_with_app();
        let patch = patch_with_diff(
            "--- a/../evil.py\n+++ b/../evil.py\n@@ -0,0 +1,1 @@\n+print(1)\n",
        );
        assert!(matches!(
            workspace.apply_patch(&patch),
            Err(SynodError::Malformed(_))
        ));
    }

    fn runner(timeout_secs: u64, command: Option<&str>) -> TestRunner {
        TestRunner::new(SandboxConfig {
            test_timeout_secs: timeout_secs,
            test_command: command.map(str::to_string),
            copy_ignore: vec![],
        })
    }

    #[tokio::test]
    async fn run_tests_captures_exit_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(30, None);

        let ok = r.run_tests(dir.path(), "echo hello").await;
        assert_eq!(ok.exit_code, Some(0));
        assert!(ok.succeeded());
        assert!(ok.output_tail.contains("hello"));

        let failing = r.run_tests(dir.path(), "false").await;
        assert_eq!(failing.exit_code, Some(1));
        assert!(!failing.succeeded());
    }

    #[tokio::test]
    async fn run_tests_reports_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(1, None);
        let execution = r.run_tests(dir.path(), "sleep 30").await;
        assert!(execution.timed_out);
        assert_eq!(execution.exit_code, None);
        assert!(!execution.succeeded());
    }

    #[tokio::test]
    async fn run_tests_handles_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(5, None);
        let execution = r.run_tests(dir.path(), "definitely-not-a-real-binary-xyz").await;
        assert_eq!(execution.exit_code, None);
        assert!(!execution.timed_out);
        assert!(execution.output_tail.contains("failed to start"));
    }

    #[tokio::test]
    async fn validate_passes_on_clean_suite() {
        let workspace = workspace_with_app();
        let mut patch = patch_with_diff(APP_DIFF);

        runner(30, Some("true")).validate(&workspace, &mut patch).await;

        assert_eq!(patch.validation, PatchValidation::Passed);
        assert!(patch.execution.as_ref().unwrap().succeeded());
        // The suite ran against the patched tree.
        let content = std::fs::read_to_string(workspace.root().join("app.py")).unwrap();
        assert_eq!(content, "import sys\nprint(sys.argv)\n");
    }

    #[tokio::test]
    async fn validate_marks_failing_suite() {
        let workspace = workspace_with_app();
        let mut patch = patch_with_diff(APP_DIFF);

        runner(30, Some("false")).validate(&workspace, &mut patch).await;

        assert_eq!(patch.validation, PatchValidation::Failed);
        assert_eq!(patch.execution.as_ref().unwrap().exit_code, Some(1));
    }

    #[tokio::test]
    async fn validate_marks_unapplicable_patch() {
        let workspace = workspace_with_app();
        let mut patch = patch_with_diff(
            "--- a/app.py\n+++ b/app.py\n@@ -1,1 +1,1 @@\n-wrong context\n+x\n",
        );

        runner(30, Some("true")).validate(&workspace, &mut patch).await;

        assert_eq!(patch.validation, PatchValidation::Failed);
        assert!(patch.execution.is_none());
    }

    #[tokio::test]
    async fn validate_without_command_skips() {
        let workspace = workspace_with_app();
        let mut patch = patch_with_diff(APP_DIFF);

        runner(30, None).validate(&workspace, &mut patch).await;

        assert_eq!(patch.validation, PatchValidation::Skipped);
        // Nothing applied either.
        let content = std::fs::read_to_string(workspace.root().join("app.py")).unwrap();
        assert_eq!(content, APP_CONTENT);
    }

    #[tokio::test]
    async fn validation_verdicts_are_isolated_per_workspace() {
        // A suite that leaves an artifact behind and fails whenever it
        // sees one from an earlier run.
        let scripts = tempfile::tempdir().unwrap();
        let suite = scripts.path().join("suite.sh");
        std::fs::write(&suite, "test ! -f marker || exit 1\ntouch marker\n").unwrap();
        let command = format!("sh {}", suite.display());
        let r = runner(30, Some(&command));

        let mut first = patch_with_diff(APP_DIFF);
        let mut second = patch_with_diff(APP_DIFF);

        let workspace = workspace_with_app();
        r.validate(&workspace, &mut first).await;
        drop(workspace);
        let workspace = workspace_with_app();
        r.validate(&workspace, &mut second).await;

        assert_eq!(first.validation, PatchValidation::Passed);
        assert_eq!(
            second.validation,
            PatchValidation::Passed,
            "second patch saw test-run artifacts from the first"
        );
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 2), "lo");
        // 'é' is two bytes; cutting inside it must round forward.
        assert_eq!(tail("xé", 2), "é");
    }
}
