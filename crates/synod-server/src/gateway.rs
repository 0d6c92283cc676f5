use async_trait::async_trait;
use tracing::{debug, warn};

use synod_core::{
    ChangedFile, FileStatus, Patch, PatchValidation, ReviewRequest, SourceFile, SynodError,
};
use synod_github::{commit_and_push_fixes, fix_branch_name, GitHubClient};
use synod_patch::Workspace;

/// Everything the pipeline needs from the outside world, behind one seam.
///
/// The orchestrator and the webhook handler only talk to this trait; the
/// live implementation wraps the GitHub API and git, and tests substitute
/// scripted gateways so whole pipeline runs execute without a network.
#[async_trait]
pub trait ReviewGateway: Send + Sync {
    /// List the files a pull request changes, with per-file diffs.
    async fn changed_files(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<ChangedFile>, SynodError>;

    /// Fetch head-commit content for the request's changed files.
    ///
    /// Removed files have no head content and are skipped.
    async fn hydrate(&self, request: &ReviewRequest) -> Result<Vec<SourceFile>, SynodError>;

    /// Populate a fresh sandbox with the PR head for patch validation.
    async fn prepare_workspace(&self, request: &ReviewRequest) -> Result<Workspace, SynodError>;

    /// Post a review comment unless one carrying `marker` already exists.
    ///
    /// Returns `true` when a comment was posted.
    async fn publish_comment(
        &self,
        request: &ReviewRequest,
        marker: &str,
        body: &str,
    ) -> Result<bool, SynodError>;

    /// Post a completed check run on the head commit.
    async fn publish_check(
        &self,
        request: &ReviewRequest,
        conclusion: &str,
        summary: &str,
    ) -> Result<(), SynodError>;

    /// Push the validated patches as a fix branch and open the fix PR.
    ///
    /// Returns the fix PR's URL.
    async fn open_fix_pr(
        &self,
        request: &ReviewRequest,
        patches: &[Patch],
    ) -> Result<String, SynodError>;
}

/// Live gateway over the GitHub API and git.
pub struct GithubGateway {
    client: GitHubClient,
}

impl GithubGateway {
    pub fn new(client: GitHubClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReviewGateway for GithubGateway {
    async fn changed_files(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<ChangedFile>, SynodError> {
        self.client.list_changed_files(owner, repo, number).await
    }

    async fn hydrate(&self, request: &ReviewRequest) -> Result<Vec<SourceFile>, SynodError> {
        let mut files = Vec::new();
        for changed in &request.changed_files {
            if changed.status == FileStatus::Removed {
                continue;
            }
            let path = changed.path.to_string_lossy();
            match self
                .client
                .fetch_file_content(&request.owner, &request.repo, &path, &request.head_sha)
                .await?
            {
                Some(content) => files.push(SourceFile {
                    path: changed.path.clone(),
                    content,
                }),
                None => debug!(file = %path, "no content at head, skipping"),
            }
        }
        Ok(files)
    }

    async fn prepare_workspace(&self, request: &ReviewRequest) -> Result<Workspace, SynodError> {
        let url = self
            .client
            .authenticated_clone_url(&request.owner, &request.repo);
        let head_sha = request.head_sha.clone();
        tokio::task::spawn_blocking(move || {
            let workspace = Workspace::new()?;
            workspace.checkout(&url, &head_sha)?;
            Ok(workspace)
        })
        .await
        .map_err(|e| SynodError::Git(format!("sandbox checkout task failed: {e}")))?
    }

    async fn publish_comment(
        &self,
        request: &ReviewRequest,
        marker: &str,
        body: &str,
    ) -> Result<bool, SynodError> {
        self.client
            .post_unique_comment(&request.owner, &request.repo, request.number, marker, body)
            .await
    }

    async fn publish_check(
        &self,
        request: &ReviewRequest,
        conclusion: &str,
        summary: &str,
    ) -> Result<(), SynodError> {
        self.client
            .create_check_run(
                &request.owner,
                &request.repo,
                &request.head_sha,
                conclusion,
                summary,
            )
            .await
    }

    async fn open_fix_pr(
        &self,
        request: &ReviewRequest,
        patches: &[Patch],
    ) -> Result<String, SynodError> {
        let passed: Vec<Patch> = patches
            .iter()
            .filter(|p| p.validation == PatchValidation::Passed)
            .cloned()
            .collect();
        if passed.is_empty() {
            return Err(SynodError::Github(
                "no validated patches to push".into(),
            ));
        }

        let branch = fix_branch_name(request.number, &request.head_sha);
        let url = self
            .client
            .authenticated_clone_url(&request.owner, &request.repo);
        let head_sha = request.head_sha.clone();
        let token = self.client.token().to_string();
        let message = format!(
            "Apply {} validated fix(es) from the automated review of #{}",
            passed.len(),
            request.number
        );

        let push_branch = branch.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SynodError> {
            let workspace = Workspace::new()?;
            workspace.checkout(&url, &head_sha)?;

            let mut applied = 0usize;
            for patch in &passed {
                match workspace.apply_patch(patch) {
                    Ok(_) => applied += 1,
                    Err(e) => {
                        warn!(patch = %patch.id, error = %e, "validated patch no longer applies, dropping");
                    }
                }
            }
            if applied == 0 {
                return Err(SynodError::Github(
                    "no validated patches applied to a fresh checkout".into(),
                ));
            }
            commit_and_push_fixes(workspace.root(), &push_branch, &message, &token)
        })
        .await
        .map_err(|e| SynodError::Git(format!("fix push task failed: {e}")))??;

        let title = format!("Synod fix: {}", request.title);
        let body = format!(
            "Automated fixes for #{}, generated by the review bot and validated \
             against the project test suite.",
            request.number
        );
        self.client
            .open_fix_pr(
                &request.owner,
                &request.repo,
                &title,
                &body,
                &branch,
                &request.head_ref,
            )
            .await
    }
}
