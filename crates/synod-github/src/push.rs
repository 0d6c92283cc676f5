use std::path::Path;

use tracing::debug;

use synod_core::SynodError;

/// Branch name for validated fixes: `synod-fix/<pr>-<short-sha>`.
///
/// # Examples
///
/// ```
/// use synod_github::push::fix_branch_name;
///
/// assert_eq!(fix_branch_name(42, "deadbeefcafe1234"), "synod-fix/42-deadbee");
/// ```
pub fn fix_branch_name(pr_number: u64, head_sha: &str) -> String {
    let short = &head_sha[..head_sha.len().min(7)];
    format!("synod-fix/{pr_number}-{short}")
}

/// Commit every change in `workdir` onto `branch` and push it to origin.
///
/// The working tree is expected to be a clone with the validated patches
/// applied. Authentication uses the token as an `x-access-token` password,
/// which is what GitHub expects for HTTPS pushes.
///
/// # Errors
///
/// Returns [`SynodError::Git`] when any git operation fails.
pub fn commit_and_push_fixes(
    workdir: &Path,
    branch: &str,
    message: &str,
    token: &str,
) -> Result<(), SynodError> {
    let repo = git2::Repository::open(workdir)
        .map_err(|e| SynodError::Git(format!("failed to open sandbox repository: {e}")))?;

    let mut index = repo
        .index()
        .map_err(|e| SynodError::Git(format!("failed to read index: {e}")))?;
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .map_err(|e| SynodError::Git(format!("failed to stage changes: {e}")))?;
    index
        .write()
        .map_err(|e| SynodError::Git(format!("failed to write index: {e}")))?;
    let tree_id = index
        .write_tree()
        .map_err(|e| SynodError::Git(format!("failed to write tree: {e}")))?;
    let tree = repo
        .find_tree(tree_id)
        .map_err(|e| SynodError::Git(format!("failed to find tree: {e}")))?;

    let parent = repo
        .head()
        .and_then(|head| head.peel_to_commit())
        .map_err(|e| SynodError::Git(format!("failed to resolve HEAD: {e}")))?;

    let signature = git2::Signature::now("synod-bot", "synod-bot@users.noreply.github.com")
        .map_err(|e| SynodError::Git(format!("failed to build signature: {e}")))?;
    let commit_id = repo
        .commit(None, &signature, &signature, message, &tree, &[&parent])
        .map_err(|e| SynodError::Git(format!("failed to commit fixes: {e}")))?;
    let commit = repo
        .find_commit(commit_id)
        .map_err(|e| SynodError::Git(format!("failed to find fix commit: {e}")))?;
    repo.branch(branch, &commit, true)
        .map_err(|e| SynodError::Git(format!("failed to create branch {branch}: {e}")))?;

    let mut remote = repo
        .find_remote("origin")
        .map_err(|e| SynodError::Git(format!("failed to find origin remote: {e}")))?;

    let token = token.to_string();
    let mut callbacks = git2::RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username, _allowed| {
        git2::Cred::userpass_plaintext("x-access-token", &token)
    });
    let mut options = git2::PushOptions::new();
    options.remote_callbacks(callbacks);

    let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
    remote
        .push(&[refspec.as_str()], Some(&mut options))
        .map_err(|e| SynodError::Git(format!("failed to push {branch}: {e}")))?;
    debug!(branch, "pushed fix branch");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_all(repo: &git2::Repository, message: &str) {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("tester", "tester@example.com").unwrap();
        let parents = match repo.head() {
            Ok(head) => vec![head.peel_to_commit().unwrap()],
            Err(_) => vec![],
        };
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap();
    }

    #[test]
    fn branch_name_uses_short_sha() {
        assert_eq!(fix_branch_name(7, "0123456789abcdef"), "synod-fix/7-0123456");
        assert_eq!(fix_branch_name(7, "ab12"), "synod-fix/7-ab12");
    }

    #[test]
    fn commits_and_pushes_to_local_remote() {
        let remote_dir = tempfile::tempdir().unwrap();
        git2::Repository::init_bare(remote_dir.path()).unwrap();

        let work_dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::init(work_dir.path()).unwrap();
        std::fs::write(work_dir.path().join("app.py"), "import os\n").unwrap();
        commit_all(&repo, "initial");
        repo.remote("origin", remote_dir.path().to_str().unwrap())
            .unwrap();

        std::fs::write(work_dir.path().join("app.py"), "import sys\n").unwrap();
        commit_and_push_fixes(
            work_dir.path(),
            "synod-fix/7-ab12cd3",
            "Synod: apply validated fixes",
            "unused-for-local-remote",
        )
        .unwrap();

        let remote = git2::Repository::open_bare(remote_dir.path()).unwrap();
        let pushed = remote
            .find_reference("refs/heads/synod-fix/7-ab12cd3")
            .unwrap()
            .peel_to_commit()
            .unwrap();
        assert_eq!(pushed.message().unwrap(), "Synod: apply validated fixes");

        // The fix commit sits on top of the original history.
        assert_eq!(pushed.parent_count(), 1);
        assert_eq!(pushed.parent(0).unwrap().message().unwrap(), "initial");
    }

    #[test]
    fn push_fails_without_remote() {
        let work_dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::init(work_dir.path()).unwrap();
        std::fs::write(work_dir.path().join("app.py"), "import os\n").unwrap();
        commit_all(&repo, "initial");

        let err = commit_and_push_fixes(work_dir.path(), "synod-fix/1-ab", "msg", "tok")
            .unwrap_err();
        assert!(err.to_string().contains("origin"));
    }
}
