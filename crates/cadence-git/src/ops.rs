use cadence_core::GitError;
use git2::{BranchType, Repository};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A file to commit, with contents to write when the job branch does not
/// already have it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    /// Repository-relative path.
    pub path: String,
    pub fallback_contents: Option<String>,
}

impl ArtifactFile {
    /// Commit whatever is at `path`.
    pub fn existing(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            fallback_contents: None,
        }
    }

    /// Commit `path`, writing `contents` first if the file is missing.
    pub fn with_fallback(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            fallback_contents: Some(contents.into()),
        }
    }
}

/// Branch, commit and merge operations on one repository.
///
/// Mutating operations shell out to the `git` CLI so hooks and the user's
/// configuration apply; read-only queries go through `git2`. Every mutating
/// operation checks the original branch back out before returning, whether
/// it succeeded or not.
#[derive(Debug, Clone)]
pub struct GitOps {
    repo_root: PathBuf,
    main_branch: String,
    develop_branch: String,
}

impl GitOps {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        main_branch: impl Into<String>,
        develop_branch: impl Into<String>,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            main_branch: main_branch.into(),
            develop_branch: develop_branch.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Run `git` in the repository, returning trimmed stdout or stderr.
    async fn git(&self, args: &[&str]) -> Result<String, String> {
        debug!(repo = %self.repo_root.display(), ?args, "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(|e| format!("failed to run git: {e}"))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Err(if stderr.is_empty() { stdout } else { stderr })
        }
    }

    fn open(&self) -> Result<Repository, GitError> {
        Repository::open(&self.repo_root).map_err(|e| {
            GitError::permanent(format!(
                "Failed to open repository {}: {}",
                self.repo_root.display(),
                e.message()
            ))
        })
    }

    // --- Queries ---

    /// Whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let repo = self.open()?;
        // Bound so the borrow of `repo` ends before it drops.
        let found = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(false),
            Err(e) => Err(GitError::permanent(format!(
                "Failed to check branch {branch}: {}",
                e.message()
            ))),
        };
        found
    }

    /// Checked-out branch name, or `HEAD` when detached.
    pub fn current_branch(&self) -> Result<String, GitError> {
        let repo = self.open()?;
        let head = repo.head().map_err(|e| {
            GitError::permanent(format!("Failed to get current branch: {}", e.message()))
        })?;
        if head.is_branch() {
            Ok(head.shorthand().unwrap_or("HEAD").to_string())
        } else {
            Ok("HEAD".to_string())
        }
    }

    /// Hash of the commit HEAD points at.
    pub fn latest_commit_hash(&self) -> Result<String, GitError> {
        let repo = self.open()?;
        let commit = repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(|e| GitError::permanent(format!("Failed to get commit hash: {}", e.message())))?;
        Ok(commit.id().to_string())
    }

    /// Hash of the tip of `branch`.
    pub fn branch_head(&self, branch: &str) -> Result<String, GitError> {
        let repo = self.open()?;
        let commit = repo
            .find_branch(branch, BranchType::Local)
            .and_then(|b| b.get().peel_to_commit())
            .map_err(|e| {
                GitError::permanent(format!("Failed to resolve {branch}: {}", e.message()))
            })?;
        Ok(commit.id().to_string())
    }

    // --- Branches ---

    /// Create the develop branch from main if it does not exist yet.
    pub async fn ensure_develop_branch(&self) -> Result<(), GitError> {
        if self.branch_exists(&self.develop_branch)? {
            return Ok(());
        }
        self.git(&["branch", &self.develop_branch, &self.main_branch])
            .await
            .map_err(|e| GitError::permanent(format!("Failed to ensure develop branch: {e}")))?;
        info!(
            repo = %self.repo_root.display(),
            develop = %self.develop_branch,
            from = %self.main_branch,
            "Created develop branch"
        );
        Ok(())
    }

    /// Create `job_branch` from develop.
    pub async fn create_job_branch(&self, job_branch: &str) -> Result<(), GitError> {
        self.git(&["branch", job_branch, &self.develop_branch])
            .await
            .map_err(|e| GitError::permanent(format!("Failed to create job branch: {e}")))?;
        info!(branch = %job_branch, "Created job branch");
        Ok(())
    }

    /// Delete a fully merged branch.
    pub async fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        self.git(&["branch", "-d", branch])
            .await
            .map_err(|e| GitError::permanent(format!("Failed to delete branch: {e}")))?;
        Ok(())
    }

    // --- Mutations (restore the original branch on every path) ---

    /// What to check out again afterwards: the branch name, or the commit
    /// hash when HEAD is detached.
    async fn restore_point(&self) -> Result<String, GitError> {
        let branch = self
            .git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .map_err(|e| GitError::permanent(format!("Failed to get current branch: {e}")))?;
        if branch != "HEAD" {
            return Ok(branch);
        }
        self.git(&["rev-parse", "HEAD"])
            .await
            .map_err(|e| GitError::permanent(format!("Failed to get commit hash: {e}")))
    }

    async fn restore(&self, original: &str, current: &str) {
        if original == current {
            return;
        }
        if let Err(e) = self.git(&["checkout", original]).await {
            warn!(
                repo = %self.repo_root.display(),
                branch = %original,
                error = %e,
                "Failed to restore original branch"
            );
        }
    }

    /// Stage `files` on `job_branch` and commit them. Returns the commit hash.
    ///
    /// Missing files with fallback contents are written after the job branch
    /// is checked out. When nothing changed the current tip of the job branch
    /// is returned, so committing the same artifacts twice is harmless.
    pub async fn commit_artifacts(
        &self,
        job_branch: &str,
        message: &str,
        files: &[ArtifactFile],
    ) -> Result<String, GitError> {
        let original = self.restore_point().await?;
        if let Err(e) = self.git(&["checkout", job_branch]).await {
            return Err(GitError::transient(format!(
                "Failed to commit artifacts: {e}"
            )));
        }
        let result = self.stage_and_commit(message, files).await;
        self.restore(&original, job_branch).await;
        let hash = result.map_err(|e| GitError::transient(format!("Failed to commit artifacts: {e}")))?;
        info!(branch = %job_branch, commit = %hash, "Committed artifacts");
        Ok(hash)
    }

    async fn stage_and_commit(
        &self,
        message: &str,
        files: &[ArtifactFile],
    ) -> Result<String, String> {
        for file in files {
            let Some(contents) = &file.fallback_contents else {
                continue;
            };
            let path = self.repo_root.join(&file.path);
            let present = tokio::fs::try_exists(&path).await.unwrap_or(false);
            if !present {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
                }
                tokio::fs::write(&path, contents)
                    .await
                    .map_err(|e| format!("cannot write {}: {e}", path.display()))?;
            }
        }

        let mut add = vec!["add", "--"];
        add.extend(files.iter().map(|f| f.path.as_str()));
        self.git(&add).await?;

        // `diff --cached --quiet` exits non-zero when something is staged.
        if self.git(&["diff", "--cached", "--quiet"]).await.is_err() {
            self.git(&["commit", "-m", message]).await?;
        } else {
            debug!("Nothing staged, reusing branch head");
        }
        self.git(&["rev-parse", "HEAD"]).await
    }

    /// Merge `job_branch` into develop with `--no-ff`. Returns the merge hash.
    ///
    /// A conflicting merge is aborted and reported as permanent.
    pub async fn merge_job_to_develop(
        &self,
        job_branch: &str,
        message: &str,
    ) -> Result<String, GitError> {
        let original = self.restore_point().await?;
        if let Err(e) = self.git(&["checkout", &self.develop_branch]).await {
            return Err(GitError::transient(format!("Failed to merge to develop: {e}")));
        }
        let result = self.merge_no_ff(job_branch, message).await;
        self.restore(&original, &self.develop_branch).await;
        let hash = result?;
        info!(branch = %job_branch, develop = %self.develop_branch, merge = %hash, "Merged job branch");
        Ok(hash)
    }

    async fn merge_no_ff(&self, job_branch: &str, message: &str) -> Result<String, GitError> {
        if let Err(e) = self.git(&["merge", "--no-ff", "-m", message, job_branch]).await {
            let conflicts = self
                .git(&["diff", "--name-only", "--diff-filter=U"])
                .await
                .unwrap_or_default();
            if !conflicts.is_empty() || e.contains("CONFLICT") {
                if let Err(abort) = self.git(&["merge", "--abort"]).await {
                    warn!(error = %abort, "git merge --abort failed");
                }
                let files = conflicts.lines().collect::<Vec<_>>().join(", ");
                return Err(GitError::permanent(format!(
                    "Failed to merge to develop: conflict in {files}"
                )));
            }
            return Err(GitError::transient(format!("Failed to merge to develop: {e}")));
        }
        self.git(&["rev-parse", "HEAD"])
            .await
            .map_err(|e| GitError::transient(format!("Failed to merge to develop: {e}")))
    }
}
