//! Isolated per-issue workspaces: one git worktree + branch per issue.
//!
//! All operations shell out to `git`. Freshness policy: a workspace more
//! than `staleness_threshold` commits behind the remote default branch is
//! destroyed and recreated, but uncommitted or unpushed work always wins
//! over staleness. Conflicts (rebase, protected branch) are never
//! auto-resolved; the branch is left in its last good state.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::WorkspaceError;

/// Convert a title to a branch-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        let cut = slug
            .char_indices()
            .take_while(|(i, _)| *i < max_len)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0)
            .min(max_len);
        slug[..cut].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Deterministic branch name for an issue.
pub fn branch_name(issue_id: i64, title: &str) -> String {
    format!("drover/issue-{}-{}", issue_id, slugify(title, 40))
}

/// Lifecycle state of an existing workspace, from the freshness evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceState {
    /// Usable as-is.
    Fresh,
    /// Too far behind the remote default branch and safe to recreate.
    Stale,
    /// Has uncommitted or unpushed work; always preserved.
    Dirty,
    /// Removed from disk.
    Destroyed,
}

/// Outcome of the pre-merge rebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseOutcome {
    /// Rebased cleanly (or was already up to date).
    Clean,
    /// Conflicts; rebase aborted, branch left at its pre-rebase state.
    Conflicted,
}

/// An acquired workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub issue_id: i64,
    pub path: PathBuf,
    pub branch: String,
}

/// Creates, validates, rebases, and destroys per-issue worktrees.
pub struct WorkspaceManager {
    project_dir: PathBuf,
    worktrees_dir: PathBuf,
    default_branch: String,
    protected_branches: Vec<String>,
    staleness_threshold: u32,
}

impl WorkspaceManager {
    pub fn new(
        project_dir: &Path,
        worktrees_dir: &Path,
        default_branch: &str,
        protected_branches: Vec<String>,
        staleness_threshold: u32,
    ) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            worktrees_dir: worktrees_dir.to_path_buf(),
            default_branch: default_branch.to_string(),
            protected_branches,
            staleness_threshold,
        }
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    /// The remote-tracking ref issues branch from by default.
    pub fn default_base(&self) -> String {
        format!("origin/{}", self.default_branch)
    }

    fn workspace_path(&self, issue_id: i64) -> PathBuf {
        self.worktrees_dir.join(format!("issue-{}", issue_id))
    }

    async fn run_git(&self, dir: &Path, args: &[&str]) -> Result<std::process::Output, WorkspaceError> {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(WorkspaceError::SpawnFailed)
    }

    /// Run git and fail with the command line + stderr on nonzero exit.
    async fn git_ok(&self, dir: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
        let output = self.run_git(dir, args).await?;
        if !output.status.success() {
            return Err(WorkspaceError::GitCommand {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Acquire the workspace for an issue: reuse a fresh or dirty one,
    /// recreate a stale one, create from `base` (default: the remote
    /// default branch) when none exists.
    pub async fn acquire(
        &self,
        issue_id: i64,
        title: &str,
        base: Option<&str>,
    ) -> Result<Workspace, WorkspaceError> {
        // Best-effort fetch so freshness is measured against the actual
        // remote state; offline operation proceeds on what is local.
        if let Err(e) = self.git_ok(&self.project_dir, &["fetch", "origin"]).await {
            warn!(error = %e, "git fetch failed; using local remote-tracking state");
        }

        let path = self.workspace_path(issue_id);
        if path.exists() {
            match self.evaluate(&path).await? {
                WorkspaceState::Stale => {
                    debug!(issue = issue_id, "workspace stale; recreating");
                    self.destroy(&path).await?;
                }
                state => {
                    debug!(issue = issue_id, ?state, "reusing existing workspace");
                    let branch = self
                        .git_ok(&path, &["rev-parse", "--abbrev-ref", "HEAD"])
                        .await?;
                    return Ok(Workspace {
                        issue_id,
                        path,
                        branch,
                    });
                }
            }
        }

        let branch = branch_name(issue_id, title);
        let base_ref = base.map(str::to_string).unwrap_or_else(|| self.default_base());

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(WorkspaceError::SpawnFailed)?;
        }

        // A branch left over from a destroyed workspace blocks `-b`.
        let _ = self
            .run_git(&self.project_dir, &["branch", "-D", &branch])
            .await;

        let path_str = path.to_string_lossy();
        if let Err(e) = self
            .git_ok(
                &self.project_dir,
                &["worktree", "add", "-b", &branch, &path_str, &base_ref],
            )
            .await
        {
            if let WorkspaceError::GitCommand { stderr, .. } = &e
                && stderr.contains("already checked out")
            {
                return Err(WorkspaceError::BranchCheckedOut { branch });
            }
            return Err(e);
        }

        Ok(Workspace {
            issue_id,
            path,
            branch,
        })
    }

    /// Evaluate the lifecycle state of an existing workspace.
    pub async fn evaluate(&self, path: &Path) -> Result<WorkspaceState, WorkspaceError> {
        let porcelain = self.git_ok(path, &["status", "--porcelain"]).await?;
        if !porcelain.is_empty() {
            return Ok(WorkspaceState::Dirty);
        }

        let unpushed = self.unpushed_count(path).await?;
        if unpushed > 0 {
            return Ok(WorkspaceState::Dirty);
        }

        let behind_ref = format!("HEAD..{}", self.default_base());
        let behind: u32 = self
            .git_ok(path, &["rev-list", "--count", &behind_ref])
            .await?
            .parse()
            .unwrap_or(0);

        if behind > self.staleness_threshold {
            Ok(WorkspaceState::Stale)
        } else {
            Ok(WorkspaceState::Fresh)
        }
    }

    /// Commits on the workspace branch not pushed anywhere. With no
    /// upstream configured, commits ahead of the remote default branch
    /// count as unpushed.
    async fn unpushed_count(&self, path: &Path) -> Result<u32, WorkspaceError> {
        let against_upstream = self.git_ok(path, &["rev-list", "--count", "@{u}..HEAD"]).await;
        let raw = match against_upstream {
            Ok(count) => count,
            Err(_) => {
                let range = format!("{}..HEAD", self.default_base());
                self.git_ok(path, &["rev-list", "--count", &range]).await?
            }
        };
        Ok(raw.parse().unwrap_or(0))
    }

    /// Precondition check: refuse to let a phase mutate a protected branch.
    pub async fn guard(&self, workspace: &Workspace) -> Result<(), WorkspaceError> {
        let head = self
            .git_ok(&workspace.path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        let protected = head == self.default_branch
            || self.protected_branches.iter().any(|b| *b == head);
        if protected {
            return Err(WorkspaceError::ProtectedBranch { branch: head });
        }
        Ok(())
    }

    /// Rebase the issue branch onto the current remote default branch
    /// before requesting a merge. Conflicts abort the rebase and surface a
    /// warning; the branch keeps its pre-rebase state.
    pub async fn pre_merge_rebase(
        &self,
        workspace: &Workspace,
    ) -> Result<RebaseOutcome, WorkspaceError> {
        if let Err(e) = self.git_ok(&self.project_dir, &["fetch", "origin"]).await {
            warn!(error = %e, "git fetch before rebase failed");
        }

        let onto = self.default_base();
        let rebase = self.run_git(&workspace.path, &["rebase", &onto]).await?;
        if rebase.status.success() {
            return Ok(RebaseOutcome::Clean);
        }

        let stderr = String::from_utf8_lossy(&rebase.stderr).trim().to_string();
        warn!(
            issue = workspace.issue_id,
            branch = %workspace.branch,
            %stderr,
            "rebase conflict; aborting rebase"
        );
        if let Err(e) = self.git_ok(&workspace.path, &["rebase", "--abort"]).await {
            warn!(error = %e, "rebase --abort failed");
        }
        Ok(RebaseOutcome::Conflicted)
    }

    /// Release after confirmed merge: remove the worktree and branch refs,
    /// tolerating a branch already deleted remotely.
    pub async fn release(&self, workspace: &Workspace) -> Result<(), WorkspaceError> {
        self.destroy(&workspace.path).await?;

        if let Err(e) = self
            .git_ok(&self.project_dir, &["branch", "-D", &workspace.branch])
            .await
        {
            debug!(branch = %workspace.branch, error = %e, "local branch already gone");
        }
        if let Err(e) = self
            .git_ok(
                &self.project_dir,
                &["push", "origin", "--delete", &workspace.branch],
            )
            .await
        {
            debug!(branch = %workspace.branch, error = %e, "remote branch already gone");
        }
        Ok(())
    }

    async fn destroy(&self, path: &Path) -> Result<(), WorkspaceError> {
        let path_str = path.to_string_lossy();
        if let Err(e) = self
            .git_ok(
                &self.project_dir,
                &["worktree", "remove", "--force", &path_str],
            )
            .await
        {
            // Not a registered worktree (e.g. half-created); remove the
            // directory itself and prune bookkeeping.
            debug!(path = %path.display(), error = %e, "worktree remove failed; pruning");
            let _ = tokio::fs::remove_dir_all(path).await;
            let _ = self
                .run_git(&self.project_dir, &["worktree", "prune"])
                .await;
        }
        Ok(())
    }
}
