//! External tracker access through the host CLI (`gh`).
//!
//! The orchestrator never speaks HTTP to the tracker; it shells out to the
//! host CLI and parses its `--json` output. Every operation here can fail
//! because the tracker is unreachable — callers treat that as the
//! tracker-unreachable bucket and degrade to their most conservative safe
//! behavior rather than failing the run.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;

use crate::store::PrRef;

/// One comment on an issue thread, in tracker chronology.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerComment {
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Issue fields the orchestrator cares about.
#[derive(Debug, Clone)]
pub struct HostIssue {
    pub number: i64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub state: String,
}

/// Abstraction over the tracker host for testability.
/// Real implementation: [`GhHost`]. Tests use in-memory doubles.
#[async_trait]
pub trait TrackerHost: Send + Sync {
    async fn issue(&self, number: i64) -> Result<HostIssue>;

    async fn comments(&self, number: i64) -> Result<Vec<TrackerComment>>;

    async fn post_comment(&self, number: i64, body: &str) -> Result<()>;

    /// Whether the given pull request has been merged.
    async fn pr_merged(&self, pr_number: i64) -> Result<bool>;

    /// Find a merged pull request whose head is the given branch.
    async fn merged_pr_for_branch(&self, branch: &str) -> Result<Option<PrRef>>;
}

// ── gh --json view shapes ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LabelView {
    name: String,
}

#[derive(Debug, Deserialize)]
struct IssueView {
    number: i64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<LabelView>,
    state: String,
}

#[derive(Debug, Deserialize)]
struct CommentsView {
    comments: Vec<TrackerComment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrStateView {
    state: String,
    #[serde(default)]
    merged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct PrListView {
    number: i64,
    url: String,
}

/// Tracker host backed by the `gh` CLI, run inside the project repository.
pub struct GhHost {
    gh_cmd: String,
    project_dir: PathBuf,
}

impl GhHost {
    pub fn new(gh_cmd: &str, project_dir: &Path) -> Self {
        Self {
            gh_cmd: gh_cmd.to_string(),
            project_dir: project_dir.to_path_buf(),
        }
    }

    async fn run_gh(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.gh_cmd)
            .args(args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to spawn {} {}", self.gh_cmd, args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} {} failed: {}", self.gh_cmd, args.join(" "), stderr.trim());
        }

        String::from_utf8(output.stdout).context("Invalid UTF-8 in gh output")
    }
}

#[async_trait]
impl TrackerHost for GhHost {
    async fn issue(&self, number: i64) -> Result<HostIssue> {
        let out = self
            .run_gh(&[
                "issue",
                "view",
                &number.to_string(),
                "--json",
                "number,title,body,labels,state",
            ])
            .await?;
        let view: IssueView =
            serde_json::from_str(&out).context("Failed to parse issue view from gh")?;
        Ok(HostIssue {
            number: view.number,
            title: view.title,
            body: view.body.unwrap_or_default(),
            labels: view.labels.into_iter().map(|l| l.name).collect(),
            state: view.state,
        })
    }

    async fn comments(&self, number: i64) -> Result<Vec<TrackerComment>> {
        let out = self
            .run_gh(&["issue", "view", &number.to_string(), "--json", "comments"])
            .await?;
        let view: CommentsView =
            serde_json::from_str(&out).context("Failed to parse comments from gh")?;
        Ok(view.comments)
    }

    async fn post_comment(&self, number: i64, body: &str) -> Result<()> {
        self.run_gh(&["issue", "comment", &number.to_string(), "--body", body])
            .await?;
        Ok(())
    }

    async fn pr_merged(&self, pr_number: i64) -> Result<bool> {
        let out = self
            .run_gh(&[
                "pr",
                "view",
                &pr_number.to_string(),
                "--json",
                "state,mergedAt",
            ])
            .await?;
        let view: PrStateView =
            serde_json::from_str(&out).context("Failed to parse PR state from gh")?;
        Ok(view.state == "MERGED" || view.merged_at.is_some())
    }

    async fn merged_pr_for_branch(&self, branch: &str) -> Result<Option<PrRef>> {
        let out = self
            .run_gh(&[
                "pr",
                "list",
                "--head",
                branch,
                "--state",
                "merged",
                "--json",
                "number,url",
            ])
            .await?;
        let prs: Vec<PrListView> =
            serde_json::from_str(&out).context("Failed to parse PR list from gh")?;
        Ok(prs.into_iter().next().map(|p| PrRef {
            number: p.number,
            url: p.url,
        }))
    }
}
