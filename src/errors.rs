//! Typed error hierarchy for the drover orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — issue store persistence failures
//! - `WorkspaceError` — git worktree lifecycle failures
//! - `PipelineError` — per-issue pipeline failures, tagged with a
//!   `FailureKind` bucket so the user can tell "needs a human fix" from
//!   "will be retried automatically"

use std::fmt;

use thiserror::Error;

use crate::phase::PhaseName;

/// Failure taxonomy bucket. Every user-visible pipeline failure names one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Invocation-mechanism failure; retried automatically inside the runner.
    Transient,
    /// Reported by the phase itself; routed through the quality loop.
    Semantic,
    /// Rebase conflict, checked-out branch, protected-branch violation.
    /// Never auto-resolved; the issue is left in its last good state.
    WorkspaceConflict,
    /// Store document unreadable; triggers the rebuild-from-markers path.
    StoreCorruption,
    /// External tracker unreachable; each operation degrades conservatively.
    TrackerUnreachable,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Semantic => "semantic",
            Self::WorkspaceConflict => "workspace_conflict",
            Self::StoreCorruption => "store_corruption",
            Self::TrackerUnreachable => "tracker_unreachable",
        }
    }

    /// Whether the orchestrator retries this bucket without human action.
    pub fn is_auto_retried(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the issue store subsystem.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Issue store at {path} is corrupt: {message}")]
    Corrupt { path: std::path::PathBuf, message: String },

    #[error("Failed to read issue store at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write issue store at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Issue {id} not found in store")]
    IssueNotFound { id: i64 },

    #[error("Store writer task is no longer running")]
    WriterGone,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the workspace lifecycle subsystem.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Refusing to run a phase on protected branch '{branch}'")]
    ProtectedBranch { branch: String },

    #[error("Rebase of '{branch}' onto '{onto}' hit conflicts; rebase aborted, branch left untouched")]
    RebaseConflict { branch: String, onto: String },

    #[error("Branch '{branch}' is checked out in another worktree")]
    BranchCheckedOut { branch: String },

    #[error("git {args} failed: {stderr}")]
    GitCommand { args: String, stderr: String },

    #[error("Failed to spawn git: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkspaceError {
    /// Conflict-class errors are surfaced as warnings, never auto-resolved.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ProtectedBranch { .. } | Self::RebaseConflict { .. } | Self::BranchCheckedOut { .. }
        )
    }
}

/// Errors from a single issue pipeline. Always carries the issue id and,
/// where one applies, the phase and taxonomy bucket.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("issue {issue}, phase {phase}: {kind} failure: {message}")]
    Phase {
        issue: i64,
        phase: PhaseName,
        kind: FailureKind,
        message: String,
    },

    #[error("issue {issue}: quality loop exhausted after {iterations} iteration(s): {last_error}")]
    QualityLoopExhausted {
        issue: i64,
        iterations: u32,
        last_error: String,
    },

    #[error("issue {issue}: aborted by operator during phase {phase}")]
    Aborted { issue: i64, phase: PhaseName },

    #[error("issue {issue}: {source}")]
    Workspace {
        issue: i64,
        #[source]
        source: WorkspaceError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn phase(issue: i64, phase: PhaseName, kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Phase {
            issue,
            phase,
            kind,
            message: message.into(),
        }
    }

    /// The taxonomy bucket, where one applies.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Phase { kind, .. } => Some(*kind),
            Self::QualityLoopExhausted { .. } => Some(FailureKind::Semantic),
            Self::Workspace { .. } => Some(FailureKind::WorkspaceConflict),
            Self::Store(StoreError::Corrupt { .. }) => Some(FailureKind::StoreCorruption),
            _ => None,
        }
    }
}
