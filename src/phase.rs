//! Closed enumerations for pipeline phases and their statuses.
//!
//! Every consumer matches exhaustively on these types, so adding a phase is
//! a compile-time-checked change across the whole crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A named step of the issue pipeline.
///
/// `QualityLoop` is the bounded diagnose-fix-rerun phase; it never appears
/// in the standard execution order and is driven by the quality controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Plan,
    Implement,
    Verify,
    Review,
    Merge,
    QualityLoop,
}

impl PhaseName {
    /// The standard pipeline, in execution order.
    pub const PIPELINE: [PhaseName; 5] = [
        PhaseName::Plan,
        PhaseName::Implement,
        PhaseName::Verify,
        PhaseName::Review,
        PhaseName::Merge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Verify => "verify",
            Self::Review => "review",
            Self::Merge => "merge",
            Self::QualityLoop => "quality_loop",
        }
    }

    /// Phases whose semantic failures are eligible for the quality loop.
    pub fn is_review_type(&self) -> bool {
        matches!(self, Self::Review | Self::Verify)
    }

    /// Position in the standard pipeline, if this phase is part of it.
    pub fn pipeline_index(&self) -> Option<usize> {
        Self::PIPELINE.iter().position(|p| p == self)
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "implement" => Ok(Self::Implement),
            "verify" => Ok(Self::Verify),
            "review" => Ok(Self::Review),
            "merge" => Ok(Self::Merge),
            "quality_loop" => Ok(Self::QualityLoop),
            _ => Err(format!("Invalid phase name: {}", s)),
        }
    }
}

/// Status of a single (issue, phase) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Terminal statuses carry both timestamps; `pending`/`in_progress` do not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}
