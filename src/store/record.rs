//! Issue and phase records — the durable data model.
//!
//! An `IssueRecord` is owned exclusively by the store's writer task and
//! mutated only through its update operations. The overall `IssueStatus` is
//! never set directly: it is recomputed from the phase map (plus external
//! merge confirmation) on every mutation via [`derive_status`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::{PhaseName, PhaseStatus};

/// Record of one (issue, phase) pair.
///
/// Invariant: terminal statuses (`completed`/`failed`/`skipped`) carry both
/// timestamps; `in_progress` carries a start timestamp only; `pending`
/// carries none. The transition methods below are the only mutation points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Quality-loop iteration counter; meaningful only for the retry phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

impl Default for PhaseRecord {
    fn default() -> Self {
        Self {
            status: PhaseStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            iteration: None,
        }
    }
}

impl PhaseRecord {
    /// Transition `pending` (or a terminal status being re-run) to `in_progress`.
    pub fn begin(&mut self) {
        self.status = PhaseStatus::InProgress;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.error = None;
    }

    pub fn complete(&mut self) {
        self.close(PhaseStatus::Completed, None);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.close(PhaseStatus::Failed, Some(error.into()));
    }

    pub fn skip(&mut self) {
        self.close(PhaseStatus::Skipped, None);
    }

    /// Mark completed from an external marker, reusing its timestamp for
    /// both ends so the pairing invariant holds without inventing durations.
    pub fn complete_from_marker(&mut self, at: DateTime<Utc>) {
        self.status = PhaseStatus::Completed;
        self.started_at = Some(at);
        self.completed_at = Some(at);
        self.error = None;
    }

    fn close(&mut self, status: PhaseStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        // A phase closed without ever starting still gets a paired stamp.
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.completed_at = Some(Utc::now());
        self.error = error;
    }

    /// Check the timestamp-pairing invariant.
    pub fn timestamps_consistent(&self) -> bool {
        match self.status {
            PhaseStatus::Pending => self.started_at.is_none() && self.completed_at.is_none(),
            PhaseStatus::InProgress => self.started_at.is_some() && self.completed_at.is_none(),
            PhaseStatus::Completed | PhaseStatus::Failed | PhaseStatus::Skipped => {
                self.started_at.is_some() == self.completed_at.is_some()
            }
        }
    }
}

/// External pull-request reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrRef {
    pub number: i64,
    pub url: String,
}

/// Aggregate acceptance-criteria counts. The orchestrator never inspects
/// individual criteria, only these totals.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct AcceptanceSummary {
    pub met: u32,
    pub not_met: u32,
    pub pending: u32,
    pub blocked: u32,
}

/// Overall issue status, derived from the phase map plus external merge
/// confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    NotStarted,
    InProgress,
    WaitingForReviewGate,
    ReadyForMerge,
    Blocked,
    Merged,
    Abandoned,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::WaitingForReviewGate => "waiting_for_review_gate",
            Self::ReadyForMerge => "ready_for_merge",
            Self::Blocked => "blocked",
            Self::Merged => "merged",
            Self::Abandoned => "abandoned",
        }
    }

    /// Terminal statuses are skipped by the scheduler unless forced.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Abandoned | Self::Blocked)
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "waiting_for_review_gate" => Ok(Self::WaitingForReviewGate),
            "ready_for_merge" => Ok(Self::ReadyForMerge),
            "blocked" => Ok(Self::Blocked),
            "merged" => Ok(Self::Merged),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(format!("Invalid issue status: {}", s)),
        }
    }
}

/// Pure derivation of the overall status from the phase map.
///
/// `merged_externally` is the external merge confirmation; it dominates
/// everything else. Ordering of the remaining arms matters: a failed phase
/// means blocked regardless of how far the pipeline got.
pub fn derive_status(
    phases: &BTreeMap<PhaseName, PhaseRecord>,
    merged_externally: bool,
) -> IssueStatus {
    if merged_externally {
        return IssueStatus::Merged;
    }

    let record = |p: PhaseName| phases.get(&p);
    let status_of = |p: PhaseName| record(p).map(|r| r.status).unwrap_or(PhaseStatus::Pending);

    if phases.values().any(|r| r.status == PhaseStatus::Failed) {
        return IssueStatus::Blocked;
    }

    let all_pending = phases.values().all(|r| r.status == PhaseStatus::Pending);
    if phases.is_empty() || all_pending {
        return IssueStatus::NotStarted;
    }

    // Abandoned: records exist, all terminal, at least one skipped, and the
    // pipeline did not complete. Produced by the explicit abandon transition.
    let any_skipped = phases.values().any(|r| r.status == PhaseStatus::Skipped);
    let all_terminal = phases.values().all(|r| r.status.is_terminal());
    let pre_merge_complete = [
        PhaseName::Plan,
        PhaseName::Implement,
        PhaseName::Verify,
        PhaseName::Review,
    ]
    .iter()
    .all(|p| status_of(*p) == PhaseStatus::Completed);

    if all_terminal && any_skipped && !pre_merge_complete {
        return IssueStatus::Abandoned;
    }

    if pre_merge_complete {
        return IssueStatus::ReadyForMerge;
    }

    // Everything up to review done, review itself pending or running.
    let before_review_complete = [PhaseName::Plan, PhaseName::Implement, PhaseName::Verify]
        .iter()
        .all(|p| status_of(*p) == PhaseStatus::Completed);
    if before_review_complete
        && matches!(
            status_of(PhaseName::Review),
            PhaseStatus::Pending | PhaseStatus::InProgress
        )
    {
        return IssueStatus::WaitingForReviewGate;
    }

    IssueStatus::InProgress
}

/// One tracked unit of work. Never deleted; terminal transitions only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRecord {
    pub id: i64,
    pub title: String,
    /// Derived; recomputed on every mutation. Stored for read-only consumers.
    pub status: IssueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<PhaseName>,
    #[serde(default)]
    pub phases: BTreeMap<PhaseName, PhaseRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance: Option<AcceptanceSummary>,
    /// External merge confirmation; set once, never cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IssueRecord {
    pub fn new(id: i64, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            status: IssueStatus::NotStarted,
            current_phase: None,
            phases: BTreeMap::new(),
            pr: None,
            workspace_path: None,
            branch: None,
            acceptance: None,
            merged_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recompute the derived status and bump the activity timestamp. Called
    /// by the store after every closure-based update.
    pub fn refresh(&mut self) {
        self.status = derive_status(&self.phases, self.merged_at.is_some());
        self.updated_at = Utc::now();
    }

    /// Record external merge confirmation. Set once, never cleared.
    pub fn mark_merged(&mut self) {
        if self.merged_at.is_none() {
            self.merged_at = Some(Utc::now());
        }
    }

    pub fn phase_mut(&mut self, phase: PhaseName) -> &mut PhaseRecord {
        self.phases.entry(phase).or_default()
    }

    pub fn phase_status(&self, phase: PhaseName) -> PhaseStatus {
        self.phases
            .get(&phase)
            .map(|r| r.status)
            .unwrap_or(PhaseStatus::Pending)
    }

    /// Explicit operator abandon: every non-completed phase is skipped.
    pub fn abandon(&mut self) {
        for phase in PhaseName::PIPELINE {
            let record = self.phase_mut(phase);
            if record.status != PhaseStatus::Completed {
                record.skip();
            }
        }
        self.refresh();
    }

    /// Quality-loop iteration counter (0 when the loop never ran).
    pub fn loop_iterations(&self) -> u32 {
        self.phases
            .get(&PhaseName::QualityLoop)
            .and_then(|r| r.iteration)
            .unwrap_or(0)
    }
}

/// The single-document store format: `{version, lastUpdated, issues}`.
/// Read-only consumers (dashboard, editor panel) watch this file; the
/// field casing is part of that interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreDocument {
    pub version: u32,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub issues: BTreeMap<i64, IssueRecord>,
}

impl StoreDocument {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn empty() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            last_updated: Utc::now(),
            issues: BTreeMap::new(),
        }
    }
}
