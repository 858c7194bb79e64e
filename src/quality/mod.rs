//! Bounded diagnose → fix → re-run loop for recoverable review failures.
//!
//! The controller is the only component that interprets a failed phase's
//! findings payload. Each iteration invokes a fix attempt (an opaque
//! phase-like operation receiving the findings) and then re-runs the
//! originally failing phase. The iteration counter is persisted on the
//! retry phase's record; once it reaches the configured maximum the issue
//! is blocked and stays blocked until the counter is explicitly reset.

use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::PipelineError;
use crate::events::{EventBus, PipelineEvent};
use crate::phase::{PhaseName, PhaseStatus};
use crate::runner::{PhaseOutcome, PhaseRunner};
use crate::store::StoreHandle;
use crate::workspace::Workspace;

pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// Severity of one review finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Error,
    #[default]
    Warning,
    Info,
}

/// One structured finding from a review-type failure.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewFinding {
    #[serde(default)]
    pub severity: FindingSeverity,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub issue: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FindingsEnvelope {
    findings: Vec<ReviewFinding>,
}

/// Parse the findings payload a failed phase reported. Accepts a bare
/// array or an `{"findings": [...]}` envelope; anything else yields an
/// empty list — the loop still runs, the fix attempt just gets less to go
/// on.
pub fn parse_findings(raw: &str) -> Vec<ReviewFinding> {
    if let Ok(list) = serde_json::from_str::<Vec<ReviewFinding>>(raw) {
        return list;
    }
    if let Ok(envelope) = serde_json::from_str::<FindingsEnvelope>(raw) {
        return envelope.findings;
    }
    Vec::new()
}

/// Per-issue bounded retry state machine.
pub struct QualityLoopController {
    store: StoreHandle,
    events: EventBus,
    max_iterations: u32,
}

impl QualityLoopController {
    pub fn new(store: StoreHandle, events: EventBus, max_iterations: u32) -> Self {
        Self {
            store,
            events,
            max_iterations,
        }
    }

    /// Drive the loop for one semantic failure of a review-type phase.
    ///
    /// Returns the final successful outcome, or
    /// [`PipelineError::QualityLoopExhausted`] once the persisted counter
    /// reaches the maximum — including on a later manual re-invocation,
    /// unless the counter was reset first.
    pub async fn run(
        &self,
        runner: &PhaseRunner,
        issue_id: i64,
        failed_phase: PhaseName,
        workspace: &Workspace,
        first_failure: PhaseOutcome,
    ) -> Result<PhaseOutcome, PipelineError> {
        let mut iteration = self
            .store
            .get(issue_id)
            .await?
            .map(|r| r.loop_iterations())
            .unwrap_or(0);
        let mut last = first_failure;

        loop {
            if iteration >= self.max_iterations {
                let last_error = last
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{} failed", failed_phase));
                self.store
                    .update(issue_id, {
                        let last_error = last_error.clone();
                        move |r| {
                            let record = r.phase_mut(PhaseName::QualityLoop);
                            record.iteration = Some(iteration);
                            record.fail(last_error.clone());
                        }
                    })
                    .await?;
                warn!(
                    issue = issue_id,
                    phase = %failed_phase,
                    iterations = iteration,
                    "quality loop exhausted; issue blocked until counter reset"
                );
                return Err(PipelineError::QualityLoopExhausted {
                    issue: issue_id,
                    iterations: iteration,
                    last_error,
                });
            }

            iteration += 1;
            self.events.publish(PipelineEvent::QualityLoopIteration {
                issue: issue_id,
                iteration,
                max_iterations: self.max_iterations,
            });
            info!(
                issue = issue_id,
                phase = %failed_phase,
                iteration,
                max = self.max_iterations,
                "quality loop iteration"
            );

            // Diagnose: hand the structured findings to the fix attempt.
            let findings = last.findings.clone().unwrap_or_else(|| {
                serde_json::json!({
                    "findings": [],
                    "error": last.error.clone().unwrap_or_default(),
                })
                .to_string()
            });

            let fix = runner
                .run_phase(issue_id, PhaseName::QualityLoop, workspace, Some(findings))
                .await?;
            self.store
                .update(issue_id, move |r| {
                    r.phase_mut(PhaseName::QualityLoop).iteration = Some(iteration);
                })
                .await?;
            if !fix.is_completed() {
                warn!(
                    issue = issue_id,
                    iteration,
                    error = fix.error.as_deref().unwrap_or("unknown"),
                    "fix attempt failed; re-running phase anyway"
                );
            }

            // Re-run the originally failing phase; it is the authority.
            let rerun = runner.run_phase(issue_id, failed_phase, workspace, None).await?;
            if rerun.is_completed() {
                // A failed fix attempt must not leave the retry record
                // failed once the re-run passed.
                self.store
                    .update(issue_id, move |r| {
                        let record = r.phase_mut(PhaseName::QualityLoop);
                        if record.status != PhaseStatus::Completed {
                            record.complete();
                        }
                        record.iteration = Some(iteration);
                    })
                    .await?;
                return Ok(rerun);
            }
            last = rerun;
        }
    }

    /// Explicitly reset the loop counter so a blocked issue may retry.
    pub async fn reset(&self, issue_id: i64) -> Result<(), PipelineError> {
        self.store
            .update(issue_id, |r| {
                r.phases.remove(&PhaseName::QualityLoop);
            })
            .await?;
        info!(issue = issue_id, "quality loop counter reset");
        Ok(())
    }
}
