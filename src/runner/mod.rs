//! Single-phase execution: sequencing, timing, and outcome capture.
//!
//! The runner owns the contract `run_phase(issue, phase) -> outcome`. It
//! updates the issue store around the opaque phase operation, emits a phase
//! marker back to the tracker thread, and distinguishes transient
//! invocation failures (retried here, bounded) from semantic failures
//! reported by the phase (never retried here; the quality loop decides).

mod invoker;

pub use invoker::{
    CommandInvoker, OutcomeStatus, PhaseContext, PhaseInvoker, PhaseOutcome, TransientInvokeError,
    decode_outcome,
};

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::errors::{FailureKind, PipelineError};
use crate::events::{EventBus, PipelineEvent};
use crate::host::TrackerHost;
use crate::phase::{PhaseName, PhaseStatus};
use crate::resume::PhaseMarker;
use crate::store::StoreHandle;
use crate::workspace::Workspace;

/// Executes one phase for one issue.
pub struct PhaseRunner {
    store: StoreHandle,
    host: Arc<dyn TrackerHost>,
    invoker: Arc<dyn PhaseInvoker>,
    events: EventBus,
    orchestrator_id: String,
    transient_retries: u32,
    retry_window: Duration,
    shutdown: broadcast::Sender<()>,
}

impl PhaseRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StoreHandle,
        host: Arc<dyn TrackerHost>,
        invoker: Arc<dyn PhaseInvoker>,
        events: EventBus,
        orchestrator_id: String,
        transient_retries: u32,
        retry_window: Duration,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            store,
            host,
            invoker,
            events,
            orchestrator_id,
            transient_retries,
            retry_window,
            shutdown,
        }
    }

    /// Run one phase to an outcome, with store updates and marker emission.
    ///
    /// Returns `Ok` with the phase's own outcome (including semantic
    /// failures) and `Err` only for orchestration-level failures: transient
    /// retry exhaustion, operator abort, or store loss.
    pub async fn run_phase(
        &self,
        issue_id: i64,
        phase: PhaseName,
        workspace: &Workspace,
        findings: Option<String>,
    ) -> Result<PhaseOutcome, PipelineError> {
        // Take-down action is registered before the phase operation starts:
        // an abort must never leave the record saying in_progress.
        let mut shutdown_rx = self.shutdown.subscribe();

        self.store
            .update(issue_id, move |r| {
                r.current_phase = Some(phase);
                r.phase_mut(phase).begin();
            })
            .await?;
        self.events
            .publish(PipelineEvent::PhaseStarted { issue: issue_id, phase });

        let window_start = Instant::now();
        let mut attempt: u32 = 0;
        let outcome = loop {
            let ctx = PhaseContext {
                issue_id,
                phase,
                workspace: workspace.path.clone(),
                orchestrator_id: self.orchestrator_id.clone(),
                fallback: attempt >= self.transient_retries,
                findings: findings.clone(),
            };

            let invocation = self.invoker.invoke(&ctx);
            tokio::select! {
                result = invocation => match result {
                    Ok(outcome) => break outcome,
                    Err(transient) => {
                        let retryable = attempt < self.transient_retries
                            && window_start.elapsed() < self.retry_window;
                        if retryable {
                            attempt += 1;
                            warn!(
                                issue = issue_id,
                                phase = %phase,
                                attempt,
                                error = %transient,
                                "transient invocation failure; retrying"
                            );
                            continue;
                        }
                        let message = transient.0.clone();
                        self.finish(issue_id, phase, PhaseStatus::Failed, Some(message.clone()))
                            .await?;
                        return Err(PipelineError::phase(
                            issue_id,
                            phase,
                            FailureKind::Transient,
                            message,
                        ));
                    }
                },
                _ = shutdown_rx.recv() => {
                    let message = "aborted by operator".to_string();
                    self.finish(issue_id, phase, PhaseStatus::Failed, Some(message)).await?;
                    return Err(PipelineError::Aborted { issue: issue_id, phase });
                }
            }
        };

        let status = if outcome.is_completed() {
            PhaseStatus::Completed
        } else {
            PhaseStatus::Failed
        };
        let acceptance = outcome.acceptance;
        let error = outcome.error.clone();
        self.store
            .update(issue_id, move |r| {
                let record = r.phase_mut(phase);
                match status {
                    PhaseStatus::Completed => record.complete(),
                    _ => record.fail(error.clone().unwrap_or_else(|| "phase failed".to_string())),
                }
                if let Some(ac) = acceptance {
                    r.acceptance = Some(ac);
                }
            })
            .await?;

        self.emit_marker(issue_id, phase, status, outcome.error.clone())
            .await;
        self.events.publish(PipelineEvent::PhaseFinished {
            issue: issue_id,
            phase,
            status,
        });

        Ok(outcome)
    }

    /// Record an already-completed phase reconstructed from a marker, so
    /// resumption never re-invokes it.
    pub async fn record_resumed(
        &self,
        issue_id: i64,
        marker: &PhaseMarker,
    ) -> Result<(), PipelineError> {
        let at = marker.timestamp;
        let phase = marker.phase;
        self.store
            .update(issue_id, move |r| {
                r.phase_mut(phase).complete_from_marker(at);
            })
            .await?;
        self.events
            .publish(PipelineEvent::PhaseSkipped { issue: issue_id, phase });
        debug!(issue = issue_id, phase = %phase, "phase already completed per marker; skipping");
        Ok(())
    }

    /// Close a phase record after an orchestration-level failure.
    async fn finish(
        &self,
        issue_id: i64,
        phase: PhaseName,
        status: PhaseStatus,
        error: Option<String>,
    ) -> Result<(), PipelineError> {
        let marker_error = error.clone();
        self.store
            .update(issue_id, move |r| {
                let record = r.phase_mut(phase);
                match status {
                    PhaseStatus::Failed => {
                        record.fail(error.clone().unwrap_or_else(|| "failed".to_string()))
                    }
                    PhaseStatus::Skipped => record.skip(),
                    PhaseStatus::Completed => record.complete(),
                    _ => {}
                }
            })
            .await?;
        self.emit_marker(issue_id, phase, status, marker_error).await;
        self.events.publish(PipelineEvent::PhaseFinished {
            issue: issue_id,
            phase,
            status,
        });
        Ok(())
    }

    /// Append the phase marker to the tracker thread. Best-effort: an
    /// unreachable tracker degrades to a warning, never fails the run.
    async fn emit_marker(
        &self,
        issue_id: i64,
        phase: PhaseName,
        status: PhaseStatus,
        error: Option<String>,
    ) {
        let mut marker = PhaseMarker::new(phase, status);
        if let Some(e) = error {
            marker = marker.with_error(e);
        }
        if let Err(e) = self.host.post_comment(issue_id, &marker.render()).await {
            warn!(
                issue = issue_id,
                phase = %phase,
                error = %e,
                "could not post phase marker; tracker unreachable"
            );
            self.events.publish(PipelineEvent::Warning {
                issue: issue_id,
                message: format!("phase marker for {} not posted: {}", phase, e),
            });
        }
    }
}
