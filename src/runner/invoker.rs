//! Invocation of the opaque phase operation.
//!
//! The orchestrator never looks inside a phase; it spawns the configured
//! command and decodes a coarse outcome. A `<phase-result>` tag in the
//! output carries the structured verdict; its `findings` payload is passed
//! through opaquely for the quality loop to interpret.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::phase::PhaseName;
use crate::store::AcceptanceSummary;

static PHASE_RESULT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<phase-result>\s*(.*?)\s*</phase-result>").unwrap());

/// Window inside which a failed invocation counts as a cold-start
/// (transient) failure rather than a semantic one.
const COLD_START_WINDOW: Duration = Duration::from_secs(10);

/// Environment/context passed into every phase invocation.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub issue_id: i64,
    pub phase: PhaseName,
    pub workspace: PathBuf,
    /// Identifies this orchestrator run so the phase operation can defer
    /// its own status posting to the runner.
    pub orchestrator_id: String,
    /// Set on the final transient retry: disable optional accelerators.
    pub fallback: bool,
    /// Raw findings payload, present only for quality-loop fix attempts.
    pub findings: Option<String>,
}

/// Coarse result of one phase invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

/// What a phase reported, without interpretation of its content.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub status: OutcomeStatus,
    pub error: Option<String>,
    /// Structured findings from a review-type failure, carried verbatim.
    pub findings: Option<String>,
    pub acceptance: Option<AcceptanceSummary>,
}

impl PhaseOutcome {
    pub fn completed() -> Self {
        Self {
            status: OutcomeStatus::Completed,
            error: None,
            findings: None,
            acceptance: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            error: Some(error.into()),
            findings: None,
            acceptance: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }
}

/// A failure of the invocation mechanism itself, distinct from a failure
/// reported by the phase. Retried by the runner; never sent to the loop.
#[derive(Debug, thiserror::Error)]
#[error("phase invocation failed: {0}")]
pub struct TransientInvokeError(pub String);

/// Abstraction over phase execution for testability.
/// Real implementation: [`CommandInvoker`]. Tests use scripted doubles.
#[async_trait]
pub trait PhaseInvoker: Send + Sync {
    async fn invoke(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, TransientInvokeError>;
}

// The structured verdict a phase may emit in its output.
#[derive(Debug, Deserialize)]
struct PhaseResultPayload {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    findings: Option<serde_json::Value>,
    #[serde(default)]
    acceptance: Option<AcceptanceSummary>,
}

/// Decode an invocation's output into an outcome. Pure; exercised directly
/// in tests.
pub fn decode_outcome(exit_ok: bool, stdout: &str, stderr: &str) -> PhaseOutcome {
    if let Some(payload) = PHASE_RESULT_REGEX
        .captures(stdout)
        .and_then(|cap| cap.get(1))
        .and_then(|m| serde_json::from_str::<PhaseResultPayload>(m.as_str()).ok())
    {
        let status = if payload.status == "completed" && exit_ok {
            OutcomeStatus::Completed
        } else {
            OutcomeStatus::Failed
        };
        return PhaseOutcome {
            status,
            error: payload.error,
            findings: payload.findings.map(|f| f.to_string()),
            acceptance: payload.acceptance,
        };
    }

    if exit_ok {
        PhaseOutcome::completed()
    } else {
        let tail: String = stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        PhaseOutcome::failed(if tail.is_empty() {
            "phase exited nonzero without output".to_string()
        } else {
            tail
        })
    }
}

/// Invoker that spawns the configured phase command as a subprocess.
pub struct CommandInvoker {
    phase_cmd: String,
    phase_args: Vec<String>,
}

impl CommandInvoker {
    pub fn new(phase_cmd: &str, phase_args: Vec<String>) -> Self {
        Self {
            phase_cmd: phase_cmd.to_string(),
            phase_args,
        }
    }
}

#[async_trait]
impl PhaseInvoker for CommandInvoker {
    async fn invoke(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, TransientInvokeError> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.phase_cmd);
        for arg in &self.phase_args {
            cmd.arg(arg);
        }
        cmd.arg(ctx.phase.as_str())
            .arg(ctx.issue_id.to_string())
            .current_dir(&ctx.workspace)
            .env("DROVER_ISSUE", ctx.issue_id.to_string())
            .env("DROVER_PHASE", ctx.phase.as_str())
            .env("DROVER_WORKSPACE", &ctx.workspace)
            .env("DROVER_ORCHESTRATOR", &ctx.orchestrator_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // An aborted run drops this future; the phase process must not
            // outlive it.
            .kill_on_drop(true);

        if ctx.fallback {
            cmd.env("DROVER_NO_ACCEL", "1");
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TransientInvokeError(format!("failed to spawn {}: {}", self.phase_cmd, e)))?;

        // Fix attempts receive the findings payload on stdin.
        if let Some(findings) = &ctx.findings
            && let Some(mut stdin) = child.stdin.take()
        {
            let _ = stdin.write_all(findings.as_bytes()).await;
            let _ = stdin.shutdown().await;
        } else {
            drop(child.stdin.take());
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for phase process")
            .map_err(|e| TransientInvokeError(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // Cold start: died almost immediately with nothing to say.
        if !output.status.success()
            && stdout.trim().is_empty()
            && start.elapsed() < COLD_START_WINDOW
        {
            return Err(TransientInvokeError(format!(
                "phase command exited {} with no output shortly after start: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Ok(decode_outcome(output.status.success(), &stdout, &stderr))
    }
}
