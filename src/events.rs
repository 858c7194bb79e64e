//! Pipeline event publishing.
//!
//! An [`EventBus`] is constructed once by the process entry point and
//! passed to whatever needs to publish — never a module-level global.
//! Observers subscribe for a receiver; teardown is dropping it.

use tokio::sync::broadcast;

use crate::phase::{PhaseName, PhaseStatus};
use crate::store::IssueStatus;

/// A pipeline milestone, published as it happens.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    IssueStarted {
        issue: i64,
        title: String,
    },
    IssueReconciled {
        issue: i64,
        status: IssueStatus,
    },
    PhaseStarted {
        issue: i64,
        phase: PhaseName,
    },
    PhaseFinished {
        issue: i64,
        phase: PhaseName,
        status: PhaseStatus,
    },
    PhaseSkipped {
        issue: i64,
        phase: PhaseName,
    },
    QualityLoopIteration {
        issue: i64,
        iteration: u32,
        max_iterations: u32,
    },
    IssueFinished {
        issue: i64,
        status: IssueStatus,
    },
    Warning {
        issue: i64,
        message: String,
    },
}

/// Broadcast channel for pipeline events, owned by the process lifecycle.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Lagging or absent subscribers are not an error.
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
