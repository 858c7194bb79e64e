//! Phase marker extraction from tracker comment threads.
//!
//! A marker is a tag-wrapped JSON payload appended to the issue's comment
//! thread when a phase finishes:
//!
//! ```text
//! <phase-marker>{"phase":"plan","status":"completed","timestamp":"..."}</phase-marker>
//! ```
//!
//! Markers are never stored locally; the thread is the source of truth, so
//! resumption works across machines. Extraction is a pure function over the
//! raw text: fenced and inline code regions are stripped first so payloads
//! quoted as documentation examples are never mistaken for live markers.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::host::TrackerComment;
use crate::phase::{PhaseName, PhaseStatus};

static MARKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<phase-marker>\s*(.*?)\s*</phase-marker>").unwrap());

static PHASE_PLAN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<phase-plan>\s*(.*?)\s*</phase-plan>").unwrap());

static FENCED_CODE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").unwrap());

static INLINE_CODE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`[^`\n]*`").unwrap());

/// One phase outcome as recorded in the tracker thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMarker {
    pub phase: PhaseName,
    pub status: PhaseStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseMarker {
    pub fn new(phase: PhaseName, status: PhaseStatus) -> Self {
        Self {
            phase,
            status,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Render the comment body carrying this marker.
    pub fn render(&self) -> String {
        // Serialization of this struct cannot fail; fall back to an empty
        // payload rather than panicking in the unlikely event it does.
        let json = serde_json::to_string(self).unwrap_or_default();
        format!(
            "Phase `{}` finished with status `{}`.\n\n<phase-marker>{}</phase-marker>",
            self.phase, self.status, json
        )
    }
}

/// Remove fenced blocks and inline code spans so markers appearing only as
/// examples are not scanned.
pub fn strip_code_regions(text: &str) -> String {
    let without_fences = FENCED_CODE_REGEX.replace_all(text, "");
    INLINE_CODE_REGEX.replace_all(&without_fences, "").into_owned()
}

/// Extract all live markers from one comment body, in order of appearance.
/// Unparsable payloads are skipped, not errors: the thread is multi-author
/// free text.
pub fn extract_markers_from_text(text: &str) -> Vec<PhaseMarker> {
    let stripped = strip_code_regions(text);
    MARKER_REGEX
        .captures_iter(&stripped)
        .filter_map(|cap| cap.get(1))
        .filter_map(|m| serde_json::from_str::<PhaseMarker>(m.as_str()).ok())
        .collect()
}

/// Extract all markers from a comment thread in chronological order.
pub fn scan_comments(comments: &[TrackerComment]) -> Vec<PhaseMarker> {
    let mut sorted: Vec<&TrackerComment> = comments.iter().collect();
    sorted.sort_by_key(|c| c.created_at);
    sorted
        .into_iter()
        .flat_map(|c| extract_markers_from_text(&c.body))
        .collect()
}

/// Collapse a chronological marker list to the most recent status per phase.
pub fn latest_status_per_phase(markers: &[PhaseMarker]) -> BTreeMap<PhaseName, PhaseMarker> {
    let mut latest = BTreeMap::new();
    for marker in markers {
        latest.insert(marker.phase, marker.clone());
    }
    latest
}

/// The "already completed" set: phases whose most recent marker says
/// completed. These are skipped on resumption.
pub fn completed_phases(markers: &[PhaseMarker]) -> BTreeMap<PhaseName, PhaseMarker> {
    latest_status_per_phase(markers)
        .into_iter()
        .filter(|(_, m)| m.status == PhaseStatus::Completed)
        .collect()
}

/// Extract a prior planning recommendation (`<phase-plan>["plan",…]</phase-plan>`)
/// from a comment thread, taking the most recent one. Lower priority than
/// explicit flags and labels; see the selection module.
pub fn extract_phase_plan(comments: &[TrackerComment]) -> Option<Vec<PhaseName>> {
    let mut sorted: Vec<&TrackerComment> = comments.iter().collect();
    sorted.sort_by_key(|c| c.created_at);
    sorted
        .into_iter()
        .rev()
        .find_map(|c| {
            let stripped = strip_code_regions(&c.body);
            PHASE_PLAN_REGEX
                .captures(&stripped)
                .and_then(|cap| cap.get(1))
                .and_then(|m| serde_json::from_str::<Vec<PhaseName>>(m.as_str()).ok())
        })
}
