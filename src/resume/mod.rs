//! Resumption: reconstruct prior progress from tracker markers and merge
//! phase-selection signals across priority-ordered sources.

mod marker;
mod signals;

pub use marker::{
    PhaseMarker, completed_phases, extract_markers_from_text, extract_phase_plan,
    latest_status_per_phase, scan_comments, strip_code_regions,
};
pub use signals::{SelectionSources, resolve_quality_loop, select_phases};
