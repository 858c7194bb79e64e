//! Phase-selection and quality-loop signals from multiple sources.
//!
//! Priority order, highest first: explicit invocation flags → tracker
//! labels → a prior planning recommendation → title keywords → body
//! keywords. Content-derived sources (planning comment, title, body) may
//! only ADD phases, never remove ones implied by a higher-priority source.
//! For the quality-loop toggle, explicit directives resolve strictly by
//! priority: a label beats a planning comment, a flag beats both.

use std::collections::BTreeSet;

use crate::phase::PhaseName;

/// Label carrying an explicit phase list: `drover:phases=plan,implement`.
const PHASES_LABEL_PREFIX: &str = "drover:phases=";
/// Label carrying an explicit quality-loop directive: `drover:quality-loop=on|off`.
const LOOP_LABEL_PREFIX: &str = "drover:quality-loop=";

/// Everything known about one issue at selection time.
#[derive(Debug, Clone, Default)]
pub struct SelectionSources {
    /// Explicit `--phases` from the invocation, if any.
    pub cli_phases: Option<Vec<PhaseName>>,
    /// Explicit `--quality-loop` / `--no-quality-loop` from the invocation.
    pub cli_quality_loop: Option<bool>,
    /// Raw tracker labels.
    pub labels: Vec<String>,
    /// A prior planning comment's recommendation, if one was found.
    pub planned_phases: Option<Vec<PhaseName>>,
    pub title: String,
    pub body: String,
}

/// Parse the explicit phase list out of tracker labels, if present.
fn label_phases(labels: &[String]) -> Option<Vec<PhaseName>> {
    labels.iter().find_map(|label| {
        let list = label.strip_prefix(PHASES_LABEL_PREFIX)?;
        let phases: Vec<PhaseName> = list
            .split(',')
            .filter_map(|p| p.trim().parse().ok())
            .collect();
        if phases.is_empty() { None } else { Some(phases) }
    })
}

/// Parse the explicit quality-loop directive out of tracker labels.
fn label_quality_loop(labels: &[String]) -> Option<bool> {
    labels.iter().find_map(|label| {
        match label.strip_prefix(LOOP_LABEL_PREFIX)? {
            "on" | "true" | "enabled" => Some(true),
            "off" | "false" | "disabled" => Some(false),
            _ => None,
        }
    })
}

/// Phases suggested by keyword analysis of free text. Only ever additive.
fn keyword_phases(text: &str) -> BTreeSet<PhaseName> {
    let lower = text.to_lowercase();
    let mut phases = BTreeSet::new();
    if lower.contains("test") || lower.contains("verif") {
        phases.insert(PhaseName::Verify);
    }
    if lower.contains("review") {
        phases.insert(PhaseName::Review);
    }
    if lower.contains("design") || lower.contains("plan") {
        phases.insert(PhaseName::Plan);
    }
    phases
}

fn keyword_quality_loop(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("quality loop") || lower.contains("auto-fix") || lower.contains("autofix")
}

/// Resolve the phase list for one issue.
///
/// The highest-priority explicit source (flags, then labels) defines the
/// base list; with neither present the full pipeline is the base. Planning
/// comment, title, and body may then add phases. The result is returned in
/// pipeline execution order.
pub fn select_phases(sources: &SelectionSources) -> Vec<PhaseName> {
    let explicit = sources
        .cli_phases
        .clone()
        .or_else(|| label_phases(&sources.labels));

    let mut selected: BTreeSet<PhaseName> = match explicit {
        Some(list) => list.into_iter().collect(),
        None => PhaseName::PIPELINE.into_iter().collect(),
    };

    // Content-derived sources are additive only.
    if let Some(planned) = &sources.planned_phases {
        selected.extend(planned.iter().copied());
    }
    selected.extend(keyword_phases(&sources.title));
    selected.extend(keyword_phases(&sources.body));

    // The retry phase is scheduled by the quality controller, never here.
    selected.remove(&PhaseName::QualityLoop);

    let mut ordered: Vec<PhaseName> = selected.into_iter().collect();
    ordered.sort_by_key(|p| p.pipeline_index().unwrap_or(usize::MAX));
    ordered
}

/// Resolve whether the quality loop is enabled for one issue.
///
/// Explicit directives win strictly by priority: flag > label > planning
/// recommendation. Keyword analysis can only enable the loop when no
/// explicit source spoke.
pub fn resolve_quality_loop(sources: &SelectionSources, planned_loop: Option<bool>) -> bool {
    if let Some(explicit) = sources.cli_quality_loop {
        return explicit;
    }
    if let Some(labeled) = label_quality_loop(&sources.labels) {
        return labeled;
    }
    if let Some(planned) = planned_loop {
        return planned;
    }
    keyword_quality_loop(&sources.title) || keyword_quality_loop(&sources.body)
}
