//! Multi-issue scheduling: drives the phase runner across a set of issues
//! in independent-parallel, sequential, or sequential-chained mode.
//!
//! Pre-flight reconciliation advances externally-merged issues straight to
//! `merged` and skips issues already in a terminal status unless forced.
//! In chained mode each issue after the first branches from the previous
//! issue's completed branch, and the chain halts on failure rather than
//! continuing to branch from a broken state.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::errors::{PipelineError, StoreError};
use crate::events::{EventBus, PipelineEvent};
use crate::host::TrackerHost;
use crate::phase::PhaseName;
use crate::quality::QualityLoopController;
use crate::resume::{
    self, PhaseMarker, SelectionSources, completed_phases, extract_phase_plan, scan_comments,
};
use crate::runner::{PhaseInvoker, PhaseRunner};
use crate::store::{IssueStatus, IssueStore, StoreHandle};
use crate::workspace::{RebaseOutcome, Workspace, WorkspaceManager};

/// How a set of issues is driven through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One pipeline per issue, concurrently; no shared workspace.
    Parallel,
    /// One pipeline at a time, each branching from the shared default.
    Sequential,
    /// Sequential, but each issue branches from the previous issue's
    /// completed branch; strict linear dependency.
    Chained,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
            Self::Chained => "chained",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            "chained" => Ok(Self::Chained),
            _ => Err(format!("Invalid execution mode: {}", s)),
        }
    }
}

/// Invocation options for one scheduler run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: ExecutionMode,
    /// Explicit quality-loop directive from the invocation, if any.
    pub quality_loop: Option<bool>,
    pub max_loop_iterations: u32,
    /// Explicit base branch overriding the remote default.
    pub base_branch: Option<String>,
    /// Reconstruct prior progress from tracker markers.
    pub resume: bool,
    /// Re-run issues already in a terminal status.
    pub force: bool,
    /// Explicit phase subset from the invocation.
    pub phases: Option<Vec<PhaseName>>,
    /// Compute the plan without executing anything.
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Parallel,
            quality_loop: None,
            max_loop_iterations: crate::quality::DEFAULT_MAX_ITERATIONS,
            base_branch: None,
            resume: true,
            force: false,
            phases: None,
            dry_run: false,
        }
    }
}

/// Final state of one issue after a scheduler run.
#[derive(Debug, Clone)]
pub struct IssueReport {
    pub issue: i64,
    pub status: IssueStatus,
    pub error: Option<String>,
    /// The phases the run would execute; populated for dry runs.
    pub planned_phases: Option<Vec<PhaseName>>,
    /// The issue's branch, when a workspace was acquired or reused.
    pub branch: Option<String>,
}

/// Aggregate result of a scheduler run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub reports: Vec<IssueReport>,
}

impl RunSummary {
    /// Zero only if every requested issue reached a terminal non-blocked,
    /// non-abandoned state (or is still cleanly in flight, e.g. dry run).
    pub fn exit_code(&self) -> i32 {
        let any_bad = self
            .reports
            .iter()
            .any(|r| matches!(r.status, IssueStatus::Blocked | IssueStatus::Abandoned));
        if any_bad { 1 } else { 0 }
    }
}

enum Preflight {
    Run { title: String, labels: Vec<String>, body: String },
    AlreadyMerged,
    SkipTerminal(IssueStatus),
}

/// Drives issue pipelines. Construction wires every collaborator
/// explicitly; nothing here is process-global.
pub struct Scheduler {
    store: StoreHandle,
    host: Arc<dyn TrackerHost>,
    invoker: Arc<dyn PhaseInvoker>,
    workspaces: Arc<WorkspaceManager>,
    events: EventBus,
    shutdown: broadcast::Sender<()>,
    orchestrator_id: String,
    transient_retries: u32,
    retry_window: Duration,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StoreHandle,
        host: Arc<dyn TrackerHost>,
        invoker: Arc<dyn PhaseInvoker>,
        workspaces: Arc<WorkspaceManager>,
        events: EventBus,
        shutdown: broadcast::Sender<()>,
        orchestrator_id: String,
        transient_retries: u32,
        retry_window: Duration,
    ) -> Self {
        Self {
            store,
            host,
            invoker,
            workspaces,
            events,
            shutdown,
            orchestrator_id,
            transient_retries,
            retry_window,
        }
    }

    fn runner(&self) -> PhaseRunner {
        PhaseRunner::new(
            self.store.clone(),
            self.host.clone(),
            self.invoker.clone(),
            self.events.clone(),
            self.orchestrator_id.clone(),
            self.transient_retries,
            self.retry_window,
            self.shutdown.clone(),
        )
    }

    /// Run the requested issues under the given options.
    pub async fn run(self: &Arc<Self>, issue_ids: &[i64], options: &RunOptions) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut runnable: Vec<(i64, String, Vec<String>, String)> = Vec::new();

        for &id in issue_ids {
            match self.preflight(id, options).await? {
                Preflight::AlreadyMerged => {
                    info!(issue = id, "already merged externally; reconciled");
                    self.events.publish(PipelineEvent::IssueReconciled {
                        issue: id,
                        status: IssueStatus::Merged,
                    });
                    summary.reports.push(IssueReport {
                        issue: id,
                        status: IssueStatus::Merged,
                        error: None,
                        planned_phases: None,
                        branch: None,
                    });
                }
                Preflight::SkipTerminal(status) => {
                    info!(issue = id, %status, "terminal status; skipping (use --force to re-run)");
                    summary.reports.push(IssueReport {
                        issue: id,
                        status,
                        error: None,
                        planned_phases: None,
                        branch: None,
                    });
                }
                Preflight::Run { title, labels, body } => {
                    runnable.push((id, title, labels, body));
                }
            }
        }

        if options.dry_run {
            for (id, title, labels, body) in runnable {
                let plan = self.plan_issue(id, &title, &labels, &body, options).await;
                let status = self
                    .store
                    .get(id)
                    .await?
                    .map(|r| r.status)
                    .unwrap_or(IssueStatus::NotStarted);
                summary.reports.push(IssueReport {
                    issue: id,
                    status,
                    error: None,
                    planned_phases: Some(plan),
                    branch: None,
                });
            }
            return Ok(summary);
        }

        match options.mode {
            ExecutionMode::Parallel => {
                let mut handles = Vec::new();
                for (id, title, labels, body) in runnable {
                    let scheduler = Arc::clone(self);
                    let options = options.clone();
                    handles.push(tokio::spawn(async move {
                        scheduler
                            .run_issue(id, &title, &labels, &body, &options, None, true)
                            .await
                    }));
                }
                for handle in handles {
                    match handle.await {
                        Ok(report) => summary.reports.push(report),
                        Err(join_err) => {
                            warn!(error = %join_err, "issue pipeline task panicked");
                        }
                    }
                }
            }
            ExecutionMode::Sequential => {
                for (id, title, labels, body) in runnable {
                    let report = self
                        .run_issue(id, &title, &labels, &body, options, None, true)
                        .await;
                    summary.reports.push(report);
                }
            }
            ExecutionMode::Chained => {
                let total = runnable.len();
                let mut base: Option<String> = None;
                for (index, (id, title, labels, body)) in runnable.into_iter().enumerate() {
                    let is_last = index + 1 == total;
                    let report = self
                        .run_issue(id, &title, &labels, &body, options, base.as_deref(), is_last)
                        .await;
                    let failed = matches!(
                        report.status,
                        IssueStatus::Blocked | IssueStatus::Abandoned
                    ) || report.error.is_some();
                    let branch = report.branch.clone();
                    summary.reports.push(report);
                    if failed {
                        warn!(issue = id, "chain halted; not branching from a broken state");
                        break;
                    }
                    base = branch;
                }
            }
        }

        Ok(summary)
    }

    /// Pre-flight reconciliation for one issue.
    async fn preflight(&self, id: i64, options: &RunOptions) -> Result<Preflight, StoreError> {
        // Tracker-unreachable degrades to local knowledge only.
        let host_issue = match self.host.issue(id).await {
            Ok(issue) => Some(issue),
            Err(e) => {
                warn!(issue = id, error = %e, "tracker unreachable; proceeding from local state");
                None
            }
        };

        let title = host_issue
            .as_ref()
            .map(|i| i.title.clone())
            .unwrap_or_else(|| format!("issue-{}", id));
        let record = self.store.upsert(id, &title).await?;

        // Already merged externally since last tracked? Issues never run
        // before have no recorded branch; the deterministic branch name
        // still lets reconciliation find their merged PR.
        let branch_hint = Some(
            record
                .branch
                .clone()
                .unwrap_or_else(|| crate::workspace::branch_name(id, &title)),
        );
        if record.merged_at.is_some() || self.confirm_merged(&record.pr, &branch_hint).await {
            if record.merged_at.is_none() {
                self.store.update(id, |r| r.mark_merged()).await?;
                self.release_recorded_workspace(id).await;
            }
            return Ok(Preflight::AlreadyMerged);
        }

        if record.status.is_terminal() && !options.force {
            return Ok(Preflight::SkipTerminal(record.status));
        }

        Ok(Preflight::Run {
            title,
            labels: host_issue.as_ref().map(|i| i.labels.clone()).unwrap_or_default(),
            body: host_issue.map(|i| i.body).unwrap_or_default(),
        })
    }

    /// External merge confirmation; conservative on tracker failure.
    async fn confirm_merged(
        &self,
        pr: &Option<crate::store::PrRef>,
        branch: &Option<String>,
    ) -> bool {
        if let Some(pr) = pr {
            return self.host.pr_merged(pr.number).await.unwrap_or(false);
        }
        if let Some(branch) = branch {
            return matches!(self.host.merged_pr_for_branch(branch).await, Ok(Some(_)));
        }
        false
    }

    async fn release_recorded_workspace(&self, id: i64) {
        let Ok(Some(record)) = self.store.get(id).await else {
            return;
        };
        if let (Some(path), Some(branch)) = (record.workspace_path, record.branch) {
            let ws = Workspace {
                issue_id: id,
                path,
                branch,
            };
            if let Err(e) = self.workspaces.release(&ws).await {
                warn!(issue = id, error = %e, "workspace release failed");
            }
        }
    }

    /// Resolve the phase plan for one issue: resumption set + selection
    /// signals. Tracker failure degrades to "start fresh".
    async fn plan_issue(
        &self,
        id: i64,
        title: &str,
        labels: &[String],
        body: &str,
        options: &RunOptions,
    ) -> Vec<PhaseName> {
        let (completed, planned) = self.resume_state(id, options).await;
        let sources = SelectionSources {
            cli_phases: options.phases.clone(),
            cli_quality_loop: options.quality_loop,
            labels: labels.to_vec(),
            planned_phases: planned,
            title: title.to_string(),
            body: body.to_string(),
        };
        resume::select_phases(&sources)
            .into_iter()
            .filter(|p| !completed.contains_key(p))
            .collect()
    }

    async fn resume_state(
        &self,
        id: i64,
        options: &RunOptions,
    ) -> (
        std::collections::BTreeMap<PhaseName, PhaseMarker>,
        Option<Vec<PhaseName>>,
    ) {
        if !options.resume {
            return (Default::default(), None);
        }
        match self.host.comments(id).await {
            Ok(comments) => {
                let markers = scan_comments(&comments);
                (completed_phases(&markers), extract_phase_plan(&comments))
            }
            Err(e) => {
                warn!(issue = id, error = %e, "tracker unreachable; resumption starts fresh");
                (Default::default(), None)
            }
        }
    }

    /// Drive one issue's pipeline to a terminal report. Phases execute
    /// strictly sequentially; a phase never starts before its
    /// predecessor's outcome is recorded.
    #[allow(clippy::too_many_arguments)]
    async fn run_issue(
        &self,
        id: i64,
        title: &str,
        labels: &[String],
        body: &str,
        options: &RunOptions,
        chain_base: Option<&str>,
        do_premerge_rebase: bool,
    ) -> IssueReport {
        self.events.publish(PipelineEvent::IssueStarted {
            issue: id,
            title: title.to_string(),
        });

        let (completed, planned) = self.resume_state(id, options).await;
        let sources = SelectionSources {
            cli_phases: options.phases.clone(),
            cli_quality_loop: options.quality_loop,
            labels: labels.to_vec(),
            planned_phases: planned.clone(),
            title: title.to_string(),
            body: body.to_string(),
        };
        let phases = resume::select_phases(&sources);
        let loop_enabled = resume::resolve_quality_loop(&sources, None);

        let base = options.base_branch.as_deref().or(chain_base);
        let workspace = match self.workspaces.acquire(id, title, base).await {
            Ok(ws) => ws,
            Err(e) => {
                let err = PipelineError::Workspace { issue: id, source: e };
                warn!(issue = id, error = %err, "workspace acquisition failed");
                return self.report(id, Some(err.to_string()), None).await;
            }
        };
        if let Err(e) = self.workspaces.guard(&workspace).await {
            let err = PipelineError::Workspace { issue: id, source: e };
            warn!(issue = id, error = %err, "protected branch guard refused");
            return self.report(id, Some(err.to_string()), Some(workspace.branch)).await;
        }

        {
            let path = workspace.path.clone();
            let branch = workspace.branch.clone();
            if let Err(e) = self
                .store
                .update(id, move |r| {
                    r.workspace_path = Some(path.clone());
                    r.branch = Some(branch.clone());
                })
                .await
            {
                return self
                    .report(id, Some(e.to_string()), Some(workspace.branch))
                    .await;
            }
        }

        let runner = self.runner();
        let controller = QualityLoopController::new(
            self.store.clone(),
            self.events.clone(),
            options.max_loop_iterations,
        );

        for phase in phases {
            if let Some(marker) = completed.get(&phase) {
                if runner.record_resumed(id, marker).await.is_err() {
                    break;
                }
                continue;
            }

            if phase == PhaseName::Merge {
                if !do_premerge_rebase {
                    // Intermediate chain member: its branch is the next
                    // issue's base, so it must not move onto the default.
                } else {
                    match self.workspaces.pre_merge_rebase(&workspace).await {
                        Ok(RebaseOutcome::Clean) => {}
                        Ok(RebaseOutcome::Conflicted) => {
                            let message = format!(
                                "pre-merge rebase of {} hit conflicts; branch left at its pre-rebase state",
                                workspace.branch
                            );
                            self.events.publish(PipelineEvent::Warning {
                                issue: id,
                                message: message.clone(),
                            });
                            warn!(issue = id, "{message}");
                            // Last good state: stop before the merge phase.
                            break;
                        }
                        Err(e) => {
                            let err = PipelineError::Workspace { issue: id, source: e };
                            warn!(issue = id, error = %err, "pre-merge rebase failed");
                            break;
                        }
                    }
                }
            }

            let outcome = match runner.run_phase(id, phase, &workspace, None).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    return self
                        .report(id, Some(e.to_string()), Some(workspace.branch))
                        .await;
                }
            };

            if !outcome.is_completed() {
                if phase.is_review_type() && loop_enabled {
                    match controller.run(&runner, id, phase, &workspace, outcome).await {
                        Ok(_) => continue,
                        Err(e) => {
                            return self
                                .report(id, Some(e.to_string()), Some(workspace.branch))
                                .await;
                        }
                    }
                }
                let error = outcome.error.unwrap_or_else(|| format!("{} failed", phase));
                return self.report(id, Some(error), Some(workspace.branch)).await;
            }

            if phase == PhaseName::Merge {
                self.confirm_and_release(id, &workspace).await;
            }
        }

        self.report(id, None, Some(workspace.branch)).await
    }

    /// After the merge phase completes, confirm the merge externally and
    /// release the workspace. Unconfirmed merges keep the workspace;
    /// reconciliation picks them up on the next run.
    async fn confirm_and_release(&self, id: i64, workspace: &Workspace) {
        let pr = match self.host.merged_pr_for_branch(&workspace.branch).await {
            Ok(pr) => pr,
            Err(e) => {
                warn!(issue = id, error = %e, "merge confirmation unavailable; assuming not merged");
                None
            }
        };
        let Some(pr) = pr else { return };

        let update = self
            .store
            .update(id, move |r| {
                r.pr = Some(pr.clone());
                r.mark_merged();
            })
            .await;
        if update.is_err() {
            return;
        }
        if let Err(e) = self.workspaces.release(workspace).await {
            warn!(issue = id, error = %e, "workspace release after merge failed");
        }
    }

    async fn report(&self, id: i64, error: Option<String>, branch: Option<String>) -> IssueReport {
        let status = self
            .store
            .get(id)
            .await
            .ok()
            .flatten()
            .map(|r| r.status)
            .unwrap_or(IssueStatus::NotStarted);
        self.events.publish(PipelineEvent::IssueFinished { issue: id, status });
        IssueReport {
            issue: id,
            status,
            error,
            planned_phases: None,
            branch,
        }
    }
}

/// Load the issue store, or rebuild it from tracker markers when the
/// document is corrupt. Any other load failure is fatal.
pub async fn load_or_rebuild_store(
    path: &std::path::Path,
    issue_ids: &[i64],
    host: &Arc<dyn TrackerHost>,
) -> Result<IssueStore> {
    match IssueStore::load(path) {
        Ok(store) => Ok(store),
        Err(StoreError::Corrupt { path: p, message }) => {
            warn!(path = %p.display(), %message, "issue store corrupt; rebuilding from markers");
            let mut issues = Vec::new();
            for &id in issue_ids {
                let title = match host.issue(id).await {
                    Ok(issue) => issue.title,
                    Err(_) => format!("issue-{}", id),
                };
                let markers = match host.comments(id).await {
                    Ok(comments) => scan_comments(&comments),
                    Err(e) => {
                        warn!(issue = id, error = %e, "no markers available during rebuild");
                        Vec::new()
                    }
                };
                issues.push((id, title, markers));
            }
            Ok(IssueStore::rebuild(path, issues))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostIssue, TrackerComment};
    use crate::phase::PhaseStatus;
    use crate::runner::{PhaseContext, PhaseOutcome, TransientInvokeError};
    use crate::store::PrRef;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct StaticHost {
        issue_state: String,
        merged_prs: Vec<i64>,
        merged_branches: Mutex<Vec<String>>,
        comments: Vec<TrackerComment>,
        unreachable: bool,
    }

    impl StaticHost {
        fn new() -> Self {
            Self {
                issue_state: "OPEN".to_string(),
                merged_prs: vec![],
                merged_branches: Mutex::new(vec![]),
                comments: vec![],
                unreachable: false,
            }
        }
    }

    #[async_trait]
    impl TrackerHost for StaticHost {
        async fn issue(&self, number: i64) -> AnyResult<HostIssue> {
            if self.unreachable {
                anyhow::bail!("tracker unreachable");
            }
            Ok(HostIssue {
                number,
                title: format!("issue {}", number),
                body: String::new(),
                labels: vec![],
                state: self.issue_state.clone(),
            })
        }
        async fn comments(&self, _: i64) -> AnyResult<Vec<TrackerComment>> {
            if self.unreachable {
                anyhow::bail!("tracker unreachable");
            }
            Ok(self.comments.clone())
        }
        async fn post_comment(&self, _: i64, _: &str) -> AnyResult<()> {
            Ok(())
        }
        async fn pr_merged(&self, pr: i64) -> AnyResult<bool> {
            Ok(self.merged_prs.contains(&pr))
        }
        async fn merged_pr_for_branch(&self, branch: &str) -> AnyResult<Option<PrRef>> {
            if self.merged_branches.lock().unwrap().iter().any(|b| b == branch) {
                Ok(Some(PrRef {
                    number: 99,
                    url: "https://example.test/pr/99".to_string(),
                }))
            } else {
                Ok(None)
            }
        }
    }

    struct NoopInvoker;

    #[async_trait]
    impl PhaseInvoker for NoopInvoker {
        async fn invoke(&self, _: &PhaseContext) -> Result<PhaseOutcome, TransientInvokeError> {
            Ok(PhaseOutcome::completed())
        }
    }

    fn scheduler_with(host: StaticHost, dir: &tempfile::TempDir) -> Arc<Scheduler> {
        let store = StoreHandle::spawn(IssueStore::load(&dir.path().join("issues.json")).unwrap());
        let (shutdown, _) = broadcast::channel(4);
        let workspaces = Arc::new(WorkspaceManager::new(
            dir.path(),
            &dir.path().join("worktrees"),
            "main",
            vec![],
            5,
        ));
        Arc::new(Scheduler::new(
            store,
            Arc::new(host),
            Arc::new(NoopInvoker),
            workspaces,
            EventBus::new(64),
            shutdown,
            "run-test".to_string(),
            2,
            Duration::from_secs(60),
        ))
    }

    // ── mode & summary plumbing ──────────────────────────────────────

    #[test]
    fn test_execution_mode_roundtrip() {
        for s in &["parallel", "sequential", "chained"] {
            let parsed: ExecutionMode = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("waves".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_exit_code_zero_when_clean() {
        let summary = RunSummary {
            reports: vec![
                IssueReport {
                    issue: 1,
                    status: IssueStatus::Merged,
                    error: None,
                    planned_phases: None,
                    branch: None,
                },
                IssueReport {
                    issue: 2,
                    status: IssueStatus::ReadyForMerge,
                    error: None,
                    planned_phases: None,
                    branch: None,
                },
            ],
        };
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn test_exit_code_nonzero_on_blocked_or_abandoned() {
        for status in [IssueStatus::Blocked, IssueStatus::Abandoned] {
            let summary = RunSummary {
                reports: vec![IssueReport {
                    issue: 1,
                    status,
                    error: None,
                    planned_phases: None,
                    branch: None,
                }],
            };
            assert_eq!(summary.exit_code(), 1, "{status} must fail the run");
        }
    }

    // ── preflight reconciliation ─────────────────────────────────────

    #[tokio::test]
    async fn test_preflight_reconciles_externally_merged_pr() {
        let dir = tempdir().unwrap();
        let mut host = StaticHost::new();
        host.merged_prs.push(7);
        let scheduler = scheduler_with(host, &dir);

        // Seed a record that tracked PR 7 before it merged externally.
        scheduler.store.upsert(10, "issue 10").await.unwrap();
        scheduler
            .store
            .update(10, |r| {
                r.pr = Some(PrRef {
                    number: 7,
                    url: "u".to_string(),
                });
            })
            .await
            .unwrap();

        let options = RunOptions::default();
        match scheduler.preflight(10, &options).await.unwrap() {
            Preflight::AlreadyMerged => {}
            _ => panic!("expected merged reconciliation"),
        }
        let record = scheduler.store.get(10).await.unwrap().unwrap();
        assert_eq!(record.status, IssueStatus::Merged);
    }

    #[tokio::test]
    async fn test_preflight_skips_terminal_unless_forced() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler_with(StaticHost::new(), &dir);

        scheduler.store.upsert(11, "issue 11").await.unwrap();
        scheduler
            .store
            .update(11, |r| {
                r.phase_mut(PhaseName::Plan).begin();
                r.phase_mut(PhaseName::Plan).fail("dead end");
            })
            .await
            .unwrap();

        let options = RunOptions::default();
        match scheduler.preflight(11, &options).await.unwrap() {
            Preflight::SkipTerminal(IssueStatus::Blocked) => {}
            other => panic!("expected terminal skip, got {:?}", matches_name(&other)),
        }

        let forced = RunOptions {
            force: true,
            ..RunOptions::default()
        };
        match scheduler.preflight(11, &forced).await.unwrap() {
            Preflight::Run { .. } => {}
            other => panic!("expected forced run, got {:?}", matches_name(&other)),
        }
    }

    #[tokio::test]
    async fn test_preflight_unreachable_tracker_assumes_not_merged() {
        let dir = tempdir().unwrap();
        let mut host = StaticHost::new();
        host.unreachable = true;
        let scheduler = scheduler_with(host, &dir);

        let options = RunOptions::default();
        match scheduler.preflight(12, &options).await.unwrap() {
            Preflight::Run { title, .. } => assert_eq!(title, "issue-12"),
            other => panic!("expected degraded run, got {:?}", matches_name(&other)),
        }
    }

    fn matches_name(p: &Preflight) -> &'static str {
        match p {
            Preflight::Run { .. } => "Run",
            Preflight::AlreadyMerged => "AlreadyMerged",
            Preflight::SkipTerminal(_) => "SkipTerminal",
        }
    }

    // ── dry run ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_dry_run_plans_without_executing() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler_with(StaticHost::new(), &dir);

        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let summary = scheduler.run(&[21], &options).await.unwrap();
        assert_eq!(summary.reports.len(), 1);
        let planned = summary.reports[0].planned_phases.as_ref().unwrap();
        assert_eq!(planned, &PhaseName::PIPELINE.to_vec());
        // Nothing executed: record still has no phase entries.
        let record = scheduler.store.get(21).await.unwrap().unwrap();
        assert!(record.phases.is_empty());
    }

    // ── store rebuild path ───────────────────────────────────────────

    #[tokio::test]
    async fn test_load_or_rebuild_recovers_from_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.json");
        std::fs::write(&path, "}{ definitely not json").unwrap();

        let marker = crate::resume::PhaseMarker::new(PhaseName::Plan, PhaseStatus::Completed);
        let mut host = StaticHost::new();
        host.comments = vec![TrackerComment {
            body: marker.render(),
            created_at: chrono::Utc::now(),
        }];
        let host: Arc<dyn TrackerHost> = Arc::new(host);

        let store = load_or_rebuild_store(&path, &[42], &host).await.unwrap();
        let record = &store.document().issues[&42];
        assert_eq!(record.phase_status(PhaseName::Plan), PhaseStatus::Completed);
    }
}
