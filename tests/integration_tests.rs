//! Integration tests for drover.
//!
//! Library-level scenarios run full pipelines against real git
//! repositories with in-memory tracker and invoker doubles; CLI-level
//! checks go through the binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use drover::events::EventBus;
use drover::host::{HostIssue, TrackerComment, TrackerHost};
use drover::phase::{PhaseName, PhaseStatus};
use drover::resume::PhaseMarker;
use drover::runner::{PhaseContext, PhaseInvoker, PhaseOutcome, TransientInvokeError};
use drover::scheduler::{ExecutionMode, RunOptions, Scheduler};
use drover::store::{IssueStatus, IssueStore, PrRef, StoreHandle};
use drover::workspace::{WorkspaceManager, branch_name};

// ── git fixture helpers ──────────────────────────────────────────────

fn git(dir: &Path, args: &[&str]) {
    let status = StdCommand::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {:?} failed in {}", args, dir.display());
}

/// Bare origin plus a clone with one pushed commit on main.
fn setup_repo(root: &Path) -> (PathBuf, PathBuf) {
    let origin = root.join("origin.git");
    std::fs::create_dir_all(&origin).unwrap();
    git(&origin, &["init", "--bare", "-b", "main", "."]);

    let project = root.join("project");
    git(root, &["clone", origin.to_str().unwrap(), "project"]);
    git(&project, &["config", "user.name", "test"]);
    git(&project, &["config", "user.email", "test@test.com"]);
    std::fs::write(project.join("README.md"), "hello\n").unwrap();
    git(&project, &["add", "."]);
    git(&project, &["commit", "-m", "init"]);
    git(&project, &["push", "-u", "origin", "main"]);
    (origin, project)
}

// ── tracker double ───────────────────────────────────────────────────

#[derive(Default)]
struct FakeTracker {
    comments: Mutex<HashMap<i64, Vec<TrackerComment>>>,
    merged_branches: Mutex<Vec<String>>,
}

impl FakeTracker {
    fn seed_comment(&self, issue: i64, body: &str) {
        self.comments
            .lock()
            .unwrap()
            .entry(issue)
            .or_default()
            .push(TrackerComment {
                body: body.to_string(),
                created_at: chrono::Utc::now(),
            });
    }

    fn mark_branch_merged(&self, branch: &str) {
        self.merged_branches.lock().unwrap().push(branch.to_string());
    }
}

#[async_trait]
impl TrackerHost for FakeTracker {
    async fn issue(&self, number: i64) -> AnyResult<HostIssue> {
        Ok(HostIssue {
            number,
            title: format!("issue {}", number),
            body: String::new(),
            labels: vec![],
            state: "OPEN".to_string(),
        })
    }

    async fn comments(&self, number: i64) -> AnyResult<Vec<TrackerComment>> {
        Ok(self
            .comments
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or_default())
    }

    async fn post_comment(&self, number: i64, body: &str) -> AnyResult<()> {
        self.seed_comment(number, body);
        Ok(())
    }

    async fn pr_merged(&self, _pr: i64) -> AnyResult<bool> {
        Ok(false)
    }

    async fn merged_pr_for_branch(&self, branch: &str) -> AnyResult<Option<PrRef>> {
        if self.merged_branches.lock().unwrap().iter().any(|b| b == branch) {
            Ok(Some(PrRef {
                number: 500,
                url: "https://example.test/pr/500".to_string(),
            }))
        } else {
            Ok(None)
        }
    }
}

// ── invoker double ───────────────────────────────────────────────────

type FailureScript = HashMap<(i64, PhaseName), Vec<PhaseOutcome>>;

/// Invoker that commits one file per phase into the workspace so branch
/// lineage is observable, with optional scripted failures and an optional
/// side effect to fire once when a given (issue, phase) is invoked.
struct CommittingInvoker {
    calls: Mutex<Vec<(i64, PhaseName)>>,
    failures: Mutex<FailureScript>,
    on_phase: Mutex<Option<(i64, PhaseName, Box<dyn FnOnce() + Send>)>>,
}

impl CommittingInvoker {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            on_phase: Mutex::new(None),
        }
    }

    fn fail_next(&self, issue: i64, phase: PhaseName, outcome: PhaseOutcome) {
        self.failures
            .lock()
            .unwrap()
            .entry((issue, phase))
            .or_default()
            .push(outcome);
    }

    fn calls(&self) -> Vec<(i64, PhaseName)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PhaseInvoker for CommittingInvoker {
    async fn invoke(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, TransientInvokeError> {
        self.calls.lock().unwrap().push((ctx.issue_id, ctx.phase));

        {
            let mut hook = self.on_phase.lock().unwrap();
            let fires = matches!(
                hook.as_ref(),
                Some((issue, phase, _)) if *issue == ctx.issue_id && *phase == ctx.phase
            );
            if fires && let Some((_, _, side_effect)) = hook.take() {
                side_effect();
            }
        }

        if let Some(queued) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&(ctx.issue_id, ctx.phase))
            .and_then(|q| (!q.is_empty()).then(|| q.remove(0)))
        {
            return Ok(queued);
        }

        // Real work: one committed file per (issue, phase).
        let file = ctx
            .workspace
            .join(format!("issue-{}-{}.txt", ctx.issue_id, ctx.phase));
        std::fs::write(&file, "done\n").map_err(|e| TransientInvokeError(e.to_string()))?;
        for args in [
            vec!["add", "."],
            vec![
                "-c",
                "user.name=test",
                "-c",
                "user.email=test@test.com",
                "commit",
                "-m",
                "phase work",
            ],
        ] {
            let status = StdCommand::new("git")
                .args(&args)
                .current_dir(&ctx.workspace)
                .status()
                .map_err(|e| TransientInvokeError(e.to_string()))?;
            if !status.success() {
                return Err(TransientInvokeError(format!("git {:?} failed", args)));
            }
        }
        Ok(PhaseOutcome::completed())
    }
}

// ── harness ──────────────────────────────────────────────────────────

struct Harness {
    scheduler: Arc<Scheduler>,
    store: StoreHandle,
    tracker: Arc<FakeTracker>,
    invoker: Arc<CommittingInvoker>,
    project: PathBuf,
    origin: PathBuf,
    _root: TempDir,
}

fn harness() -> Harness {
    let root = TempDir::new().unwrap();
    let (origin, project) = setup_repo(root.path());
    build_harness(root, origin, project, Arc::new(FakeTracker::default()))
}

fn build_harness(
    root: TempDir,
    origin: PathBuf,
    project: PathBuf,
    tracker: Arc<FakeTracker>,
) -> Harness {
    let store_path = project.join(".drover/issues.json");
    std::fs::create_dir_all(project.join(".drover")).unwrap();
    let store = StoreHandle::spawn(IssueStore::load(&store_path).unwrap());
    let workspaces = Arc::new(WorkspaceManager::new(
        &project,
        &project.join(".drover/worktrees"),
        "main",
        vec!["master".to_string()],
        5,
    ));
    let invoker = Arc::new(CommittingInvoker::new());
    let (shutdown, _) = broadcast::channel(4);
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        tracker.clone() as Arc<dyn TrackerHost>,
        invoker.clone() as Arc<dyn PhaseInvoker>,
        workspaces,
        EventBus::new(256),
        shutdown,
        "run-integration".to_string(),
        2,
        Duration::from_secs(60),
    ));
    Harness {
        scheduler,
        store,
        tracker,
        invoker,
        project,
        origin,
        _root: root,
    }
}

fn options(mode: ExecutionMode) -> RunOptions {
    RunOptions {
        mode,
        ..RunOptions::default()
    }
}

// =============================================================================
// Pipeline scenarios
// =============================================================================

mod pipelines {
    use super::*;

    #[tokio::test]
    async fn parallel_run_reaches_ready_for_merge_with_distinct_workspaces() {
        let h = harness();
        // A sixth issue was merged externally before this run ever saw it.
        h.tracker.mark_branch_merged(&branch_name(6, "issue 6"));

        let summary = h
            .scheduler
            .run(&[1, 2, 3, 4, 5, 6], &options(ExecutionMode::Parallel))
            .await
            .unwrap();
        assert_eq!(summary.exit_code(), 0);

        let mut seen_paths = std::collections::BTreeSet::new();
        for id in 1..=5 {
            let record = h.store.get(id).await.unwrap().unwrap();
            assert_eq!(record.status, IssueStatus::ReadyForMerge, "issue {id}");
            let path = record.workspace_path.clone().unwrap();
            assert!(path.exists(), "workspace for issue {id} missing");
            assert!(seen_paths.insert(path), "workspace path reused");
            for phase in PhaseName::PIPELINE {
                assert_eq!(record.phase_status(phase), PhaseStatus::Completed);
            }
        }

        // The merged issue was reconciled without any workspace or phases.
        let merged = h.store.get(6).await.unwrap().unwrap();
        assert_eq!(merged.status, IssueStatus::Merged);
        assert!(merged.workspace_path.is_none());
        assert!(!h.invoker.calls().iter().any(|(id, _)| *id == 6));
    }

    #[tokio::test]
    async fn chained_run_links_branches_and_rebases_only_last() {
        let h = harness();

        // While issue 10 is mid-implement, the shared default branch moves.
        let origin = h.origin.clone();
        let root = h.project.parent().unwrap().to_path_buf();
        *h.invoker.on_phase.lock().unwrap() = Some((
            10,
            PhaseName::Implement,
            Box::new(move || {
                let pusher = root.join("late-pusher");
                git(&root, &["clone", origin.to_str().unwrap(), "late-pusher"]);
                git(&pusher, &["config", "user.name", "test"]);
                git(&pusher, &["config", "user.email", "test@test.com"]);
                std::fs::write(pusher.join("late.txt"), "moved on\n").unwrap();
                git(&pusher, &["add", "."]);
                git(&pusher, &["commit", "-m", "late mainline work"]);
                git(&pusher, &["push", "origin", "main"]);
            }),
        ));

        let summary = h
            .scheduler
            .run(&[10, 11, 12], &options(ExecutionMode::Chained))
            .await
            .unwrap();
        assert_eq!(summary.exit_code(), 0);

        let store = &h.store;
        let ws = |id: i64| async move {
            store
                .get(id)
                .await
                .unwrap()
                .unwrap()
                .workspace_path
                .unwrap()
        };

        // N-1 parent links: each workspace contains its predecessor's work.
        let ws11 = ws(11).await;
        assert!(ws11.join("issue-10-implement.txt").exists());
        let ws12 = ws(12).await;
        assert!(ws12.join("issue-10-implement.txt").exists());
        assert!(ws12.join("issue-11-implement.txt").exists());

        // Only the last chain member rebased onto the moved default branch.
        let ws10 = ws(10).await;
        assert!(!ws10.join("late.txt").exists(), "issue 10 must not rebase");
        assert!(!ws11.join("late.txt").exists(), "issue 11 must not rebase");
        assert!(ws12.join("late.txt").exists(), "issue 12 must rebase");
    }

    #[tokio::test]
    async fn chain_halts_after_failed_issue() {
        let h = harness();
        h.invoker.fail_next(
            11,
            PhaseName::Implement,
            PhaseOutcome::failed("cannot implement"),
        );

        let summary = h
            .scheduler
            .run(&[10, 11, 12], &options(ExecutionMode::Chained))
            .await
            .unwrap();
        assert_eq!(summary.exit_code(), 1);

        assert_eq!(
            h.store.get(11).await.unwrap().unwrap().status,
            IssueStatus::Blocked
        );
        // Issue 12 never started: the chain does not branch from a broken state.
        assert!(!h.invoker.calls().iter().any(|(id, _)| *id == 12));
        let untouched = h.store.get(12).await.unwrap().unwrap();
        assert_eq!(untouched.status, IssueStatus::NotStarted);
        assert!(untouched.phases.is_empty());
        assert!(untouched.workspace_path.is_none());
    }

    #[tokio::test]
    async fn resumption_skips_phases_completed_in_markers() {
        let h = harness();
        // Issue 20 previously completed plan and implement and failed review.
        for (phase, status) in [
            (PhaseName::Plan, PhaseStatus::Completed),
            (PhaseName::Implement, PhaseStatus::Completed),
            (PhaseName::Review, PhaseStatus::Failed),
        ] {
            h.tracker
                .seed_comment(20, &PhaseMarker::new(phase, status).render());
        }

        let summary = h
            .scheduler
            .run(&[20], &options(ExecutionMode::Sequential))
            .await
            .unwrap();
        assert_eq!(summary.exit_code(), 0);

        let invoked: Vec<PhaseName> = h
            .invoker
            .calls()
            .iter()
            .map(|(_, phase)| *phase)
            .collect();
        assert!(!invoked.contains(&PhaseName::Plan), "plan was re-invoked");
        assert!(
            !invoked.contains(&PhaseName::Implement),
            "implement was re-invoked"
        );
        // Execution starts directly at verify/review.
        assert_eq!(invoked.first(), Some(&PhaseName::Verify));
        assert!(invoked.contains(&PhaseName::Review));
    }

    #[tokio::test]
    async fn second_run_against_same_endpoint_is_idempotent() {
        let h = harness();
        let opts = options(ExecutionMode::Sequential);

        let first = h.scheduler.run(&[30], &opts).await.unwrap();
        assert_eq!(first.exit_code(), 0);
        let calls_after_first = h.invoker.calls().len();
        assert_eq!(calls_after_first, PhaseName::PIPELINE.len());

        // Markers from the first run now live in the tracker thread; the
        // second run re-invokes nothing.
        let second = h.scheduler.run(&[30], &opts).await.unwrap();
        assert_eq!(second.exit_code(), 0);
        assert_eq!(h.invoker.calls().len(), calls_after_first);
    }

    #[tokio::test]
    async fn semantic_review_failure_without_loop_blocks_issue() {
        let h = harness();
        h.invoker.fail_next(
            40,
            PhaseName::Review,
            PhaseOutcome::failed("review verdict: fail"),
        );

        let summary = h
            .scheduler
            .run(&[40], &options(ExecutionMode::Sequential))
            .await
            .unwrap();
        assert_eq!(summary.exit_code(), 1);

        let record = h.store.get(40).await.unwrap().unwrap();
        assert_eq!(record.status, IssueStatus::Blocked);
        let review = &record.phases[&PhaseName::Review];
        assert_eq!(review.error.as_deref(), Some("review verdict: fail"));
    }

    #[tokio::test]
    async fn quality_loop_fixes_review_failure_and_proceeds() {
        let h = harness();
        h.invoker.fail_next(
            41,
            PhaseName::Review,
            PhaseOutcome::failed("review verdict: fail"),
        );

        let opts = RunOptions {
            mode: ExecutionMode::Sequential,
            quality_loop: Some(true),
            ..RunOptions::default()
        };
        let summary = h.scheduler.run(&[41], &opts).await.unwrap();
        assert_eq!(summary.exit_code(), 0);

        let record = h.store.get(41).await.unwrap().unwrap();
        assert_eq!(record.status, IssueStatus::ReadyForMerge);
        assert_eq!(record.loop_iterations(), 1);

        let invoked: Vec<PhaseName> = h
            .invoker
            .calls()
            .iter()
            .map(|(_, phase)| *phase)
            .collect();
        assert!(invoked.contains(&PhaseName::QualityLoop));
    }

    #[tokio::test]
    async fn merge_confirmation_releases_workspace_and_records_pr() {
        let h = harness();
        // The branch becomes merged on the tracker only while the merge
        // phase itself runs, so preflight sees an unmerged issue.
        let tracker = h.tracker.clone();
        *h.invoker.on_phase.lock().unwrap() = Some((
            50,
            PhaseName::Merge,
            Box::new(move || {
                tracker.mark_branch_merged(&branch_name(50, "issue 50"));
            }),
        ));

        let summary = h
            .scheduler
            .run(&[50], &options(ExecutionMode::Sequential))
            .await
            .unwrap();
        assert_eq!(summary.exit_code(), 0);

        let record = h.store.get(50).await.unwrap().unwrap();
        assert_eq!(record.status, IssueStatus::Merged);
        assert_eq!(record.pr.as_ref().unwrap().number, 500);
        // Workspace destroyed after confirmed merge.
        assert!(!record.workspace_path.unwrap().exists());
    }

    #[tokio::test]
    async fn terminal_issue_skipped_without_force() {
        let h = harness();
        h.invoker.fail_next(
            60,
            PhaseName::Plan,
            PhaseOutcome::failed("no plan possible"),
        );
        let opts = options(ExecutionMode::Sequential);
        h.scheduler.run(&[60], &opts).await.unwrap();
        let calls_after_block = h.invoker.calls().len();

        // Blocked is terminal: the next run skips it entirely.
        h.scheduler.run(&[60], &opts).await.unwrap();
        assert_eq!(h.invoker.calls().len(), calls_after_block);

        // Unless forced; resumption then re-runs what never completed.
        let forced = RunOptions {
            force: true,
            ..options(ExecutionMode::Sequential)
        };
        let summary = h.scheduler.run(&[60], &forced).await.unwrap();
        assert_eq!(summary.exit_code(), 0);
        assert!(h.invoker.calls().len() > calls_after_block);
    }
}

// =============================================================================
// CLI basics
// =============================================================================

mod cli_basics {
    use assert_cmd::Command;
    use assert_cmd::cargo::cargo_bin_cmd;
    use predicates::prelude::*;

    fn drover() -> Command {
        cargo_bin_cmd!("drover")
    }

    #[test]
    fn test_help() {
        drover().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        drover().arg("--version").assert().success();
    }

    #[test]
    fn test_run_requires_issue_ids() {
        drover().arg("run").assert().failure();
    }

    #[test]
    fn test_status_without_store() {
        let dir = tempfile::tempdir().unwrap();
        drover()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No tracked issues"));
    }

    #[test]
    fn test_conflicting_mode_flags_rejected() {
        drover()
            .args(["run", "1", "--sequential", "--chain"])
            .assert()
            .failure();
    }

    #[test]
    fn test_conflicting_loop_flags_rejected() {
        drover()
            .args(["run", "1", "--quality-loop", "--no-quality-loop"])
            .assert()
            .failure();
    }
}
