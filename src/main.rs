use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use tokio::sync::broadcast;

use drover::config::Config;
use drover::events::{EventBus, PipelineEvent};
use drover::host::{GhHost, TrackerHost};
use drover::phase::PhaseName;
use drover::quality::QualityLoopController;
use drover::runner::CommandInvoker;
use drover::scheduler::{ExecutionMode, RunOptions, Scheduler, load_or_rebuild_store};
use drover::store::{IssueStore, StoreHandle};
use drover::workspace::WorkspaceManager;

#[derive(Parser)]
#[command(name = "drover")]
#[command(version, about = "Issue pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive issues through the phase pipeline
    Run {
        /// Issue identifiers from the external tracker
        #[arg(required = true)]
        issue_ids: Vec<i64>,

        /// Run pipelines one at a time instead of in parallel
        #[arg(long)]
        sequential: bool,

        /// Sequential, with each issue branching from the previous issue's
        /// completed branch
        #[arg(long, conflicts_with = "sequential")]
        chain: bool,

        /// Base branch overriding the remote default
        #[arg(long)]
        base_branch: Option<String>,

        /// Enable the bounded quality loop for review failures
        #[arg(long)]
        quality_loop: bool,

        /// Disable the quality loop regardless of labels or comments
        #[arg(long, conflicts_with = "quality_loop")]
        no_quality_loop: bool,

        /// Maximum quality-loop iterations before an issue is blocked
        #[arg(long, default_value = "3")]
        max_loop_iterations: u32,

        /// Do not reconstruct prior progress from tracker markers
        #[arg(long)]
        no_resume: bool,

        /// Re-run issues already in a terminal status
        #[arg(long)]
        force: bool,

        /// Comma-separated phase subset (e.g. "plan,implement")
        #[arg(long)]
        phases: Option<String>,

        /// Compute the plan without executing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Show stored pipeline state
    Status {
        /// Limit output to one issue
        issue_id: Option<i64>,
    },
    /// Abandon an issue: every non-completed phase is marked skipped
    Abandon { issue_id: i64 },
    /// Reset a blocked issue's quality-loop counter so it may retry
    ResetLoop { issue_id: i64 },
}

fn parse_phase_list(raw: &str) -> Result<Vec<PhaseName>> {
    raw.split(',')
        .map(|p| {
            p.trim()
                .parse::<PhaseName>()
                .map_err(|e| anyhow::anyhow!(e))
        })
        .collect()
}

/// Print pipeline events as they happen. Returns when the bus closes.
async fn print_events(mut rx: broadcast::Receiver<PipelineEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            PipelineEvent::IssueStarted { issue, title } => {
                println!("{} #{} {}", style("▶").cyan(), issue, style(title).bold());
            }
            PipelineEvent::IssueReconciled { issue, status } => {
                println!(
                    "{} #{} already {} externally",
                    style("✓").green(),
                    issue,
                    status
                );
            }
            PipelineEvent::PhaseStarted { issue, phase } => {
                println!("  #{} {} {}", issue, style("phase").dim(), phase);
            }
            PipelineEvent::PhaseFinished { issue, phase, status } => {
                let mark = match status {
                    drover::phase::PhaseStatus::Completed => style("✓").green(),
                    drover::phase::PhaseStatus::Failed => style("✗").red(),
                    _ => style("·").dim(),
                };
                println!("  #{} {} {} {}", issue, mark, phase, style(status).dim());
            }
            PipelineEvent::PhaseSkipped { issue, phase } => {
                println!(
                    "  #{} {} {} {}",
                    issue,
                    style("↷").dim(),
                    phase,
                    style("already completed (marker)").dim()
                );
            }
            PipelineEvent::QualityLoopIteration {
                issue,
                iteration,
                max_iterations,
            } => {
                println!(
                    "  #{} {} iteration {}/{}",
                    issue,
                    style("quality loop").yellow(),
                    iteration,
                    max_iterations
                );
            }
            PipelineEvent::IssueFinished { issue, status } => {
                println!("{} #{} {}", style("■").cyan(), issue, style(status).bold());
            }
            PipelineEvent::Warning { issue, message } => {
                println!("  #{} {} {}", issue, style("warning:").yellow(), message);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    config: &Config,
    issue_ids: &[i64],
    mode: ExecutionMode,
    base_branch: Option<String>,
    quality_loop: Option<bool>,
    max_loop_iterations: u32,
    resume: bool,
    force: bool,
    phases: Option<Vec<PhaseName>>,
    dry_run: bool,
) -> Result<i32> {
    config.ensure_directories()?;

    let host: Arc<dyn TrackerHost> = Arc::new(GhHost::new(
        &config.toml.tracker.gh_cmd,
        &config.project_dir,
    ));
    let store = load_or_rebuild_store(&config.store_path, issue_ids, &host).await?;
    let store = StoreHandle::spawn(store);

    let workspaces = Arc::new(WorkspaceManager::new(
        &config.project_dir,
        &config.worktrees_dir,
        &config.toml.workspace.default_branch,
        config.toml.workspace.protected_branches.clone(),
        config.toml.workspace.staleness_threshold,
    ));
    let invoker = Arc::new(CommandInvoker::new(
        &config.toml.phases.cmd,
        config.toml.phases.args.clone(),
    ));

    let events = EventBus::new(256);
    let printer = tokio::spawn(print_events(events.subscribe()));

    // Operator abort: mark the in-flight phase failed before exiting.
    let (shutdown, _) = broadcast::channel(4);
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", style("interrupt received; aborting in-flight phases").red());
                let _ = shutdown.send(());
            }
        });
    }

    let quality_loop = quality_loop.or(if config.toml.quality.enabled {
        Some(true)
    } else {
        None
    });

    let options = RunOptions {
        mode,
        quality_loop,
        max_loop_iterations,
        base_branch,
        resume,
        force,
        phases,
        dry_run,
    };

    let scheduler = Arc::new(Scheduler::new(
        store,
        host,
        invoker,
        workspaces,
        events.clone(),
        shutdown,
        uuid::Uuid::new_v4().to_string(),
        config.toml.phases.transient_retries,
        config.retry_window(),
    ));

    let summary = scheduler.run(issue_ids, &options).await?;
    drop(scheduler);
    drop(events);
    let _ = printer.await;

    println!();
    for report in &summary.reports {
        let status_styled = match report.status {
            drover::store::IssueStatus::Blocked | drover::store::IssueStatus::Abandoned => {
                style(report.status.to_string()).red().bold()
            }
            drover::store::IssueStatus::Merged
            | drover::store::IssueStatus::ReadyForMerge => {
                style(report.status.to_string()).green().bold()
            }
            _ => style(report.status.to_string()).bold(),
        };
        print!("#{}: {}", report.issue, status_styled);
        if let Some(planned) = &report.planned_phases {
            let names: Vec<&str> = planned.iter().map(|p| p.as_str()).collect();
            print!("  plan: [{}]", names.join(", "));
        }
        if let Some(error) = &report.error {
            print!("  {}", style(error).red());
        }
        println!();
    }

    Ok(summary.exit_code())
}

fn cmd_status(config: &Config, issue_id: Option<i64>) -> Result<()> {
    let store = IssueStore::load(&config.store_path)
        .context("Cannot read issue store (run `drover run` first)")?;
    let doc = store.document();

    let issues: Vec<_> = doc
        .issues
        .values()
        .filter(|r| issue_id.is_none_or(|id| r.id == id))
        .collect();
    if issues.is_empty() {
        println!("No tracked issues.");
        return Ok(());
    }

    for record in issues {
        println!(
            "#{} {} — {}",
            record.id,
            style(&record.title).bold(),
            style(record.status).cyan()
        );
        for (phase, pr) in &record.phases {
            let iteration = pr
                .iteration
                .map(|i| format!(" (iteration {})", i))
                .unwrap_or_default();
            let error = pr
                .error
                .as_deref()
                .map(|e| format!(" — {}", e))
                .unwrap_or_default();
            println!("    {:<13} {}{}{}", phase.to_string(), pr.status, iteration, error);
        }
        if let Some(pr) = &record.pr {
            println!("    pr: #{} {}", pr.number, pr.url);
        }
        if let Some(branch) = &record.branch {
            println!("    branch: {}", branch);
        }
        if let Some(ac) = &record.acceptance {
            println!(
                "    acceptance: {} met, {} not met, {} pending, {} blocked",
                ac.met, ac.not_met, ac.pending, ac.blocked
            );
        }
    }
    Ok(())
}

async fn cmd_abandon(config: &Config, issue_id: i64) -> Result<()> {
    config.ensure_directories()?;
    let store = StoreHandle::spawn(IssueStore::load(&config.store_path)?);
    let record = store.update(issue_id, |r| r.abandon()).await?;
    println!(
        "#{} abandoned ({} phases skipped)",
        issue_id,
        record
            .phases
            .values()
            .filter(|p| p.status == drover::phase::PhaseStatus::Skipped)
            .count()
    );
    Ok(())
}

async fn cmd_reset_loop(config: &Config, issue_id: i64) -> Result<()> {
    config.ensure_directories()?;
    let store = StoreHandle::spawn(IssueStore::load(&config.store_path)?);
    let controller = QualityLoopController::new(
        store,
        EventBus::new(16),
        config.toml.quality.max_iterations,
    );
    controller.reset(issue_id).await?;
    println!("#{} quality-loop counter reset", issue_id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "warn" })
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::new(project_dir, cli.verbose)?;

    match &cli.command {
        Commands::Run {
            issue_ids,
            sequential,
            chain,
            base_branch,
            quality_loop,
            no_quality_loop,
            max_loop_iterations,
            no_resume,
            force,
            phases,
            dry_run,
        } => {
            let mode = if *chain {
                ExecutionMode::Chained
            } else if *sequential {
                ExecutionMode::Sequential
            } else {
                ExecutionMode::Parallel
            };
            let quality = if *quality_loop {
                Some(true)
            } else if *no_quality_loop {
                Some(false)
            } else {
                None
            };
            let phase_subset = phases.as_deref().map(parse_phase_list).transpose()?;

            let code = cmd_run(
                &config,
                issue_ids,
                mode,
                base_branch.clone(),
                quality,
                *max_loop_iterations,
                !*no_resume,
                *force,
                phase_subset,
                *dry_run,
            )
            .await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Status { issue_id } => cmd_status(&config, *issue_id)?,
        Commands::Abandon { issue_id } => cmd_abandon(&config, *issue_id).await?,
        Commands::ResetLoop { issue_id } => cmd_reset_loop(&config, *issue_id).await?,
    }

    Ok(())
}
