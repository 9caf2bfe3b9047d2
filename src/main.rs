//! Flowplan CLI entry point

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowplan::config::parse_duration;
use flowplan::core::{graph, JobStatus, JobStore};
use flowplan::worktree::StdinPrompt;
use flowplan::{
    ExecutorRegistry, FlowError, GitCli, HookRegistry, LogHook, OrchestratorConfig, Plan,
    RunReport, Scheduler, WorktreeManager,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "flowplan", version, about = "Run DAG plans of markdown job files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every job in a plan directory until done or blocked
    Run {
        plan_dir: PathBuf,
        /// Overrides max_parallel_jobs from the config files
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Git repository that worktrees are created from
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// Show job statuses and the remaining execution stages
    Status {
        plan_dir: PathBuf,
        /// Print the status summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the dependency graph as a mermaid diagram
    Graph { plan_dir: PathBuf },
    /// Mark a detached job completed
    Complete {
        job_file: PathBuf,
        #[arg(long)]
        output: Option<String>,
    },
    /// Mark a detached job failed
    Fail {
        job_file: PathBuf,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Remove unlocked worktrees older than --age
    CleanupWorktrees {
        repo: PathBuf,
        #[arg(long, default_value = "24h", value_parser = parse_duration)]
        age: Duration,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            plan_dir,
            max_parallel,
            repo,
        } => run(&plan_dir, max_parallel, &repo).await,
        Command::Status { plan_dir, json } => status(&plan_dir, json),
        Command::Graph { plan_dir } => {
            let plan = Plan::load(&plan_dir)?;
            print!("{}", graph::to_mermaid(&plan));
            Ok(())
        }
        Command::Complete { job_file, output } => {
            finish_job(&job_file, JobStatus::Completed, output.as_deref())
        }
        Command::Fail { job_file, reason } => {
            let reason = reason.map(|r| format!("error: {}", r));
            finish_job(&job_file, JobStatus::Failed, reason.as_deref())
        }
        Command::CleanupWorktrees { repo, age } => {
            let config = OrchestratorConfig::load(&repo)?;
            let manager = WorktreeManager::new(
                repo.join(&config.worktree_base_dir),
                "cleanup",
                GitCli::new(&repo),
                config.worktree,
            )?;
            let removed = manager.cleanup_stale_worktrees(age)?;
            println!("Removed {} stale worktrees", removed);
            Ok(())
        }
    }
}

async fn run(plan_dir: &Path, max_parallel: Option<usize>, repo: &Path) -> Result<()> {
    log::info!("🚀 flowplan v{}", env!("CARGO_PKG_VERSION"));

    let plan = Plan::load(plan_dir)
        .with_context(|| format!("loading plan from {}", plan_dir.display()))?;
    let mut config = OrchestratorConfig::load(plan_dir)?;
    if let Some(n) = max_parallel {
        config.max_parallel_jobs = n;
    }

    let needs_worktrees = plan.jobs().iter().any(|j| j.worktree_name().is_some());
    let manager = if needs_worktrees {
        let manager = WorktreeManager::new(
            repo.join(&config.worktree_base_dir),
            &plan.name,
            GitCli::new(repo),
            config.worktree.clone(),
        )
        .context("setting up worktrees")?;
        Some(manager.with_prompt(StdinPrompt))
    } else {
        None
    };

    let mut hooks = HookRegistry::new();
    hooks.register(LogHook);

    let mut scheduler = Scheduler::new(plan, ExecutorRegistry::with_defaults(), config)?.with_hooks(hooks);
    if let Some(manager) = manager {
        scheduler = scheduler.with_worktrees(manager);
    }

    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });

    match scheduler.run_all().await {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(FlowError::Incomplete(status)) => {
            bail!(
                "plan incomplete: {}/{} completed, {} failed, {} blocked, {} pending user",
                status.completed,
                status.total,
                status.failed,
                status.blocked,
                status.pending_user
            )
        }
        Err(e) => Err(e.into()),
    }
}

fn status(plan_dir: &Path, json: bool) -> Result<()> {
    let plan = Plan::load(plan_dir)?;
    let summary = plan.status();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Plan: {}", plan.name);
    for job in plan.jobs() {
        let worktree = job.worktree_name().map(|w| format!(" [{}]", w)).unwrap_or_default();
        println!("  {:<14} {} ({}){}", job.status().as_str(), job.id, job.job_type, worktree);
    }

    let stages = graph::execution_stages(&plan);
    if !stages.is_empty() {
        println!("Remaining stages:");
        for (i, stage) in stages.iter().enumerate() {
            let ids: Vec<&str> = stage.iter().map(|j| j.id.as_str()).collect();
            println!("  {}: {}", i + 1, ids.join(", "));
        }
    }

    println!(
        "{}/{} completed, {} running, {} pending, {} failed ({:.0}%)",
        summary.completed, summary.total, summary.running, summary.pending, summary.failed, summary.progress
    );
    if let Ok(last) = RunReport::load_latest(plan_dir) {
        println!("Last run: {} ({} jobs finished)", last.id, last.jobs.len());
    }
    Ok(())
}

fn finish_job(job_file: &Path, status: JobStatus, output: Option<&str>) -> Result<()> {
    let store = JobStore::new(job_file);
    let job = store
        .load()?
        .with_context(|| format!("{} is not a job file", job_file.display()))?;
    if job.status() != JobStatus::Running {
        bail!("job {} is {}, not running", job.id, job.status());
    }
    if !job.awaiting_completion() {
        bail!(
            "job {} is not awaiting completion; its executor is still attached",
            job.id
        );
    }

    if let Some(output) = output {
        store.append_output(output)?;
    }
    let job = store.set_status(status)?;
    println!("{} -> {}", job.id, job.status());
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "✅ Plan {} completed: {} jobs ({:.0}%)",
        report.plan, report.status.total, report.status.progress
    );
    for outcome in &report.jobs {
        println!("  {:<10} {}", outcome.status.as_str(), outcome.job_id);
    }
}
