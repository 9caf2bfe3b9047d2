//! Executors - pluggable strategies that perform a job's work
//!
//! The scheduler only sees the eventual [`Outcome`]; how the work happens
//! (a shell, an LLM call, a detached terminal session) is up to the
//! executor registered for the job's type.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::job::{Job, JobType};
use super::plan::Plan;
use crate::error::FlowError;

/// What a finished executor call means for the job
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Work is done; `output` is appended to the job file.
    Completed { output: Option<String> },
    /// Handed off to a session that outlives this call. The job stays
    /// `running` until an explicit completion signal arrives.
    Detached,
    /// The executor needs a person before anything else can happen.
    PendingUser,
}

/// Everything an executor gets besides the job itself
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Worktree path, or the plan directory for jobs on the shared root.
    pub work_dir: PathBuf,
    pub plan_dir: PathBuf,
    pub worktree: Option<String>,
    /// Fires when the run is cancelled; executors should stop promptly.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Perform the job. An error marks the job failed.
    async fn execute(&self, ctx: &ExecutionContext, job: &Job, plan: &Plan) -> Result<Outcome>;
}

/// Maps each job type to the executor that handles it
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<JobType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in shell executor.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(JobType::Shell, ShellExecutor::new());
        registry
    }

    pub fn register(&mut self, job_type: JobType, executor: impl Executor + 'static) -> &mut Self {
        self.register_arc(job_type, Arc::new(executor))
    }

    pub fn register_arc(&mut self, job_type: JobType, executor: Arc<dyn Executor>) -> &mut Self {
        log::debug!("Registered executor {} for {}", executor.name(), job_type);
        self.executors.insert(job_type, executor);
        self
    }

    pub fn get(&self, job_type: JobType) -> Result<Arc<dyn Executor>, FlowError> {
        self.executors
            .get(&job_type)
            .cloned()
            .ok_or_else(|| FlowError::NoExecutor(job_type.to_string()))
    }

    /// Job types used by `plan` that have no executor, sorted.
    pub fn missing_for(&self, plan: &Plan) -> Vec<JobType> {
        let mut missing: Vec<JobType> = plan
            .jobs()
            .iter()
            .map(|j| j.job_type)
            .filter(|t| !self.executors.contains_key(t))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}

/// Runs the job body as a `sh -c` script in the job's working directory
#[derive(Debug, Default, Clone)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(&self, ctx: &ExecutionContext, job: &Job, _plan: &Plan) -> Result<Outcome> {
        let script = job.body.trim();
        if script.is_empty() {
            log::warn!("Job {} has an empty body, nothing to run", job.id);
            return Ok(Outcome::Completed { output: None });
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .current_dir(&ctx.work_dir)
            .env("FLOWPLAN_PLAN_DIR", &ctx.plan_dir)
            .env("FLOWPLAN_WORK_DIR", &ctx.work_dir)
            .env("FLOWPLAN_JOB_ID", &job.id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning shell for job '{}'", job.id))?;

        // Dropping the wait future on cancellation kills the child.
        let output = tokio::select! {
            res = child.wait_with_output() => res.with_context(|| format!("waiting for job '{}'", job.id))?,
            _ = ctx.cancel.cancelled() => anyhow::bail!("job '{}' cancelled", job.id),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        log::debug!("Job {} finished ({} bytes of output)", job.id, stdout.len());
        Ok(Outcome::Completed {
            output: (!stdout.is_empty()).then_some(stdout),
        })
    }
}
