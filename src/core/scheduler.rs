//! Scheduler - drives a plan's DAG to completion under a concurrency bound
//!
//! The scheduler owns the [`Plan`] and is its only writer. Each dispatched
//! job runs on its own tokio task against an immutable snapshot; results
//! come back through a `JoinSet` and are applied by the loop.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::executor::{ExecutionContext, Executor, ExecutorRegistry, Outcome};
use super::graph;
use super::job::{Job, JobStatus, JobType};
use super::lockfile::JobLock;
use super::plan::Plan;
use crate::config::OrchestratorConfig;
use crate::error::{FlowError, Result};
use crate::hooks::{HookRegistry, JobEvent, JobEventKind};
use crate::report::{PlanStatus, RunReport};
use crate::worktree::WorktreeManager;

/// Out-of-band terminal transition for a detached job
#[derive(Debug, Clone)]
pub enum CompletionSignal {
    Completed { job_id: String, output: Option<String> },
    Failed { job_id: String, reason: String },
}

/// Cloneable sender used by detached sessions to report back
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    tx: mpsc::UnboundedSender<CompletionSignal>,
}

impl CompletionHandle {
    /// Returns false once the scheduler is gone.
    pub fn complete(&self, job_id: &str) -> bool {
        self.send(CompletionSignal::Completed {
            job_id: job_id.to_string(),
            output: None,
        })
    }

    pub fn complete_with_output(&self, job_id: &str, output: impl Into<String>) -> bool {
        self.send(CompletionSignal::Completed {
            job_id: job_id.to_string(),
            output: Some(output.into()),
        })
    }

    pub fn fail(&self, job_id: &str, reason: impl Into<String>) -> bool {
        self.send(CompletionSignal::Failed {
            job_id: job_id.to_string(),
            reason: reason.into(),
        })
    }

    fn send(&self, signal: CompletionSignal) -> bool {
        self.tx.send(signal).is_ok()
    }
}

/// Result of one dispatched job task
struct Finished {
    job_id: String,
    result: anyhow::Result<Outcome>,
    job_lock: Option<JobLock>,
}

/// Bookkeeping for one scheduler run
struct RunState {
    tasks: JoinSet<Finished>,
    /// Jobs whose executor call is in flight.
    executing: HashSet<String>,
    /// Running jobs waiting on a completion signal.
    detached: HashSet<String>,
    /// Jobs skipped for the rest of this run after a resource failure.
    deferred: HashSet<String>,
    report: RunReport,
}

impl RunState {
    fn new(plan: &Plan) -> Self {
        Self {
            tasks: JoinSet::new(),
            executing: HashSet::new(),
            detached: HashSet::new(),
            deferred: HashSet::new(),
            report: RunReport::new(plan),
        }
    }
}

enum Wake {
    Cancelled,
    Finished(std::result::Result<Finished, JoinError>),
    Signal(CompletionSignal),
    Tick,
}

/// DAG scheduler with dependency resolution and bounded parallelism
pub struct Scheduler {
    plan: Plan,
    executors: ExecutorRegistry,
    config: OrchestratorConfig,
    worktrees: Option<Arc<WorktreeManager>>,
    hooks: HookRegistry,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    signal_tx: mpsc::UnboundedSender<CompletionSignal>,
    signal_rx: mpsc::UnboundedReceiver<CompletionSignal>,
}

impl Scheduler {
    /// Fails if any job type used by the plan has no registered executor.
    pub fn new(plan: Plan, executors: ExecutorRegistry, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let missing = executors.missing_for(&plan);
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(JobType::as_str).collect();
            return Err(FlowError::NoExecutor(names.join(", ")));
        }

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_parallel_jobs)),
            plan,
            executors,
            config,
            worktrees: None,
            hooks: HookRegistry::new(),
            cancel: CancellationToken::new(),
            signal_tx,
            signal_rx,
        })
    }

    pub fn with_worktrees(mut self, manager: WorktreeManager) -> Self {
        self.worktrees = Some(Arc::new(manager));
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Cancelling this token stops dispatch and aborts in-flight executors.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn completion_handle(&self) -> CompletionHandle {
        CompletionHandle {
            tx: self.signal_tx.clone(),
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn status(&self) -> PlanStatus {
        self.plan.status()
    }

    pub fn into_plan(self) -> Plan {
        self.plan
    }

    /// Run until every reachable job is finished. Returns the report when
    /// all jobs completed, [`FlowError::Incomplete`] otherwise.
    pub async fn run_all(&mut self) -> Result<RunReport> {
        let mut state = RunState::new(&self.plan);
        self.adopt_running(&mut state);

        let cancel = self.cancel.clone();
        let mut tick = tokio::time::interval(self.config.check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        log::info!(
            "Running plan '{}' ({} jobs, max {} in parallel)",
            self.plan.name,
            self.plan.jobs().len(),
            self.config.max_parallel_jobs
        );

        loop {
            if cancel.is_cancelled() {
                return self.abort(state).await;
            }

            let contended = self.dispatch_ready(&mut state).await;
            if state.tasks.is_empty() && state.detached.is_empty() && !contended {
                break;
            }

            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                Some(joined) = state.tasks.join_next(), if !state.tasks.is_empty() => Wake::Finished(joined),
                Some(signal) = self.signal_rx.recv() => Wake::Signal(signal),
                _ = tick.tick() => Wake::Tick,
            };

            match wake {
                Wake::Cancelled => return self.abort(state).await,
                Wake::Finished(Ok(finished)) => self.finish(&mut state, finished).await,
                Wake::Finished(Err(e)) => log::error!("Job task failed to join: {}", e),
                Wake::Signal(signal) => self.handle_signal(&mut state, signal).await,
                Wake::Tick => self.reload(&mut state).await,
            }
        }

        self.conclude(state.report)
    }

    /// Dispatch the current frontier once and wait for those jobs. Returns
    /// the IDs that were started, in declaration order.
    pub async fn run_next(&mut self) -> Result<Vec<String>> {
        let mut state = RunState::new(&self.plan);
        self.dispatch_ready(&mut state).await;

        let started: Vec<String> = self
            .plan
            .jobs()
            .iter()
            .filter(|j| state.executing.contains(&j.id))
            .map(|j| j.id.clone())
            .collect();

        while let Some(joined) = state.tasks.join_next().await {
            match joined {
                Ok(finished) => self.finish(&mut state, finished).await,
                Err(e) => log::error!("Job task failed to join: {}", e),
            }
        }
        Ok(started)
    }

    /// Run a single job now. A failed job is reset to pending first so it
    /// can be retried; any other job must be runnable.
    pub async fn run_job(&mut self, id: &str) -> Result<Outcome> {
        let job = self
            .plan
            .get(id)
            .ok_or_else(|| FlowError::JobNotFound(id.to_string()))?;
        if job.status() == JobStatus::Failed {
            log::info!("Retrying failed job {}", id);
            self.plan.update_status(id, JobStatus::Pending)?;
        }

        let job = self
            .plan
            .get(id)
            .ok_or_else(|| FlowError::JobNotFound(id.to_string()))?;
        if !job.is_runnable(&self.plan) {
            return Err(FlowError::Execution {
                job_id: id.to_string(),
                message: format!("not runnable (status {}, or dependencies incomplete)", job.status()),
            });
        }

        let mut state = RunState::new(&self.plan);
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| FlowError::Cancelled)?;
        self.start_job(id, permit, &mut state.tasks).await?;

        let finished = match state.tasks.join_next().await {
            Some(Ok(finished)) => finished,
            Some(Err(e)) => {
                return Err(FlowError::Execution {
                    job_id: id.to_string(),
                    message: e.to_string(),
                })
            }
            None => return Err(FlowError::JobNotFound(id.to_string())),
        };

        let outcome = match &finished.result {
            Ok(outcome) => Ok(outcome.clone()),
            Err(e) => Err(FlowError::Execution {
                job_id: id.to_string(),
                message: format!("{:#}", e),
            }),
        };
        self.finish(&mut state, finished).await;
        outcome
    }

    /// Jobs left `running` by an earlier process: detached ones are waited
    /// on, others are reported and left alone.
    fn adopt_running(&self, state: &mut RunState) {
        for job in self.plan.jobs() {
            if job.status() != JobStatus::Running {
                continue;
            }
            if job.awaiting_completion() {
                log::info!("Waiting on detached job {} from an earlier run", job.id);
                state.detached.insert(job.id.clone());
            } else {
                log::warn!("Job {} is marked running by an earlier run; not re-dispatching", job.id);
            }
        }
    }

    /// Start every runnable job that fits under the parallelism limit.
    /// Returns true when some job is waiting for a lock held elsewhere.
    async fn dispatch_ready(&mut self, state: &mut RunState) -> bool {
        let candidates: Vec<String> = graph::runnable_jobs(&self.plan)
            .into_iter()
            .filter(|j| !state.deferred.contains(&j.id))
            .map(|j| j.id.clone())
            .collect();

        let mut contended = false;
        for id in candidates {
            if self.plan.count(JobStatus::Running) >= self.config.max_parallel_jobs {
                break;
            }
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };

            match self.start_job(&id, permit, &mut state.tasks).await {
                Ok(()) => {
                    state.executing.insert(id);
                }
                Err(e @ (FlowError::AlreadyLocked { .. } | FlowError::JobLocked(_))) => {
                    log::debug!("Job {} waits: {}", id, e);
                    contended = true;
                }
                Err(e @ FlowError::NoExecutor(_)) => {
                    let message = e.to_string();
                    log::error!("Job {}: {}", id, message);
                    self.settle(state, &id, JobStatus::Failed, Some(message)).await;
                }
                Err(e) => {
                    log::warn!("Deferring job {} for this run: {}", id, e);
                    state.deferred.insert(id);
                }
            }
        }
        contended
    }

    /// Acquire resources, mark the job running and spawn its executor.
    /// On error nothing is left held and the job stays pending.
    async fn start_job(
        &mut self,
        id: &str,
        permit: OwnedSemaphorePermit,
        tasks: &mut JoinSet<Finished>,
    ) -> Result<()> {
        let job = self
            .plan
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::JobNotFound(id.to_string()))?;
        let executor = self.executors.get(job.job_type)?;

        let worktree = match job.worktree_name() {
            Some(name) => Some((name.to_string(), self.acquire_worktree(name, id).await?)),
            None => None,
        };

        let job_lock = match self.mark_running(&job) {
            Ok(lock) => lock,
            Err(e) => {
                if let Some((name, _)) = &worktree {
                    self.unlock_worktree(name).await;
                }
                return Err(e);
            }
        };

        self.hooks
            .emit(&JobEvent::new(JobEventKind::Started, &self.plan.name, id, job.job_type));

        let (work_dir, worktree_name) = match worktree {
            Some((name, path)) => (path, Some(name)),
            None => (self.plan.directory.clone(), None),
        };
        let ctx = ExecutionContext {
            work_dir,
            plan_dir: self.plan.directory.clone(),
            worktree: worktree_name,
            cancel: self.cancel.child_token(),
        };

        let snapshot = Arc::new(self.plan.clone());
        let job = snapshot.get(id).cloned().unwrap_or(job);
        log::info!("Dispatching {} ({}) via {}", id, job.job_type, executor.name());
        tasks.spawn(run_executor(
            executor,
            ctx,
            job,
            snapshot,
            self.cancel.clone(),
            permit,
            job_lock,
        ));
        Ok(())
    }

    fn mark_running(&mut self, job: &Job) -> Result<Option<JobLock>> {
        let lock = match &job.path {
            Some(path) => Some(JobLock::acquire(path)?),
            None => None,
        };
        self.plan.update_status(&job.id, JobStatus::Running)?;
        Ok(lock)
    }

    async fn acquire_worktree(&self, name: &str, job_id: &str) -> Result<PathBuf> {
        let Some(manager) = &self.worktrees else {
            return Err(FlowError::Backend(format!(
                "job {} needs worktree '{}' but no worktree manager is configured",
                job_id, name
            )));
        };
        let (name, job_id) = (name.to_string(), job_id.to_string());
        on_worktrees(manager, move |m| {
            let path = m.get_or_create_worktree(&name)?;
            m.lock_worktree(&name, &job_id)?;
            Ok(path)
        })
        .await
    }

    async fn unlock_worktree(&self, name: &str) {
        let Some(manager) = &self.worktrees else { return };
        let owned = name.to_string();
        if let Err(e) = on_worktrees(manager, move |m| m.unlock_worktree(&owned)).await {
            log::warn!("Failed to unlock worktree {}: {}", name, e);
        }
    }

    /// Apply an executor result to the plan.
    async fn finish(&mut self, state: &mut RunState, finished: Finished) {
        let Finished {
            job_id,
            result,
            job_lock,
        } = finished;
        state.executing.remove(&job_id);

        match result {
            Ok(Outcome::Completed { output }) => {
                if let Some(output) = output {
                    self.append_output(&job_id, &output);
                }
                self.settle(state, &job_id, JobStatus::Completed, None).await;
            }
            Ok(Outcome::Detached) => {
                if let Err(e) = self.plan.set_awaiting_completion(&job_id, true) {
                    log::warn!("Failed to mark {} as awaiting completion: {}", job_id, e);
                }
                state.detached.insert(job_id.clone());
                if let Some(job) = self.plan.get(&job_id) {
                    self.hooks.emit(
                        &JobEvent::new(JobEventKind::AwaitingInput, &self.plan.name, &job_id, job.job_type)
                            .with_message("handed off to a detached session"),
                    );
                }
            }
            Ok(Outcome::PendingUser) => {
                self.settle(state, &job_id, JobStatus::PendingUser, None).await;
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.append_output(&job_id, &format!("error: {}", message));
                self.settle(state, &job_id, JobStatus::Failed, Some(message)).await;
            }
        }

        drop(job_lock);
    }

    /// Record a terminal status, notify hooks and release the worktree.
    async fn settle(&mut self, state: &mut RunState, id: &str, status: JobStatus, error: Option<String>) {
        if let Err(e) = self.plan.update_status(id, status) {
            log::error!("Failed to record {} for job {}: {}", status, id, e);
        }
        state.detached.remove(id);
        self.after_terminal(state, id, error).await;
    }

    async fn after_terminal(&mut self, state: &mut RunState, id: &str, error: Option<String>) {
        let Some(job) = self.plan.get(id).cloned() else {
            return;
        };

        let kind = match job.status() {
            JobStatus::Completed => JobEventKind::Completed,
            JobStatus::Failed => JobEventKind::Failed,
            _ => JobEventKind::AwaitingInput,
        };
        let mut event = JobEvent::new(kind, &self.plan.name, id, job.job_type);
        if let Some(message) = &error {
            event = event.with_message(message.clone());
        }
        self.hooks.emit(&event);

        if job.status() == JobStatus::Failed {
            let blocked = graph::transitive_dependents(&self.plan, id).len();
            if blocked > 0 {
                log::warn!("Job {} failed; {} dependent jobs are blocked", id, blocked);
            }
        }

        state.report.record(&self.plan, id, error);
        self.release_worktree(&job).await;
    }

    /// Unlock the job's worktree and apply the cleanup policy, unless another
    /// unfinished job still needs the same worktree.
    async fn release_worktree(&self, job: &Job) {
        let (Some(name), Some(manager)) = (job.worktree_name(), &self.worktrees) else {
            return;
        };
        self.unlock_worktree(name).await;

        if job.status() == JobStatus::PendingUser {
            return;
        }
        let shared = self.plan.jobs().iter().any(|other| {
            other.id != job.id
                && other.worktree_name() == Some(name)
                && !matches!(other.status(), JobStatus::Completed | JobStatus::Failed)
        });
        if shared {
            log::debug!("Keeping worktree {}: still needed by other jobs", name);
            return;
        }

        let owned = job.clone();
        match on_worktrees(manager, move |m| m.cleanup_job_worktree(&owned)).await {
            Ok(true) => log::info!("Removed worktree {} after job {}", name, job.id),
            Ok(false) => {}
            Err(e) => log::warn!("Worktree cleanup for {} failed: {}", job.id, e),
        }
    }

    async fn handle_signal(&mut self, state: &mut RunState, signal: CompletionSignal) {
        let (job_id, status, output, error) = match signal {
            CompletionSignal::Completed { job_id, output } => {
                (job_id, JobStatus::Completed, output, None)
            }
            CompletionSignal::Failed { job_id, reason } => {
                (job_id, JobStatus::Failed, None, Some(reason))
            }
        };

        match self.plan.get(&job_id).map(Job::status) {
            None => log::warn!("Completion signal for unknown job {}", job_id),
            Some(JobStatus::Running) if state.executing.contains(&job_id) => {
                log::warn!("Ignoring completion signal for {}: executor still running", job_id);
            }
            Some(JobStatus::Running) => {
                if let Some(output) = output {
                    self.append_output(&job_id, &output);
                }
                log::info!("Job {} signalled {}", job_id, status);
                self.settle(state, &job_id, status, error).await;
            }
            Some(other) => {
                log::warn!("Ignoring completion signal for {}: status is {}", job_id, other);
            }
        }
    }

    /// Pick up status edits made by other processes, e.g. `flowplan complete`.
    /// Jobs whose executor is still attached are owned by this run.
    async fn reload(&mut self, state: &mut RunState) {
        for id in self.plan.reload_statuses(&state.executing) {
            let finished = self
                .plan
                .get(&id)
                .is_some_and(|j| j.status() != JobStatus::Running);
            if finished && state.detached.remove(&id) {
                log::info!("Detached job {} finished externally", id);
                self.after_terminal(state, &id, None).await;
            }
        }
    }

    fn append_output(&self, id: &str, output: &str) {
        if let Err(e) = self.plan.append_output(id, output) {
            log::warn!("Failed to append output for {}: {}", id, e);
        }
    }

    async fn abort(&mut self, mut state: RunState) -> Result<RunReport> {
        log::warn!(
            "Run cancelled; discarding {} in-flight jobs",
            state.tasks.len()
        );
        while state.tasks.join_next().await.is_some() {}
        state.report.finish(&self.plan);
        self.save_report(&state.report);
        Err(FlowError::Cancelled)
    }

    fn conclude(&self, mut report: RunReport) -> Result<RunReport> {
        report.finish(&self.plan);
        self.save_report(&report);

        let status = report.status.clone();
        log::info!(
            "Plan '{}' finished: {}/{} completed, {} failed, {} blocked ({:.0}%)",
            self.plan.name,
            status.completed,
            status.total,
            status.failed,
            status.blocked,
            status.progress
        );

        if status.is_complete() {
            Ok(report)
        } else {
            Err(FlowError::Incomplete(status))
        }
    }

    fn save_report(&self, report: &RunReport) {
        if !self.plan.is_persistent() {
            return;
        }
        match report.save(&self.plan.directory) {
            Ok(path) => log::debug!("Saved run report to {}", path.display()),
            Err(e) => log::warn!("Failed to save run report: {}", e),
        }
    }
}

async fn run_executor(
    executor: Arc<dyn Executor>,
    ctx: ExecutionContext,
    job: Job,
    plan: Arc<Plan>,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
    job_lock: Option<JobLock>,
) -> Finished {
    let job_id = job.id.clone();
    let mut inner = tokio::spawn(async move { executor.execute(&ctx, &job, &plan).await });

    let result = tokio::select! {
        joined = &mut inner => joined.unwrap_or_else(|e| Err(anyhow::anyhow!("executor task failed: {}", e))),
        _ = cancel.cancelled() => {
            inner.abort();
            Err(anyhow::anyhow!("cancelled"))
        }
    };

    Finished {
        job_id,
        result,
        job_lock,
    }
}

/// Run a worktree operation on the blocking pool.
async fn on_worktrees<T, F>(manager: &Arc<WorktreeManager>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&WorktreeManager) -> Result<T> + Send + 'static,
{
    let manager = Arc::clone(manager);
    tokio::task::spawn_blocking(move || op(&manager))
        .await
        .map_err(|e| FlowError::Backend(format!("worktree task failed: {}", e)))?
}
