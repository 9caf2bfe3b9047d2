//! Flowplan - DAG job orchestrator
//!
//! Loads a plan of markdown job files, validates the dependency graph and
//! runs jobs concurrently, giving each job that asks for one an exclusive
//! git worktree.

pub mod config;
pub mod core;
pub mod error;
pub mod hooks;
pub mod process;
pub mod report;
pub mod worktree;

// Re-exports
pub use config::{OrchestratorConfig, WorktreeConfig};
pub use core::{
    CompletionHandle, ExecutionContext, Executor, ExecutorRegistry, Job, JobStatus, JobType,
    Outcome, Plan, Scheduler, ShellExecutor,
};
pub use error::{FlowError, Result};
pub use hooks::{HookRegistry, JobEvent, JobEventKind, LifecycleHook, LogHook};
pub use report::{PlanStatus, RunReport};
pub use worktree::{GitCli, WorktreeManager};
