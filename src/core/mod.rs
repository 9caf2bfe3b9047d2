//! Core engine - job model, plan loading, graph validation, scheduling

mod executor;
mod frontmatter;
pub mod graph;
mod job;
mod lockfile;
mod plan;
mod scheduler;
mod store;

pub use executor::{ExecutionContext, Executor, ExecutorRegistry, Outcome, ShellExecutor};
pub use job::{Job, JobStatus, JobType, OutputSpec};
pub use lockfile::JobLock;
pub(crate) use lockfile::reclaim_stale;
pub use plan::Plan;
pub use scheduler::{CompletionHandle, CompletionSignal, Scheduler};
pub use store::{write_atomic, JobStore};
