//! Error taxonomy for plan loading, worktree management and execution

use std::path::PathBuf;
use thiserror::Error;

use crate::report::PlanStatus;

#[derive(Error, Debug)]
pub enum FlowError {
    // -- validation (load time, fatal to the whole plan) --
    #[error("job file {path:?} is missing required field: {field}")]
    MissingField { path: PathBuf, field: &'static str },

    #[error("invalid job type '{0}'")]
    InvalidType(String),

    #[error("invalid job status '{0}'")]
    InvalidStatus(String),

    #[error("duplicate job ID '{id}' in files {first} and {second}")]
    DuplicateJobId {
        id: String,
        first: String,
        second: String,
    },

    #[error("job '{job}' depends on non-existent job '{missing}'")]
    NonExistentJob { job: String, missing: String },

    #[error("circular dependency detected: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("malformed frontmatter in {path:?}: {reason}")]
    Frontmatter { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    // -- resources --
    #[error("worktree '{name}' already locked by job {job_id} (PID: {pid})")]
    AlreadyLocked { name: String, job_id: String, pid: u32 },

    #[error("invalid worktree name '{name}': {reason}")]
    InvalidWorktreeName { name: String, reason: String },

    #[error("worktree backend error: {0}")]
    Backend(String),

    #[error("job file {0:?} is locked by another process")]
    JobLocked(PathBuf),

    // -- execution --
    #[error("no executor for job type: {0}")]
    NoExecutor(String),

    #[error("job {job_id} failed: {message}")]
    Execution { job_id: String, message: String },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error(
        "plan finished incomplete: {} completed, {} failed, {} blocked of {} jobs",
        .0.completed, .0.failed, .0.blocked, .0.total
    )]
    Incomplete(PlanStatus),

    #[error("run cancelled")]
    Cancelled,

    // -- plumbing --
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Load-time errors that reject the whole plan.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingField { .. }
                | Self::InvalidType(_)
                | Self::InvalidStatus(_)
                | Self::DuplicateJobId { .. }
                | Self::NonExistentJob { .. }
                | Self::CircularDependency(_)
                | Self::Frontmatter { .. }
        )
    }

    /// Errors that leave the affected job pending and retryable.
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            Self::AlreadyLocked { .. }
                | Self::InvalidWorktreeName { .. }
                | Self::Backend(_)
                | Self::JobLocked(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
