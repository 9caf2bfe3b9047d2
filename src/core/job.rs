//! Job model - identity, type, status and dependency references

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::plan::Plan;
use crate::error::FlowError;

/// Job status as written to the `status:` frontmatter key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    PendingUser,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PendingUser => "pending_user",
        }
    }

    /// Statuses the scheduler never moves a job out of on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::PendingUser)
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "pending_user" => Ok(Self::PendingUser),
            other => Err(FlowError::InvalidStatus(other.to_string())),
        }
    }
}

/// Closed set of job types; each maps to one registered executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Shell,
    Oneshot,
    Chat,
    Agent,
    HeadlessAgent,
    InteractiveAgent,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        Self::Shell,
        Self::Oneshot,
        Self::Chat,
        Self::Agent,
        Self::HeadlessAgent,
        Self::InteractiveAgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Oneshot => "oneshot",
            Self::Chat => "chat",
            Self::Agent => "agent",
            Self::HeadlessAgent => "headless_agent",
            Self::InteractiveAgent => "interactive_agent",
        }
    }

    /// Types whose executors usually hand off to a detached session.
    pub fn is_interactive(&self) -> bool {
        matches!(self, Self::Agent | Self::InteractiveAgent)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| FlowError::InvalidType(s.to_string()))
    }
}

/// What an executor should do with a successful result. Opaque to the
/// scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A single unit of work inside a [`Plan`]
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub title: String,
    pub job_type: JobType,
    pub depends_on: Vec<String>,
    pub worktree: Option<String>,
    pub model: Option<String>,
    pub branch: Option<String>,
    pub output: Option<OutputSpec>,
    /// Markdown body following the frontmatter: the task itself.
    pub body: String,
    /// Slot used for declaration ordering, e.g. `01-design.md`.
    pub filename: String,
    /// Backing file; `None` for plans built in memory.
    pub path: Option<PathBuf>,

    pub(crate) status: JobStatus,
    pub(crate) awaiting_completion: bool,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    /// Resolved dependencies as indices into the owning plan.
    pub(crate) dependencies: Vec<usize>,
}

impl Job {
    /// Build an in-memory job. The filename defaults to `<id>.md`.
    pub fn new(id: impl Into<String>, job_type: JobType) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            filename: format!("{}.md", id),
            id,
            job_type,
            depends_on: Vec::new(),
            worktree: None,
            model: None,
            branch: None,
            output: None,
            body: String::new(),
            path: None,
            status: JobStatus::Pending,
            awaiting_completion: false,
            started_at: None,
            completed_at: None,
            dependencies: Vec::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_worktree(mut self, worktree: impl Into<String>) -> Self {
        self.worktree = Some(worktree.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Running under a detached session until an external completion signal.
    pub fn awaiting_completion(&self) -> bool {
        self.awaiting_completion
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Worktree name, treating an empty string as "shared root".
    pub fn worktree_name(&self) -> Option<&str> {
        self.worktree.as_deref().filter(|w| !w.is_empty())
    }

    /// Pending with every dependency completed. Any other own status is
    /// never runnable, whatever the dependencies look like.
    pub fn is_runnable(&self, plan: &Plan) -> bool {
        self.status == JobStatus::Pending
            && plan
                .dependencies_of(self)
                .all(|dep| dep.status == JobStatus::Completed)
    }

    /// Apply a status change and stamp the matching timestamp.
    pub(crate) fn apply_status(&mut self, status: JobStatus, now: DateTime<Utc>) {
        match status {
            JobStatus::Running => {
                self.started_at = Some(now);
                self.completed_at = None;
            }
            JobStatus::Completed | JobStatus::Failed => {
                self.completed_at = Some(now);
                self.awaiting_completion = false;
            }
            JobStatus::PendingUser => {
                self.awaiting_completion = false;
            }
            JobStatus::Pending => {
                self.started_at = None;
                self.completed_at = None;
                self.awaiting_completion = false;
            }
        }
        self.status = status;
    }
}
