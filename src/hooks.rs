//! Lifecycle hooks - observers notified as jobs move through the scheduler
//!
//! Delivered when:
//! - a job is dispatched
//! - a job completes or fails
//! - a job hands off to a detached session or needs user input
//!
//! Hook failures never affect scheduling; they are logged and dropped.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::JobType;

/// Lifecycle event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEventKind {
    Started,
    Completed,
    Failed,
    /// Detached session or `pending_user`: a person has to act next
    AwaitingInput,
}

impl JobEventKind {
    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Started => "🚀",
            Self::Completed => "✅",
            Self::Failed => "❌",
            Self::AwaitingInput => "⏳",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub plan: String,
    pub job_id: String,
    pub job_type: JobType,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(kind: JobEventKind, plan: &str, job_id: &str, job_type: JobType) -> Self {
        Self {
            kind,
            plan: plan.to_string(),
            job_id: job_id.to_string(),
            job_type,
            message: None,
            at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

pub trait LifecycleHook: Send + Sync {
    fn name(&self) -> &str;
    fn on_event(&self, event: &JobEvent) -> Result<()>;
}

/// Ordered set of hooks handed to the scheduler
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: impl LifecycleHook + 'static) -> &mut Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Deliver `event` to every hook in registration order.
    pub fn emit(&self, event: &JobEvent) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_event(event) {
                log::warn!("Hook {} failed on {:?} for {}: {}", hook.name(), event.kind, event.job_id, e);
            }
        }
    }
}

/// Writes every event through the `log` facade
#[derive(Debug, Default)]
pub struct LogHook;

impl LifecycleHook for LogHook {
    fn name(&self) -> &str {
        "log"
    }

    fn on_event(&self, event: &JobEvent) -> Result<()> {
        let line = format!(
            "{} [{}] {} ({}) {:?}",
            event.kind.emoji(),
            event.plan,
            event.job_id,
            event.job_type,
            event.kind
        );
        match (&event.kind, &event.message) {
            (JobEventKind::Failed, Some(msg)) => log::error!("{}: {}", line, msg),
            (JobEventKind::Failed, None) => log::error!("{}", line),
            (_, Some(msg)) => log::info!("{}: {}", line, msg),
            (_, None) => log::info!("{}", line),
        }
        Ok(())
    }
}
