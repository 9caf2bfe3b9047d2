//! Job file persistence - the markdown file is the durable source of truth

use chrono::{DateTime, Local, Utc};
use serde_yaml::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::frontmatter;
use super::job::{Job, JobStatus, JobType, OutputSpec};
use super::lockfile::JobLock;
use crate::config::format_duration;
use crate::error::{FlowError, Result};

const OUTPUT_MARKER: &str = "\n\n## Output\n\n";

/// Reads and rewrites a single job file. Every write holds the job's
/// advisory lock and replaces the file atomically.
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the file into a [`Job`]. Returns `Ok(None)` for markdown files
    /// that are not jobs: no `type` key, or a type this orchestrator does
    /// not run.
    pub fn load(&self) -> Result<Option<Job>> {
        let content = fs::read_to_string(&self.path)?;
        let (fm, body) = frontmatter::parse(&self.path, &content)?;

        let Some(type_str) = frontmatter::get_str(&fm, "type") else {
            return Ok(None);
        };
        let Ok(job_type) = type_str.parse::<JobType>() else {
            log::debug!("Skipping {}: not a job type: {}", self.path.display(), type_str);
            return Ok(None);
        };

        let id = self.required(&fm, "id")?;
        let title = self.required(&fm, "title")?;
        let status: JobStatus = self.required(&fm, "status")?.parse()?;

        let filename = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let output = match fm.get("output") {
            Some(v) if !v.is_null() => Some(
                serde_yaml::from_value::<OutputSpec>(v.clone()).map_err(|e| {
                    FlowError::Frontmatter {
                        path: self.path.clone(),
                        reason: format!("invalid output: {}", e),
                    }
                })?,
            ),
            _ => None,
        };

        let mut job = Job::new(id, job_type).with_body(body);
        job.title = title;
        job.status = status;
        job.filename = filename;
        job.path = Some(self.path.clone());
        job.depends_on = frontmatter::get_list(&fm, "depends_on");
        job.worktree = frontmatter::get_str(&fm, "worktree").filter(|w| !w.is_empty());
        job.model = frontmatter::get_str(&fm, "model");
        job.branch = frontmatter::get_str(&fm, "branch");
        job.output = output;
        job.awaiting_completion = fm
            .get("awaiting_completion")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        job.started_at = parse_time(frontmatter::get_str(&fm, "started_at"));
        job.completed_at = parse_time(frontmatter::get_str(&fm, "completed_at"));
        Ok(Some(job))
    }

    fn required(&self, fm: &serde_yaml::Mapping, field: &'static str) -> Result<String> {
        frontmatter::get_str(fm, field)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| FlowError::MissingField {
                path: self.path.clone(),
                field,
            })
    }

    /// Write the job's status and timestamps into its frontmatter.
    pub fn write_status(&self, job: &Job) -> Result<()> {
        let duration = match (job.started_at(), job.completed_at()) {
            (Some(start), Some(end)) => (end - start)
                .to_std()
                .map(|d| Value::from(format_duration(d)))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        };
        let awaiting = if job.awaiting_completion() {
            Value::Bool(true)
        } else {
            Value::Null
        };
        let updates = vec![
            ("status", Value::from(job.status().as_str())),
            ("updated_at", Value::from(Utc::now().to_rfc3339())),
            ("started_at", time_value(job.started_at())),
            ("completed_at", time_value(job.completed_at())),
            ("duration", duration),
            ("awaiting_completion", awaiting),
        ];

        self.rewrite(|fm, _| {
            frontmatter::apply_updates(fm, updates);
        })
    }

    /// Change the status of this file's job directly, outside any running
    /// scheduler. A scheduler watching the plan picks it up on reload.
    pub fn set_status(&self, status: JobStatus) -> Result<Job> {
        let mut job = self.load()?.ok_or_else(|| FlowError::Frontmatter {
            path: self.path.clone(),
            reason: "not a job file (no recognised type)".to_string(),
        })?;
        job.apply_status(status, Utc::now());
        self.write_status(&job)?;
        Ok(job)
    }

    /// Append one timestamped line per output line under `## Output`.
    pub fn append_output(&self, output: &str) -> Result<()> {
        let stamp = Local::now().format("%H:%M:%S").to_string();
        self.rewrite(|_, body| {
            if !body.contains(OUTPUT_MARKER) {
                body.push_str(OUTPUT_MARKER);
            }
            for line in output.lines() {
                body.push_str(&format!("[{}] {}\n", stamp, line));
            }
        })
    }

    fn rewrite<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut serde_yaml::Mapping, &mut String),
    {
        let _lock = JobLock::acquire(&self.path)?;
        let content = fs::read_to_string(&self.path)?;
        let (mut fm, mut body) = frontmatter::parse(&self.path, &content)?;
        edit(&mut fm, &mut body);
        write_atomic(&self.path, &frontmatter::render(&fm, &body)?)
    }
}

fn time_value(time: Option<DateTime<Utc>>) -> Value {
    time.map(|t| Value::from(t.to_rfc3339()))
        .unwrap_or(Value::Null)
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Write to a sibling temp file and rename it over `path`.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp.{}", name, std::process::id()));

    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(result?)
}
