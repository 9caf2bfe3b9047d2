//! Run reports - status summaries and per-run history saved as JSON

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::core::{graph, JobStatus, Plan};
use crate::error::{FlowError, Result};

const RUNS_DIR: &str = ".flowplan/runs";

/// Snapshot of job counts across a plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStatus {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending_user: usize,
    /// Pending jobs that can never run because something upstream failed.
    pub blocked: usize,
    /// Completed share of all jobs, 0-100.
    pub progress: f64,
}

impl PlanStatus {
    pub fn from_plan(plan: &Plan) -> Self {
        let total = plan.jobs().len();
        let completed = plan.count(JobStatus::Completed);

        let mut blocked: HashSet<&str> = HashSet::new();
        for job in plan.jobs() {
            if job.status() == JobStatus::Failed {
                for dependent in graph::transitive_dependents(plan, &job.id) {
                    if dependent.status() == JobStatus::Pending {
                        blocked.insert(&dependent.id);
                    }
                }
            }
        }

        Self {
            total,
            pending: plan.count(JobStatus::Pending),
            running: plan.count(JobStatus::Running),
            completed,
            failed: plan.count(JobStatus::Failed),
            pending_user: plan.count(JobStatus::PendingUser),
            blocked: blocked.len(),
            progress: if total == 0 {
                100.0
            } else {
                completed as f64 * 100.0 / total as f64
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.total
    }
}

/// How one job ended in a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One scheduler run over a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub id: String,
    pub plan: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub jobs: Vec<JobOutcome>,
    pub status: PlanStatus,
}

impl RunReport {
    pub fn new(plan: &Plan) -> Self {
        let now = Utc::now();
        Self {
            id: now.format("%Y-%m-%d-%H-%M-%S").to_string(),
            plan: plan.name.clone(),
            started_at: now,
            ended_at: None,
            jobs: Vec::new(),
            status: plan.status(),
        }
    }

    /// Record that a job reached a terminal state during this run.
    pub fn record(&mut self, plan: &Plan, job_id: &str, error: Option<String>) {
        let Some(job) = plan.get(job_id) else { return };
        self.jobs.retain(|o| o.job_id != job_id);
        self.jobs.push(JobOutcome {
            job_id: job_id.to_string(),
            status: job.status(),
            started_at: job.started_at(),
            completed_at: job.completed_at(),
            error,
        });
    }

    /// Close the report with the plan's final counts.
    pub fn finish(&mut self, plan: &Plan) {
        self.ended_at = Some(Utc::now());
        self.status = plan.status();
    }

    pub fn runs_dir(plan_dir: &Path) -> PathBuf {
        plan_dir.join(RUNS_DIR)
    }

    /// Save under the plan's runs directory and point `latest.json` at it.
    pub fn save(&self, plan_dir: &Path) -> Result<PathBuf> {
        let dir = Self::runs_dir(plan_dir);
        fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.json", self.id));
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;

        let latest_path = dir.join("latest.json");
        #[cfg(unix)]
        {
            use std::os::unix::fs as unix_fs;
            let _ = fs::remove_file(&latest_path);
            unix_fs::symlink(format!("{}.json", self.id), &latest_path)?;
        }
        #[cfg(not(unix))]
        fs::copy(&path, &latest_path)?;

        Ok(path)
    }

    pub fn load(plan_dir: &Path, id: &str) -> Result<Self> {
        let path = Self::runs_dir(plan_dir).join(format!("{}.json", id));
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn load_latest(plan_dir: &Path) -> Result<Self> {
        let latest_path = Self::runs_dir(plan_dir).join("latest.json");
        if !latest_path.exists() {
            return Err(FlowError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no runs recorded for {}", plan_dir.display()),
            )));
        }
        let content = fs::read_to_string(&latest_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Run IDs, most recent first.
    pub fn list_all(plan_dir: &Path) -> Result<Vec<String>> {
        let dir = Self::runs_dir(plan_dir);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if stem != "latest" {
                        runs.push(stem.to_string());
                    }
                }
            }
        }

        runs.sort();
        runs.reverse();
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Job, JobType};

    fn sample_plan() -> Plan {
        Plan::from_jobs(
            "demo",
            PathBuf::from("."),
            vec![
                Job::new("01", JobType::Shell).with_status(JobStatus::Failed),
                Job::new("02", JobType::Shell).depends_on(["01"]),
                Job::new("03", JobType::Shell).depends_on(["02"]),
                Job::new("04", JobType::Shell).with_status(JobStatus::Completed),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_status_counts() {
        let status = sample_plan().status();
        assert_eq!(status.total, 4);
        assert_eq!(status.completed, 1);
        assert_eq!(status.failed, 1);
        assert_eq!(status.pending, 2);
        assert_eq!(status.blocked, 2);
        assert_eq!(status.progress, 25.0);
        assert!(!status.is_complete());
    }

    #[test]
    fn test_report_save_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let plan = sample_plan();

        let mut report = RunReport::new(&plan);
        report.record(&plan, "01", Some("exit 1".into()));
        report.record(&plan, "04", None);
        report.finish(&plan);
        report.save(dir.path()).unwrap();

        assert_eq!(RunReport::list_all(dir.path()).unwrap(), vec![report.id.clone()]);
        let latest = RunReport::load_latest(dir.path()).unwrap();
        assert_eq!(latest.jobs.len(), 2);
        assert_eq!(latest.jobs[0].error.as_deref(), Some("exit 1"));
        assert_eq!(latest.status, report.status);

        let by_id = RunReport::load(dir.path(), &report.id).unwrap();
        assert_eq!(by_id.plan, "demo");
    }

    #[test]
    fn test_empty_runs_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RunReport::list_all(dir.path()).unwrap().is_empty());
        match RunReport::load_latest(dir.path()) {
            Err(FlowError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("expected a not-found error, got {:?}", other.map(|r| r.id)),
        }
    }
}
