//! Plan - a named, validated collection of jobs loaded from one directory

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::graph;
use super::job::{Job, JobStatus};
use super::store::JobStore;
use crate::error::{FlowError, Result};
use crate::report::PlanStatus;

#[derive(Debug, Clone)]
pub struct Plan {
    pub name: String,
    pub directory: PathBuf,
    jobs: Vec<Job>,
    index: HashMap<String, usize>,
    persistent: bool,
}

impl Plan {
    /// Load every job file (`*.md`) in `dir`, in filename order, and
    /// validate the dependency graph.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut jobs = Vec::new();
        for file in files {
            if let Some(job) = JobStore::new(&file).load()? {
                jobs.push(job);
            }
        }

        let name = dir
            .canonicalize()
            .unwrap_or_else(|_| dir.to_path_buf())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plan".to_string());

        log::info!("Loaded plan '{}' with {} jobs from {}", name, jobs.len(), dir.display());
        let mut plan = Self::from_jobs(name, dir.to_path_buf(), jobs)?;
        plan.persistent = true;
        Ok(plan)
    }

    /// Build a plan from jobs already in memory. Duplicate IDs are rejected
    /// first, then unresolved dependencies, then cycles.
    pub fn from_jobs(name: impl Into<String>, directory: PathBuf, mut jobs: Vec<Job>) -> Result<Self> {
        graph::check_duplicates(&jobs)?;
        graph::resolve_dependencies(&mut jobs)?;
        graph::detect_cycles(&jobs)?;

        let index = jobs
            .iter()
            .enumerate()
            .map(|(i, j)| (j.id.clone(), i))
            .collect();
        Ok(Self {
            name: name.into(),
            directory,
            jobs,
            index,
            persistent: false,
        })
    }

    /// True when the plan was loaded from a directory of job files.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Jobs in declaration order.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.index.get(id).map(|&i| &self.jobs[i])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Direct dependencies of `job`, which must belong to this plan.
    pub fn dependencies_of<'a>(&'a self, job: &'a Job) -> impl Iterator<Item = &'a Job> + 'a {
        job.dependencies.iter().filter_map(move |&i| self.jobs.get(i))
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status() == status).count()
    }

    pub fn status(&self) -> PlanStatus {
        PlanStatus::from_plan(self)
    }

    /// The only path by which a job's status changes. Stamps the matching
    /// timestamp and persists to the job file; if persisting fails the
    /// in-memory job is left as it was.
    pub fn update_status(&mut self, id: &str, status: JobStatus) -> Result<()> {
        let idx = self.require(id)?;
        let previous = self.jobs[idx].clone();

        self.jobs[idx].apply_status(status, Utc::now());
        if let Err(e) = self.persist(idx) {
            self.jobs[idx] = previous;
            return Err(e);
        }
        log::debug!("Job {} -> {}", id, status);
        Ok(())
    }

    /// Mark a running job as handed off to a detached session.
    pub fn set_awaiting_completion(&mut self, id: &str, awaiting: bool) -> Result<()> {
        let idx = self.require(id)?;
        let previous = self.jobs[idx].awaiting_completion;

        self.jobs[idx].awaiting_completion = awaiting;
        if let Err(e) = self.persist(idx) {
            self.jobs[idx].awaiting_completion = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Append executor output to the job file's `## Output` section.
    pub fn append_output(&self, id: &str, output: &str) -> Result<()> {
        let idx = self.require(id)?;
        match &self.jobs[idx].path {
            Some(path) => JobStore::new(path).append_output(output),
            None => Ok(()),
        }
    }

    /// Re-read status fields from job files to pick up edits made by other
    /// processes. Jobs in `skip` keep their in-memory state. Returns the IDs
    /// whose status changed. Unreadable files are logged and skipped.
    pub fn reload_statuses(&mut self, skip: &HashSet<String>) -> Vec<String> {
        let mut changed = Vec::new();
        for job in &mut self.jobs {
            if skip.contains(&job.id) {
                continue;
            }
            let Some(path) = &job.path else { continue };
            let on_disk = match JobStore::new(path).load() {
                Ok(Some(j)) => j,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Failed to reload {}: {}", path.display(), e);
                    continue;
                }
            };

            if on_disk.status != job.status || on_disk.awaiting_completion != job.awaiting_completion {
                log::info!("Job {} changed on disk: {} -> {}", job.id, job.status, on_disk.status);
                if on_disk.status != job.status {
                    changed.push(job.id.clone());
                }
                job.status = on_disk.status;
                job.awaiting_completion = on_disk.awaiting_completion;
                job.started_at = on_disk.started_at;
                job.completed_at = on_disk.completed_at;
            }
        }
        changed
    }

    fn require(&self, id: &str) -> Result<usize> {
        self.index_of(id)
            .ok_or_else(|| FlowError::JobNotFound(id.to_string()))
    }

    fn persist(&self, idx: usize) -> Result<()> {
        match &self.jobs[idx].path {
            Some(path) => JobStore::new(path).write_status(&self.jobs[idx]),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobType;

    fn write(dir: &Path, name: &str, id: &str, deps: &str) {
        let content = format!(
            "---\nid: {id}\ntitle: {id}\nstatus: pending\ntype: shell\ndepends_on: [{deps}]\n---\necho {id}\n"
        );
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_load_orders_by_filename_and_skips_non_jobs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "02-build.md", "build", "setup");
        write(dir.path(), "01-setup.md", "setup", "");
        fs::write(dir.path().join("README.md"), "# Notes\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let plan = Plan::load(dir.path()).unwrap();
        let ids: Vec<_> = plan.jobs().iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["setup", "build"]);
    }

    #[test]
    fn test_load_duplicate_names_both_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "01-a.md", "same", "");
        write(dir.path(), "02-b.md", "same", "");

        let err = Plan::load(dir.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("duplicate job ID"));
        assert!(msg.contains("01-a.md") && msg.contains("02-b.md"));
    }

    #[test]
    fn test_update_status_persists() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "01-setup.md", "setup", "");
        let mut plan = Plan::load(dir.path()).unwrap();

        plan.update_status("setup", JobStatus::Running).unwrap();
        assert!(plan.get("setup").unwrap().started_at().is_some());

        let reloaded = Plan::load(dir.path()).unwrap();
        assert_eq!(reloaded.get("setup").unwrap().status(), JobStatus::Running);
    }

    #[test]
    fn test_update_status_rolls_back_on_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "01-setup.md", "setup", "");
        let mut plan = Plan::load(dir.path()).unwrap();

        fs::remove_file(dir.path().join("01-setup.md")).unwrap();
        assert!(plan.update_status("setup", JobStatus::Running).is_err());

        let job = plan.get("setup").unwrap();
        assert_eq!(job.status(), JobStatus::Pending);
        assert!(job.started_at().is_none());
    }

    #[test]
    fn test_reload_picks_up_external_edit() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "01-setup.md", "setup", "");
        let mut plan = Plan::load(dir.path()).unwrap();
        let mut other = Plan::load(dir.path()).unwrap();

        other.update_status("setup", JobStatus::Completed).unwrap();
        assert_eq!(plan.reload_statuses(&HashSet::new()), vec!["setup".to_string()]);
        assert_eq!(plan.get("setup").unwrap().status(), JobStatus::Completed);
        assert!(plan.reload_statuses(&HashSet::new()).is_empty());
    }

    #[test]
    fn test_reload_skips_excluded_jobs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "01-setup.md", "setup", "");
        let mut plan = Plan::load(dir.path()).unwrap();
        let mut other = Plan::load(dir.path()).unwrap();

        other.update_status("setup", JobStatus::Completed).unwrap();
        let skip = HashSet::from(["setup".to_string()]);
        assert!(plan.reload_statuses(&skip).is_empty());
        assert_eq!(plan.get("setup").unwrap().status(), JobStatus::Pending);
    }

    #[test]
    fn test_unknown_job_id() {
        let mut plan = Plan::from_jobs("t", PathBuf::from("."), vec![Job::new("a", JobType::Shell)]).unwrap();
        assert!(matches!(
            plan.update_status("b", JobStatus::Running),
            Err(FlowError::JobNotFound(_))
        ));
    }
}
