//! Worktree lifecycle: creation, exclusive locking, stale reclamation, cleanup

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use super::{sanitize_for_path, validate_name, CleanupPrompt, Worktree, WorktreeBackend, WorktreeLock};
use crate::config::WorktreeConfig;
use crate::core::{reclaim_stale, Job, JobStatus};
use crate::error::{FlowError, Result};
use crate::process;

const LOCKS_DIR: &str = ".locks";
const BRANCH_PREFIX: &str = "flowplan";
/// A lock file this young with unreadable content may still be mid-write.
const PARTIAL_LOCK_GRACE: Duration = Duration::from_secs(60);

enum LockState {
    Free,
    Held(WorktreeLock),
}

/// Owns every worktree under `base_dir` for one plan
pub struct WorktreeManager {
    base_dir: PathBuf,
    plan_name: String,
    backend: Box<dyn WorktreeBackend>,
    config: WorktreeConfig,
    prompt: Option<Box<dyn CleanupPrompt>>,
    /// Serializes lock and create attempts within this process.
    mu: Mutex<()>,
}

impl WorktreeManager {
    /// Fails when the backend is not a repository. Creates `base_dir`.
    pub fn new(
        base_dir: impl AsRef<Path>,
        plan_name: &str,
        backend: impl WorktreeBackend + 'static,
        config: WorktreeConfig,
    ) -> Result<Self> {
        if !backend.is_git_repo() {
            return Err(FlowError::Backend("not a git repository".to_string()));
        }
        fs::create_dir_all(base_dir.as_ref())?;
        let base_dir = fs::canonicalize(base_dir.as_ref())?;

        Ok(Self {
            base_dir,
            plan_name: plan_name.to_string(),
            backend: Box::new(backend),
            config,
            prompt: None,
            mu: Mutex::new(()),
        })
    }

    /// Confirmation collaborator used when `cleanup_prompt` is set.
    pub fn with_prompt(mut self, prompt: impl CleanupPrompt + 'static) -> Self {
        self.prompt = Some(Box::new(prompt));
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config(&self) -> &WorktreeConfig {
        &self.config
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.mu.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `<base>/<plan>-worktrees/<name>`
    pub fn worktree_path(&self, name: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}-worktrees", sanitize_for_path(&self.plan_name)))
            .join(name)
    }

    /// `flowplan/<plan>/<name>`
    pub fn branch_name(&self, name: &str) -> String {
        format!("{}/{}/{}", BRANCH_PREFIX, sanitize_for_path(&self.plan_name), name)
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(LOCKS_DIR).join(format!("{}.lock", name))
    }

    fn find_existing(&self, name: &str) -> Result<Option<Worktree>> {
        let expected = self.worktree_path(name);
        Ok(self
            .backend
            .worktree_list()?
            .into_iter()
            .find(|wt| wt.path == expected || (wt.path.starts_with(&self.base_dir) && wt.name == name)))
    }

    /// Create the worktree `name` on a fresh branch forked from `base_branch`.
    /// Returns the existing path if the worktree is already there.
    pub fn create_worktree(&self, name: &str, base_branch: &str) -> Result<PathBuf> {
        validate_name(name)?;
        let _guard = self.guard();

        if let Some(existing) = self.find_existing(name)? {
            return Ok(existing.path);
        }

        let branch = self.branch_name(name);
        if let Err(e) = self.backend.create_branch(&branch, base_branch) {
            if !e.to_string().contains("already exists") {
                return Err(e);
            }
            log::debug!("Branch {} already exists, reusing it", branch);
        }

        let path = self.worktree_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.backend.worktree_add(&path, &branch)?;

        log::info!("Created worktree {} at {} on {}", name, path.display(), branch);
        Ok(path)
    }

    /// Path of the worktree `name`, creating it from the current branch if
    /// needed.
    pub fn get_or_create_worktree(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        if let Some(existing) = self.find_existing(name)? {
            log::debug!("Found existing worktree {} at {}", name, existing.path.display());
            return Ok(existing.path);
        }
        let base = self.backend.current_branch()?;
        self.create_worktree(name, &base)
    }

    /// Take the exclusive lock on `name` for `job_id`. A lock left by a dead
    /// process is reclaimed; any other existing lock is an error.
    pub fn lock_worktree(&self, name: &str, job_id: &str) -> Result<()> {
        validate_name(name)?;
        let _guard = self.guard();

        let path = self.lock_path(name);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let record = WorktreeLock::new(name, job_id, process::current_pid());
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(record.to_file_contents().as_bytes())?;
                    file.sync_all()?;
                    log::debug!("Locked worktree {} for job {}", name, job_id);
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let LockState::Held(holder) = self.read_lock(name)? {
                        return Err(FlowError::AlreadyLocked {
                            name: name.to_string(),
                            job_id: holder.job_id,
                            pid: holder.pid,
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(FlowError::AlreadyLocked {
            name: name.to_string(),
            job_id: "unknown".to_string(),
            pid: 0,
        })
    }

    /// Delete the lock record. Unlocking a free worktree is a no-op.
    pub fn unlock_worktree(&self, name: &str) -> Result<()> {
        let _guard = self.guard();
        remove_if_present(&self.lock_path(name))?;
        log::debug!("Unlocked worktree {}", name);
        Ok(())
    }

    /// Current holder, if any. Stale locks are removed as a side effect.
    pub fn is_locked(&self, name: &str) -> Result<Option<WorktreeLock>> {
        Ok(match self.read_lock(name)? {
            LockState::Held(lock) => Some(lock),
            LockState::Free => None,
        })
    }

    fn read_lock(&self, name: &str) -> Result<LockState> {
        let path = self.lock_path(name);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LockState::Free),
            Err(e) => return Err(e.into()),
        };

        match WorktreeLock::parse(name, &content) {
            Some(lock) if process::is_alive(lock.pid) => Ok(LockState::Held(lock)),
            Some(lock) => {
                if !reclaim_stale(&path, |current| current == content)? {
                    return Ok(LockState::Held(WorktreeLock::new(name, "unknown", 0)));
                }
                log::warn!(
                    "Reclaimed stale lock on worktree {} (job {}, PID {} is gone)",
                    name,
                    lock.job_id,
                    lock.pid
                );
                Ok(LockState::Free)
            }
            None => {
                let expired = |current: &str| current == content && file_age(&path) > PARTIAL_LOCK_GRACE;
                if expired(&content) && reclaim_stale(&path, expired)? {
                    log::warn!("Removed unreadable lock on worktree {}", name);
                    Ok(LockState::Free)
                } else {
                    Ok(LockState::Held(WorktreeLock::new(name, "unknown", 0)))
                }
            }
        }
    }

    /// Remove the worktree from the backend and disk. Refuses while locked
    /// unless `force`. The lock record is always removed last.
    pub fn remove_worktree(&self, name: &str, force: bool) -> Result<()> {
        if let Some(holder) = self.is_locked(name)? {
            if !force {
                return Err(FlowError::AlreadyLocked {
                    name: name.to_string(),
                    job_id: holder.job_id,
                    pid: holder.pid,
                });
            }
        }

        let path = self
            .find_existing(name)?
            .map(|wt| wt.path)
            .unwrap_or_else(|| self.worktree_path(name));

        let removed = self.backend.worktree_remove(&path, force);
        if path.exists() {
            if let Err(e) = fs::remove_dir_all(&path) {
                log::error!("Failed to remove worktree directory {}: {}", path.display(), e);
            }
        }
        let unlocked = remove_if_present(&self.lock_path(name));

        removed?;
        unlocked?;
        log::info!("Removed worktree {}", name);
        Ok(())
    }

    /// Worktrees located under `base_dir`.
    pub fn list_worktrees(&self) -> Result<Vec<Worktree>> {
        Ok(self
            .backend
            .worktree_list()?
            .into_iter()
            .filter(|wt| wt.path.starts_with(&self.base_dir))
            .collect())
    }

    /// Remove unlocked worktrees whose directory was last modified more than
    /// `age` ago. Returns how many were removed.
    pub fn cleanup_stale_worktrees(&self, age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut cleaned = 0;

        for wt in self.list_worktrees()? {
            if self.is_locked(&wt.name)?.is_some() {
                continue;
            }
            let Ok(modified) = fs::metadata(&wt.path).and_then(|m| m.modified()) else {
                continue;
            };
            if now.duration_since(modified).unwrap_or_default() <= age {
                continue;
            }
            match self.remove_worktree(&wt.name, false) {
                Ok(()) => cleaned += 1,
                Err(e) => log::error!("Failed to clean up stale worktree {}: {}", wt.name, e),
            }
        }

        log::info!("Cleaned up {} stale worktrees", cleaned);
        Ok(cleaned)
    }

    /// Apply the cleanup policy to a finished job's worktree. Returns whether
    /// the worktree was removed.
    pub fn cleanup_job_worktree(&self, job: &Job) -> Result<bool> {
        let Some(name) = job.worktree_name() else {
            return Ok(false);
        };
        if !self.config.auto_cleanup {
            return Ok(false);
        }
        if job.status() == JobStatus::Failed && self.config.preserve_on_error {
            log::info!("Preserving worktree {} of failed job {}", name, job.id);
            return Ok(false);
        }
        if self.config.cleanup_prompt {
            let confirmed = match &self.prompt {
                Some(prompt) => prompt.confirm(name, &job.id),
                None => {
                    log::info!("Skipping cleanup of {}: confirmation required", name);
                    false
                }
            };
            if !confirmed {
                return Ok(false);
            }
        }

        self.remove_worktree(name, false)?;
        Ok(true)
    }
}

fn file_age(path: &Path) -> Duration {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .unwrap_or_default()
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobType;
    use std::sync::Arc;

    /// Backend that records worktrees in memory and creates their directories.
    #[derive(Default, Clone)]
    struct FakeBackend {
        worktrees: Arc<Mutex<Vec<Worktree>>>,
        branches: Arc<Mutex<Vec<String>>>,
    }

    impl WorktreeBackend for FakeBackend {
        fn is_git_repo(&self) -> bool {
            true
        }
        fn current_branch(&self) -> Result<String> {
            Ok("main".into())
        }
        fn create_branch(&self, name: &str, _start: &str) -> Result<()> {
            let mut branches = self.branches.lock().unwrap();
            if branches.iter().any(|b| b == name) {
                return Err(FlowError::Backend(format!("branch '{}' already exists", name)));
            }
            branches.push(name.to_string());
            Ok(())
        }
        fn worktree_add(&self, path: &Path, branch: &str) -> Result<()> {
            fs::create_dir_all(path)?;
            let mut wt = Worktree::at(path.to_path_buf());
            wt.branch = Some(branch.to_string());
            self.worktrees.lock().unwrap().push(wt);
            Ok(())
        }
        fn worktree_list(&self) -> Result<Vec<Worktree>> {
            Ok(self.worktrees.lock().unwrap().clone())
        }
        fn worktree_remove(&self, path: &Path, _force: bool) -> Result<()> {
            self.worktrees.lock().unwrap().retain(|w| w.path != path);
            Ok(())
        }
    }

    fn manager(dir: &Path, config: WorktreeConfig) -> (WorktreeManager, FakeBackend) {
        let backend = FakeBackend::default();
        let mgr = WorktreeManager::new(dir.join("wt"), "My Plan", backend.clone(), config).unwrap();
        (mgr, backend)
    }

    fn set_age(path: &Path, age: Duration) {
        let file = fs::File::open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, backend) = manager(dir.path(), WorktreeConfig::default());

        let first = mgr.get_or_create_worktree("w1").unwrap();
        let second = mgr.get_or_create_worktree("w1").unwrap();
        assert_eq!(first, second);
        assert!(first.ends_with("My-Plan-worktrees/w1"));
        assert_eq!(backend.worktree_list().unwrap().len(), 1);
        assert_eq!(
            backend.worktree_list().unwrap()[0].branch.as_deref(),
            Some("flowplan/My-Plan/w1")
        );
    }

    #[test]
    fn test_existing_branch_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, backend) = manager(dir.path(), WorktreeConfig::default());
        backend.create_branch("flowplan/My-Plan/w1", "main").unwrap();

        assert!(mgr.create_worktree("w1", "main").is_ok());
    }

    #[test]
    fn test_invalid_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = manager(dir.path(), WorktreeConfig::default());
        assert!(matches!(
            mgr.get_or_create_worktree("../escape"),
            Err(FlowError::InvalidWorktreeName { .. })
        ));
    }

    #[test]
    fn test_lock_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = manager(dir.path(), WorktreeConfig::default());

        mgr.lock_worktree("w1", "job-a").unwrap();
        let err = mgr.lock_worktree("w1", "job-b").unwrap_err();
        assert!(err.to_string().contains("already locked"));
        assert_eq!(mgr.is_locked("w1").unwrap().unwrap().job_id, "job-a");

        mgr.unlock_worktree("w1").unwrap();
        assert!(mgr.is_locked("w1").unwrap().is_none());
        mgr.lock_worktree("w1", "job-b").unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_holder_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = manager(dir.path(), WorktreeConfig::default());

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();

        let lock_path = mgr.lock_path("w1");
        fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
        fs::write(&lock_path, WorktreeLock::new("w1", "old", dead).to_file_contents()).unwrap();

        mgr.lock_worktree("w1", "new").unwrap();
        let holder = mgr.is_locked("w1").unwrap().unwrap();
        assert_eq!(holder.job_id, "new");
        assert_eq!(holder.pid, process::current_pid());
    }

    #[test]
    fn test_fresh_partial_lock_counts_as_held() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = manager(dir.path(), WorktreeConfig::default());
        let lock_path = mgr.lock_path("w1");
        fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
        fs::write(&lock_path, "").unwrap();

        assert!(mgr.lock_worktree("w1", "a").is_err());

        set_age(&lock_path, Duration::from_secs(120));
        assert!(mgr.lock_worktree("w1", "a").is_ok());
    }

    #[test]
    fn test_concurrent_lockers_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = manager(dir.path(), WorktreeConfig::default());
        let mgr = Arc::new(mgr);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let mgr = mgr.clone();
                std::thread::spawn(move || mgr.lock_worktree("w1", &format!("job-{}", i)).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_concurrent_reclaim_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = manager(dir.path(), WorktreeConfig::default());
        let (second, _) = manager(dir.path(), WorktreeConfig::default());
        let managers = [Arc::new(first), Arc::new(second)];

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();
        let stale = WorktreeLock::new("w1", "old", dead).to_file_contents();
        let lock_path = managers[0].lock_path("w1");
        fs::create_dir_all(lock_path.parent().unwrap()).unwrap();

        // Separate managers share no mutex, so only the files arbitrate.
        for _ in 0..50 {
            fs::write(&lock_path, &stale).unwrap();
            let barrier = Arc::new(std::sync::Barrier::new(managers.len()));
            let handles: Vec<_> = managers
                .iter()
                .enumerate()
                .map(|(i, mgr)| {
                    let mgr = mgr.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        mgr.lock_worktree("w1", &format!("job-{}", i)).is_ok()
                    })
                })
                .collect();
            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
            assert!(managers[0].is_locked("w1").unwrap().is_some());
            managers[0].unlock_worktree("w1").unwrap();
        }
    }

    #[test]
    fn test_remove_refuses_locked_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, backend) = manager(dir.path(), WorktreeConfig::default());
        let path = mgr.get_or_create_worktree("w1").unwrap();
        mgr.lock_worktree("w1", "a").unwrap();

        assert!(mgr.remove_worktree("w1", false).is_err());
        assert!(path.exists());

        mgr.remove_worktree("w1", true).unwrap();
        assert!(!path.exists());
        assert!(backend.worktree_list().unwrap().is_empty());
        assert!(mgr.is_locked("w1").unwrap().is_none());
    }

    #[test]
    fn test_list_only_managed() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, backend) = manager(dir.path(), WorktreeConfig::default());
        mgr.get_or_create_worktree("w1").unwrap();
        backend.worktree_add(&dir.path().join("elsewhere"), "main").unwrap();

        let listed = mgr.list_worktrees().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "w1");
    }

    #[test]
    fn test_cleanup_stale_removes_only_old_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = manager(dir.path(), WorktreeConfig::default());
        let day = Duration::from_secs(24 * 60 * 60);

        let old = mgr.get_or_create_worktree("old").unwrap();
        let old_locked = mgr.get_or_create_worktree("old-locked").unwrap();
        let fresh = mgr.get_or_create_worktree("fresh").unwrap();
        set_age(&old, day * 2);
        set_age(&old_locked, day * 2);
        mgr.lock_worktree("old-locked", "busy").unwrap();

        assert_eq!(mgr.cleanup_stale_worktrees(day).unwrap(), 1);
        assert!(!old.exists());
        assert!(old_locked.exists());
        assert!(fresh.exists());
    }

    struct Answer(bool);

    impl CleanupPrompt for Answer {
        fn confirm(&self, _worktree: &str, _job_id: &str) -> bool {
            self.0
        }
    }

    #[test]
    fn test_cleanup_job_worktree_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _) = manager(dir.path(), WorktreeConfig::default());

        let failed = Job::new("a", JobType::Shell).with_worktree("w1").with_status(JobStatus::Failed);
        let done = Job::new("b", JobType::Shell).with_worktree("w1").with_status(JobStatus::Completed);
        let shared = Job::new("c", JobType::Shell).with_status(JobStatus::Completed);

        let path = mgr.get_or_create_worktree("w1").unwrap();
        assert!(!mgr.cleanup_job_worktree(&failed).unwrap());
        assert!(path.exists());
        assert!(!mgr.cleanup_job_worktree(&shared).unwrap());
        assert!(mgr.cleanup_job_worktree(&done).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_cleanup_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorktreeConfig {
            cleanup_prompt: true,
            ..WorktreeConfig::default()
        };
        let done = Job::new("b", JobType::Shell).with_worktree("w1").with_status(JobStatus::Completed);

        let (mgr, _) = manager(dir.path(), config.clone());
        mgr.get_or_create_worktree("w1").unwrap();
        assert!(!mgr.cleanup_job_worktree(&done).unwrap());

        let mgr = mgr.with_prompt(Answer(false));
        assert!(!mgr.cleanup_job_worktree(&done).unwrap());

        let (mgr, _) = manager(dir.path(), config);
        let mgr = mgr.with_prompt(Answer(true));
        assert!(mgr.cleanup_job_worktree(&done).unwrap());
    }

    #[test]
    fn test_auto_cleanup_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorktreeConfig {
            auto_cleanup: false,
            ..WorktreeConfig::default()
        };
        let (mgr, _) = manager(dir.path(), config);
        mgr.get_or_create_worktree("w1").unwrap();
        let done = Job::new("b", JobType::Shell).with_worktree("w1").with_status(JobStatus::Completed);
        assert!(!mgr.cleanup_job_worktree(&done).unwrap());
    }
}
