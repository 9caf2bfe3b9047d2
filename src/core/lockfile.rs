//! Job-level advisory lock: `<job file>.lock` holding the owner's PID

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{FlowError, Result};
use crate::process;

const RECLAIM_GUARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Guard for a job lock file. The file is removed on drop when this guard
/// created it; a guard re-entered by the owning process leaves it alone.
#[derive(Debug)]
pub struct JobLock {
    path: PathBuf,
    owned: bool,
}

pub fn lock_path(job_file: &Path) -> PathBuf {
    let mut name = job_file.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

impl JobLock {
    /// Take the lock for `job_file`, reclaiming it if the recorded holder is
    /// dead. Fails with [`FlowError::JobLocked`] while a live process other
    /// than this one holds it.
    pub fn acquire(job_file: &Path) -> Result<Self> {
        let path = lock_path(job_file);
        let me = process::current_pid();

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", me)?;
                    file.sync_all()?;
                    return Ok(Self { path, owned: true });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let content = match fs::read_to_string(&path) {
                        Ok(c) => c,
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };
                    match content.trim().parse::<u32>().ok() {
                        Some(pid) if pid == me => return Ok(Self { path, owned: false }),
                        Some(pid) if process::is_alive(pid) => {
                            return Err(FlowError::JobLocked(job_file.to_path_buf()))
                        }
                        _ => {
                            if !reclaim_stale(&path, |current| current == content)? {
                                return Err(FlowError::JobLocked(job_file.to_path_buf()));
                            }
                            log::warn!("Reclaimed stale job lock {}", path.display());
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(FlowError::JobLocked(job_file.to_path_buf()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if self.owned {
            if let Err(e) = remove_if_present(&self.path) {
                log::warn!("Failed to remove job lock {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Delete the lock file at `lock` if `still_stale` holds for its current
/// content. Runs under an exclusive `<lock>.reclaim` guard, so a lock
/// created by another process after the stale one was read is never
/// deleted. Returns true when the lock is gone; false when it is held or
/// another process is reclaiming it.
pub(crate) fn reclaim_stale(lock: &Path, still_stale: impl Fn(&str) -> bool) -> io::Result<bool> {
    let guard = reclaim_guard_path(lock);
    match OpenOptions::new().write(true).create_new(true).open(&guard) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            // A reclaimer that died mid-way leaves its guard behind.
            let age = fs::metadata(&guard)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .unwrap_or_default();
            if age > RECLAIM_GUARD_TIMEOUT {
                log::warn!("Removing abandoned reclaim guard {}", guard.display());
                remove_if_present(&guard)?;
            }
            return Ok(false);
        }
        Err(e) => return Err(e),
    }

    let result = match fs::read_to_string(lock) {
        Ok(current) if still_stale(&current) => remove_if_present(lock).map(|_| true),
        Ok(_) => Ok(false),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    };
    remove_if_present(&guard)?;
    result
}

fn reclaim_guard_path(lock: &Path) -> PathBuf {
    let mut name = lock.as_os_str().to_owned();
    name.push(".reclaim");
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_pid(job_file: &Path) -> Option<u32> {
        fs::read_to_string(lock_path(job_file))
            .ok()
            .and_then(|content| content.trim().parse().ok())
    }

    #[test]
    fn test_lock_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let job = dir.path().join("01-build.md");

        let lock = JobLock::acquire(&job).unwrap();
        assert_eq!(read_pid(&job), Some(process::current_pid()));
        assert!(lock.path().exists());

        drop(lock);
        assert_eq!(read_pid(&job), None);
    }

    #[test]
    fn test_reclaim_skips_replaced_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("w1.lock");
        fs::write(&lock, "new holder").unwrap();

        // The stale record read earlier no longer matches what is on disk.
        assert!(!reclaim_stale(&lock, |current| current == "old holder").unwrap());
        assert_eq!(fs::read_to_string(&lock).unwrap(), "new holder");
        assert!(!reclaim_guard_path(&lock).exists());

        assert!(reclaim_stale(&lock, |current| current == "new holder").unwrap());
        assert!(!lock.exists());
    }

    #[test]
    fn test_reclaim_yields_to_active_reclaimer() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("w1.lock");
        fs::write(&lock, "stale").unwrap();
        fs::write(reclaim_guard_path(&lock), "").unwrap();

        assert!(!reclaim_stale(&lock, |_| true).unwrap());
        assert!(lock.exists());
    }

    #[test]
    fn test_abandoned_guard_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("w1.lock");
        fs::write(&lock, "stale").unwrap();
        let guard = reclaim_guard_path(&lock);
        fs::write(&guard, "").unwrap();
        fs::File::options()
            .write(true)
            .open(&guard)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(60))
            .unwrap();

        assert!(!reclaim_stale(&lock, |_| true).unwrap());
        assert!(!guard.exists());
        assert!(reclaim_stale(&lock, |_| true).unwrap());
    }

    #[test]
    fn test_reentrant_guard_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let job = dir.path().join("01-build.md");

        let outer = JobLock::acquire(&job).unwrap();
        let inner = JobLock::acquire(&job).unwrap();
        drop(inner);
        assert!(outer.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_holder_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let job = dir.path().join("01-build.md");

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();
        fs::write(lock_path(&job), dead.to_string()).unwrap();

        let _lock = JobLock::acquire(&job).unwrap();
        assert_eq!(read_pid(&job), Some(process::current_pid()));
    }

    #[cfg(unix)]
    #[test]
    fn test_live_foreign_holder_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let job = dir.path().join("01-build.md");

        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        fs::write(lock_path(&job), child.id().to_string()).unwrap();

        let err = JobLock::acquire(&job).unwrap_err();
        assert!(matches!(err, FlowError::JobLocked(_)));

        child.kill().unwrap();
        child.wait().unwrap();
    }
}
