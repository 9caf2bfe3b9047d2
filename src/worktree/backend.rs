//! Backing store for worktrees - the `git` binary in production

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

use super::Worktree;
use crate::error::{FlowError, Result};

/// Operations the worktree manager needs from version control.
pub trait WorktreeBackend: Send + Sync {
    fn is_git_repo(&self) -> bool;
    fn current_branch(&self) -> Result<String>;
    /// Create `name` starting at `start_point`. Fails if it already exists.
    fn create_branch(&self, name: &str, start_point: &str) -> Result<()>;
    fn worktree_add(&self, path: &Path, branch: &str) -> Result<()>;
    fn worktree_list(&self) -> Result<Vec<Worktree>>;
    fn worktree_remove(&self, path: &Path, force: bool) -> Result<()>;
}

/// [`WorktreeBackend`] that shells out to `git` inside one repository
#[derive(Debug, Clone)]
pub struct GitCli {
    repo: PathBuf,
}

impl GitCli {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    fn git<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(&args)
            .output()
            .map_err(|e| FlowError::Backend(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let command = args
                .iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            return Err(FlowError::Backend(format!("git {}: {}", command, stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl WorktreeBackend for GitCli {
    fn is_git_repo(&self) -> bool {
        self.git(["rev-parse", "--git-dir"]).is_ok()
    }

    fn current_branch(&self) -> Result<String> {
        Ok(self.git(["rev-parse", "--abbrev-ref", "HEAD"])?.trim().to_string())
    }

    fn create_branch(&self, name: &str, start_point: &str) -> Result<()> {
        self.git(["branch", name, start_point]).map(|_| ())
    }

    fn worktree_add(&self, path: &Path, branch: &str) -> Result<()> {
        self.git([
            OsStr::new("worktree"),
            OsStr::new("add"),
            path.as_os_str(),
            OsStr::new(branch),
        ])
        .map(|_| ())
    }

    fn worktree_list(&self) -> Result<Vec<Worktree>> {
        Ok(parse_porcelain(&self.git(["worktree", "list", "--porcelain"])?))
    }

    fn worktree_remove(&self, path: &Path, force: bool) -> Result<()> {
        let mut args = vec![OsString::from("worktree"), OsString::from("remove")];
        if force {
            args.push("--force".into());
        }
        args.push(path.as_os_str().to_os_string());
        self.git(args).map(|_| ())
    }
}

/// Parse `git worktree list --porcelain`: one blank-line separated block
/// per worktree.
pub fn parse_porcelain(output: &str) -> Vec<Worktree> {
    let mut worktrees = Vec::new();
    let mut current: Option<Worktree> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            worktrees.extend(current.take());
            current = Some(Worktree::at(PathBuf::from(path)));
        } else if let Some(wt) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                wt.head = Some(head.to_string());
            } else if let Some(branch) = line.strip_prefix("branch ") {
                let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
                wt.branch = Some(branch.to_string());
            }
        }
    }
    worktrees.extend(current);
    worktrees
}
