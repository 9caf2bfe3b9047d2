//! Worktree resource manager - exclusive, lockable checkouts for jobs

mod backend;
mod lock;
mod manager;

pub use backend::{parse_porcelain, GitCli, WorktreeBackend};
pub use lock::WorktreeLock;
pub use manager::WorktreeManager;

use regex::Regex;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::error::{FlowError, Result};

const MAX_NAME_LEN: usize = 100;

/// A checkout known to the backing store
#[derive(Debug, Clone, PartialEq)]
pub struct Worktree {
    pub name: String,
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
}

impl Worktree {
    /// Worktree at `path`, named after its last path component.
    pub fn at(path: PathBuf) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            path,
            branch: None,
            head: None,
        }
    }
}

/// Asks whether a finished job's worktree may be removed.
pub trait CleanupPrompt: Send + Sync {
    fn confirm(&self, worktree: &str, job_id: &str) -> bool;
}

/// Interactive `[y/N]` prompt on the terminal
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl CleanupPrompt for StdinPrompt {
    fn confirm(&self, worktree: &str, job_id: &str) -> bool {
        print!("Remove worktree '{}' for job {}? [y/N]: ", worktree, job_id);
        if std::io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        answer.trim().eq_ignore_ascii_case("y")
    }
}

/// Worktree names are single path components: `[A-Za-z0-9_-]`, at most
/// 100 characters.
pub fn validate_name(name: &str) -> Result<()> {
    static VALID: OnceLock<Regex> = OnceLock::new();
    let invalid = |reason: &str| FlowError::InvalidWorktreeName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name too long (max 100 characters)"));
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(invalid("name contains path traversal characters"));
    }
    let re = VALID.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"));
    if !re.is_match(name) {
        return Err(invalid(
            "use only letters, numbers, hyphens, and underscores",
        ));
    }
    Ok(())
}

/// Collapse anything outside `[A-Za-z0-9_-]` into single hyphens.
pub fn sanitize_for_path(s: &str) -> String {
    static SPECIAL: OnceLock<Regex> = OnceLock::new();
    static HYPHENS: OnceLock<Regex> = OnceLock::new();
    let special = SPECIAL.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("static regex"));
    let hyphens = HYPHENS.get_or_init(|| Regex::new(r"-+").expect("static regex"));

    let replaced = special.replace_all(s, "-");
    hyphens
        .replace_all(replaced.trim_matches('-'), "-")
        .into_owned()
}
