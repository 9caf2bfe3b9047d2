//! Durable worktree lock record: `job_id\npid\nRFC3339 timestamp`

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeLock {
    pub worktree_name: String,
    pub job_id: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl WorktreeLock {
    pub fn new(worktree_name: &str, job_id: &str, pid: u32) -> Self {
        Self {
            worktree_name: worktree_name.to_string(),
            job_id: job_id.to_string(),
            pid,
            acquired_at: Utc::now(),
        }
    }

    pub fn to_file_contents(&self) -> String {
        format!("{}\n{}\n{}", self.job_id, self.pid, self.acquired_at.to_rfc3339())
    }

    /// `None` when the content is truncated or malformed.
    pub fn parse(worktree_name: &str, content: &str) -> Option<Self> {
        let mut lines = content.lines();
        let job_id = lines.next()?.trim();
        let pid = lines.next()?.trim().parse().ok()?;
        let acquired_at = DateTime::parse_from_rfc3339(lines.next()?.trim())
            .ok()?
            .with_timezone(&Utc);
        if job_id.is_empty() {
            return None;
        }
        Some(Self {
            worktree_name: worktree_name.to_string(),
            job_id: job_id.to_string(),
            pid,
            acquired_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_format() {
        let lock = WorktreeLock::new("w1", "02-build", 4242);
        let text = lock.to_file_contents();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("02-build"));
        assert_eq!(lines.next(), Some("4242"));
        assert!(DateTime::parse_from_rfc3339(lines.next().unwrap()).is_ok());

        let parsed = WorktreeLock::parse("w1", &text).unwrap();
        assert_eq!(parsed.job_id, "02-build");
        assert_eq!(parsed.pid, 4242);
    }

    #[test]
    fn test_truncated_record() {
        assert!(WorktreeLock::parse("w1", "").is_none());
        assert!(WorktreeLock::parse("w1", "job\n").is_none());
        assert!(WorktreeLock::parse("w1", "job\nabc\n2024-01-01T00:00:00Z").is_none());
    }
}
