//! Orchestrator configuration
//!
//! Layered: built-in defaults, then `<config dir>/flowplan/config.yml`, then
//! `.flowplan.yml` in the plan directory, then `FLOWPLAN_MAX_PARALLEL`.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FlowError, Result};

pub const PLAN_CONFIG_FILE: &str = ".flowplan.yml";
pub const MAX_PARALLEL_ENV: &str = "FLOWPLAN_MAX_PARALLEL";

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_parallel_jobs: usize,
    /// How often job files are re-read to pick up external status edits.
    #[serde(with = "duration_str")]
    pub check_interval: Duration,
    /// Directory, relative to the repository root, that holds managed worktrees.
    pub worktree_base_dir: PathBuf,
    pub worktree: WorktreeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 3,
            check_interval: Duration::from_secs(5),
            worktree_base_dir: PathBuf::from(".flowplan-worktrees"),
            worktree: WorktreeConfig::default(),
        }
    }
}

/// Worktree cleanup policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Remove a job's worktree once the job finishes.
    pub auto_cleanup: bool,
    /// Age after which an unlocked worktree counts as stale.
    #[serde(with = "duration_str")]
    pub cleanup_age: Duration,
    /// Keep the worktree of a failed job for inspection.
    pub preserve_on_error: bool,
    /// Ask before removing a worktree.
    pub cleanup_prompt: bool,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            auto_cleanup: true,
            cleanup_age: Duration::from_secs(24 * 60 * 60),
            preserve_on_error: true,
            cleanup_prompt: false,
        }
    }
}

impl OrchestratorConfig {
    /// Global config file location, if the platform has a config dir.
    pub fn global_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("flowplan").join("config.yml"))
    }

    /// Resolve the effective config for a plan directory.
    pub fn load(plan_dir: &Path) -> Result<Self> {
        let global = Self::global_path();
        let env = std::env::var(MAX_PARALLEL_ENV).ok();
        Self::load_layers(global.as_deref(), Some(&plan_dir.join(PLAN_CONFIG_FILE)), env.as_deref())
    }

    /// Merge the given layers over the defaults. Missing files are skipped.
    pub fn load_layers(
        global: Option<&Path>,
        plan: Option<&Path>,
        max_parallel_override: Option<&str>,
    ) -> Result<Self> {
        let mut merged = serde_yaml::to_value(Self::default())?;

        for path in [global, plan].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            log::debug!("Loading config layer {}", path.display());
            let content = std::fs::read_to_string(path)?;
            if content.trim().is_empty() {
                continue;
            }
            let layer: Value = serde_yaml::from_str(&content)
                .map_err(|e| FlowError::Config(format!("{}: {}", path.display(), e)))?;
            merge(&mut merged, layer);
        }

        let mut config: Self = serde_yaml::from_value(merged)
            .map_err(|e| FlowError::Config(e.to_string()))?;

        if let Some(raw) = max_parallel_override {
            config.max_parallel_jobs = raw.trim().parse().map_err(|_| {
                FlowError::Config(format!("{} must be a positive integer, got '{}'", MAX_PARALLEL_ENV, raw))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_jobs == 0 {
            return Err(FlowError::Config("max_parallel_jobs must be at least 1".to_string()));
        }
        if self.check_interval.is_zero() {
            return Err(FlowError::Config("check_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Overlay `layer` onto `base`, recursing into mappings.
fn merge(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Mapping(base), Value::Mapping(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

/// Parse a duration such as `"250ms"`, `"30s"`, `"24h"` or `"1h30m"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let idx = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("duration '{}' missing unit suffix", s))?;
        let (num_part, tail) = rest.split_at(idx);
        let value: u64 = num_part
            .parse()
            .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        total += match unit.trim().to_lowercase().as_str() {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 60 * 60),
            other => {
                return Err(format!(
                    "unsupported duration unit '{}'; expected ms, s, m, or h",
                    other
                ))
            }
        };
        rest = next;
    }
    Ok(total)
}

/// Render a duration in the compact form [`parse_duration`] accepts.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return format!("{}ms", d.subsec_millis());
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if s > 0 || out.is_empty() {
        out.push_str(&format!("{}s", s));
    }
    out
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
