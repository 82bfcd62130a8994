//! Configuration management for the orchestration engine.
//!
//! Project settings live in `.automaker/automode.json`. Every field has a
//! serde default so a partial (or missing) file still loads.

use crate::error::{AutoModeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory holding all per-project state.
pub const AUTOMAKER_DIR: &str = ".automaker";

/// Feature records, one directory per feature id.
pub const FEATURES_DIR: &str = "features";

/// Worktree metadata records, one directory per sanitized branch.
pub const WORKTREES_META_DIR: &str = "worktrees";

/// Per-feature JSON record file name.
pub const FEATURE_FILE: &str = "feature.json";

/// Per-feature agent context artifact.
pub const CONTEXT_FILE: &str = "agent-output.md";

/// Per-worktree metadata file name.
pub const WORKTREE_META_FILE: &str = "worktree.json";

/// Relative path of the one-shot worktree init script.
pub const INIT_SCRIPT_RELATIVE_PATH: &str = ".automaker/worktree-init.sh";

/// Scheduler and worktree settings for one project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutoModeConfig {
    /// Upper bound on features the auto loop runs at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Branch features merge into. Detected from the project checkout when unset.
    #[serde(default)]
    pub main_branch: Option<String>,

    /// Run features in their own worktree instead of the project root.
    #[serde(default = "default_true")]
    pub use_worktrees: bool,

    /// Park passing features in `waiting_approval` instead of `verified`.
    #[serde(default)]
    pub require_approval: bool,

    /// Consecutive failures after which the auto loop stops retrying a feature.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fallback admission re-evaluation interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Directory (relative to the project) where worktrees are created.
    #[serde(default = "default_worktrees_dir")]
    pub worktrees_dir: String,

    /// Agent CLI invocation; the prompt is written to its stdin.
    #[serde(default = "default_agent_command")]
    pub agent_command: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_concurrency() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_worktrees_dir() -> String {
    ".worktrees".to_string()
}

fn default_agent_command() -> Vec<String> {
    ["claude", "-p", "--output-format", "stream-json", "--verbose"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for AutoModeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            main_branch: None,
            use_worktrees: true,
            require_approval: false,
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            worktrees_dir: default_worktrees_dir(),
            agent_command: default_agent_command(),
        }
    }
}

impl AutoModeConfig {
    /// Load configuration for a project, falling back to defaults when the
    /// settings file does not exist.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let settings_path = Self::settings_path(project_dir);

        if settings_path.exists() {
            let content = std::fs::read_to_string(&settings_path)?;
            let config: AutoModeConfig = serde_json::from_str(&content).map_err(|e| {
                AutoModeError::config_with_path(e.to_string(), settings_path.clone())
            })?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(AutoModeError::config("maxConcurrency must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(AutoModeError::config("maxAttempts must be at least 1"));
        }
        if self.agent_command.first().is_none_or(|c| c.trim().is_empty()) {
            return Err(AutoModeError::config("agentCommand must name a program"));
        }
        if self.worktrees_dir.trim().is_empty() {
            return Err(AutoModeError::config("worktreesDir must not be empty"));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    #[must_use]
    pub fn with_main_branch(mut self, branch: impl Into<String>) -> Self {
        self.main_branch = Some(branch.into());
        self
    }

    #[must_use]
    pub fn with_require_approval(mut self, require: bool) -> Self {
        self.require_approval = require;
        self
    }

    #[must_use]
    pub fn with_use_worktrees(mut self, use_worktrees: bool) -> Self {
        self.use_worktrees = use_worktrees;
        self
    }

    #[must_use]
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Get the settings path for a project
    pub fn settings_path(project_dir: &Path) -> PathBuf {
        project_dir.join(AUTOMAKER_DIR).join("automode.json")
    }

    /// Get the features directory
    pub fn features_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(AUTOMAKER_DIR).join(FEATURES_DIR)
    }

    /// Get the worktree metadata directory
    pub fn worktree_meta_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(AUTOMAKER_DIR).join(WORKTREES_META_DIR)
    }

    /// Get the init script path
    pub fn init_script_path(project_dir: &Path) -> PathBuf {
        project_dir.join(INIT_SCRIPT_RELATIVE_PATH)
    }

    /// Directory worktrees are checked out under.
    pub fn worktrees_root(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.worktrees_dir)
    }
}
