//! Custom error types for the orchestration engine.
//!
//! Every failure that can end a feature run maps to one variant here so the
//! scheduler can turn it into a terminal event with readable text instead of
//! tearing down the whole service.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for orchestration operations
#[derive(Error, Debug)]
pub enum AutoModeError {
    // =========================================================================
    // Scheduling Errors
    // =========================================================================
    /// A feature or project loop is already active
    #[error("Already running: {target}")]
    AlreadyRunning { target: String },

    /// Stop/follow-up requested for something that is not running
    #[error("Not running: {target}")]
    NotRunning { target: String },

    /// Admission deferred because dependencies are not verified yet
    #[error("Feature {feature_id} is blocked by unverified dependencies: {}", .pending.join(", "))]
    DependencyUnsatisfied {
        feature_id: String,
        pending: Vec<String>,
    },

    /// Feature record does not exist
    #[error("Feature not found: {feature_id}")]
    FeatureNotFound { feature_id: String },

    /// Status change the feature lifecycle does not allow
    #[error("Feature {feature_id} cannot move from {from} to {to}")]
    InvalidTransition {
        feature_id: String,
        from: String,
        to: String,
    },

    /// Agent task runner failed or verification did not pass
    #[error("Agent task failed for {feature_id}: {message}")]
    AgentTask { feature_id: String, message: String },

    // =========================================================================
    // Worktree Errors
    // =========================================================================
    /// Could not create or locate a worktree
    #[error("Failed to create worktree for branch '{branch}': {message}")]
    WorktreeCreation { branch: String, message: String },

    /// Merge stopped on conflicts; message is git's own output
    #[error("Merge conflict merging '{branch}': {message}")]
    MergeConflict { branch: String, message: String },

    /// No POSIX-compatible shell could be located
    #[error("No compatible shell found (searched: {})", .searched.join(", "))]
    ShellNotFound { searched: Vec<String> },

    /// Branch name git would reject
    #[error("Invalid branch name '{branch}': {reason}")]
    InvalidBranch { branch: String, reason: String },

    /// Git operation failed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    // =========================================================================
    // Storage / Configuration Errors
    // =========================================================================
    /// Path escaped the allow-listed roots of the file store
    #[error("Security violation: path {path} is outside the allowed roots")]
    SecurityViolation { path: PathBuf },

    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AutoModeError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create an already-running error
    pub fn already_running(target: impl Into<String>) -> Self {
        Self::AlreadyRunning {
            target: target.into(),
        }
    }

    /// Create a not-running error
    pub fn not_running(target: impl Into<String>) -> Self {
        Self::NotRunning {
            target: target.into(),
        }
    }

    /// Create a feature-not-found error
    pub fn feature_not_found(feature_id: impl Into<String>) -> Self {
        Self::FeatureNotFound {
            feature_id: feature_id.into(),
        }
    }

    /// Create an agent task error
    pub fn agent_task(feature_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AgentTask {
            feature_id: feature_id.into(),
            message: message.into(),
        }
    }

    /// Create a worktree creation error
    pub fn worktree(branch: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WorktreeCreation {
            branch: branch.into(),
            message: message.into(),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Failures that end one feature run but leave the scheduler healthy.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DependencyUnsatisfied { .. }
                | Self::WorktreeCreation { .. }
                | Self::MergeConflict { .. }
                | Self::ShellNotFound { .. }
                | Self::AgentTask { .. }
                | Self::Git { .. }
        )
    }

    /// Rejections caused by the caller's request rather than an external tool.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning { .. }
                | Self::NotRunning { .. }
                | Self::FeatureNotFound { .. }
                | Self::InvalidTransition { .. }
                | Self::InvalidBranch { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AlreadyRunning { .. } | Self::NotRunning { .. } => 2,
            Self::FeatureNotFound { .. }
            | Self::InvalidTransition { .. }
            | Self::InvalidBranch { .. } => 3,
            Self::MergeConflict { .. } => 4,
            Self::SecurityViolation { .. } => 5,
            Self::Config { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for orchestration results
pub type Result<T> = std::result::Result<T, AutoModeError>;

/// Extension trait for converting anyhow errors to AutoModeError
pub trait IntoAutoModeError<T> {
    fn into_git_error(self, operation: &str) -> Result<T>;
    fn into_worktree_error(self, branch: &str) -> Result<T>;
    fn into_agent_error(self, feature_id: &str) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> IntoAutoModeError<T> for std::result::Result<T, E> {
    fn into_git_error(self, operation: &str) -> Result<T> {
        self.map_err(|e| AutoModeError::git(operation, format!("{:#}", e.into())))
    }

    fn into_worktree_error(self, branch: &str) -> Result<T> {
        self.map_err(|e| AutoModeError::worktree(branch, format!("{:#}", e.into())))
    }

    fn into_agent_error(self, feature_id: &str) -> Result<T> {
        self.map_err(|e| AutoModeError::agent_task(feature_id, format!("{:#}", e.into())))
    }
}
