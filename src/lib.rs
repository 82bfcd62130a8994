//! Automode - feature orchestration engine for autonomous coding agents
//!
//! Runs a backlog of features through a coding agent, each in its own git
//! worktree, with dependency-aware admission and a bounded number of
//! concurrent runs.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`scheduler`] - Auto-mode admission loop and per-feature run pipeline
//! - [`worktree`] - Worktree creation, init scripts, merge, revert and delete
//! - [`feature`] - Feature records and their on-disk store
//! - [`events`] - Typed events and the pub/sub bus
//! - [`shell`] - Locating a POSIX shell for init scripts
//! - [`operations`] - Real git, agent and file-store implementations
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Testing infrastructure (traits, mocks, fixtures)
//!
//! # Example
//!
//! ```rust,ignore
//! use automode::{AutoModeService, AutoModeDeps, AutoModeConfig};
//!
//! let config = AutoModeConfig::load(&project)?;
//! let service = AutoModeService::new(deps);
//!
//! // Admit backlog features three at a time
//! service.start(&project, config.max_concurrency).await?;
//!
//! // Or run one feature by hand
//! let ack = service.run_feature(&project, "feature-1", true).await?;
//! println!("running in {}", ack.worktree_path.display());
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod feature;
pub mod operations;
pub mod scheduler;
pub mod shell;
pub mod testing;
pub mod worktree;

// Re-export commonly used types
pub use error::{AutoModeError, IntoAutoModeError, Result};

pub use config::AutoModeConfig;

pub use events::{AgentEvent, EventBus, OutputStream, Phase, Subscription, Topic};

pub use feature::{Complexity, Feature, FeatureStatus, FeatureStore};

pub use operations::{CommandAgentRunner, GitCli, ScopedFileStore};

pub use scheduler::{AutoModeDeps, AutoModeService, RunAck, RunMode, STOPPED_BY_USER};

pub use shell::{ResolveShell, ShellCommand, ShellResolver};

// Re-export testing types for convenience
pub use testing::{
    AgentMessage, AgentRequest, AgentRunner, GitClient, MockAgentRunner, MockGit, SecureFileStore,
};

pub use worktree::{
    DeleteWorktreeOptions, EnsuredWorktree, InitOutcome, MergeOptions, WorktreeDeps,
    WorktreeInfo, WorktreeManager,
};
