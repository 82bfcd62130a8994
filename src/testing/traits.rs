//! Trait definitions for testable abstractions.
//!
//! These traits abstract the external collaborators of the engine (git, the
//! coding agent, and the file system) so the scheduler and worktree manager
//! can be exercised without real repositories or subprocesses.

use crate::error::Result as AutoModeResult;
use crate::events::Phase;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name, `None` for a detached HEAD.
    pub branch: Option<String>,
    pub bare: bool,
}

/// Result of asking git to merge a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// Merge stopped; carries git's combined output verbatim.
    Conflicted { output: String },
}

/// Abstraction for git operations.
///
/// Every method takes the repository (or worktree) path explicitly; nothing
/// depends on the process working directory.
///
/// # Example
///
/// ```rust,ignore
/// use automode::testing::GitClient;
///
/// async fn has_worktree(git: &dyn GitClient, repo: &Path, branch: &str) -> bool {
///     git.worktree_list(repo).await.map(|list| {
///         list.iter().any(|w| w.branch.as_deref() == Some(branch))
///     }).unwrap_or(false)
/// }
/// ```
#[async_trait]
pub trait GitClient: Send + Sync {
    /// Branch checked out in `repo`.
    ///
    /// # Errors
    ///
    /// Returns an error if git is not available or `repo` is not a repository.
    async fn current_branch(&self, repo: &Path) -> Result<String>;

    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool>;

    /// All worktrees registered with `repo`, main checkout first.
    async fn worktree_list(&self, repo: &Path) -> Result<Vec<WorktreeEntry>>;

    /// Check `branch` out at `path`.
    ///
    /// With `create_branch`, the branch is created from `base` (or HEAD).
    ///
    /// # Errors
    ///
    /// Returns git's error text when the worktree cannot be added.
    async fn worktree_add(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: Option<&str>,
        create_branch: bool,
    ) -> Result<()>;

    async fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<()>;

    async fn worktree_prune(&self, repo: &Path) -> Result<()>;

    /// Force-delete a local branch.
    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()>;

    /// Merge `branch` into the branch checked out in `repo`.
    ///
    /// A non-zero git exit is reported as [`MergeOutcome::Conflicted`], not
    /// as an error, so the caller can decide how to clean up.
    async fn merge(
        &self,
        repo: &Path,
        branch: &str,
        squash: bool,
        message: &str,
    ) -> Result<MergeOutcome>;

    /// Roll back an interrupted merge.
    async fn merge_abort(&self, repo: &Path, squash: bool) -> Result<()>;

    /// Whether tracked files in `repo` differ from HEAD, staged or not.
    /// Untracked files are ignored.
    async fn has_tracked_changes(&self, repo: &Path) -> Result<bool>;

    /// Whether a merge left state behind in `repo`: `MERGE_HEAD`, unmerged
    /// paths, or staged changes. Only meaningful when the tree was clean
    /// before the merge started.
    async fn merge_in_progress(&self, repo: &Path) -> Result<bool>;

    /// Stage everything and commit. Returns false when there was nothing to commit.
    async fn commit_all(&self, worktree: &Path, message: &str) -> Result<bool>;
}

/// A single unit of work handed to the coding agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub feature_id: String,
    pub phase: Phase,
    pub prompt: String,
    pub cwd: PathBuf,
    pub allowed_tools: Vec<String>,
    pub images: Vec<PathBuf>,
}

/// Message yielded by an agent run.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    Text(String),
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    /// Final message of a run.
    Result { success: bool, summary: String },
}

/// Stream of agent messages for one request.
pub type AgentStream = BoxStream<'static, AgentMessage>;

/// Abstraction for the coding agent.
///
/// The runner must observe the cancellation token: once it fires, the
/// stream should end promptly.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Start the agent on `request`.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent cannot be started at all.
    async fn run(&self, request: AgentRequest, cancel: CancellationToken) -> Result<AgentStream>;
}

/// Abstraction for file system access restricted to allow-listed roots.
///
/// Implementations reject paths outside their roots with
/// [`crate::AutoModeError::SecurityViolation`].
pub trait SecureFileStore: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the file doesn't exist or can't be read.
    fn read_to_string(&self, path: &Path) -> AutoModeResult<String>;

    /// Replace the file's contents so readers see either the old or the new
    /// bytes, never a mix. Creates parent directories.
    fn write_atomic(&self, path: &Path, contents: &[u8]) -> AutoModeResult<()>;

    /// Append to a file, creating it and its parents if needed.
    fn append(&self, path: &Path, contents: &str) -> AutoModeResult<()>;

    fn create_dir_all(&self, path: &Path) -> AutoModeResult<()>;

    /// Remove a file or a directory tree. Missing paths are not an error.
    fn remove(&self, path: &Path) -> AutoModeResult<()>;

    fn exists(&self, path: &Path) -> bool;

    /// Immediate children of a directory; empty if it does not exist.
    fn list_dir(&self, path: &Path) -> AutoModeResult<Vec<PathBuf>>;
}
