//! Testing infrastructure for the orchestration engine.
//!
//! This module provides the collaborator traits the engine is written
//! against, mocks implementing them, and fixtures for scheduler tests.
//!
//! # Architecture
//!
//! The testing infrastructure is organized into:
//! - **Traits**: Abstractions for external dependencies (git, the coding agent, the file system)
//! - **Mocks**: Test doubles that implement the traits with controllable behavior
//! - **Fixtures**: Fully wired temporary projects (test-only)
//!
//! # Example
//!
//! ```rust,ignore
//! use automode::testing::{MockAgentRunner, MockGit};
//!
//! let git = MockGit::new().with_branch("feat/login");
//!
//! let agent = MockAgentRunner::new()
//!     .with_feature_failure("feature-1", Phase::Verification, "tests failed");
//! ```

#[cfg(test)]
pub mod fixtures;
pub mod mocks;
pub mod traits;

// Re-export commonly used types
#[cfg(test)]
pub use fixtures::*;
pub use mocks::*;
pub use traits::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Phase;
    use futures::StreamExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn request(feature_id: &str, phase: Phase) -> AgentRequest {
        AgentRequest {
            feature_id: feature_id.to_string(),
            phase,
            prompt: "do it".to_string(),
            cwd: PathBuf::from("/repo"),
            allowed_tools: vec!["Read".to_string()],
            images: Vec::new(),
        }
    }

    // =========================================================================
    // Mock Git Tests
    // =========================================================================

    #[tokio::test]
    async fn test_mock_git_defaults_to_main() {
        let git = MockGit::new();
        let repo = Path::new("/repo");
        assert_eq!(git.current_branch(repo).await.unwrap(), "main");
        assert!(git.branch_exists(repo, "main").await.unwrap());
        assert!(!git.branch_exists(repo, "feat-x").await.unwrap());
        assert_eq!(git.worktree_list(repo).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_git_worktree_add_checks_branches() {
        let temp = tempfile::TempDir::new().unwrap();
        let git = MockGit::new().with_branch("feat/existing");
        let path = temp.path().join("wt");

        assert!(git
            .worktree_add(temp.path(), &path, "feat/existing", None, true)
            .await
            .is_err());
        assert!(git
            .worktree_add(temp.path(), &path, "feat/missing", None, false)
            .await
            .is_err());
        git.worktree_add(temp.path(), &path, "feat/existing", None, false)
            .await
            .unwrap();

        assert!(path.exists());
        assert_eq!(git.worktree_add_count(), 3);
        assert_eq!(git.calls(), vec!["worktree add feat/existing"]);
    }

    #[tokio::test]
    async fn test_mock_git_merge_conflict() {
        let git = MockGit::new().with_merge_conflict("CONFLICT");
        let outcome = git.merge(Path::new("/repo"), "feat-x", false, "msg").await.unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Conflicted {
                output: "CONFLICT".to_string()
            }
        );
        assert!(git.merge_in_progress(Path::new("/repo")).await.unwrap());
        git.merge_abort(Path::new("/repo"), false).await.unwrap();
        assert!(!git.merge_in_progress(Path::new("/repo")).await.unwrap());
        assert!(git.merge_abort(Path::new("/repo"), false).await.is_err());
    }

    // =========================================================================
    // Mock Agent Tests
    // =========================================================================

    #[tokio::test]
    async fn test_mock_agent_default_passes() {
        let agent = MockAgentRunner::new();
        let stream = agent
            .run(request("f1", Phase::Action), CancellationToken::new())
            .await
            .unwrap();
        let messages: Vec<AgentMessage> = stream.collect().await;

        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages.last(),
            Some(&AgentMessage::Result {
                success: true,
                summary: "action complete".to_string()
            })
        );
        assert_eq!(agent.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_agent_feature_failure_beats_phase_failure() {
        let agent = MockAgentRunner::new()
            .with_phase_failure(Phase::Action, "generic")
            .with_feature_failure("f1", Phase::Action, "specific");
        let messages: Vec<AgentMessage> = agent
            .run(request("f1", Phase::Action), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(
            messages.last(),
            Some(AgentMessage::Result { success: false, summary }) if summary == "specific"
        ));
    }

    #[tokio::test]
    async fn test_mock_agent_hold_ends_on_cancel() {
        let agent = std::sync::Arc::new(MockAgentRunner::new().with_hold("f1"));
        let cancel = CancellationToken::new();
        let task = {
            let agent = std::sync::Arc::clone(&agent);
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.run(request("f1", Phase::Planning), cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(agent.max_in_flight(), 1);
        cancel.cancel();
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_mock_agent_start_error() {
        let agent = MockAgentRunner::new().with_start_error("spawn failed");
        let result = agent
            .run(request("f1", Phase::Planning), CancellationToken::new())
            .await;
        assert!(result.is_err());
        assert_eq!(agent.requests().len(), 1);
    }
}
