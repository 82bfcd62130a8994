//! Mock implementations of testing traits.
//!
//! These mocks provide controllable test doubles for git and the coding
//! agent, enabling deterministic tests of the scheduler and worktree manager.

use super::traits::{
    AgentMessage, AgentRequest, AgentRunner, AgentStream, GitClient, MergeOutcome, WorktreeEntry,
};
use crate::events::Phase;
use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct MockGitState {
    current_branch: String,
    branches: BTreeSet<String>,
    worktrees: Vec<WorktreeEntry>,
    calls: Vec<String>,
    commits: Vec<(PathBuf, String)>,
    merge_pending: bool,
}

/// In-memory git double.
///
/// Worktree directories are really created on disk so init scripts can run
/// inside them; branches and the worktree registry live in memory. Clones
/// share state.
///
/// # Example
///
/// ```rust,ignore
/// let git = MockGit::new()
///     .with_branch("feat/existing")
///     .with_merge_conflict("CONFLICT (content): Merge conflict in README.md");
/// ```
#[derive(Debug, Clone)]
pub struct MockGit {
    state: Arc<Mutex<MockGitState>>,
    add_delay: Duration,
    add_error: Option<String>,
    merge_conflict: Option<String>,
    merge_refusal: Option<String>,
    tracked_changes: bool,
    worktree_add_count: Arc<AtomicU32>,
}

impl Default for MockGit {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockGitState {
                current_branch: "main".to_string(),
                branches: BTreeSet::from(["main".to_string()]),
                worktrees: Vec::new(),
                calls: Vec::new(),
                commits: Vec::new(),
                merge_pending: false,
            })),
            add_delay: Duration::ZERO,
            add_error: None,
            merge_conflict: None,
            merge_refusal: None,
            tracked_changes: false,
            worktree_add_count: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl MockGit {
    /// Create a new mock with `main` checked out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the branch checked out in the project root.
    #[must_use]
    pub fn with_current_branch(self, branch: &str) -> Self {
        {
            let mut state = locked(&self.state);
            state.current_branch = branch.to_string();
            state.branches.insert(branch.to_string());
        }
        self
    }

    /// Add an existing local branch.
    #[must_use]
    pub fn with_branch(self, branch: &str) -> Self {
        locked(&self.state).branches.insert(branch.to_string());
        self
    }

    /// Slow down `worktree add` to widen race windows.
    #[must_use]
    pub fn with_worktree_add_delay(mut self, delay: Duration) -> Self {
        self.add_delay = delay;
        self
    }

    /// Make every `worktree add` fail with this text.
    #[must_use]
    pub fn with_worktree_add_error(mut self, error: &str) -> Self {
        self.add_error = Some(error.to_string());
        self
    }

    /// Make every merge stop with this git output.
    #[must_use]
    pub fn with_merge_conflict(mut self, output: &str) -> Self {
        self.merge_conflict = Some(output.to_string());
        self
    }

    /// Make every merge fail with this text before git touches anything,
    /// as when local changes would be overwritten.
    #[must_use]
    pub fn with_merge_refusal(mut self, output: &str) -> Self {
        self.merge_refusal = Some(output.to_string());
        self
    }

    /// Report uncommitted changes to tracked files in every checkout.
    #[must_use]
    pub fn with_tracked_changes(mut self) -> Self {
        self.tracked_changes = true;
        self
    }

    /// Number of `worktree add` invocations, including failed ones.
    #[must_use]
    pub fn worktree_add_count(&self) -> u32 {
        self.worktree_add_count.load(Ordering::SeqCst)
    }

    /// Every mutating command issued so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        locked(&self.state).calls.clone()
    }

    #[must_use]
    pub fn has_branch(&self, branch: &str) -> bool {
        locked(&self.state).branches.contains(branch)
    }

    /// Commits made through `commit_all`, as (worktree, message).
    #[must_use]
    pub fn commits(&self) -> Vec<(PathBuf, String)> {
        locked(&self.state).commits.clone()
    }

    fn record(&self, call: String) {
        locked(&self.state).calls.push(call);
    }
}

#[async_trait]
impl GitClient for MockGit {
    async fn current_branch(&self, _repo: &Path) -> Result<String> {
        Ok(locked(&self.state).current_branch.clone())
    }

    async fn branch_exists(&self, _repo: &Path, branch: &str) -> Result<bool> {
        Ok(self.has_branch(branch))
    }

    async fn worktree_list(&self, repo: &Path) -> Result<Vec<WorktreeEntry>> {
        let state = locked(&self.state);
        let mut entries = vec![WorktreeEntry {
            path: repo.to_path_buf(),
            head: Some("0000000".to_string()),
            branch: Some(state.current_branch.clone()),
            bare: false,
        }];
        entries.extend(state.worktrees.iter().cloned());
        Ok(entries)
    }

    async fn worktree_add(
        &self,
        _repo: &Path,
        path: &Path,
        branch: &str,
        _base: Option<&str>,
        create_branch: bool,
    ) -> Result<()> {
        self.worktree_add_count.fetch_add(1, Ordering::SeqCst);
        if !self.add_delay.is_zero() {
            tokio::time::sleep(self.add_delay).await;
        }
        if let Some(error) = &self.add_error {
            bail!("{error}");
        }

        {
            let state = locked(&self.state);
            if state.worktrees.iter().any(|w| w.path == path) {
                bail!("fatal: '{}' already exists", path.display());
            }
            let exists = state.branches.contains(branch);
            if create_branch && exists {
                bail!("fatal: a branch named '{branch}' already exists");
            }
            if !create_branch && !exists {
                bail!("fatal: invalid reference: {branch}");
            }
        }

        std::fs::create_dir_all(path)?;

        let mut state = locked(&self.state);
        state.branches.insert(branch.to_string());
        state.worktrees.push(WorktreeEntry {
            path: path.to_path_buf(),
            head: Some("1111111".to_string()),
            branch: Some(branch.to_string()),
            bare: false,
        });
        state.calls.push(format!("worktree add {branch}"));
        Ok(())
    }

    async fn worktree_remove(&self, _repo: &Path, path: &Path) -> Result<()> {
        {
            let mut state = locked(&self.state);
            let before = state.worktrees.len();
            state.worktrees.retain(|w| w.path != path);
            if state.worktrees.len() == before {
                bail!("fatal: '{}' is not a working tree", path.display());
            }
            state.calls.push(format!("worktree remove {}", path.display()));
        }
        match std::fs::remove_dir_all(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn worktree_prune(&self, _repo: &Path) -> Result<()> {
        let mut state = locked(&self.state);
        state.worktrees.retain(|w| w.path.exists());
        state.calls.push("worktree prune".to_string());
        Ok(())
    }

    async fn delete_branch(&self, _repo: &Path, branch: &str) -> Result<()> {
        let mut state = locked(&self.state);
        if !state.branches.remove(branch) {
            bail!("error: branch '{branch}' not found");
        }
        state.calls.push(format!("branch -D {branch}"));
        Ok(())
    }

    async fn merge(
        &self,
        _repo: &Path,
        branch: &str,
        squash: bool,
        _message: &str,
    ) -> Result<MergeOutcome> {
        self.record(format!("merge {branch} squash={squash}"));
        if let Some(output) = &self.merge_refusal {
            return Ok(MergeOutcome::Conflicted {
                output: output.clone(),
            });
        }
        Ok(match &self.merge_conflict {
            Some(output) => {
                locked(&self.state).merge_pending = true;
                MergeOutcome::Conflicted {
                    output: output.clone(),
                }
            }
            None => MergeOutcome::Merged,
        })
    }

    async fn merge_abort(&self, _repo: &Path, squash: bool) -> Result<()> {
        let mut state = locked(&self.state);
        if !state.merge_pending {
            bail!("fatal: There is no merge to abort (MERGE_HEAD missing).");
        }
        state.merge_pending = false;
        state.calls.push(if squash {
            "reset --merge".to_string()
        } else {
            "merge --abort".to_string()
        });
        Ok(())
    }

    async fn has_tracked_changes(&self, _repo: &Path) -> Result<bool> {
        Ok(self.tracked_changes)
    }

    async fn merge_in_progress(&self, _repo: &Path) -> Result<bool> {
        Ok(locked(&self.state).merge_pending)
    }

    async fn commit_all(&self, worktree: &Path, message: &str) -> Result<bool> {
        let mut state = locked(&self.state);
        state
            .commits
            .push((worktree.to_path_buf(), message.to_string()));
        state.calls.push(format!("commit {message}"));
        Ok(true)
    }
}

/// Scripted coding agent.
///
/// Every run yields a text chunk, a tool use, and a final result. Failures,
/// delays, and runs that only end on cancellation can be configured per
/// feature or per phase.
///
/// # Example
///
/// ```rust,ignore
/// let agent = MockAgentRunner::new()
///     .with_delay(Duration::from_millis(20))
///     .with_feature_failure("feature-2", Phase::Verification, "tests failed");
/// ```
#[derive(Debug, Default)]
pub struct MockAgentRunner {
    delay: Duration,
    hold_all: bool,
    held: HashSet<String>,
    phase_failures: HashMap<Phase, String>,
    feature_failures: HashMap<(String, Phase), String>,
    start_error: Option<String>,
    call_count: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<AgentRequest>>,
}

impl MockAgentRunner {
    /// Create a mock whose runs all pass immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay each run before it yields output.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Runs for this feature never finish on their own.
    #[must_use]
    pub fn with_hold(mut self, feature_id: &str) -> Self {
        self.held.insert(feature_id.to_string());
        self
    }

    /// No run finishes on its own.
    #[must_use]
    pub fn with_hold_all(mut self) -> Self {
        self.hold_all = true;
        self
    }

    /// Fail this phase for every feature.
    #[must_use]
    pub fn with_phase_failure(mut self, phase: Phase, message: &str) -> Self {
        self.phase_failures.insert(phase, message.to_string());
        self
    }

    /// Fail this phase for one feature.
    #[must_use]
    pub fn with_feature_failure(mut self, feature_id: &str, phase: Phase, message: &str) -> Self {
        self.feature_failures
            .insert((feature_id.to_string(), phase), message.to_string());
        self
    }

    /// Refuse to start at all.
    #[must_use]
    pub fn with_start_error(mut self, error: &str) -> Self {
        self.start_error = Some(error.to_string());
        self
    }

    /// Get the number of times `run` was called.
    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Highest number of runs observed in progress at the same time.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn requests(&self) -> Vec<AgentRequest> {
        locked(&self.requests).clone()
    }

    /// Phases requested for one feature, in order.
    #[must_use]
    pub fn phases_for(&self, feature_id: &str) -> Vec<Phase> {
        locked(&self.requests)
            .iter()
            .filter(|r| r.feature_id == feature_id)
            .map(|r| r.phase)
            .collect()
    }

    fn failure_for(&self, feature_id: &str, phase: Phase) -> Option<String> {
        self.feature_failures
            .get(&(feature_id.to_string(), phase))
            .or_else(|| self.phase_failures.get(&phase))
            .cloned()
    }

    async fn wait(&self, feature_id: &str, cancel: &CancellationToken) -> Result<()> {
        if self.hold_all || self.held.contains(feature_id) {
            cancel.cancelled().await;
            bail!("agent cancelled");
        }
        if !self.delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => bail!("agent cancelled"),
                () = tokio::time::sleep(self.delay) => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AgentRunner for MockAgentRunner {
    async fn run(&self, request: AgentRequest, cancel: CancellationToken) -> Result<AgentStream> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        locked(&self.requests).push(request.clone());
        if let Some(error) = &self.start_error {
            bail!("{error}");
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let waited = self.wait(&request.feature_id, &cancel).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        waited?;

        let phase = request.phase;
        let failure = self.failure_for(&request.feature_id, phase);
        let messages = vec![
            AgentMessage::Text(format!("{phase} output for {}", request.feature_id)),
            AgentMessage::ToolUse {
                name: "Read".to_string(),
                input: serde_json::json!({ "file_path": "src/lib.rs" }),
            },
            AgentMessage::Result {
                success: failure.is_none(),
                summary: failure.unwrap_or_else(|| format!("{phase} complete")),
            },
        ];
        Ok(futures::stream::iter(messages).boxed())
    }
}
