//! Test fixtures for creating reproducible test environments.
//!
//! [`TestProject`] wires a temporary project directory to the real file
//! store, feature store and worktree manager, with mocks standing in for git
//! and the coding agent.

use super::mocks::{MockAgentRunner, MockGit};
use super::traits::{AgentRunner, SecureFileStore};
use crate::config::AutoModeConfig;
use crate::events::{AgentEvent, EventBus};
use crate::feature::{Feature, FeatureStore};
use crate::operations::ScopedFileStore;
use crate::scheduler::{AutoModeDeps, AutoModeService};
use crate::shell::{ResolveShell, ShellResolver};
use crate::worktree::{WorktreeDeps, WorktreeManager};
use chrono::{Duration as ChronoDuration, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

/// A temporary project with a fully wired scheduler.
///
/// Automatically cleans up when dropped.
///
/// # Example
///
/// ```rust,ignore
/// let t = TestProject::builder()
///     .agent(MockAgentRunner::new().with_hold("f1"))
///     .build();
/// t.add_feature("f1", 0, &[]);
/// t.service.run_feature(t.path(), "f1", true).await?;
/// ```
pub struct TestProject {
    temp_dir: TempDir,
    pub git: MockGit,
    pub agent: Arc<MockAgentRunner>,
    pub bus: EventBus,
    pub files: Arc<dyn SecureFileStore>,
    pub worktrees: Arc<WorktreeManager>,
    pub service: AutoModeService,
    created: AtomicI64,
}

/// Builder for [`TestProject`].
pub struct TestProjectBuilder {
    git: MockGit,
    agent: MockAgentRunner,
    config: AutoModeConfig,
    shell: Option<Arc<dyn ResolveShell>>,
}

impl TestProjectBuilder {
    #[must_use]
    pub fn git(mut self, git: MockGit) -> Self {
        self.git = git;
        self
    }

    #[must_use]
    pub fn agent(mut self, agent: MockAgentRunner) -> Self {
        self.agent = agent;
        self
    }

    /// Adjust the configuration, e.g. `|c| c.with_require_approval(true)`.
    #[must_use]
    pub fn config(mut self, adjust: impl FnOnce(AutoModeConfig) -> AutoModeConfig) -> Self {
        self.config = adjust(self.config);
        self
    }

    #[must_use]
    pub fn shell(mut self, shell: Arc<dyn ResolveShell>) -> Self {
        self.shell = Some(shell);
        self
    }

    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn build(self) -> TestProject {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let files: Arc<dyn SecureFileStore> = Arc::new(ScopedFileStore::new([temp_dir.path()]));
        let bus = EventBus::new();
        let shell: Arc<dyn ResolveShell> = match self.shell {
            Some(shell) => shell,
            None => Arc::new(ShellResolver::for_current_platform()),
        };

        let worktrees = Arc::new(WorktreeManager::new(
            WorktreeDeps {
                git: Arc::new(self.git.clone()),
                files: Arc::clone(&files),
                shell,
                bus: bus.clone(),
            },
            self.config.clone(),
        ));
        let agent = Arc::new(self.agent);
        let runner: Arc<dyn AgentRunner> = agent.clone();
        let service = AutoModeService::new(AutoModeDeps {
            features: FeatureStore::new(Arc::clone(&files)),
            worktrees: Arc::clone(&worktrees),
            agent: runner,
            bus: bus.clone(),
            config: self.config,
        });

        TestProject {
            temp_dir,
            git: self.git,
            agent,
            bus,
            files,
            worktrees,
            service,
            created: AtomicI64::new(0),
        }
    }
}

impl TestProject {
    #[must_use]
    pub fn builder() -> TestProjectBuilder {
        TestProjectBuilder {
            git: MockGit::new(),
            agent: MockAgentRunner::new(),
            config: AutoModeConfig::default().with_poll_interval_ms(50),
            shell: None,
        }
    }

    /// Project with default mocks.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Add a backlog feature titled after its id. Each call is created one
    /// second after the previous, so FIFO tie-breaks follow call order.
    ///
    /// # Panics
    ///
    /// Panics if the feature cannot be written.
    pub fn add_feature(&self, id: &str, priority: i32, dependencies: &[&str]) -> Feature {
        let offset = self.created.fetch_add(1, Ordering::SeqCst);
        let feature = Feature::new(id, "")
            .with_id(id)
            .with_priority(priority)
            .with_dependencies(dependencies.iter().copied())
            .with_created_at(Utc::now() + ChronoDuration::seconds(offset));
        self.service
            .features()
            .create(self.path(), feature)
            .expect("Failed to create feature")
    }

    /// # Panics
    ///
    /// Panics if the feature does not exist.
    #[must_use]
    pub fn feature(&self, id: &str) -> Feature {
        self.service
            .features()
            .get(self.path(), id)
            .expect("Feature should exist")
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive until an event matches, returning it. `None` on timeout or when
/// the channel closes.
pub async fn wait_for_event<F>(
    rx: &mut UnboundedReceiver<AgentEvent>,
    timeout: Duration,
    matches: F,
) -> Option<AgentEvent>
where
    F: Fn(&AgentEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) if matches(&event) => return Some(event),
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Receive every event up to and including the first match.
///
/// # Panics
///
/// Panics if nothing matches before `timeout`.
pub async fn collect_until<F>(
    rx: &mut UnboundedReceiver<AgentEvent>,
    timeout: Duration,
    matches: F,
) -> Vec<AgentEvent>
where
    F: Fn(&AgentEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => {
                let done = matches(&event);
                events.push(event);
                if done {
                    return events;
                }
            }
            Ok(None) => panic!("event channel closed; received {events:?}"),
            Err(_) => panic!("timed out waiting for event; received {events:?}"),
        }
    }
}
