//! Auto-mode scheduler.
//!
//! Admits backlog features whose dependencies are verified, runs each one in
//! its own task through planning, action and verification, and reports the
//! outcome as events plus a single status write. One admission loop per
//! project; manual runs share the same running set.

pub mod admission;
pub mod pipeline;
pub mod running;

pub use admission::{blocked_features, pending_dependencies, select_admissible};
pub use pipeline::{allowed_tools, build_prompt, PipelineRun, PromptContext, RunMode, Settlement};
pub use running::{RunningEntry, RunningSet};

use crate::config::AutoModeConfig;
use crate::error::{AutoModeError, Result};
use crate::events::{AgentEvent, EventBus};
use crate::feature::{Feature, FeatureStatus, FeatureStore};
use crate::testing::AgentRunner;
use crate::worktree::{DeleteWorktreeOptions, DeleteWorktreeOutcome, RevertOutcome, WorktreeManager};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Terminal message for runs cancelled through [`AutoModeService::stop_feature`].
pub const STOPPED_BY_USER: &str = "stopped by user";

/// Collaborators the scheduler needs.
pub struct AutoModeDeps {
    pub features: FeatureStore,
    pub worktrees: Arc<WorktreeManager>,
    pub agent: Arc<dyn AgentRunner>,
    pub bus: EventBus,
    pub config: AutoModeConfig,
}

/// Returned as soon as a run has been registered; the outcome arrives as events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAck {
    pub feature_id: String,
    pub worktree_path: PathBuf,
    pub branch_name: Option<String>,
}

/// State of one project's admission loop.
#[derive(Debug)]
struct ProjectLoop {
    cancel: CancellationToken,
    max_concurrency: AtomicUsize,
    wake: Notify,
    /// Consecutive failures per feature in this session.
    attempts: DashMap<String, u32>,
    /// Stopped by hand; not re-admitted until run explicitly.
    user_stopped: DashSet<String>,
}

impl ProjectLoop {
    fn new(max_concurrency: usize) -> Self {
        Self {
            cancel: CancellationToken::new(),
            max_concurrency: AtomicUsize::new(max_concurrency),
            wake: Notify::new(),
            attempts: DashMap::new(),
            user_stopped: DashSet::new(),
        }
    }

    fn record_outcome(&self, feature_id: &str, passed: bool) {
        if passed {
            self.attempts.remove(feature_id);
        } else {
            *self.attempts.entry(feature_id.to_string()).or_insert(0) += 1;
        }
    }
}

/// Outcome of one admission pass.
#[derive(Debug, Default)]
struct AdmissionPass {
    launched: usize,
    running: usize,
}

/// Where a run executes.
struct Workspace {
    path: PathBuf,
    branch: Option<String>,
}

struct ServiceInner {
    features: FeatureStore,
    worktrees: Arc<WorktreeManager>,
    agent: Arc<dyn AgentRunner>,
    bus: EventBus,
    config: AutoModeConfig,
    running: RunningSet,
    loops: DashMap<PathBuf, Arc<ProjectLoop>>,
}

/// The scheduler. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct AutoModeService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for AutoModeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoModeService")
            .field("running", &self.inner.running.len())
            .field("loops", &self.inner.loops.len())
            .finish_non_exhaustive()
    }
}

impl AutoModeService {
    #[must_use]
    pub fn new(deps: AutoModeDeps) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                features: deps.features,
                worktrees: deps.worktrees,
                agent: deps.agent,
                bus: deps.bus,
                config: deps.config,
                running: RunningSet::new(),
                loops: DashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn features(&self) -> &FeatureStore {
        &self.inner.features
    }

    #[must_use]
    pub fn worktrees(&self) -> &Arc<WorktreeManager> {
        &self.inner.worktrees
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    #[must_use]
    pub fn config(&self) -> &AutoModeConfig {
        &self.inner.config
    }

    fn project_loop(&self, project: &Path) -> Option<Arc<ProjectLoop>> {
        self.inner.loops.get(project).map(|l| Arc::clone(l.value()))
    }

    fn wake_loop(&self, project: &Path) {
        if let Some(handle) = self.project_loop(project) {
            handle.wake.notify_one();
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    #[must_use]
    pub fn is_running(&self, feature_id: &str) -> bool {
        self.inner.running.contains(feature_id)
    }

    #[must_use]
    pub fn running_count(&self, project: &Path) -> usize {
        self.inner.running.count_for_project(project)
    }

    #[must_use]
    pub fn is_loop_running(&self, project: &Path) -> bool {
        self.inner.loops.contains_key(project)
    }

    #[must_use]
    pub fn context_exists(&self, project: &Path, feature_id: &str) -> bool {
        self.inner.features.context_exists(project, feature_id)
    }

    // =========================================================================
    // Auto loop
    // =========================================================================

    /// Start the admission loop for `project`.
    #[instrument(skip(self, project), fields(project = %project.display()))]
    pub async fn start(&self, project: &Path, max_concurrency: usize) -> Result<()> {
        if max_concurrency == 0 {
            return Err(AutoModeError::config("maxConcurrency must be at least 1"));
        }
        let handle = Arc::new(ProjectLoop::new(max_concurrency));
        match self.inner.loops.entry(project.to_path_buf()) {
            Entry::Occupied(_) => {
                return Err(AutoModeError::already_running(project.display().to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
            }
        }

        info!(max_concurrency, "Auto mode started");
        self.inner.bus.publish(AgentEvent::AutoModeStarted {
            project_path: project.to_path_buf(),
            max_concurrency,
        });

        let service = self.clone();
        let project = project.to_path_buf();
        tokio::spawn(async move { service.admission_loop(project, handle).await });
        Ok(())
    }

    /// Stop the loop and cancel every running feature of the project.
    ///
    /// Returns how many runs were cancelled.
    #[instrument(skip(self, project), fields(project = %project.display()))]
    pub async fn stop(&self, project: &Path) -> Result<usize> {
        let handle = self.inner.loops.remove(project).map(|(_, l)| l);
        let running = self.inner.running.ids_for_project(project);
        if handle.is_none() && running.is_empty() {
            return Err(AutoModeError::not_running(project.display().to_string()));
        }
        if let Some(handle) = handle {
            handle.cancel.cancel();
        }

        let mut stopped = 0;
        for id in running {
            if self.stop_feature(&id).await.is_ok() {
                stopped += 1;
            }
        }

        info!(stopped, "Auto mode stopped");
        self.inner.bus.publish(AgentEvent::AutoModeStopped {
            project_path: project.to_path_buf(),
            stopped_features: stopped,
        });
        Ok(stopped)
    }

    /// Change the loop's concurrency bound and re-run admission.
    pub async fn set_max_concurrency(&self, project: &Path, max_concurrency: usize) -> Result<()> {
        if max_concurrency == 0 {
            return Err(AutoModeError::config("maxConcurrency must be at least 1"));
        }
        let handle = self
            .project_loop(project)
            .ok_or_else(|| AutoModeError::not_running(project.display().to_string()))?;
        handle.max_concurrency.store(max_concurrency, Ordering::SeqCst);
        handle.wake.notify_one();
        debug!(max_concurrency, "Updated concurrency bound");
        Ok(())
    }

    async fn admission_loop(self, project: PathBuf, handle: Arc<ProjectLoop>) {
        let poll = Duration::from_millis(self.inner.config.poll_interval_ms.max(1));
        let mut idle = false;

        loop {
            if handle.cancel.is_cancelled() {
                break;
            }
            match self.admit(&project, &handle).await {
                Ok(pass) => {
                    let now_idle = pass.launched == 0 && pass.running == 0;
                    if now_idle && !idle {
                        debug!(project = %project.display(), "Nothing left to admit");
                        self.inner.bus.publish(AgentEvent::AutoModeIdle {
                            project_path: project.clone(),
                        });
                    }
                    idle = now_idle;
                }
                Err(e) => warn!(project = %project.display(), "Admission pass failed: {}", e),
            }

            tokio::select! {
                () = handle.cancel.cancelled() => break,
                () = handle.wake.notified() => {}
                () = tokio::time::sleep(poll) => {}
            }
        }
        debug!(project = %project.display(), "Admission loop exited");
    }

    async fn admit(&self, project: &Path, handle: &ProjectLoop) -> Result<AdmissionPass> {
        let features = self.inner.features.list(project)?;
        let running = self.inner.running.ids_for_project(project);

        let max_attempts = self.inner.config.max_attempts;
        let mut excluded: HashSet<String> =
            handle.user_stopped.iter().map(|id| id.key().clone()).collect();
        excluded.extend(
            handle
                .attempts
                .iter()
                .filter(|a| *a.value() >= max_attempts)
                .map(|a| a.key().clone()),
        );

        for blocked in blocked_features(&features) {
            debug!("{}", blocked);
        }

        let max = handle.max_concurrency.load(Ordering::SeqCst);
        let selected: Vec<String> = select_admissible(&features, &running, max, &excluded)
            .into_iter()
            .map(|f| f.id.clone())
            .collect();

        let mut pass = AdmissionPass::default();
        for id in selected {
            if handle.cancel.is_cancelled() {
                break;
            }
            match self
                .launch(project, &id, RunMode::Fresh, self.inner.config.use_worktrees)
                .await
            {
                Ok(_) => pass.launched += 1,
                // Lost a race with a manual run, a status change or a delete.
                Err(e) if e.is_user_error() => debug!(feature_id = %id, "Skipped: {}", e),
                Err(e) => {
                    if e.is_recoverable() {
                        warn!(feature_id = %id, "Failed to launch: {}", e);
                    } else {
                        error!(feature_id = %id, "Failed to launch: {}", e);
                    }
                    handle.record_outcome(&id, false);
                }
            }
        }
        pass.running = self.inner.running.count_for_project(project);
        Ok(pass)
    }

    // =========================================================================
    // Single-feature runs
    // =========================================================================

    /// Plan, implement and verify one feature.
    pub async fn run_feature(
        &self,
        project: &Path,
        feature_id: &str,
        use_worktrees: bool,
    ) -> Result<RunAck> {
        self.clear_user_stop(project, feature_id);
        self.launch(project, feature_id, RunMode::Fresh, use_worktrees)
            .await
    }

    /// Continue from the action phase when earlier agent output exists,
    /// otherwise behave like [`Self::run_feature`].
    pub async fn resume_feature(
        &self,
        project: &Path,
        feature_id: &str,
        use_worktrees: bool,
    ) -> Result<RunAck> {
        self.clear_user_stop(project, feature_id);
        self.launch(project, feature_id, RunMode::Resume, use_worktrees)
            .await
    }

    /// Run only the verification phase in the feature's existing checkout.
    pub async fn verify_feature(&self, project: &Path, feature_id: &str) -> Result<RunAck> {
        self.clear_user_stop(project, feature_id);
        self.launch(project, feature_id, RunMode::Verify, self.inner.config.use_worktrees)
            .await
    }

    /// Send further instructions to a feature in its existing checkout.
    pub async fn follow_up_feature(
        &self,
        project: &Path,
        feature_id: &str,
        prompt: &str,
        images: Vec<PathBuf>,
    ) -> Result<RunAck> {
        self.clear_user_stop(project, feature_id);
        let mode = RunMode::FollowUp {
            prompt: prompt.to_string(),
            images,
        };
        self.launch(project, feature_id, mode, self.inner.config.use_worktrees)
            .await
    }

    fn clear_user_stop(&self, project: &Path, feature_id: &str) {
        if let Some(handle) = self.project_loop(project) {
            handle.user_stopped.remove(feature_id);
        }
    }

    /// Cancel one run. The feature returns to the backlog and exactly one
    /// terminal event is published.
    pub async fn stop_feature(&self, feature_id: &str) -> Result<()> {
        let project = self
            .inner
            .running
            .get(feature_id)
            .map(|entry| entry.project.clone())
            .ok_or_else(|| AutoModeError::not_running(feature_id))?;
        // Mark before the slot frees up so the loop cannot re-admit it.
        let handle = self.project_loop(&project);
        if let Some(handle) = &handle {
            handle.user_stopped.insert(feature_id.to_string());
        }
        let entry = self
            .inner
            .running
            .remove(feature_id)
            .ok_or_else(|| AutoModeError::not_running(feature_id))?;
        entry.cancel.cancel();

        if entry.settle() {
            if let Err(e) = self.inner.features.update_status(
                &entry.project,
                feature_id,
                FeatureStatus::Backlog,
                None,
            ) {
                warn!(feature_id = %feature_id, "Failed to reset stopped feature: {}", e);
            }
            self.inner.bus.publish(AgentEvent::AutoModeFeatureComplete {
                feature_id: feature_id.to_string(),
                passes: false,
                message: STOPPED_BY_USER.to_string(),
            });
        }
        info!(feature_id = %feature_id, "Stopped feature");

        if let Some(handle) = handle {
            handle.wake.notify_one();
        }
        Ok(())
    }

    /// Accept a feature parked in `waiting_approval`.
    pub async fn approve_feature(&self, project: &Path, feature_id: &str) -> Result<Feature> {
        let feature = self.inner.features.get(project, feature_id)?;
        if feature.status != FeatureStatus::WaitingApproval {
            return Err(AutoModeError::InvalidTransition {
                feature_id: feature_id.to_string(),
                from: feature.status.to_string(),
                to: FeatureStatus::Verified.to_string(),
            });
        }
        let approved =
            self.inner
                .features
                .update_status(project, feature_id, FeatureStatus::Verified, None)?;
        info!(feature_id = %feature_id, "Approved feature");
        self.wake_loop(project);
        Ok(approved)
    }

    /// Stage and commit the feature's checkout. Returns false when there was
    /// nothing to commit.
    pub async fn commit_feature(
        &self,
        project: &Path,
        feature_id: &str,
        message: Option<&str>,
    ) -> Result<bool> {
        if self.is_running(feature_id) {
            return Err(AutoModeError::already_running(feature_id));
        }
        let feature = self.inner.features.get(project, feature_id)?;
        let branch = match &feature.branch_name {
            Some(branch) => branch.clone(),
            None => self.inner.worktrees.main_branch(project).await?,
        };
        let message = message.map_or_else(|| format!("feat: {}", feature.title), str::to_string);
        self.inner
            .worktrees
            .commit_changes(project, &branch, &message)
            .await
    }

    /// Delete a feature, stopping it first if it is running.
    pub async fn delete_feature(&self, project: &Path, feature_id: &str) -> Result<()> {
        if self.is_running(feature_id) {
            self.stop_feature(feature_id).await?;
        }
        self.inner.features.delete(project, feature_id)?;
        info!(feature_id = %feature_id, "Deleted feature");
        Ok(())
    }

    fn refuse_if_branch_busy(&self, project: &Path, branch: &str, main: &str) -> Result<()> {
        let busy = self
            .inner
            .features
            .on_branch(project, branch, main)?
            .into_iter()
            .any(|f| self.is_running(&f.id));
        if busy {
            return Err(AutoModeError::already_running(branch));
        }
        Ok(())
    }

    /// Revert a branch unless one of its features is still running.
    pub async fn revert_worktree(&self, project: &Path, branch: &str) -> Result<RevertOutcome> {
        let main = self.inner.worktrees.main_branch(project).await?;
        self.refuse_if_branch_busy(project, branch, &main)?;
        self.inner.worktrees.revert_feature(project, branch).await
    }

    /// Delete a worktree unless one of its features is still running.
    pub async fn delete_worktree(
        &self,
        project: &Path,
        branch: &str,
        options: DeleteWorktreeOptions,
    ) -> Result<DeleteWorktreeOutcome> {
        let main = self.inner.worktrees.main_branch(project).await?;
        self.refuse_if_branch_busy(project, branch, &main)?;
        self.inner
            .worktrees
            .delete_worktree(project, branch, options)
            .await
    }

    // =========================================================================
    // Run lifecycle
    // =========================================================================

    async fn workspace_for(
        &self,
        project: &Path,
        feature: &mut Feature,
        mode: &RunMode,
        use_worktrees: bool,
    ) -> Result<Workspace> {
        match mode {
            RunMode::Verify | RunMode::FollowUp { .. } => {
                let Some(branch) = feature.branch_name.clone() else {
                    return Ok(Workspace {
                        path: project.to_path_buf(),
                        branch: None,
                    });
                };
                let path = self
                    .inner
                    .worktrees
                    .find_worktree(project, &branch)
                    .await?
                    .ok_or_else(|| {
                        AutoModeError::worktree(&branch, "no worktree exists for this branch")
                    })?;
                Ok(Workspace {
                    path,
                    branch: Some(branch),
                })
            }
            RunMode::Fresh | RunMode::Resume if use_worktrees => {
                let branch = match &feature.branch_name {
                    Some(branch) => branch.clone(),
                    None => {
                        let branch = format!("feature/{}", feature.id);
                        feature.branch_name = Some(branch.clone());
                        self.inner.features.save(project, feature)?;
                        branch
                    }
                };
                let ensured = self
                    .inner
                    .worktrees
                    .ensure_worktree(project, &branch, None)
                    .await?;
                Ok(Workspace {
                    path: ensured.path,
                    branch: Some(branch),
                })
            }
            RunMode::Fresh | RunMode::Resume => Ok(Workspace {
                path: project.to_path_buf(),
                branch: feature.branch_name.clone(),
            }),
        }
    }

    async fn prepare(
        &self,
        project: &Path,
        feature_id: &str,
        mode: &RunMode,
        use_worktrees: bool,
    ) -> Result<Workspace> {
        let mut feature = self.inner.features.get(project, feature_id)?;
        if !feature.status.can_transition_to(FeatureStatus::InProgress) {
            return Err(AutoModeError::InvalidTransition {
                feature_id: feature_id.to_string(),
                from: feature.status.to_string(),
                to: FeatureStatus::InProgress.to_string(),
            });
        }
        self.workspace_for(project, &mut feature, mode, use_worktrees)
            .await
    }

    #[instrument(skip(self, project, mode), fields(mode = mode.label()))]
    async fn launch(
        &self,
        project: &Path,
        feature_id: &str,
        mode: RunMode,
        use_worktrees: bool,
    ) -> Result<RunAck> {
        let entry = self
            .inner
            .running
            .try_insert(feature_id, project)
            .ok_or_else(|| AutoModeError::already_running(feature_id))?;

        let workspace = match self.prepare(project, feature_id, &mode, use_worktrees).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.inner.running.remove_run(feature_id, entry.run_id);
                warn!(feature_id = %feature_id, "Could not start run: {}", e);
                self.inner.bus.publish(AgentEvent::AutoModeError {
                    feature_id: Some(feature_id.to_string()),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let feature = match self.inner.features.update_status(
            project,
            feature_id,
            FeatureStatus::InProgress,
            None,
        ) {
            Ok(updated) => updated,
            Err(e) => {
                self.inner.running.remove_run(feature_id, entry.run_id);
                return Err(e);
            }
        };
        // stop_feature may have won the race while the worktree was prepared.
        if entry.cancel.is_cancelled() {
            if let Err(e) = self.inner.features.update_status(
                project,
                feature_id,
                FeatureStatus::Backlog,
                None,
            ) {
                warn!(feature_id = %feature_id, "Failed to reset cancelled feature: {}", e);
            }
            return Err(AutoModeError::not_running(feature_id));
        }

        let prior_context = match mode {
            RunMode::Resume | RunMode::FollowUp { .. } => {
                self.inner.features.read_context(project, feature_id)?
            }
            RunMode::Fresh | RunMode::Verify => None,
        };

        info!(
            feature_id = %feature_id,
            worktree = %workspace.path.display(),
            "Starting feature"
        );
        self.inner.bus.publish(AgentEvent::AutoModeFeatureStart {
            feature_id: feature_id.to_string(),
            project_path: project.to_path_buf(),
            branch_name: workspace.branch.clone(),
            worktree_path: workspace.path.clone(),
        });

        let run = PipelineRun {
            feature,
            project: project.to_path_buf(),
            workdir: workspace.path.clone(),
            mode,
            prior_context,
            agent: Arc::clone(&self.inner.agent),
            features: self.inner.features.clone(),
            bus: self.inner.bus.clone(),
            cancel: entry.cancel.clone(),
        };
        let service = self.clone();
        let task_project = project.to_path_buf();
        let task_id = feature_id.to_string();
        tokio::spawn(async move {
            let settlement = run.drive().await;
            service.settle(&task_project, &task_id, &entry, settlement);
        });

        Ok(RunAck {
            feature_id: feature_id.to_string(),
            worktree_path: workspace.path,
            branch_name: workspace.branch,
        })
    }

    fn settle(&self, project: &Path, feature_id: &str, entry: &RunningEntry, settlement: Settlement) {
        if entry.settle() {
            let (status, error, passes, message) = match settlement {
                Settlement::Passed { summary } => {
                    let status = if self.inner.config.require_approval {
                        FeatureStatus::WaitingApproval
                    } else {
                        FeatureStatus::Verified
                    };
                    (status, None, true, summary)
                }
                Settlement::Failed { error } => {
                    let error = error.to_string();
                    (FeatureStatus::Backlog, Some(error.clone()), false, error)
                }
                Settlement::Cancelled => {
                    (FeatureStatus::Backlog, None, false, STOPPED_BY_USER.to_string())
                }
            };

            if let Err(e) = self
                .inner
                .features
                .update_status(project, feature_id, status, error)
            {
                warn!(feature_id = %feature_id, "Failed to record outcome: {}", e);
            }
            if passes {
                info!(feature_id = %feature_id, %status, "Feature passed");
            } else {
                warn!(feature_id = %feature_id, "Feature failed: {}", message);
            }
            self.inner.bus.publish(AgentEvent::AutoModeFeatureComplete {
                feature_id: feature_id.to_string(),
                passes,
                message,
            });
            if let Some(handle) = self.project_loop(project) {
                handle.record_outcome(feature_id, passes);
            }
        }

        self.inner.running.remove_run(feature_id, entry.run_id);
        self.wake_loop(project);
    }
}
