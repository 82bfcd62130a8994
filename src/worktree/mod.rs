//! Worktree lifecycle: create, initialize, merge, revert, and delete the
//! isolated git checkouts features run in.
//!
//! Creation is serialized per (project, branch) so concurrent callers share a
//! single `git worktree add`. The main branch always maps to the project root.

pub mod init_script;
pub mod metadata;

pub use init_script::{InitOutcome, InitScriptService};
pub use metadata::{sanitize_branch_name, InitScriptStatus, WorktreeMetadata, WorktreeMetadataStore};

use crate::config::AutoModeConfig;
use crate::error::{AutoModeError, IntoAutoModeError, Result};
use crate::events::EventBus;
use crate::feature::{FeatureStatus, FeatureStore};
use crate::shell::ResolveShell;
use crate::testing::{GitClient, MergeOutcome, SecureFileStore};
use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Characters and sequences git refuses in a branch name.
fn forbidden_branch_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(\.\.|@\{|//|/\.|[\x00-\x20\x7f~^:?*\[\\])").ok())
        .as_ref()
}

/// Reject names `git check-ref-format --branch` would refuse.
pub fn validate_branch_name(branch: &str) -> Result<()> {
    let reject = |reason: &str| {
        Err(AutoModeError::InvalidBranch {
            branch: branch.to_string(),
            reason: reason.to_string(),
        })
    };

    if branch.is_empty() {
        return reject("branch name is empty");
    }
    if branch == "@" {
        return reject("'@' is not a valid branch name");
    }
    if branch.starts_with('-') || branch.starts_with('.') || branch.starts_with('/') {
        return reject("must not start with '-', '.' or '/'");
    }
    if branch.ends_with('/') || branch.ends_with('.') || branch.ends_with(".lock") {
        return reject("must not end with '/', '.' or '.lock'");
    }
    if forbidden_branch_pattern().is_some_and(|re| re.is_match(branch)) {
        return reject("contains characters or sequences git does not allow");
    }
    Ok(())
}

/// Collaborators the manager needs.
pub struct WorktreeDeps {
    pub git: Arc<dyn GitClient>,
    pub files: Arc<dyn SecureFileStore>,
    pub shell: Arc<dyn ResolveShell>,
    pub bus: EventBus,
}

/// Result of [`WorktreeManager::ensure_worktree`].
#[derive(Debug)]
pub struct EnsuredWorktree {
    pub path: PathBuf,
    pub branch: String,
    /// False when an existing worktree (or the project root) was returned.
    pub created: bool,
    /// Background init-script run, only for freshly created worktrees.
    pub init_task: Option<JoinHandle<Result<InitOutcome>>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub is_main: bool,
    pub head: Option<String>,
    pub feature_count: usize,
    pub metadata: Option<WorktreeMetadata>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub squash: bool,
    pub commit_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub branch: String,
    pub target: String,
    pub squashed: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteWorktreeOptions {
    pub delete_branch: bool,
    pub delete_features: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteWorktreeOutcome {
    pub removed_path: Option<PathBuf>,
    pub branch_deleted: bool,
    /// Features moved to the main branch.
    pub reassigned: Vec<String>,
    /// Features deleted along with the worktree.
    pub deleted_features: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevertOutcome {
    pub removed_path: Option<PathBuf>,
    /// Features moved back to the main branch and the backlog.
    pub reset_features: Vec<String>,
}

type BranchKey = (PathBuf, String);

pub struct WorktreeManager {
    git: Arc<dyn GitClient>,
    files: Arc<dyn SecureFileStore>,
    features: FeatureStore,
    metadata: WorktreeMetadataStore,
    init: Arc<InitScriptService>,
    config: AutoModeConfig,
    branch_locks: DashMap<BranchKey, Arc<tokio::sync::Mutex<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for WorktreeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorktreeManager")
            .field("worktrees_dir", &self.config.worktrees_dir)
            .field("branch_locks", &self.branch_locks.len())
            .finish_non_exhaustive()
    }
}

impl WorktreeManager {
    #[must_use]
    pub fn new(deps: WorktreeDeps, config: AutoModeConfig) -> Self {
        let metadata = WorktreeMetadataStore::new(Arc::clone(&deps.files));
        let init = Arc::new(InitScriptService::new(
            Arc::clone(&deps.files),
            metadata.clone(),
            deps.shell,
            deps.bus,
        ));
        Self {
            git: deps.git,
            features: FeatureStore::new(Arc::clone(&deps.files)),
            files: deps.files,
            metadata,
            init,
            config,
            branch_locks: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn init_scripts(&self) -> &InitScriptService {
        &self.init
    }

    #[must_use]
    pub fn metadata(&self) -> &WorktreeMetadataStore {
        &self.metadata
    }

    /// Cancel background init scripts.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Branch features merge into: configured, or whatever the project has checked out.
    pub async fn main_branch(&self, project: &Path) -> Result<String> {
        if let Some(branch) = &self.config.main_branch {
            return Ok(branch.clone());
        }
        self.git
            .current_branch(project)
            .await
            .into_git_error("detect main branch")
    }

    fn branch_lock(&self, project: &Path, branch: &str) -> Arc<tokio::sync::Mutex<()>> {
        let lock = self
            .branch_locks
            .entry((project.to_path_buf(), branch.to_string()))
            .or_default();
        Arc::clone(lock.value())
    }

    /// Where a new worktree for `branch` goes.
    #[must_use]
    pub fn worktree_path(&self, project: &Path, branch: &str) -> PathBuf {
        self.config
            .worktrees_root(project)
            .join(sanitize_branch_name(branch))
    }

    /// Existing checkout of `branch`, without creating anything.
    pub async fn find_worktree(&self, project: &Path, branch: &str) -> Result<Option<PathBuf>> {
        if branch == self.main_branch(project).await? {
            return Ok(Some(project.to_path_buf()));
        }
        let entries = self
            .git
            .worktree_list(project)
            .await
            .into_git_error("worktree list")?;
        Ok(entries
            .into_iter()
            .find(|entry| entry.branch.as_deref() == Some(branch) && entry.path.exists())
            .map(|entry| entry.path))
    }

    /// Return the worktree for `branch`, creating it if necessary.
    ///
    /// A freshly created worktree gets its metadata record and a background
    /// init-script run. Concurrent calls for the same branch wait for each
    /// other and observe the same path.
    #[instrument(skip(self, project), fields(project = %project.display()))]
    pub async fn ensure_worktree(
        &self,
        project: &Path,
        branch: &str,
        base_ref: Option<&str>,
    ) -> Result<EnsuredWorktree> {
        validate_branch_name(branch)?;
        if branch == self.main_branch(project).await? {
            return Ok(EnsuredWorktree {
                path: project.to_path_buf(),
                branch: branch.to_string(),
                created: false,
                init_task: None,
            });
        }

        let lock = self.branch_lock(project, branch);
        let _guard = lock.lock().await;

        if let Some(path) = self.find_worktree(project, branch).await? {
            debug!("Reusing worktree {}", path.display());
            return Ok(EnsuredWorktree {
                path,
                branch: branch.to_string(),
                created: false,
                init_task: None,
            });
        }

        let path = self.worktree_path(project, branch);
        self.files
            .create_dir_all(&self.config.worktrees_root(project))?;
        // Clears registrations whose directories were deleted out from under git.
        if let Err(e) = self.git.worktree_prune(project).await {
            warn!("worktree prune failed: {:#}", e);
        }

        let exists = self
            .git
            .branch_exists(project, branch)
            .await
            .into_worktree_error(branch)?;
        self.git
            .worktree_add(project, &path, branch, base_ref, !exists)
            .await
            .into_worktree_error(branch)?;
        info!(branch = %branch, "Created worktree at {}", path.display());

        if self.metadata.read(project, branch)?.is_none() {
            self.metadata.write(project, &WorktreeMetadata::new(branch))?;
        }

        let init = Arc::clone(&self.init);
        let cancel = self.shutdown.child_token();
        let (task_project, task_branch, task_path) =
            (project.to_path_buf(), branch.to_string(), path.clone());
        let init_task = tokio::spawn(async move {
            init.run_if_needed(&task_project, &task_branch, &task_path, cancel)
                .await
        });

        Ok(EnsuredWorktree {
            path,
            branch: branch.to_string(),
            created: true,
            init_task: Some(init_task),
        })
    }

    /// Every registered worktree joined with its metadata and feature count.
    pub async fn list_worktrees(&self, project: &Path) -> Result<Vec<WorktreeInfo>> {
        let main = self.main_branch(project).await?;
        let entries = self
            .git
            .worktree_list(project)
            .await
            .into_git_error("worktree list")?;
        let features = self.features.list(project)?;

        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            let is_main = entry.path == project;
            let metadata = match (&entry.branch, is_main) {
                (Some(branch), false) => self.metadata.read(project, branch)?,
                _ => None,
            };
            let feature_count = entry.branch.as_deref().map_or(0, |branch| {
                features
                    .iter()
                    .filter(|f| f.is_on_branch(branch, &main))
                    .count()
            });
            infos.push(WorktreeInfo {
                path: entry.path,
                branch: entry.branch,
                is_main,
                head: entry.head,
                feature_count,
                metadata,
            });
        }
        Ok(infos)
    }

    /// Re-run the init script for an existing worktree, ignoring earlier runs.
    pub async fn force_run_init(&self, project: &Path, branch: &str) -> Result<InitOutcome> {
        let path = self
            .find_worktree(project, branch)
            .await?
            .ok_or_else(|| AutoModeError::worktree(branch, "no worktree exists for this branch"))?;
        self.init
            .force_run(project, branch, &path, self.shutdown.child_token())
            .await
    }

    /// Merge `branch` into the main branch checked out in the project root.
    ///
    /// The project root must have no uncommitted changes to tracked files,
    /// so a failed merge can be rolled back without touching the user's
    /// work and a squash commit holds only the branch's changes. On failure
    /// the merge is rolled back and the worktree is left alone.
    #[instrument(skip(self, project, options), fields(project = %project.display()))]
    pub async fn merge_feature(
        &self,
        project: &Path,
        branch: &str,
        options: MergeOptions,
    ) -> Result<MergeSummary> {
        validate_branch_name(branch)?;
        let main = self.main_branch(project).await?;
        if branch == main {
            return Err(AutoModeError::InvalidBranch {
                branch: branch.to_string(),
                reason: "cannot merge the main branch into itself".to_string(),
            });
        }
        let checked_out = self
            .git
            .current_branch(project)
            .await
            .into_git_error("merge")?;
        if checked_out != main {
            return Err(AutoModeError::git(
                "merge",
                format!("project root is on '{checked_out}', expected '{main}'"),
            ));
        }
        if !self
            .git
            .branch_exists(project, branch)
            .await
            .into_git_error("merge")?
        {
            return Err(AutoModeError::git(
                "merge",
                format!("branch '{branch}' does not exist"),
            ));
        }
        if self
            .git
            .has_tracked_changes(project)
            .await
            .into_git_error("merge")?
        {
            return Err(AutoModeError::git(
                "merge",
                "project root has uncommitted changes to tracked files; commit or stash them first",
            ));
        }

        let message = options
            .commit_message
            .unwrap_or_else(|| format!("Merge branch '{branch}'"));
        let outcome = self
            .git
            .merge(project, branch, options.squash, &message)
            .await
            .into_git_error("merge")?;

        match outcome {
            MergeOutcome::Merged => {
                info!(branch = %branch, "Merged into {}", main);
                Ok(MergeSummary {
                    branch: branch.to_string(),
                    target: main,
                    squashed: options.squash,
                })
            }
            MergeOutcome::Conflicted { output } => {
                match self.git.merge_in_progress(project).await {
                    Ok(true) => {
                        if let Err(e) = self.git.merge_abort(project, options.squash).await {
                            warn!("Failed to abort merge of {}: {:#}", branch, e);
                        }
                    }
                    Ok(false) => debug!("Merge of {} left nothing to roll back", branch),
                    Err(e) => warn!("Could not inspect merge state after {}: {:#}", branch, e),
                }
                Err(AutoModeError::MergeConflict {
                    branch: branch.to_string(),
                    message: output,
                })
            }
        }
    }

    async fn remove_checkout(&self, project: &Path, branch: &str) -> Result<Option<PathBuf>> {
        let Some(path) = self.find_worktree(project, branch).await? else {
            return Ok(None);
        };
        if let Err(e) = self.git.worktree_remove(project, &path).await {
            warn!("git worktree remove failed for {}: {:#}", path.display(), e);
            self.files.remove(&path)?;
            self.git
                .worktree_prune(project)
                .await
                .into_git_error("worktree prune")?;
        }
        Ok(Some(path))
    }

    fn reject_main(&self, branch: &str, main: &str, action: &str) -> Result<()> {
        if branch == main {
            return Err(AutoModeError::InvalidBranch {
                branch: branch.to_string(),
                reason: format!("cannot {action} the main branch"),
            });
        }
        Ok(())
    }

    /// Throw away a feature branch: worktree, branch ref, and metadata go;
    /// its features return to the main branch and the backlog.
    #[instrument(skip(self, project), fields(project = %project.display()))]
    pub async fn revert_feature(&self, project: &Path, branch: &str) -> Result<RevertOutcome> {
        validate_branch_name(branch)?;
        let main = self.main_branch(project).await?;
        self.reject_main(branch, &main, "revert")?;

        let lock = self.branch_lock(project, branch);
        let _guard = lock.lock().await;

        let removed_path = self.remove_checkout(project, branch).await?;
        if self
            .git
            .branch_exists(project, branch)
            .await
            .into_git_error("branch -D")?
        {
            self.git
                .delete_branch(project, branch)
                .await
                .into_git_error("branch -D")?;
        }
        self.metadata.delete(project, branch)?;

        let reset_features = self.features.reassign_branch(project, branch, Some(&main))?;
        for id in &reset_features {
            let status = self.features.get(project, id)?.status;
            if matches!(status, FeatureStatus::Backlog | FeatureStatus::Archived) {
                continue;
            }
            self.features
                .update_status(project, id, FeatureStatus::Backlog, None)?;
        }
        info!(branch = %branch, "Reverted {} feature(s)", reset_features.len());

        Ok(RevertOutcome {
            removed_path,
            reset_features,
        })
    }

    /// Remove a worktree, optionally with its branch and its features.
    #[instrument(skip(self, project), fields(project = %project.display()))]
    pub async fn delete_worktree(
        &self,
        project: &Path,
        branch: &str,
        options: DeleteWorktreeOptions,
    ) -> Result<DeleteWorktreeOutcome> {
        validate_branch_name(branch)?;
        let main = self.main_branch(project).await?;
        self.reject_main(branch, &main, "delete")?;

        let lock = self.branch_lock(project, branch);
        let _guard = lock.lock().await;

        let removed_path = self.remove_checkout(project, branch).await?;
        self.metadata.delete(project, branch)?;

        let mut branch_deleted = false;
        if options.delete_branch
            && self
                .git
                .branch_exists(project, branch)
                .await
                .into_git_error("branch -D")?
        {
            self.git
                .delete_branch(project, branch)
                .await
                .into_git_error("branch -D")?;
            branch_deleted = true;
        }

        let mut outcome = DeleteWorktreeOutcome {
            removed_path,
            branch_deleted,
            ..Default::default()
        };
        if options.delete_features {
            let ids: Vec<String> = self
                .features
                .on_branch(project, branch, &main)?
                .into_iter()
                .map(|f| f.id)
                .collect();
            self.features.delete_many(project, &ids)?;
            outcome.deleted_features = ids;
        } else {
            outcome.reassigned = self.features.reassign_branch(project, branch, Some(&main))?;
        }
        info!(
            branch = %branch,
            reassigned = outcome.reassigned.len(),
            deleted = outcome.deleted_features.len(),
            "Deleted worktree"
        );

        Ok(outcome)
    }

    /// Stage and commit everything in the checkout of `branch`.
    pub async fn commit_changes(&self, project: &Path, branch: &str, message: &str) -> Result<bool> {
        let path = self
            .find_worktree(project, branch)
            .await?
            .ok_or_else(|| AutoModeError::worktree(branch, "no worktree exists for this branch"))?;
        self.git
            .commit_all(&path, message)
            .await
            .into_git_error("commit")
    }
}
