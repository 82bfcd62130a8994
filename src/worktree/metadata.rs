//! Per-worktree metadata under `.automaker/worktrees/<sanitized-branch>/`.

use crate::config::{AutoModeConfig, WORKTREE_META_FILE};
use crate::error::Result;
use crate::testing::SecureFileStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

const MAX_SANITIZED_LEN: usize = 200;
const BRANCH_HASH_LEN: usize = 8;

/// Turn a branch name into a single safe path segment.
///
/// Path separators and characters Windows rejects become `-`, whitespace
/// becomes `_`, and the readable part is followed by a short hash of the raw
/// name. Branches that sanitize alike (`feat/x` and `feat-x`) or differ only
/// in case still get distinct segments. The result is at most 200 characters.
#[must_use]
pub fn sanitize_branch_name(branch: &str) -> String {
    let readable: String = branch
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .take(MAX_SANITIZED_LEN - BRANCH_HASH_LEN - 1)
        .collect();
    let digest = hex::encode(Sha256::digest(branch.as_bytes()));
    format!("{readable}-{}", &digest[..BRANCH_HASH_LEN])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitScriptStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeMetadata {
    pub branch: String,
    pub created_at: DateTime<Utc>,
    /// Set once the script has finished, whatever the outcome.
    #[serde(default)]
    pub init_script_ran: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_script_status: Option<InitScriptStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_script_error: Option<String>,
    /// Associated pull request, stored opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<serde_json::Value>,
}

impl WorktreeMetadata {
    #[must_use]
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            created_at: Utc::now(),
            init_script_ran: false,
            init_script_status: None,
            init_script_error: None,
            pr: None,
        }
    }

    pub fn mark_init_running(&mut self) {
        self.init_script_ran = false;
        self.init_script_status = Some(InitScriptStatus::Running);
        self.init_script_error = None;
    }

    /// Forget earlier runs so the script is treated as never run.
    pub fn reset_init_state(&mut self) {
        self.init_script_ran = false;
        self.init_script_status = None;
        self.init_script_error = None;
    }

    pub fn mark_init_finished(&mut self, error: Option<String>) {
        self.init_script_ran = true;
        self.init_script_status = Some(if error.is_none() {
            InitScriptStatus::Success
        } else {
            InitScriptStatus::Failed
        });
        self.init_script_error = error;
    }

    /// `ran` and a final status always agree; `running` never has `ran` set.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        match self.init_script_status {
            Some(InitScriptStatus::Running) => !self.init_script_ran,
            Some(InitScriptStatus::Success) => self.init_script_ran && self.init_script_error.is_none(),
            Some(InitScriptStatus::Failed) => self.init_script_ran,
            None => !self.init_script_ran,
        }
    }
}

#[derive(Clone)]
pub struct WorktreeMetadataStore {
    files: Arc<dyn SecureFileStore>,
}

impl std::fmt::Debug for WorktreeMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorktreeMetadataStore").finish_non_exhaustive()
    }
}

impl WorktreeMetadataStore {
    #[must_use]
    pub fn new(files: Arc<dyn SecureFileStore>) -> Self {
        Self { files }
    }

    #[must_use]
    pub fn metadata_dir(project: &Path, branch: &str) -> PathBuf {
        AutoModeConfig::worktree_meta_dir(project).join(sanitize_branch_name(branch))
    }

    fn record_path(project: &Path, branch: &str) -> PathBuf {
        Self::metadata_dir(project, branch).join(WORKTREE_META_FILE)
    }

    pub fn read(&self, project: &Path, branch: &str) -> Result<Option<WorktreeMetadata>> {
        let path = Self::record_path(project, branch);
        if !self.files.exists(&path) {
            return Ok(None);
        }
        let content = self.files.read_to_string(&path)?;
        let metadata: WorktreeMetadata = serde_json::from_str(&content)?;
        if metadata.branch != branch {
            warn!(
                "Ignoring worktree metadata at {}: recorded for '{}', not '{}'",
                path.display(),
                metadata.branch,
                branch
            );
            return Ok(None);
        }
        Ok(Some(metadata))
    }

    pub fn write(&self, project: &Path, metadata: &WorktreeMetadata) -> Result<()> {
        let json = serde_json::to_vec_pretty(metadata)?;
        self.files
            .write_atomic(&Self::record_path(project, &metadata.branch), &json)
    }

    /// Read-modify-write, starting from a fresh record if none exists.
    pub fn update<F>(&self, project: &Path, branch: &str, apply: F) -> Result<WorktreeMetadata>
    where
        F: FnOnce(&mut WorktreeMetadata),
    {
        let mut metadata = self
            .read(project, branch)?
            .unwrap_or_else(|| WorktreeMetadata::new(branch));
        apply(&mut metadata);
        self.write(project, &metadata)?;
        Ok(metadata)
    }

    pub fn delete(&self, project: &Path, branch: &str) -> Result<()> {
        self.files.remove(&Self::metadata_dir(project, branch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::ScopedFileStore;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_branch_name() {
        assert!(sanitize_branch_name("feat/login").starts_with("feat-login-"));
        assert!(sanitize_branch_name("fix: a|b").starts_with("fix-_a-b-"));
        assert!(sanitize_branch_name(r"win\path*?").starts_with("win-path---"));
        assert_eq!(sanitize_branch_name("feat/login").len(), "feat-login".len() + 9);
        assert_eq!(sanitize_branch_name(&"x".repeat(300)).len(), 200);
        assert_eq!(
            sanitize_branch_name("feat/login"),
            sanitize_branch_name("feat/login")
        );
    }

    #[test]
    fn test_sanitize_keeps_lookalike_branches_apart() {
        let names = ["feat/x", "feat-x", "feat:x", "Feat-x", "feature/f1", "feature-f1"];
        let segments: std::collections::HashSet<String> =
            names.iter().map(|b| sanitize_branch_name(b)).collect();
        assert_eq!(segments.len(), names.len());

        let long_a = format!("{}a", "x".repeat(250));
        let long_b = format!("{}b", "x".repeat(250));
        assert_ne!(sanitize_branch_name(&long_a), sanitize_branch_name(&long_b));
    }

    #[test]
    fn test_lookalike_branches_have_separate_records() {
        let temp = TempDir::new().unwrap();
        let store = WorktreeMetadataStore::new(Arc::new(ScopedFileStore::new([temp.path()])));

        store
            .update(temp.path(), "feat/x", |m| m.mark_init_finished(None))
            .unwrap();
        assert!(store.read(temp.path(), "feat-x").unwrap().is_none());

        store.write(temp.path(), &WorktreeMetadata::new("feat-x")).unwrap();
        store.delete(temp.path(), "feat-x").unwrap();

        let kept = store.read(temp.path(), "feat/x").unwrap().unwrap();
        assert_eq!(kept.branch, "feat/x");
        assert!(kept.init_script_ran);
    }

    #[test]
    fn test_read_ignores_record_for_another_branch() {
        let temp = TempDir::new().unwrap();
        let store = WorktreeMetadataStore::new(Arc::new(ScopedFileStore::new([temp.path()])));
        let dir = WorktreeMetadataStore::metadata_dir(temp.path(), "feat-y");
        std::fs::create_dir_all(&dir).unwrap();
        let foreign = serde_json::to_vec(&WorktreeMetadata::new("feat/y")).unwrap();
        std::fs::write(dir.join(WORKTREE_META_FILE), foreign).unwrap();

        assert!(store.read(temp.path(), "feat-y").unwrap().is_none());
    }

    #[test]
    fn test_init_state_transitions_stay_consistent() {
        let mut meta = WorktreeMetadata::new("feat/x");
        assert!(meta.is_consistent());

        meta.mark_init_running();
        assert!(meta.is_consistent());
        assert!(!meta.init_script_ran);

        meta.mark_init_finished(Some("exit code 1".into()));
        assert!(meta.is_consistent());
        assert_eq!(meta.init_script_status, Some(InitScriptStatus::Failed));

        meta.mark_init_running();
        meta.mark_init_finished(None);
        assert!(meta.is_consistent());
        assert_eq!(meta.init_script_error, None);
    }

    #[test]
    fn test_store_update_creates_and_preserves() {
        let temp = TempDir::new().unwrap();
        let store = WorktreeMetadataStore::new(Arc::new(ScopedFileStore::new([temp.path()])));

        assert!(store.read(temp.path(), "feat/x").unwrap().is_none());

        store
            .update(temp.path(), "feat/x", |m| {
                m.pr = Some(serde_json::json!({"number": 42}));
            })
            .unwrap();
        let updated = store
            .update(temp.path(), "feat/x", |m| m.mark_init_finished(None))
            .unwrap();

        assert_eq!(updated.pr.unwrap()["number"], 42);
        let record = WorktreeMetadataStore::metadata_dir(temp.path(), "feat/x").join(WORKTREE_META_FILE);
        assert!(record.starts_with(temp.path().join(".automaker/worktrees")));
        assert!(record.exists());

        store.delete(temp.path(), "feat/x").unwrap();
        assert!(store.read(temp.path(), "feat/x").unwrap().is_none());
    }
}
