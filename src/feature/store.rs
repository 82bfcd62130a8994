//! Durable feature records under `.automaker/features/<id>/`.
//!
//! Each feature directory holds `feature.json` and, once the agent has run,
//! the `agent-output.md` context artifact. Record writes are atomic.

use super::{Feature, FeatureStatus};
use crate::config::{AutoModeConfig, CONTEXT_FILE, FEATURE_FILE};
use crate::error::{AutoModeError, Result};
use crate::testing::SecureFileStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Feature ids become directory names, so they must be a single plain segment.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !id.chars().any(char::is_control)
}

#[derive(Clone)]
pub struct FeatureStore {
    files: Arc<dyn SecureFileStore>,
}

impl std::fmt::Debug for FeatureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureStore").finish_non_exhaustive()
    }
}

impl FeatureStore {
    #[must_use]
    pub fn new(files: Arc<dyn SecureFileStore>) -> Self {
        Self { files }
    }

    #[must_use]
    pub fn feature_dir(project: &Path, id: &str) -> PathBuf {
        AutoModeConfig::features_dir(project).join(id)
    }

    #[must_use]
    pub fn context_path(project: &Path, id: &str) -> PathBuf {
        Self::feature_dir(project, id).join(CONTEXT_FILE)
    }

    fn record_path(project: &Path, id: &str) -> PathBuf {
        Self::feature_dir(project, id).join(FEATURE_FILE)
    }

    fn write(&self, project: &Path, feature: &Feature) -> Result<()> {
        let json = serde_json::to_vec_pretty(feature)?;
        self.files
            .write_atomic(&Self::record_path(project, &feature.id), &json)
    }

    /// All readable features, ordered by priority then creation time.
    ///
    /// Unreadable records are skipped with a warning.
    pub fn list(&self, project: &Path) -> Result<Vec<Feature>> {
        let dir = AutoModeConfig::features_dir(project);
        let mut features = Vec::new();

        for entry in self.files.list_dir(&dir)? {
            let record = entry.join(FEATURE_FILE);
            if !self.files.exists(&record) {
                continue;
            }
            let parsed = self
                .files
                .read_to_string(&record)
                .and_then(|content| Ok(serde_json::from_str::<Feature>(&content)?));
            match parsed {
                Ok(feature) => features.push(feature),
                Err(e) => warn!("Skipping unreadable feature {}: {}", record.display(), e),
            }
        }

        features.sort_by(|a, b| {
            (a.priority, a.created_at, &a.id).cmp(&(b.priority, b.created_at, &b.id))
        });
        Ok(features)
    }

    pub fn get(&self, project: &Path, id: &str) -> Result<Feature> {
        if !is_valid_id(id) {
            return Err(AutoModeError::feature_not_found(id));
        }
        let record = Self::record_path(project, id);
        if !self.files.exists(&record) {
            return Err(AutoModeError::feature_not_found(id));
        }
        let content = self.files.read_to_string(&record)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persist a new feature. Fails if the id is already taken.
    pub fn create(&self, project: &Path, feature: Feature) -> Result<Feature> {
        if !is_valid_id(&feature.id) {
            return Err(AutoModeError::Other(anyhow::anyhow!(
                "Invalid feature id: {:?}",
                feature.id
            )));
        }
        if self.files.exists(&Self::record_path(project, &feature.id)) {
            return Err(AutoModeError::Other(anyhow::anyhow!(
                "Feature {} already exists",
                feature.id
            )));
        }
        self.write(project, &feature)?;
        debug!("Created feature {}", feature.id);
        Ok(feature)
    }

    /// Write back a modified feature, bumping `updated_at`.
    pub fn save(&self, project: &Path, feature: &mut Feature) -> Result<()> {
        feature.touch();
        self.write(project, feature)
    }

    /// Move a feature to `status` in a single write.
    ///
    /// Entering `in_progress` stamps `started_at`; every change replaces
    /// `error` with the given value.
    pub fn update_status(
        &self,
        project: &Path,
        id: &str,
        status: FeatureStatus,
        error: Option<String>,
    ) -> Result<Feature> {
        let mut feature = self.get(project, id)?;
        if !feature.status.can_transition_to(status) {
            return Err(AutoModeError::InvalidTransition {
                feature_id: id.to_string(),
                from: feature.status.to_string(),
                to: status.to_string(),
            });
        }
        if status == FeatureStatus::InProgress {
            feature.started_at = Some(chrono::Utc::now());
        }
        feature.status = status;
        feature.error = error;
        self.save(project, &mut feature)?;
        Ok(feature)
    }

    /// Remove the feature record together with its context artifact.
    pub fn delete(&self, project: &Path, id: &str) -> Result<()> {
        if !is_valid_id(id) || !self.files.exists(&Self::record_path(project, id)) {
            return Err(AutoModeError::feature_not_found(id));
        }
        self.files.remove(&Self::feature_dir(project, id))
    }

    /// Delete several features; missing ids are skipped. Returns how many went.
    pub fn delete_many(&self, project: &Path, ids: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for id in ids {
            match self.delete(project, id) {
                Ok(()) => deleted += 1,
                Err(AutoModeError::FeatureNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Features whose effective branch is `branch`.
    pub fn on_branch(&self, project: &Path, branch: &str, main_branch: &str) -> Result<Vec<Feature>> {
        Ok(self
            .list(project)?
            .into_iter()
            .filter(|f| f.is_on_branch(branch, main_branch))
            .collect())
    }

    /// Point every feature on `from` at `to` instead. Returns the ids touched.
    pub fn reassign_branch(&self, project: &Path, from: &str, to: Option<&str>) -> Result<Vec<String>> {
        let mut touched = Vec::new();
        for mut feature in self.list(project)? {
            if feature.branch_name.as_deref() != Some(from) {
                continue;
            }
            feature.branch_name = to.map(str::to_string);
            self.save(project, &mut feature)?;
            touched.push(feature.id);
        }
        Ok(touched)
    }

    // =========================================================================
    // Context artifact
    // =========================================================================

    #[must_use]
    pub fn context_exists(&self, project: &Path, id: &str) -> bool {
        is_valid_id(id) && self.files.exists(&Self::context_path(project, id))
    }

    pub fn read_context(&self, project: &Path, id: &str) -> Result<Option<String>> {
        if !self.context_exists(project, id) {
            return Ok(None);
        }
        self.files
            .read_to_string(&Self::context_path(project, id))
            .map(Some)
    }

    pub fn append_context(&self, project: &Path, id: &str, text: &str) -> Result<()> {
        if !is_valid_id(id) {
            return Err(AutoModeError::feature_not_found(id));
        }
        self.files.append(&Self::context_path(project, id), text)
    }
}
