//! Feature records and their lifecycle.
//!
//! A feature is a unit of work for the agent. Its status moves through
//! `backlog -> in_progress -> (waiting_approval | verified)` and falls back to
//! `backlog` on failure or cancellation. `archived` is terminal for scheduling.

pub mod store;

pub use store::FeatureStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Lifecycle state of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    #[default]
    Backlog,
    InProgress,
    WaitingApproval,
    Verified,
    Archived,
}

impl FeatureStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::WaitingApproval => "waiting_approval",
            Self::Verified => "verified",
            Self::Archived => "archived",
        }
    }

    /// Whether a feature in this state may move to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: FeatureStatus) -> bool {
        use FeatureStatus::{Archived, Backlog, InProgress, Verified, WaitingApproval};
        match (self, next) {
            (Archived, Archived) => true,
            (Archived, _) => false,
            (_, Archived) => true,
            (Backlog, Backlog | InProgress) => true,
            (InProgress, _) => true,
            (WaitingApproval, Verified | InProgress | Backlog) => true,
            (Verified, InProgress | Backlog) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FeatureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "in_progress" => Ok(Self::InProgress),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "verified" => Ok(Self::Verified),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown feature status: {other}")),
        }
    }
}

/// Rough size estimate used in prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
}

impl std::str::FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Self::Simple),
            "moderate" => Ok(Self::Moderate),
            "complex" => Ok(Self::Complex),
            other => Err(format!("unknown complexity: {other}")),
        }
    }
}

/// A unit of work tracked on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub complexity: Complexity,
    /// Lower runs first.
    #[serde(default)]
    pub priority: i32,
    /// Ids that must be verified before this feature is admitted.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub status: FeatureStatus,
    /// Worktree branch; `None` means the main branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Text of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Feature {
    /// New backlog feature with a generated id.
    #[must_use]
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("feature-{}-{}", now.timestamp_millis(), &suffix[..8]),
            title: title.into(),
            description: description.into(),
            category: String::new(),
            complexity: Complexity::default(),
            priority: 0,
            dependencies: BTreeSet::new(),
            status: FeatureStatus::Backlog,
            branch_name: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    #[must_use]
    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    #[must_use]
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_name = Some(branch.into());
        self
    }

    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    /// Branch this feature runs on, falling back to `main_branch`.
    #[must_use]
    pub fn effective_branch<'a>(&'a self, main_branch: &'a str) -> &'a str {
        self.branch_name.as_deref().unwrap_or(main_branch)
    }

    #[must_use]
    pub fn is_on_branch(&self, branch: &str, main_branch: &str) -> bool {
        self.effective_branch(main_branch) == branch
    }

    /// Advance `updated_at` without ever moving it backwards.
    pub fn touch(&mut self) {
        self.updated_at = self.updated_at.max(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_feature_defaults() {
        let feature = Feature::new("Login page", "Add a login form");
        assert!(feature.id.starts_with("feature-"));
        assert_eq!(feature.status, FeatureStatus::Backlog);
        assert!(feature.dependencies.is_empty());
        assert_eq!(feature.created_at, feature.updated_at);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = Feature::new("a", "");
        let b = Feature::new("b", "");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_transitions() {
        use FeatureStatus::*;
        assert!(Backlog.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Verified));
        assert!(InProgress.can_transition_to(WaitingApproval));
        assert!(InProgress.can_transition_to(Backlog));
        assert!(WaitingApproval.can_transition_to(Verified));
        assert!(Verified.can_transition_to(InProgress));
        assert!(Backlog.can_transition_to(Archived));

        assert!(!Backlog.can_transition_to(Verified));
        assert!(!Verified.can_transition_to(WaitingApproval));
        assert!(!Archived.can_transition_to(Backlog));
        assert!(!Archived.can_transition_to(InProgress));
    }

    #[test]
    fn test_effective_branch() {
        let on_main = Feature::new("a", "");
        let on_branch = Feature::new("b", "").with_branch("feat/b");

        assert_eq!(on_main.effective_branch("main"), "main");
        assert!(on_main.is_on_branch("main", "main"));
        assert!(on_branch.is_on_branch("feat/b", "main"));
        assert!(!on_branch.is_on_branch("main", "main"));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let future = Utc::now() + chrono::Duration::hours(1);
        let mut feature = Feature::new("a", "").with_created_at(future);
        feature.touch();
        assert_eq!(feature.updated_at, future);
    }

    #[test]
    fn test_serialized_shape() {
        let feature = Feature::new("a", "b")
            .with_id("feature-1")
            .with_branch("feat/a")
            .with_dependencies(["feature-0"]);
        let json = serde_json::to_value(&feature).unwrap();

        assert_eq!(json["branchName"], "feat/a");
        assert_eq!(json["status"], "backlog");
        assert_eq!(json["dependencies"][0], "feature-0");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_minimal_record_deserializes() {
        let json = r#"{
            "id": "feature-7",
            "title": "Minimal",
            "createdAt": "2025-01-01T00:00:00Z",
            "updatedAt": "2025-01-01T00:00:00Z"
        }"#;
        let feature: Feature = serde_json::from_str(json).unwrap();
        assert_eq!(feature.status, FeatureStatus::Backlog);
        assert_eq!(feature.priority, 0);
        assert_eq!(feature.branch_name, None);
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!(
            "waiting_approval".parse::<FeatureStatus>().unwrap(),
            FeatureStatus::WaitingApproval
        );
        assert!("done".parse::<FeatureStatus>().is_err());
    }
}
