//! Pure admission rules for the auto loop.

use crate::error::AutoModeError;
use crate::feature::{Feature, FeatureStatus};
use std::collections::{HashMap, HashSet};

/// Dependencies of `feature` that are not yet verified.
///
/// Ids that match no known feature count as satisfied, so deleting a
/// prerequisite never strands its dependents.
#[must_use]
pub fn pending_dependencies(feature: &Feature, by_id: &HashMap<&str, &Feature>) -> Vec<String> {
    feature
        .dependencies
        .iter()
        .filter(|dep| {
            by_id
                .get(dep.as_str())
                .is_some_and(|d| d.status != FeatureStatus::Verified)
        })
        .cloned()
        .collect()
}

fn index(features: &[Feature]) -> HashMap<&str, &Feature> {
    features.iter().map(|f| (f.id.as_str(), f)).collect()
}

/// Backlog features that could run now, best first, capped at the free slots.
///
/// `running` holds ids already executing; `excluded` holds ids the caller
/// wants skipped this pass (stopped by the user, out of attempts).
#[must_use]
pub fn select_admissible<'a>(
    features: &'a [Feature],
    running: &HashSet<String>,
    max_concurrency: usize,
    excluded: &HashSet<String>,
) -> Vec<&'a Feature> {
    let free = max_concurrency.saturating_sub(running.len());
    if free == 0 {
        return Vec::new();
    }

    let by_id = index(features);
    let mut eligible: Vec<&Feature> = features
        .iter()
        .filter(|f| f.status == FeatureStatus::Backlog)
        .filter(|f| !running.contains(&f.id) && !excluded.contains(&f.id))
        .filter(|f| pending_dependencies(f, &by_id).is_empty())
        .collect();

    eligible.sort_by(|a, b| (a.priority, a.created_at, &a.id).cmp(&(b.priority, b.created_at, &b.id)));
    eligible.truncate(free);
    eligible
}

/// Backlog features held back by unverified dependencies.
#[must_use]
pub fn blocked_features(features: &[Feature]) -> Vec<AutoModeError> {
    let by_id = index(features);
    features
        .iter()
        .filter(|f| f.status == FeatureStatus::Backlog)
        .filter_map(|f| {
            let pending = pending_dependencies(f, &by_id);
            (!pending.is_empty()).then(|| AutoModeError::DependencyUnsatisfied {
                feature_id: f.id.clone(),
                pending,
            })
        })
        .collect()
}
