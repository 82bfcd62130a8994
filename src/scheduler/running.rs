//! In-memory index of executing features.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One in-flight run.
#[derive(Debug)]
pub struct RunningEntry {
    pub run_id: Uuid,
    pub project: PathBuf,
    pub cancel: CancellationToken,
    settled: AtomicBool,
}

impl RunningEntry {
    /// Claim the right to report this run's outcome. Only the first caller
    /// gets `true`; everyone else must stay silent.
    pub fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }
}

/// Feature id → running entry. Safe to share across tasks.
#[derive(Debug, Default)]
pub struct RunningSet {
    entries: DashMap<String, Arc<RunningEntry>>,
}

impl RunningSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run. Returns `None` if the feature is already running.
    pub fn try_insert(&self, feature_id: &str, project: &Path) -> Option<Arc<RunningEntry>> {
        match self.entries.entry(feature_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let entry = Arc::new(RunningEntry {
                    run_id: Uuid::new_v4(),
                    project: project.to_path_buf(),
                    cancel: CancellationToken::new(),
                    settled: AtomicBool::new(false),
                });
                slot.insert(Arc::clone(&entry));
                Some(entry)
            }
        }
    }

    pub fn remove(&self, feature_id: &str) -> Option<Arc<RunningEntry>> {
        self.entries.remove(feature_id).map(|(_, entry)| entry)
    }

    /// Remove the entry only if it still belongs to `run_id`.
    pub fn remove_run(&self, feature_id: &str, run_id: Uuid) -> bool {
        self.entries
            .remove_if(feature_id, |_, entry| entry.run_id == run_id)
            .is_some()
    }

    #[must_use]
    pub fn get(&self, feature_id: &str) -> Option<Arc<RunningEntry>> {
        self.entries.get(feature_id).map(|e| Arc::clone(e.value()))
    }

    #[must_use]
    pub fn contains(&self, feature_id: &str) -> bool {
        self.entries.contains_key(feature_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn ids_for_project(&self, project: &Path) -> HashSet<String> {
        self.entries
            .iter()
            .filter(|e| e.value().project == project)
            .map(|e| e.key().clone())
            .collect()
    }

    #[must_use]
    pub fn count_for_project(&self, project: &Path) -> usize {
        self.entries
            .iter()
            .filter(|e| e.value().project == project)
            .count()
    }
}
