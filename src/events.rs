//! Progress events and the in-process event bus.
//!
//! Events are ephemeral: the bus fans each one out synchronously to the
//! handlers subscribed at the moment of emission and keeps nothing around.
//! Late subscribers must re-read feature state from the store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;

/// Agent work phase within a single feature run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Action,
    Verification,
}

impl Phase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Action => "action",
            Self::Verification => "verification",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which pipe an init-script output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Every event observers can receive, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    AutoModeStarted {
        project_path: PathBuf,
        max_concurrency: usize,
    },
    AutoModeStopped {
        project_path: PathBuf,
        stopped_features: usize,
    },
    /// Nothing admissible and nothing running.
    AutoModeIdle { project_path: PathBuf },
    AutoModeFeatureStart {
        feature_id: String,
        project_path: PathBuf,
        branch_name: Option<String>,
        worktree_path: PathBuf,
    },
    AutoModePhase {
        feature_id: String,
        phase: Phase,
        message: String,
    },
    AutoModeProgress {
        feature_id: String,
        phase: Phase,
        content: String,
    },
    AutoModeTool {
        feature_id: String,
        phase: Phase,
        tool: String,
        input: serde_json::Value,
    },
    /// Terminal event; exactly one per run.
    AutoModeFeatureComplete {
        feature_id: String,
        passes: bool,
        message: String,
    },
    AutoModeError {
        feature_id: Option<String>,
        error: String,
    },
    WorktreeInitStarted {
        project_path: PathBuf,
        branch: String,
        worktree_path: PathBuf,
    },
    WorktreeInitOutput {
        branch: String,
        stream: OutputStream,
        content: String,
    },
    WorktreeInitCompleted {
        branch: String,
        success: bool,
        exit_code: Option<i32>,
        error: Option<String>,
    },
}

impl AgentEvent {
    /// Topic this event is published on.
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Self::WorktreeInitStarted { .. }
            | Self::WorktreeInitOutput { .. }
            | Self::WorktreeInitCompleted { .. } => Topic::Worktree,
            _ => Topic::AutoMode,
        }
    }

    #[must_use]
    pub fn feature_id(&self) -> Option<&str> {
        match self {
            Self::AutoModeFeatureStart { feature_id, .. }
            | Self::AutoModePhase { feature_id, .. }
            | Self::AutoModeProgress { feature_id, .. }
            | Self::AutoModeTool { feature_id, .. }
            | Self::AutoModeFeatureComplete { feature_id, .. } => Some(feature_id),
            Self::AutoModeError { feature_id, .. } => feature_id.as_deref(),
            _ => None,
        }
    }

    /// The wire name of the variant, e.g. `auto_mode_feature_complete`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AutoModeStarted { .. } => "auto_mode_started",
            Self::AutoModeStopped { .. } => "auto_mode_stopped",
            Self::AutoModeIdle { .. } => "auto_mode_idle",
            Self::AutoModeFeatureStart { .. } => "auto_mode_feature_start",
            Self::AutoModePhase { .. } => "auto_mode_phase",
            Self::AutoModeProgress { .. } => "auto_mode_progress",
            Self::AutoModeTool { .. } => "auto_mode_tool",
            Self::AutoModeFeatureComplete { .. } => "auto_mode_feature_complete",
            Self::AutoModeError { .. } => "auto_mode_error",
            Self::WorktreeInitStarted { .. } => "worktree_init_started",
            Self::WorktreeInitOutput { .. } => "worktree_init_output",
            Self::WorktreeInitCompleted { .. } => "worktree_init_completed",
        }
    }
}

/// Channel an event is published on. `All` is only meaningful for subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    AutoMode,
    Worktree,
    All,
}

impl Topic {
    fn accepts(self, emitted: Topic) -> bool {
        self == Topic::All || self == emitted
    }
}

type Handler = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    topic: Topic,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

/// Synchronous publish/subscribe fan-out.
///
/// Cloning is cheap; clones share the same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every handler subscribed to `topic`, in
    /// subscription order, before returning.
    ///
    /// The subscriber list is snapshotted first, so handlers may subscribe or
    /// unsubscribe while being called.
    pub fn emit(&self, topic: Topic, event: &AgentEvent) {
        let handlers: Vec<Handler> = {
            let subscribers = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers
                .iter()
                .filter(|s| s.topic.accepts(topic))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        for handler in handlers {
            handler(event);
        }
    }

    /// Emit on the event's own topic.
    pub fn publish(&self, event: AgentEvent) {
        self.emit(event.topic(), &event);
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                topic,
                handler: Arc::new(handler),
            });
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Bridge a subscription into an async channel.
    pub fn subscribe_channel(
        &self,
        topic: Topic,
    ) -> (Subscription, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(topic, move |event| {
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping it leaves the handler registered; call [`Subscription::unsubscribe`].
#[derive(Debug)]
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the handler. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        let mut subscribers = inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != self.id);
        subscribers.len() != before
    }
}
