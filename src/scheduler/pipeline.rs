//! Drives one feature run through its phases and republishes agent output.

use crate::error::AutoModeError;
use crate::events::{AgentEvent, EventBus, Phase};
use crate::feature::{Feature, FeatureStore};
use crate::testing::{AgentMessage, AgentRequest, AgentRunner};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Prior context beyond this many characters is cut from the front.
const MAX_PRIOR_CONTEXT_CHARS: usize = 20_000;

/// Which entry point started the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Fresh,
    Resume,
    Verify,
    FollowUp {
        prompt: String,
        images: Vec<PathBuf>,
    },
}

impl RunMode {
    /// Phases to execute, given whether earlier agent context exists.
    #[must_use]
    pub fn phases(&self, has_context: bool) -> Vec<Phase> {
        match self {
            Self::Fresh => vec![Phase::Planning, Phase::Action, Phase::Verification],
            Self::Resume if has_context => vec![Phase::Action, Phase::Verification],
            Self::Resume => vec![Phase::Planning, Phase::Action, Phase::Verification],
            Self::Verify => vec![Phase::Verification],
            Self::FollowUp { .. } => vec![Phase::Action, Phase::Verification],
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Fresh => "run",
            Self::Resume => "resume",
            Self::Verify => "verify",
            Self::FollowUp { .. } => "follow-up",
        }
    }
}

/// How a run ended. Failures are always [`AutoModeError::AgentTask`].
#[derive(Debug)]
pub enum Settlement {
    Passed { summary: String },
    Failed { error: AutoModeError },
    Cancelled,
}

impl Settlement {
    fn failed(feature_id: &str, message: String) -> Self {
        Self::Failed {
            error: AutoModeError::agent_task(feature_id, message),
        }
    }
}

/// Tools the agent may use in each phase.
#[must_use]
pub fn allowed_tools(phase: Phase) -> Vec<String> {
    let tools: &[&str] = match phase {
        Phase::Planning => &["Read", "Glob", "Grep"],
        Phase::Action => &["Read", "Write", "Edit", "Glob", "Grep", "Bash"],
        Phase::Verification => &["Read", "Glob", "Grep", "Bash"],
    };
    tools.iter().map(|t| (*t).to_string()).collect()
}

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    let start = text.char_indices().nth(skip).map_or(0, |(i, _)| i);
    &text[start..]
}

fn feature_block(feature: &Feature) -> String {
    let mut block = format!("# Feature: {}\n\n", feature.title);
    if !feature.category.is_empty() {
        block.push_str(&format!("Category: {}\n", feature.category));
    }
    block.push_str(&format!("Complexity: {:?}\n\n", feature.complexity));
    block.push_str(&feature.description);
    block.push('\n');
    block
}

/// Inputs to a phase prompt beyond the feature itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct PromptContext<'a> {
    pub plan: Option<&'a str>,
    pub prior_context: Option<&'a str>,
    pub follow_up: Option<&'a str>,
    pub images: &'a [PathBuf],
}

#[must_use]
pub fn build_prompt(phase: Phase, feature: &Feature, ctx: PromptContext<'_>) -> String {
    let mut prompt = match phase {
        Phase::Planning => String::from(
            "Plan the implementation of the feature below. Read the code you need, \
             then reply with a short numbered plan. Do not modify any files.\n\n",
        ),
        Phase::Action => String::from(
            "Implement the feature below in this working directory. Keep changes \
             focused and consistent with the existing code.\n\n",
        ),
        Phase::Verification => String::from(
            "Verify that the feature below is fully implemented. Build the project \
             and run its tests. Report clearly whether verification passed.\n\n",
        ),
    };
    prompt.push_str(&feature_block(feature));

    if let Some(plan) = ctx.plan.filter(|p| !p.trim().is_empty()) {
        prompt.push_str("\n## Plan\n\n");
        prompt.push_str(plan.trim());
        prompt.push('\n');
    }
    if let Some(prior) = ctx.prior_context.filter(|p| !p.trim().is_empty()) {
        prompt.push_str("\n## Previous work on this feature\n\n");
        prompt.push_str(tail_chars(prior.trim(), MAX_PRIOR_CONTEXT_CHARS));
        prompt.push('\n');
    }
    if let Some(follow_up) = ctx.follow_up {
        prompt.push_str("\n## Follow-up instructions\n\n");
        prompt.push_str(follow_up.trim());
        prompt.push('\n');
    }
    if !ctx.images.is_empty() {
        prompt.push_str("\n## Attached images\n\n");
        for image in ctx.images {
            prompt.push_str(&format!("- {}\n", image.display()));
        }
    }
    prompt
}

/// Everything one run needs; consumed by [`PipelineRun::drive`].
pub struct PipelineRun {
    pub feature: Feature,
    pub project: PathBuf,
    pub workdir: PathBuf,
    pub mode: RunMode,
    pub prior_context: Option<String>,
    pub agent: Arc<dyn AgentRunner>,
    pub features: FeatureStore,
    pub bus: EventBus,
    pub cancel: CancellationToken,
}

impl PipelineRun {
    fn record(&self, text: &str) {
        if let Err(e) = self
            .features
            .append_context(&self.project, &self.feature.id, text)
        {
            warn!(feature_id = %self.feature.id, "Failed to append agent context: {}", e);
        }
    }

    fn publish(&self, event: AgentEvent) {
        self.bus.publish(event);
    }

    /// Run every phase in order. Stops at the first failing phase.
    pub async fn drive(self) -> Settlement {
        let id = self.feature.id.clone();
        let phases = self.mode.phases(self.prior_context.is_some());
        let (follow_up, images) = match &self.mode {
            RunMode::FollowUp { prompt, images } => (Some(prompt.clone()), images.clone()),
            _ => (None, Vec::new()),
        };

        self.record(&format!(
            "\n## {} ({})\n",
            self.mode.label(),
            chrono::Utc::now().to_rfc3339()
        ));

        let mut plan: Option<String> = None;
        let mut summary = String::new();

        for phase in phases {
            if self.cancel.is_cancelled() {
                return Settlement::Cancelled;
            }
            debug!(feature_id = %id, %phase, "Starting phase");
            self.publish(AgentEvent::AutoModePhase {
                feature_id: id.clone(),
                phase,
                message: format!("Starting {phase} phase"),
            });
            self.record(&format!("\n### {phase}\n\n"));

            let prompt = build_prompt(
                phase,
                &self.feature,
                PromptContext {
                    plan: plan.as_deref(),
                    prior_context: self.prior_context.as_deref(),
                    follow_up: follow_up.as_deref(),
                    images: &images,
                },
            );
            let request = AgentRequest {
                feature_id: id.clone(),
                phase,
                prompt,
                cwd: self.workdir.clone(),
                allowed_tools: allowed_tools(phase),
                images: images.clone(),
            };

            let started = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Settlement::Cancelled,
                started = self.agent.run(request, self.cancel.clone()) => started,
            };
            let mut stream = match started {
                Ok(stream) => stream,
                Err(_) if self.cancel.is_cancelled() => return Settlement::Cancelled,
                Err(e) => {
                    return Settlement::failed(&id, format!("Agent failed to start {phase} phase: {e:#}"))
                }
            };

            let mut output = String::new();
            let mut result: Option<(bool, String)> = None;
            loop {
                let next = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Settlement::Cancelled,
                    next = stream.next() => next,
                };
                match next {
                    Some(AgentMessage::Text(text)) => {
                        self.record(&text);
                        self.record("\n");
                        output.push_str(&text);
                        output.push('\n');
                        self.publish(AgentEvent::AutoModeProgress {
                            feature_id: id.clone(),
                            phase,
                            content: text,
                        });
                    }
                    Some(AgentMessage::ToolUse { name, input }) => {
                        self.record(&format!("\n[tool] {name}\n"));
                        self.publish(AgentEvent::AutoModeTool {
                            feature_id: id.clone(),
                            phase,
                            tool: name,
                            input,
                        });
                    }
                    Some(AgentMessage::Result { success, summary }) => {
                        result = Some((success, summary));
                    }
                    None => break,
                }
            }

            if self.cancel.is_cancelled() {
                return Settlement::Cancelled;
            }
            match result {
                Some((true, phase_summary)) => {
                    if phase == Phase::Planning {
                        plan = Some(output);
                    }
                    summary = phase_summary;
                }
                Some((false, reason)) => {
                    self.record(&format!("\n{phase} failed: {reason}\n"));
                    return Settlement::failed(&id, format!("{phase} failed: {reason}"));
                }
                None => {
                    return Settlement::failed(
                        &id,
                        format!("Agent ended the {phase} phase without a result"),
                    )
                }
            }
        }

        Settlement::Passed { summary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Topic;
    use crate::operations::ScopedFileStore;
    use crate::testing::MockAgentRunner;
    use tempfile::TempDir;

    fn run_with(
        temp: &TempDir,
        agent: Arc<dyn AgentRunner>,
        mode: RunMode,
        bus: &EventBus,
        cancel: CancellationToken,
    ) -> PipelineRun {
        let features = FeatureStore::new(Arc::new(ScopedFileStore::new([temp.path()])));
        PipelineRun {
            feature: Feature::new("Login", "Add a login form").with_id("f1"),
            project: temp.path().to_path_buf(),
            workdir: temp.path().to_path_buf(),
            mode,
            prior_context: None,
            agent,
            features,
            bus: bus.clone(),
            cancel,
        }
    }

    #[test]
    fn test_phases_per_mode() {
        assert_eq!(RunMode::Fresh.phases(true).len(), 3);
        assert_eq!(
            RunMode::Resume.phases(true),
            vec![Phase::Action, Phase::Verification]
        );
        assert_eq!(RunMode::Resume.phases(false).len(), 3);
        assert_eq!(RunMode::Verify.phases(false), vec![Phase::Verification]);
    }

    #[test]
    fn test_planning_tools_are_read_only() {
        let tools = allowed_tools(Phase::Planning);
        assert!(!tools.iter().any(|t| t == "Write" || t == "Edit" || t == "Bash"));
        assert!(allowed_tools(Phase::Action).contains(&"Edit".to_string()));
    }

    #[test]
    fn test_prompt_sections() {
        let feature = Feature::new("Login", "Add a login form").with_category("auth");
        let images = vec![PathBuf::from("/tmp/mock.png")];
        let prompt = build_prompt(
            Phase::Action,
            &feature,
            PromptContext {
                plan: Some("1. add form"),
                prior_context: Some("earlier output"),
                follow_up: Some("make the button blue"),
                images: &images,
            },
        );

        assert!(prompt.contains("# Feature: Login"));
        assert!(prompt.contains("Category: auth"));
        assert!(prompt.contains("## Plan\n\n1. add form"));
        assert!(prompt.contains("## Previous work on this feature"));
        assert!(prompt.contains("make the button blue"));
        assert!(prompt.contains("- /tmp/mock.png"));

        let bare = build_prompt(Phase::Verification, &feature, PromptContext::default());
        assert!(!bare.contains("## Plan"));
    }

    #[test]
    fn test_tail_chars_respects_char_boundaries() {
        assert_eq!(tail_chars("héllo", 3), "llo");
        assert_eq!(tail_chars("abc", 10), "abc");
    }

    #[tokio::test]
    async fn test_drive_passes_and_emits_in_phase_order() {
        let temp = TempDir::new().unwrap();
        let bus = EventBus::new();
        let (_sub, mut rx) = bus.subscribe_channel(Topic::AutoMode);
        let agent = Arc::new(MockAgentRunner::new());
        let run = run_with(&temp, agent.clone(), RunMode::Fresh, &bus, CancellationToken::new());

        match run.drive().await {
            Settlement::Passed { summary } => assert_eq!(summary, "verification complete"),
            other => panic!("expected a pass, got {other:?}"),
        }

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::AutoModePhase { phase, .. } = event {
                phases.push(phase);
            }
        }
        assert_eq!(phases, vec![Phase::Planning, Phase::Action, Phase::Verification]);

        let action = &agent.requests()[1];
        assert!(action.prompt.contains("planning output for f1"));
        assert!(action.allowed_tools.contains(&"Write".to_string()));

        let context = std::fs::read_to_string(FeatureStore::context_path(temp.path(), "f1")).unwrap();
        assert!(context.contains("### verification"));
        assert!(context.contains("[tool] Read"));
    }

    #[tokio::test]
    async fn test_drive_stops_at_failing_phase() {
        let temp = TempDir::new().unwrap();
        let bus = EventBus::new();
        let agent = Arc::new(MockAgentRunner::new().with_phase_failure(Phase::Action, "compile error"));
        let run = run_with(&temp, agent.clone(), RunMode::Fresh, &bus, CancellationToken::new());

        match run.drive().await {
            Settlement::Failed {
                error: AutoModeError::AgentTask { feature_id, message },
            } => {
                assert_eq!(feature_id, "f1");
                assert_eq!(message, "action failed: compile error");
            }
            other => panic!("expected an agent task failure, got {other:?}"),
        }
        assert_eq!(agent.phases_for("f1"), vec![Phase::Planning, Phase::Action]);
    }

    #[tokio::test]
    async fn test_drive_reports_start_error() {
        let temp = TempDir::new().unwrap();
        let bus = EventBus::new();
        let agent = Arc::new(MockAgentRunner::new().with_start_error("claude: command not found"));
        let run = run_with(&temp, agent, RunMode::Verify, &bus, CancellationToken::new());

        match run.drive().await {
            Settlement::Failed { error } => {
                assert!(error.is_recoverable());
                assert!(error.to_string().contains("command not found"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drive_observes_cancellation() {
        let temp = TempDir::new().unwrap();
        let bus = EventBus::new();
        let agent = Arc::new(MockAgentRunner::new().with_hold_all());
        let cancel = CancellationToken::new();
        let run = run_with(&temp, agent, RunMode::Fresh, &bus, cancel.clone());

        let handle = tokio::spawn(run.drive());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(matches!(handle.await.unwrap(), Settlement::Cancelled));
    }
}
