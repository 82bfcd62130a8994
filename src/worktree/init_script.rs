//! One-shot worktree init script (`.automaker/worktree-init.sh`).
//!
//! The script runs at most once per worktree unless forced. Success and
//! failure both mark it as ran, so a broken script is not retried on every
//! feature that lands in the worktree.

use super::metadata::WorktreeMetadataStore;
use crate::config::AutoModeConfig;
use crate::error::Result;
use crate::events::{AgentEvent, EventBus, OutputStream};
use crate::shell::ResolveShell;
use crate::testing::SecureFileStore;
use dashmap::DashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Environment variables exported to the script.
pub const ENV_PROJECT_PATH: &str = "AUTOMAKER_PROJECT_PATH";
pub const ENV_WORKTREE_PATH: &str = "AUTOMAKER_WORKTREE_PATH";
pub const ENV_BRANCH: &str = "AUTOMAKER_BRANCH";

const STDERR_TAIL_LINES: usize = 20;

const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    NoScript,
    AlreadyRan,
    /// Another run for this worktree has not finished yet.
    InProgress,
    Succeeded,
    Failed { error: String },
}

impl InitOutcome {
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

type RunKey = (PathBuf, String);

pub struct InitScriptService {
    files: Arc<dyn SecureFileStore>,
    metadata: WorktreeMetadataStore,
    shell: Arc<dyn ResolveShell>,
    bus: EventBus,
    /// Worktrees with a script running in this process. The persisted
    /// `Running` status outlives a crash, so it cannot answer this.
    active: DashSet<RunKey>,
}

/// Marks one worktree's script as running until dropped.
struct RunClaim<'a> {
    active: &'a DashSet<RunKey>,
    key: RunKey,
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.key);
    }
}

impl std::fmt::Debug for InitScriptService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitScriptService").finish_non_exhaustive()
    }
}

async fn forward_lines<R>(
    reader: R,
    bus: EventBus,
    branch: String,
    stream: OutputStream,
) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = Vec::new();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if stream == OutputStream::Stderr {
            if tail.len() == STDERR_TAIL_LINES {
                tail.remove(0);
            }
            tail.push(line.clone());
        }
        bus.publish(AgentEvent::WorktreeInitOutput {
            branch: branch.clone(),
            stream,
            content: line,
        });
    }
    tail
}

/// Collect a reader task. Background processes started by the script can
/// keep the pipe open after it exits, so readers get a bounded grace period.
async fn drain(task: Option<JoinHandle<Vec<String>>>, cancelled: bool) -> Vec<String> {
    let Some(mut task) = task else {
        return Vec::new();
    };
    if cancelled {
        task.abort();
        return Vec::new();
    }
    match tokio::time::timeout(READER_GRACE, &mut task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            task.abort();
            Vec::new()
        }
    }
}

impl InitScriptService {
    #[must_use]
    pub fn new(
        files: Arc<dyn SecureFileStore>,
        metadata: WorktreeMetadataStore,
        shell: Arc<dyn ResolveShell>,
        bus: EventBus,
    ) -> Self {
        Self {
            files,
            metadata,
            shell,
            bus,
            active: DashSet::new(),
        }
    }

    fn claim(&self, project: &Path, branch: &str) -> Option<RunClaim<'_>> {
        let key = (project.to_path_buf(), branch.to_string());
        self.active.insert(key.clone()).then(|| RunClaim {
            active: &self.active,
            key,
        })
    }

    /// Whether this process is currently running the script for `branch`.
    #[must_use]
    pub fn is_running(&self, project: &Path, branch: &str) -> bool {
        self.active
            .contains(&(project.to_path_buf(), branch.to_string()))
    }

    #[must_use]
    pub fn script_path(project: &Path) -> PathBuf {
        AutoModeConfig::init_script_path(project)
    }

    pub fn get_script(&self, project: &Path) -> Result<Option<String>> {
        let path = Self::script_path(project);
        if !self.files.exists(&path) {
            return Ok(None);
        }
        self.files.read_to_string(&path).map(Some)
    }

    pub fn set_script(&self, project: &Path, content: &str) -> Result<()> {
        self.files
            .write_atomic(&Self::script_path(project), content.as_bytes())
    }

    /// Returns false if there was no script.
    pub fn delete_script(&self, project: &Path) -> Result<bool> {
        let path = Self::script_path(project);
        if !self.files.exists(&path) {
            return Ok(false);
        }
        self.files.remove(&path)?;
        Ok(true)
    }

    /// Run the script unless this worktree already ran (or is running) it.
    pub async fn run_if_needed(
        &self,
        project: &Path,
        branch: &str,
        worktree: &Path,
        cancel: CancellationToken,
    ) -> Result<InitOutcome> {
        if !self.files.exists(&Self::script_path(project)) {
            return Ok(InitOutcome::NoScript);
        }
        let Some(_claim) = self.claim(project, branch) else {
            return Ok(InitOutcome::InProgress);
        };
        if self
            .metadata
            .read(project, branch)?
            .is_some_and(|m| m.init_script_ran)
        {
            return Ok(InitOutcome::AlreadyRan);
        }
        self.execute(project, branch, worktree, cancel).await
    }

    /// Run the script again regardless of earlier results, including a
    /// `Running` status left behind by a process that died mid-script.
    pub async fn force_run(
        &self,
        project: &Path,
        branch: &str,
        worktree: &Path,
        cancel: CancellationToken,
    ) -> Result<InitOutcome> {
        if !self.files.exists(&Self::script_path(project)) {
            return Ok(InitOutcome::NoScript);
        }
        let Some(_claim) = self.claim(project, branch) else {
            return Ok(InitOutcome::InProgress);
        };
        self.metadata
            .update(project, branch, |m| m.reset_init_state())?;
        self.execute(project, branch, worktree, cancel).await
    }

    async fn execute(
        &self,
        project: &Path,
        branch: &str,
        worktree: &Path,
        cancel: CancellationToken,
    ) -> Result<InitOutcome> {
        self.metadata
            .update(project, branch, |m| m.mark_init_running())?;
        self.bus.publish(AgentEvent::WorktreeInitStarted {
            project_path: project.to_path_buf(),
            branch: branch.to_string(),
            worktree_path: worktree.to_path_buf(),
        });
        info!("Running worktree init script for {}", branch);

        let (exit_code, error) = self.spawn_and_wait(project, branch, worktree, cancel).await;

        if let Some(error) = &error {
            warn!("Init script for {} failed: {}", branch, error);
        }
        self.metadata
            .update(project, branch, |m| m.mark_init_finished(error.clone()))?;
        self.bus.publish(AgentEvent::WorktreeInitCompleted {
            branch: branch.to_string(),
            success: error.is_none(),
            exit_code,
            error: error.clone(),
        });

        Ok(match error {
            None => InitOutcome::Succeeded,
            Some(error) => InitOutcome::Failed { error },
        })
    }

    /// Exit code and, on failure, the error text.
    async fn spawn_and_wait(
        &self,
        project: &Path,
        branch: &str,
        worktree: &Path,
        cancel: CancellationToken,
    ) -> (Option<i32>, Option<String>) {
        let shell = match self.shell.resolve() {
            Ok(shell) => shell,
            Err(e) => return (None, Some(e.to_string())),
        };

        let spawned = Command::new(&shell.program)
            .args(&shell.args)
            .arg(Self::script_path(project))
            .current_dir(worktree)
            .env(ENV_PROJECT_PATH, project)
            .env(ENV_WORKTREE_PATH, worktree)
            .env(ENV_BRANCH, branch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return (
                    None,
                    Some(format!("Failed to start {}: {e}", shell.program.display())),
                )
            }
        };

        let stdout_task = child.stdout.take().map(|out| {
            tokio::spawn(forward_lines(
                out,
                self.bus.clone(),
                branch.to_string(),
                OutputStream::Stdout,
            ))
        });
        let stderr_task = child.stderr.take().map(|err| {
            tokio::spawn(forward_lines(
                err,
                self.bus.clone(),
                branch.to_string(),
                OutputStream::Stderr,
            ))
        });

        let status = tokio::select! {
            status = child.wait() => Some(status),
            () = cancel.cancelled() => {
                let _ = child.kill().await;
                None
            }
        };

        let cancelled = status.is_none();
        drain(stdout_task, cancelled).await;
        let stderr_tail = drain(stderr_task, cancelled).await;

        match status {
            None => (None, Some("Init script cancelled".to_string())),
            Some(Ok(status)) if status.success() => (status.code(), None),
            Some(Ok(status)) => {
                let mut error = match status.code() {
                    Some(code) => format!("Init script exited with code {code}"),
                    None => "Init script terminated by signal".to_string(),
                };
                if let Some(last) = stderr_tail.last() {
                    error.push_str(": ");
                    error.push_str(last);
                }
                (status.code(), Some(error))
            }
            Some(Err(e)) => (None, Some(format!("Failed to wait for init script: {e}"))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::Topic;
    use crate::worktree::metadata::InitScriptStatus;
    use crate::operations::ScopedFileStore;
    use crate::shell::{ShellPlatform, ShellResolver};
    use tempfile::TempDir;

    struct Harness {
        temp: TempDir,
        worktree: PathBuf,
        bus: EventBus,
        metadata: WorktreeMetadataStore,
        service: InitScriptService,
    }

    fn harness_with_shell(shell: Arc<dyn ResolveShell>) -> Harness {
        let temp = TempDir::new().unwrap();
        let files: Arc<dyn SecureFileStore> = Arc::new(ScopedFileStore::new([temp.path()]));
        let worktree = temp.path().join(".worktrees").join("feat-x");
        std::fs::create_dir_all(&worktree).unwrap();
        let bus = EventBus::new();
        let metadata = WorktreeMetadataStore::new(Arc::clone(&files));
        let service = InitScriptService::new(files, metadata.clone(), shell, bus.clone());
        Harness {
            temp,
            worktree,
            bus,
            metadata,
            service,
        }
    }

    fn harness() -> Harness {
        harness_with_shell(Arc::new(ShellResolver::for_current_platform()))
    }

    impl Harness {
        fn project(&self) -> &Path {
            self.temp.path()
        }

        async fn run(&self) -> InitOutcome {
            self.service
                .run_if_needed(self.project(), "feat/x", &self.worktree, CancellationToken::new())
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_no_script() {
        let h = harness();
        assert_eq!(h.run().await, InitOutcome::NoScript);
        assert!(h.metadata.read(h.project(), "feat/x").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_success_streams_output_and_exports_env() {
        let h = harness();
        h.service
            .set_script(
                h.project(),
                "echo hello\necho oops >&2\necho \"$AUTOMAKER_BRANCH\" > branch.txt\n",
            )
            .unwrap();
        let (_sub, mut rx) = h.bus.subscribe_channel(Topic::Worktree);

        assert_eq!(h.run().await, InitOutcome::Succeeded);

        let written = std::fs::read_to_string(h.worktree.join("branch.txt")).unwrap();
        assert_eq!(written.trim(), "feat/x");

        let meta = h.metadata.read(h.project(), "feat/x").unwrap().unwrap();
        assert!(meta.init_script_ran);
        assert_eq!(meta.init_script_status, Some(InitScriptStatus::Success));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(AgentEvent::WorktreeInitStarted { .. })));
        assert!(events.iter().any(|e| matches!(e,
            AgentEvent::WorktreeInitOutput { stream: OutputStream::Stdout, content, .. } if content == "hello")));
        assert!(events.iter().any(|e| matches!(e,
            AgentEvent::WorktreeInitOutput { stream: OutputStream::Stderr, content, .. } if content == "oops")));
        assert!(matches!(
            events.last(),
            Some(AgentEvent::WorktreeInitCompleted { success: true, exit_code: Some(0), .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_not_retried() {
        let h = harness();
        h.service
            .set_script(h.project(), "echo broken >&2\nexit 3\n")
            .unwrap();

        match h.run().await {
            InitOutcome::Failed { error } => {
                assert!(error.contains("code 3"));
                assert!(error.contains("broken"));
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let meta = h.metadata.read(h.project(), "feat/x").unwrap().unwrap();
        assert!(meta.init_script_ran);
        assert_eq!(meta.init_script_status, Some(InitScriptStatus::Failed));
        assert!(meta.is_consistent());

        assert_eq!(h.run().await, InitOutcome::AlreadyRan);
    }

    #[tokio::test]
    async fn test_force_run_executes_again() {
        let h = harness();
        h.service
            .set_script(h.project(), "echo run >> runs.txt\n")
            .unwrap();

        assert_eq!(h.run().await, InitOutcome::Succeeded);
        assert_eq!(h.run().await, InitOutcome::AlreadyRan);
        let forced = h
            .service
            .force_run(h.project(), "feat/x", &h.worktree, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(forced, InitOutcome::Succeeded);

        let runs = std::fs::read_to_string(h.worktree.join("runs.txt")).unwrap();
        assert_eq!(runs.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_stale_running_status_does_not_block() {
        let h = harness();
        h.service
            .set_script(h.project(), "echo ran >> runs.txt\n")
            .unwrap();
        // A process that died mid-script leaves this behind.
        h.metadata
            .update(h.project(), "feat/x", |m| {
                m.pr = Some(serde_json::json!({"number": 7}));
                m.mark_init_running();
            })
            .unwrap();
        let created_at = h
            .metadata
            .read(h.project(), "feat/x")
            .unwrap()
            .unwrap()
            .created_at;

        let forced = h
            .service
            .force_run(h.project(), "feat/x", &h.worktree, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(forced, InitOutcome::Succeeded);
        assert!(!h.service.is_running(h.project(), "feat/x"));

        let meta = h.metadata.read(h.project(), "feat/x").unwrap().unwrap();
        assert!(meta.init_script_ran);
        assert_eq!(meta.init_script_status, Some(InitScriptStatus::Success));
        assert_eq!(meta.created_at, created_at);
        assert_eq!(meta.pr.unwrap()["number"], 7);

        h.metadata
            .update(h.project(), "feat/x", |m| m.mark_init_running())
            .unwrap();
        assert_eq!(h.run().await, InitOutcome::Succeeded);

        let runs = std::fs::read_to_string(h.worktree.join("runs.txt")).unwrap();
        assert_eq!(runs.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_run_reports_in_progress() {
        let h = harness();
        h.service.set_script(h.project(), "sleep 30\n").unwrap();
        let cancel = CancellationToken::new();

        let first = h
            .service
            .run_if_needed(h.project(), "feat/x", &h.worktree, cancel.clone());
        let second = async {
            while !h.service.is_running(h.project(), "feat/x") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let forced = h
                .service
                .force_run(h.project(), "feat/x", &h.worktree, CancellationToken::new())
                .await
                .unwrap();
            let again = h
                .service
                .run_if_needed(h.project(), "feat/x", &h.worktree, CancellationToken::new())
                .await
                .unwrap();
            cancel.cancel();
            (forced, again)
        };

        let (first, (forced, again)) = tokio::time::timeout(
            Duration::from_secs(10),
            async { tokio::join!(first, second) },
        )
        .await
        .expect("cancellation should end the script");

        assert!(first.unwrap().is_failure());
        assert_eq!(forced, InitOutcome::InProgress);
        assert_eq!(again, InitOutcome::InProgress);
        assert!(!h.service.is_running(h.project(), "feat/x"));
    }

    #[tokio::test]
    async fn test_missing_shell_marks_failed() {
        let h = harness_with_shell(Arc::new(ShellResolver::with_candidates(
            ShellPlatform::Unix,
            vec![PathBuf::from("/nonexistent/bash")],
        )));
        h.service.set_script(h.project(), "echo hi\n").unwrap();

        match h.run().await {
            InitOutcome::Failed { error } => assert!(error.contains("No compatible shell")),
            other => panic!("expected failure, got {other:?}"),
        }
        let meta = h.metadata.read(h.project(), "feat/x").unwrap().unwrap();
        assert!(meta.init_script_ran);
        assert_eq!(meta.init_script_status, Some(InitScriptStatus::Failed));
    }

    #[tokio::test]
    async fn test_cancellation_kills_script() {
        let h = harness();
        h.service.set_script(h.project(), "sleep 30\n").unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            h.service
                .run_if_needed(h.project(), "feat/x", &h.worktree, cancel),
        )
        .await
        .expect("cancellation should end the script")
        .unwrap();

        assert_eq!(
            outcome,
            InitOutcome::Failed {
                error: "Init script cancelled".into()
            }
        );
    }

    #[test]
    fn test_script_crud() {
        let h = harness();
        assert_eq!(h.service.get_script(h.project()).unwrap(), None);
        h.service.set_script(h.project(), "npm ci\n").unwrap();
        assert_eq!(
            h.service.get_script(h.project()).unwrap().as_deref(),
            Some("npm ci\n")
        );
        assert!(h.service.delete_script(h.project()).unwrap());
        assert!(!h.service.delete_script(h.project()).unwrap());
    }
}
