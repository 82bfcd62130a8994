//! Real implementations of the collaborator traits.
//!
//! These use actual git subprocesses, the configured agent CLI, and the local
//! file system. They implement the same traits as the mocks so the service
//! can be wired with either.

use crate::error::{AutoModeError, Result as AutoModeResult};
use crate::testing::{
    AgentMessage, AgentRequest, AgentRunner, AgentStream, GitClient, MergeOutcome,
    SecureFileStore, WorktreeEntry,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use fs2::FileExt;
use futures::StreamExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command as AsyncCommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

// =============================================================================
// Git
// =============================================================================

/// Git client that shells out to the `git` binary.
///
/// Arguments are always passed as argv, never through a shell.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit git binary.
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn output(&self, repo: &Path, args: &[&str]) -> Result<Output> {
        debug!(repo = %repo.display(), ?args, "git");
        AsyncCommand::new(&self.program)
            .args(args)
            .current_dir(repo)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    async fn checked(&self, repo: &Path, args: &[&str]) -> Result<String> {
        let output = self.output(repo, args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                combined_output(&output)
            )
        }
    }
}

/// stdout and stderr joined, trimmed, as git printed them.
fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut text = stdout.trim().to_string();
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr.trim());
    }
    text
}

/// Parse `git worktree list --porcelain` output.
#[must_use]
pub fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                bare: false,
            });
            continue;
        }

        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
            entry.branch = Some(short.to_string());
        } else if line == "bare" {
            entry.bare = true;
        }
    }

    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

#[async_trait]
impl GitClient for GitCli {
    async fn current_branch(&self, repo: &Path) -> Result<String> {
        self.checked(repo, &["symbolic-ref", "--short", "HEAD"])
            .await
            .context("Failed to determine current branch")
    }

    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        let output = self
            .output(repo, &["rev-parse", "--verify", "--quiet", &reference])
            .await?;
        Ok(output.status.success())
    }

    async fn worktree_list(&self, repo: &Path) -> Result<Vec<WorktreeEntry>> {
        let stdout = self
            .checked(repo, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_porcelain(&stdout))
    }

    #[instrument(skip(self, repo, path), fields(repo = %repo.display(), path = %path.display()))]
    async fn worktree_add(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: Option<&str>,
        create_branch: bool,
    ) -> Result<()> {
        let path_arg = path.to_string_lossy();
        let mut args = vec!["worktree", "add"];
        if create_branch {
            args.extend(["-b", branch, &*path_arg]);
            if let Some(base) = base {
                args.push(base);
            }
        } else {
            args.extend([&*path_arg, branch]);
        }
        self.checked(repo, &args).await.map(|_| ())
    }

    async fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.checked(repo, &["worktree", "remove", "--force", &path_arg])
            .await
            .map(|_| ())
    }

    async fn worktree_prune(&self, repo: &Path) -> Result<()> {
        self.checked(repo, &["worktree", "prune"]).await.map(|_| ())
    }

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        self.checked(repo, &["branch", "-D", branch]).await.map(|_| ())
    }

    #[instrument(skip(self, repo, message), fields(repo = %repo.display()))]
    async fn merge(
        &self,
        repo: &Path,
        branch: &str,
        squash: bool,
        message: &str,
    ) -> Result<MergeOutcome> {
        if !squash {
            let output = self
                .output(repo, &["merge", "--no-ff", "-m", message, branch])
                .await?;
            return Ok(if output.status.success() {
                MergeOutcome::Merged
            } else {
                MergeOutcome::Conflicted {
                    output: combined_output(&output),
                }
            });
        }

        let output = self.output(repo, &["merge", "--squash", branch]).await?;
        if !output.status.success() {
            return Ok(MergeOutcome::Conflicted {
                output: combined_output(&output),
            });
        }

        let commit = self.output(repo, &["commit", "-m", message]).await?;
        if commit.status.success() {
            return Ok(MergeOutcome::Merged);
        }
        let text = combined_output(&commit);
        if text.contains("nothing to commit") {
            Ok(MergeOutcome::Merged)
        } else {
            Ok(MergeOutcome::Conflicted { output: text })
        }
    }

    async fn merge_abort(&self, repo: &Path, squash: bool) -> Result<()> {
        // A squash merge never writes MERGE_HEAD, so `merge --abort` refuses it.
        let args: &[&str] = if squash {
            &["reset", "--merge"]
        } else {
            &["merge", "--abort"]
        };
        self.checked(repo, args).await.map(|_| ())
    }

    async fn has_tracked_changes(&self, repo: &Path) -> Result<bool> {
        let status = self
            .checked(repo, &["status", "--porcelain", "--untracked-files=no"])
            .await?;
        Ok(!status.is_empty())
    }

    async fn merge_in_progress(&self, repo: &Path) -> Result<bool> {
        let merge_head = self
            .output(repo, &["rev-parse", "--verify", "--quiet", "MERGE_HEAD"])
            .await?;
        if merge_head.status.success() {
            return Ok(true);
        }
        if !self.checked(repo, &["ls-files", "-u"]).await?.is_empty() {
            return Ok(true);
        }
        // A squash merge stages its result without MERGE_HEAD.
        let staged = self
            .output(repo, &["diff", "--cached", "--quiet"])
            .await?;
        Ok(!staged.status.success())
    }

    async fn commit_all(&self, worktree: &Path, message: &str) -> Result<bool> {
        self.checked(worktree, &["add", "-A"]).await?;
        let staged = self
            .output(worktree, &["diff", "--cached", "--quiet"])
            .await?;
        if staged.status.success() {
            return Ok(false);
        }
        self.checked(worktree, &["commit", "-m", message]).await?;
        Ok(true)
    }
}

// =============================================================================
// Agent
// =============================================================================

/// Runs the agent CLI once per request and parses its `stream-json` output.
#[derive(Debug, Clone)]
pub struct CommandAgentRunner {
    command: Vec<String>,
}

impl CommandAgentRunner {
    #[must_use]
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

/// Translate one line of agent `stream-json` output into messages.
///
/// Lines that are not JSON are passed through as text.
#[must_use]
pub fn parse_stream_json_line(line: &str) -> Vec<AgentMessage> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return vec![AgentMessage::Text(line.to_string())];
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("assistant") => value
            .pointer("/message/content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| match block.get("type").and_then(|t| t.as_str()) {
                        Some("text") => block
                            .get("text")
                            .and_then(|t| t.as_str())
                            .map(|t| AgentMessage::Text(t.to_string())),
                        Some("tool_use") => Some(AgentMessage::ToolUse {
                            name: block
                                .get("name")
                                .and_then(|n| n.as_str())
                                .unwrap_or("unknown")
                                .to_string(),
                            input: block.get("input").cloned().unwrap_or_default(),
                        }),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        Some("result") => {
            let is_error = value
                .get("is_error")
                .and_then(|e| e.as_bool())
                .unwrap_or(false);
            let subtype = value.get("subtype").and_then(|s| s.as_str());
            let success = !is_error && subtype.is_none_or(|s| s == "success");
            let summary = value
                .get("result")
                .and_then(|r| r.as_str())
                .or(subtype)
                .unwrap_or_default()
                .to_string();
            vec![AgentMessage::Result { success, summary }]
        }
        _ => Vec::new(),
    }
}

const STDERR_TAIL_BYTES: usize = 4096;

async fn pump_agent_output(
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    tx: mpsc::Sender<AgentMessage>,
    cancel: CancellationToken,
) {
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut stderr = stderr;
        let _ = stderr.read_to_end(&mut buf).await;
        let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
        String::from_utf8_lossy(&buf[start..]).trim().to_string()
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut saw_result = false;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = child.start_kill();
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    for message in parse_stream_json_line(&line) {
                        saw_result |= matches!(message, AgentMessage::Result { .. });
                        if tx.send(message).await.is_err() {
                            let _ = child.start_kill();
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read agent output: {}", e);
                    break;
                }
            }
        }
    }

    let status = child.wait().await;
    let stderr = stderr_task.await.unwrap_or_default();
    if saw_result {
        return;
    }

    let (success, summary) = match status {
        Ok(status) if status.success() => (true, "Agent finished".to_string()),
        Ok(status) => (false, format!("Agent exited with {status}: {stderr}")),
        Err(e) => (false, format!("Failed to wait for agent: {e}")),
    };
    let _ = tx.send(AgentMessage::Result { success, summary }).await;
}

#[async_trait]
impl AgentRunner for CommandAgentRunner {
    #[instrument(skip_all, fields(feature = %request.feature_id, phase = %request.phase))]
    async fn run(&self, request: AgentRequest, cancel: CancellationToken) -> Result<AgentStream> {
        let (program, args) = self
            .command
            .split_first()
            .context("Agent command is empty")?;

        let mut command = AsyncCommand::new(program);
        command.args(args);
        if !request.allowed_tools.is_empty() {
            command
                .arg("--allowedTools")
                .arg(request.allowed_tools.join(","));
        }

        let mut child = command
            .current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start agent '{program}'"))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.prompt.as_bytes()).await?;
            stdin.flush().await?;
            drop(stdin);
        }

        let stdout = child.stdout.take().context("Agent stdout not captured")?;
        let stderr = child.stderr.take().context("Agent stderr not captured")?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_agent_output(child, stdout, stderr, tx, cancel));

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })
        .boxed())
    }
}

// =============================================================================
// File store
// =============================================================================

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent writers.
const LOCK_SUFFIX: &str = ".lock";

/// File store confined to a set of root directories.
#[derive(Debug, Clone)]
pub struct ScopedFileStore {
    roots: Vec<PathBuf>,
}

/// Resolve `.` and `..` without touching the file system.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

impl ScopedFileStore {
    #[must_use]
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            roots: roots
                .into_iter()
                .map(|root| normalize(root.as_ref()))
                .collect(),
        }
    }

    /// Normalized `path` if it lies under one of the roots.
    pub fn check(&self, path: &Path) -> AutoModeResult<PathBuf> {
        let normalized = normalize(path);
        if path.is_absolute() && self.roots.iter().any(|root| normalized.starts_with(root)) {
            Ok(normalized)
        } else {
            Err(AutoModeError::SecurityViolation {
                path: path.to_path_buf(),
            })
        }
    }
}

impl SecureFileStore for ScopedFileStore {
    fn read_to_string(&self, path: &Path) -> AutoModeResult<String> {
        let path = self.check(path)?;
        Ok(fs::read_to_string(path)?)
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> AutoModeResult<()> {
        let path = self.check(path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = File::create(sibling(&path, LOCK_SUFFIX))?;
        FileExt::lock_exclusive(&lock_file).map_err(|e| {
            AutoModeError::Other(anyhow::anyhow!(
                "Failed to lock {}: {e}",
                path.display()
            ))
        })?;

        let tmp_path = sibling(&path, TMP_SUFFIX);
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(contents)?;
        tmp_file.sync_all()?;
        fs::rename(&tmp_path, &path)?;

        let _ = FileExt::unlock(&lock_file);
        Ok(())
    }

    fn append(&self, path: &Path, contents: &str) -> AutoModeResult<()> {
        let path = self.check(path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> AutoModeResult<()> {
        let path = self.check(path)?;
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> AutoModeResult<()> {
        let path = self.check(path)?;
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.check(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn list_dir(&self, path: &Path) -> AutoModeResult<Vec<PathBuf>> {
        let path = self.check(path)?;
        if !path.is_dir() {
            return Ok(Vec::new());
        }
        let mut children = fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        children.sort();
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // =========================================================================
    // Porcelain parsing
    // =========================================================================

    #[test]
    fn test_parse_worktree_porcelain() {
        let output = "worktree /repo\nHEAD 1111\nbranch refs/heads/main\n\n\
                      worktree /repo/.worktrees/feat-x\nHEAD 2222\nbranch refs/heads/feat/x\n\n\
                      worktree /tmp/detached\nHEAD 3333\ndetached\n";
        let entries = parse_worktree_porcelain(output);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, PathBuf::from("/repo"));
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].branch.as_deref(), Some("feat/x"));
        assert_eq!(entries[1].head.as_deref(), Some("2222"));
        assert_eq!(entries[2].branch, None);
    }

    #[test]
    fn test_parse_worktree_porcelain_bare() {
        let entries = parse_worktree_porcelain("worktree /srv/repo.git\nbare\n");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].bare);
    }

    // =========================================================================
    // Stream JSON parsing
    // =========================================================================

    #[test]
    fn test_parse_assistant_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"Reading the file"},
            {"type":"tool_use","name":"Read","input":{"file_path":"src/lib.rs"}}
        ]}}"#
            .replace('\n', "");
        let messages = parse_stream_json_line(&line);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], AgentMessage::Text("Reading the file".into()));
        match &messages[1] {
            AgentMessage::ToolUse { name, input } => {
                assert_eq!(name, "Read");
                assert_eq!(input["file_path"], "src/lib.rs");
            }
            other => panic!("expected tool use, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_result_line() {
        let ok = parse_stream_json_line(
            r#"{"type":"result","subtype":"success","is_error":false,"result":"All tests pass"}"#,
        );
        assert_eq!(
            ok,
            vec![AgentMessage::Result {
                success: true,
                summary: "All tests pass".into()
            }]
        );

        let failed =
            parse_stream_json_line(r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#);
        assert_eq!(
            failed,
            vec![AgentMessage::Result {
                success: false,
                summary: "error_max_turns".into()
            }]
        );
    }

    #[test]
    fn test_parse_plain_text_and_noise() {
        assert_eq!(
            parse_stream_json_line("not json at all"),
            vec![AgentMessage::Text("not json at all".into())]
        );
        assert!(parse_stream_json_line("   ").is_empty());
        assert!(parse_stream_json_line(r#"{"type":"system","subtype":"init"}"#).is_empty());
    }

    // =========================================================================
    // Scoped file store
    // =========================================================================

    #[test]
    fn test_scoped_store_rejects_escape() {
        let temp = TempDir::new().unwrap();
        let store = ScopedFileStore::new([temp.path()]);

        let escape = temp.path().join("..").join("outside.txt");
        match store.write_atomic(&escape, b"x") {
            Err(AutoModeError::SecurityViolation { path }) => assert_eq!(path, escape),
            other => panic!("expected security violation, got {other:?}"),
        }
        assert!(matches!(
            store.read_to_string(Path::new("relative.txt")),
            Err(AutoModeError::SecurityViolation { .. })
        ));
        assert!(!store.exists(Path::new("/etc/passwd")));
    }

    #[test]
    fn test_scoped_store_atomic_write_leaves_no_tmp() {
        let temp = TempDir::new().unwrap();
        let store = ScopedFileStore::new([temp.path()]);
        let target = temp.path().join("a").join("b").join("record.json");

        store.write_atomic(&target, b"{\"v\":1}").unwrap();
        store.write_atomic(&target, b"{\"v\":2}").unwrap();

        assert_eq!(store.read_to_string(&target).unwrap(), "{\"v\":2}");
        assert!(!sibling(&target, TMP_SUFFIX).exists());
    }

    #[test]
    fn test_scoped_store_append_and_remove() {
        let temp = TempDir::new().unwrap();
        let store = ScopedFileStore::new([temp.path()]);
        let dir = temp.path().join("feature-1");
        let log = dir.join("agent-output.md");

        store.append(&log, "one\n").unwrap();
        store.append(&log, "two\n").unwrap();
        assert_eq!(store.read_to_string(&log).unwrap(), "one\ntwo\n");

        store.remove(&dir).unwrap();
        assert!(!store.exists(&dir));
        store.remove(&dir).unwrap();
    }

    #[test]
    fn test_scoped_store_list_dir_missing_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = ScopedFileStore::new([temp.path()]);
        assert!(store.list_dir(&temp.path().join("nope")).unwrap().is_empty());
    }

    // =========================================================================
    // Git (skipped when git is unavailable)
    // =========================================================================

    async fn init_repo() -> Option<TempDir> {
        which::which("git").ok()?;
        let temp = TempDir::new().ok()?;
        let git = GitCli::new();
        let repo = temp.path();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
            vec!["config", "commit.gpgsign", "false"],
        ] {
            git.checked(repo, &args).await.ok()?;
        }
        fs::write(repo.join("README.md"), "hello\n").ok()?;
        fs::write(repo.join(".gitignore"), ".worktrees/\n").ok()?;
        git.checked(repo, &["add", "-A"]).await.ok()?;
        git.checked(repo, &["commit", "-m", "init"]).await.ok()?;
        Some(temp)
    }

    #[tokio::test]
    async fn test_git_worktree_lifecycle() {
        let Some(temp) = init_repo().await else {
            return;
        };
        let git = GitCli::new();
        let repo = temp.path();
        let wt = repo.join(".worktrees").join("feat-x");

        assert_eq!(git.current_branch(repo).await.unwrap(), "main");
        assert!(!git.branch_exists(repo, "feat/x").await.unwrap());

        git.worktree_add(repo, &wt, "feat/x", None, true).await.unwrap();
        assert!(git.branch_exists(repo, "feat/x").await.unwrap());
        let list = git.worktree_list(repo).await.unwrap();
        assert!(list.iter().any(|e| e.branch.as_deref() == Some("feat/x")));

        fs::write(wt.join("new.txt"), "change\n").unwrap();
        assert!(git.commit_all(&wt, "add new file").await.unwrap());
        assert!(!git.commit_all(&wt, "nothing").await.unwrap());

        let outcome = git.merge(repo, "feat/x", false, "Merge feat/x").await.unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(repo.join("new.txt").exists());

        git.worktree_remove(repo, &wt).await.unwrap();
        git.delete_branch(repo, "feat/x").await.unwrap();
        assert!(!git.branch_exists(repo, "feat/x").await.unwrap());
    }

    #[tokio::test]
    async fn test_git_merge_conflict_reports_output() {
        let Some(temp) = init_repo().await else {
            return;
        };
        let git = GitCli::new();
        let repo = temp.path();
        let wt = repo.join(".worktrees").join("conflict");

        git.worktree_add(repo, &wt, "conflict", None, true).await.unwrap();
        fs::write(wt.join("README.md"), "branch side\n").unwrap();
        git.commit_all(&wt, "branch edit").await.unwrap();
        fs::write(repo.join("README.md"), "main side\n").unwrap();
        git.commit_all(repo, "main edit").await.unwrap();

        match git.merge(repo, "conflict", false, "Merge").await.unwrap() {
            MergeOutcome::Conflicted { output } => assert!(output.contains("CONFLICT")),
            MergeOutcome::Merged => panic!("expected a conflict"),
        }
        git.merge_abort(repo, false).await.unwrap();
        assert_eq!(fs::read_to_string(repo.join("README.md")).unwrap(), "main side\n");
    }

    #[tokio::test]
    async fn test_git_tracked_changes_ignore_untracked_files() {
        let Some(temp) = init_repo().await else {
            return;
        };
        let git = GitCli::new();
        let repo = temp.path();

        assert!(!git.has_tracked_changes(repo).await.unwrap());
        fs::write(repo.join("scratch.txt"), "untracked\n").unwrap();
        assert!(!git.has_tracked_changes(repo).await.unwrap());

        fs::write(repo.join("README.md"), "edited\n").unwrap();
        assert!(git.has_tracked_changes(repo).await.unwrap());
        git.checked(repo, &["add", "README.md"]).await.unwrap();
        assert!(git.has_tracked_changes(repo).await.unwrap());
    }

    #[tokio::test]
    async fn test_git_merge_state_only_after_a_real_merge() {
        let Some(temp) = init_repo().await else {
            return;
        };
        let git = GitCli::new();
        let repo = temp.path();
        let wt = repo.join(".worktrees").join("squash");
        git.worktree_add(repo, &wt, "squash", None, true).await.unwrap();
        assert!(!git.merge_in_progress(repo).await.unwrap());

        // An untracked file in the way makes git refuse before touching anything.
        fs::write(wt.join("blocker.txt"), "branch\n").unwrap();
        git.commit_all(&wt, "add blocker").await.unwrap();
        fs::write(repo.join("blocker.txt"), "mine\n").unwrap();
        match git.merge(repo, "squash", true, "Squash").await.unwrap() {
            MergeOutcome::Conflicted { output } => assert!(output.contains("blocker.txt")),
            MergeOutcome::Merged => panic!("expected git to refuse"),
        }
        assert!(!git.merge_in_progress(repo).await.unwrap());
        assert_eq!(fs::read_to_string(repo.join("blocker.txt")).unwrap(), "mine\n");
        fs::remove_file(repo.join("blocker.txt")).unwrap();

        fs::write(wt.join("README.md"), "branch side\n").unwrap();
        git.commit_all(&wt, "branch edit").await.unwrap();
        fs::write(repo.join("README.md"), "main side\n").unwrap();
        git.commit_all(repo, "main edit").await.unwrap();
        match git.merge(repo, "squash", true, "Squash").await.unwrap() {
            MergeOutcome::Conflicted { output } => assert!(output.contains("CONFLICT")),
            MergeOutcome::Merged => panic!("expected a conflict"),
        }
        assert!(git.merge_in_progress(repo).await.unwrap());
        git.merge_abort(repo, true).await.unwrap();
        assert!(!git.merge_in_progress(repo).await.unwrap());
        assert_eq!(fs::read_to_string(repo.join("README.md")).unwrap(), "main side\n");
    }
}
