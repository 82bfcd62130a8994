//! Locating a POSIX-compatible shell for running init scripts.
//!
//! The result is memoized per resolver; candidates are probed once.

use crate::error::{AutoModeError, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Program (plus leading arguments) that can run a script file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ShellCommand {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

/// Resolution seam used by the init-script runner.
pub trait ResolveShell: Send + Sync {
    /// # Errors
    ///
    /// Returns [`AutoModeError::ShellNotFound`] when no candidate works.
    fn resolve(&self) -> Result<ShellCommand>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellPlatform {
    Unix,
    Windows,
}

impl ShellPlatform {
    #[must_use]
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }

    /// Fixed locations probed for this platform, in preference order.
    #[must_use]
    pub fn default_candidates(self) -> Vec<PathBuf> {
        match self {
            Self::Unix => [
                "/bin/bash",
                "/usr/bin/bash",
                "/usr/local/bin/bash",
                "/opt/homebrew/bin/bash",
                "/bin/sh",
                "/usr/bin/sh",
            ]
            .into_iter()
            .map(PathBuf::from)
            .collect(),
            Self::Windows => {
                let mut candidates: Vec<PathBuf> = [
                    r"C:\Program Files\Git\bin\bash.exe",
                    r"C:\Program Files\Git\usr\bin\bash.exe",
                    r"C:\Program Files (x86)\Git\bin\bash.exe",
                ]
                .into_iter()
                .map(PathBuf::from)
                .collect();
                if let Some(local) = std::env::var_os("LOCALAPPDATA") {
                    candidates.push(
                        PathBuf::from(local)
                            .join("Programs")
                            .join("Git")
                            .join("bin")
                            .join("bash.exe"),
                    );
                }
                candidates
            }
        }
    }
}

/// `bash.exe` shims that launch WSL instead of a native shell.
#[must_use]
pub fn is_wsl_launcher(path: &Path) -> bool {
    let lowered = path.to_string_lossy().to_lowercase().replace('/', "\\");
    lowered.contains("\\windows\\system32\\") || lowered.contains("\\windowsapps\\")
}

#[derive(Debug, Clone)]
enum Resolution {
    Found(ShellCommand),
    NotFound(Vec<String>),
}

/// Finds a shell once and remembers the answer.
///
/// Unix prefers `bash` on `PATH`, then fixed bash locations, then `sh`.
/// Windows prefers Git Bash install locations, then `bash` on `PATH` unless
/// it is the WSL launcher, then `sh` on `PATH`.
#[derive(Debug)]
pub struct ShellResolver {
    platform: ShellPlatform,
    candidates: Vec<PathBuf>,
    search_path: bool,
    cache: OnceLock<Resolution>,
}

impl ShellResolver {
    #[must_use]
    pub fn for_current_platform() -> Self {
        let platform = ShellPlatform::current();
        Self {
            platform,
            candidates: platform.default_candidates(),
            search_path: true,
            cache: OnceLock::new(),
        }
    }

    /// Probe only `candidates`, never `PATH`.
    #[must_use]
    pub fn with_candidates(platform: ShellPlatform, candidates: Vec<PathBuf>) -> Self {
        Self {
            platform,
            candidates,
            search_path: false,
            cache: OnceLock::new(),
        }
    }

    fn lookup(&self, name: &str, searched: &mut Vec<String>) -> Option<PathBuf> {
        if !self.search_path {
            return None;
        }
        searched.push(format!("{name} (PATH)"));
        which::which(name).ok()
    }

    fn probe(candidates: &[PathBuf], searched: &mut Vec<String>) -> Option<PathBuf> {
        candidates.iter().find_map(|candidate| {
            searched.push(candidate.display().to_string());
            candidate.is_file().then(|| candidate.clone())
        })
    }

    fn search(&self) -> Resolution {
        let mut searched = Vec::new();
        let found = match self.platform {
            ShellPlatform::Unix => self
                .lookup("bash", &mut searched)
                .or_else(|| Self::probe(&self.candidates, &mut searched)),
            ShellPlatform::Windows => Self::probe(&self.candidates, &mut searched)
                .or_else(|| {
                    self.lookup("bash", &mut searched)
                        .filter(|path| !is_wsl_launcher(path))
                })
                .or_else(|| self.lookup("sh", &mut searched)),
        };

        match found {
            Some(program) => {
                debug!("Resolved shell: {}", program.display());
                Resolution::Found(ShellCommand::new(program))
            }
            None => Resolution::NotFound(searched),
        }
    }
}

impl ResolveShell for ShellResolver {
    fn resolve(&self) -> Result<ShellCommand> {
        match self.cache.get_or_init(|| self.search()) {
            Resolution::Found(command) => Ok(command.clone()),
            Resolution::NotFound(searched) => Err(AutoModeError::ShellNotFound {
                searched: searched.clone(),
            }),
        }
    }
}
