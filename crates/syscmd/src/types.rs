//! Core types for the command boundary

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A command to run, with optional environment and timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name or path
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    /// Per-command timeout; `None` uses the executor default
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Create a new command.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    /// Set an environment variable for this command.
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.env
            .insert(key.as_ref().to_string(), value.as_ref().to_string());
        self
    }

    /// Override the timeout for this command.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The command line as a single display string.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push('\'');
                line.push_str(arg);
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Captured result of a command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal or timeout
    pub exit_code: Option<i32>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Set when the command was killed after its timeout
    pub timed_out: bool,
}

impl CommandOutput {
    /// A successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// A failed result with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Stdout trimmed of surrounding whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Stderr trimmed of surrounding whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// What a path points at, without following a final symlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file
    File,
    /// Directory
    Dir,
    /// Symbolic link
    Symlink,
}

/// Kind and permission bits of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// What the path is
    pub kind: FileKind,
    /// Permission bits (`0o777` mask)
    pub mode: u32,
}

/// A mutation intercepted in dry-run mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    /// A command that would have been run
    Run(String),
    /// A file that would have been written
    Write {
        /// Destination
        path: PathBuf,
        /// Size of the new content
        bytes: usize,
    },
    /// A file that would have been removed
    Remove(PathBuf),
    /// A directory that would have been created
    CreateDir(PathBuf),
    /// A rename that would have happened
    Rename {
        /// Source path
        from: PathBuf,
        /// Destination path
        to: PathBuf,
    },
    /// A symlink that would have been created
    Symlink {
        /// Where the link points
        target: PathBuf,
        /// The link itself
        link: PathBuf,
    },
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(cmd) => write!(f, "would run: {cmd}"),
            Self::Write { path, bytes } => {
                write!(f, "would write {} ({bytes} bytes)", path.display())
            }
            Self::Remove(path) => write!(f, "would remove {}", path.display()),
            Self::CreateDir(path) => write!(f, "would create directory {}", path.display()),
            Self::Rename { from, to } => {
                write!(f, "would move {} to {}", from.display(), to.display())
            }
            Self::Symlink { target, link } => {
                write!(f, "would link {} -> {}", link.display(), target.display())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_whitespace_args() {
        let spec = CommandSpec::new("sh").args(["-c", "echo hi"]);
        assert_eq!(spec.display(), "sh -c 'echo hi'");
    }

    #[test]
    fn test_output_success_requires_zero_and_no_timeout() {
        assert!(CommandOutput::ok("x").success());
        assert!(!CommandOutput::failed(1, "boom").success());
        let timed_out = CommandOutput {
            exit_code: Some(0),
            timed_out: true,
            ..Default::default()
        };
        assert!(!timed_out.success());
    }

    #[test]
    fn test_planned_action_display() {
        let action = PlannedAction::Write {
            path: PathBuf::from("/etc/docker/daemon.json"),
            bytes: 42,
        };
        assert_eq!(
            action.to_string(),
            "would write /etc/docker/daemon.json (42 bytes)"
        );
    }
}
