//! Error types for command execution.
//!
//! Errors are categorized so callers can give actionable feedback. A timeout
//! is reported as an external command failure with `timed_out` set, never as
//! a separate kind of error, so fail-fast handling treats both the same way.

use std::path::PathBuf;
use thiserror::Error;

/// Categories of command errors for user feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The command ran longer than its timeout and was killed
    Timeout,
    /// The program is not installed or not on `$PATH`
    NotFound,
    /// Permission denied (usually: not running as root)
    Permission,
    /// The command ran and exited non-zero
    Failed,
    /// Filesystem or other I/O problem
    Io,
}

impl ErrorCategory {
    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Timeout => "Command timed out",
            Self::NotFound => "Program not found",
            Self::Permission => "Permission denied",
            Self::Failed => "Command failed",
            Self::Io => "I/O error",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Timeout => {
                "Check network connectivity and mirrors, or raise command_timeout_secs"
            }
            Self::NotFound => "Install the missing program or check $PATH",
            Self::Permission => "Run gpuhost with sudo",
            Self::Failed => "Check the command's stderr above; the step is safe to re-run",
            Self::Io => "Check disk space and permissions on the target path",
        }
    }
}

/// Errors raised at the command boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// An external command exited non-zero or timed out
    #[error("{}", external_message(.command, *.exit_code, .stderr, *.timed_out))]
    ExternalCommand {
        /// The full command line, as logged
        command: String,
        /// Exit code, or `None` if killed by a signal or timeout
        exit_code: Option<i32>,
        /// Captured standard error (trimmed)
        stderr: String,
        /// Whether the command was killed for exceeding its timeout
        timed_out: bool,
    },

    /// The program could not be started at all
    #[error("failed to start '{program}': {source}")]
    Spawn {
        /// Program name
        program: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// A file operation on the host failed
    #[error("{action} {}: {source}", .path.display())]
    File {
        /// What was being done ("write", "remove", ...)
        action: &'static str,
        /// Target path
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Command output could not be interpreted
    #[error("unexpected output from '{command}': {message}")]
    Parse {
        /// The command that produced the output
        command: String,
        /// What was wrong with it
        message: String,
    },
}

fn external_message(command: &str, exit_code: Option<i32>, stderr: &str, timed_out: bool) -> String {
    let mut msg = if timed_out {
        format!("'{command}' timed out")
    } else {
        match exit_code {
            Some(code) => format!("'{command}' exited with status {code}"),
            None => format!("'{command}' was terminated by a signal"),
        }
    };
    if !stderr.is_empty() {
        msg.push_str(": ");
        msg.push_str(stderr);
    }
    msg
}

impl Error {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ExternalCommand { timed_out: true, .. } => ErrorCategory::Timeout,
            Self::ExternalCommand { stderr, .. } => {
                let lower = stderr.to_lowercase();
                if lower.contains("permission denied")
                    || lower.contains("are you root")
                    || lower.contains("operation not permitted")
                {
                    ErrorCategory::Permission
                } else {
                    ErrorCategory::Failed
                }
            }
            Self::Spawn { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => ErrorCategory::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCategory::Permission,
                _ => ErrorCategory::Io,
            },
            Self::File { source, .. } => match source.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorCategory::Permission,
                _ => ErrorCategory::Io,
            },
            Self::Parse { .. } => ErrorCategory::Failed,
        }
    }

    /// Whether this error is a command timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ExternalCommand { timed_out: true, .. })
    }

    /// Exit code of a failed external command, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ExternalCommand { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

/// Result type for command operations.
pub type Result<T> = std::result::Result<T, Error>;
