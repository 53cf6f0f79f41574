//! Error types for reconciliation.
//!
//! Errors are categorized to enable retry decisions and appropriate user
//! feedback. Each variant carries enough context to tell which command,
//! artifact or operation failed and why.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::checksum::ChecksumAlgorithm;
use crate::reconciler::Diagnostic;

/// Result type alias for wslkit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categories of errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network-related errors (transient, retryable).
    Network,
    /// A distribution could not be reached or started (transient, retryable).
    Unavailable,
    /// An external command failed or timed out.
    Command,
    /// Downloaded or local artifact failed integrity checks.
    Integrity,
    /// The desired-state specification is invalid.
    Spec,
    /// Current state could not be determined.
    Inspection,
    /// The operation was cancelled by the caller.
    Cancelled,
    /// Other/unknown errors.
    Other,
}

impl ErrorCategory {
    /// Whether this error category is typically transient and worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Unavailable)
    }

    /// Get a user-friendly description of this error category.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Network => "Network connectivity issue",
            Self::Unavailable => "Distribution unavailable",
            Self::Command => "Command failed",
            Self::Integrity => "Integrity check failed",
            Self::Spec => "Invalid specification",
            Self::Inspection => "State could not be determined",
            Self::Cancelled => "Cancelled",
            Self::Other => "Unexpected error",
        }
    }

    /// Get actionable advice for resolving this error category.
    #[must_use]
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Network => "Check your internet connection and try again",
            Self::Unavailable => "Check `wsl --list --verbose` and that the distribution can start",
            Self::Command => "Inspect the stderr excerpt; re-running is safe once the cause is fixed",
            Self::Integrity => "Verify the expected checksum and algorithm, or re-download the source",
            Self::Spec => "Fix the manifest entry and run again",
            Self::Inspection => "Make sure the target tools (stat, getent, systemctl...) exist in the distribution",
            Self::Cancelled => "Re-run to continue from the current state",
            Self::Other => "Check the error details for more information",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur while inspecting, planning or applying.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An external command exited with a code outside its allow-list.
    #[error("`{program}` exited with code {exit_code:?} on {target}: {stderr}")]
    Execution {
        /// Where the command ran.
        target: String,
        /// Program name.
        program: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Excerpt of standard error.
        stderr: String,
    },

    /// The command could not be started at all.
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        /// Program name.
        program: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// An external command ran past its timeout and was killed.
    #[error("`{program}` on {target} timed out after {timeout:?}")]
    ExecutionTimeout {
        /// Where the command ran.
        target: String,
        /// Program name.
        program: String,
        /// Timeout that expired.
        timeout: Duration,
    },

    /// Computed digest differs from the expected one.
    #[error("{algorithm} checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch {
        /// Artifact that was checked.
        path: PathBuf,
        /// Algorithm used.
        algorithm: ChecksumAlgorithm,
        /// Expected digest.
        expected: String,
        /// Actual digest.
        actual: String,
    },

    /// Target unreachable or its state could not be parsed.
    #[error("cannot inspect {entity}: {message}")]
    Inspection {
        /// Entity being inspected.
        entity: String,
        /// What went wrong.
        message: String,
    },

    /// A distribution could not be reached or started.
    #[error("distribution '{distribution}' is unavailable: {message}")]
    EnvironmentUnavailable {
        /// Distribution name.
        distribution: String,
        /// Details.
        message: String,
    },

    /// A planned operation failed mid-apply.
    #[error("operation '{operation}' failed after {} step(s): {source}", .diagnostics.len())]
    Reconciliation {
        /// Description of the failing operation.
        operation: String,
        /// Outcome of every attempted operation, failing one last.
        diagnostics: Vec<Diagnostic>,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// The desired-state specification is inconsistent.
    #[error("invalid specification: {0}")]
    InvalidSpec(String),

    /// Download of a remote artifact failed.
    #[error("download of {url} failed: {message}")]
    Download {
        /// Source URL.
        url: String,
        /// Error message.
        message: String,
        /// HTTP status code if available.
        status: Option<u16>,
    },

    /// Bundle extraction failed.
    #[error("cannot extract {}: {message}", .path.display())]
    Extraction {
        /// Bundle path.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// IO error during file operations.
    #[error("IO error at {}: {source}", .path.display())]
    Io {
        /// Path involved in the error.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The caller cancelled the reconciliation between operations.
    #[error("reconciliation cancelled after {} step(s)", .diagnostics.len())]
    Cancelled {
        /// Outcome of every operation applied before cancellation.
        diagnostics: Vec<Diagnostic>,
    },
}

impl Error {
    /// Create an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an inspection error.
    pub fn inspection(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Inspection {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Create a spec error.
    pub fn spec(message: impl Into<String>) -> Self {
        Self::InvalidSpec(message.into())
    }

    /// Get the error category for retry logic.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Execution { .. } | Error::Launch { .. } | Error::ExecutionTimeout { .. } => {
                ErrorCategory::Command
            }
            Error::ChecksumMismatch { .. } | Error::Extraction { .. } => ErrorCategory::Integrity,
            Error::Inspection { .. } => ErrorCategory::Inspection,
            Error::EnvironmentUnavailable { .. } => ErrorCategory::Unavailable,
            Error::Reconciliation { source, .. } => source.category(),
            Error::InvalidSpec(_) => ErrorCategory::Spec,
            Error::Download { status, .. } => match status {
                // Client errors will not fix themselves
                Some(code) if (400..500).contains(code) && *code != 429 => ErrorCategory::Other,
                _ => ErrorCategory::Network,
            },
            Error::Io { .. } => ErrorCategory::Other,
            Error::Cancelled { .. } => ErrorCategory::Cancelled,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    ///
    /// A failed apply is never retryable as a whole, even when its cause is:
    /// side effects may already exist.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Reconciliation { .. }) && self.category().is_retryable()
    }

    /// The innermost cause, unwrapping reconciliation failures.
    #[must_use]
    pub fn root(&self) -> &Error {
        match self {
            Error::Reconciliation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Diagnostics collected before the failure, if any.
    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            Error::Reconciliation { diagnostics, .. } | Error::Cancelled { diagnostics } => {
                diagnostics
            }
            _ => &[],
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(code) => Self::Download {
                url: String::new(),
                message: format!("HTTP {code}"),
                status: Some(code),
            },
            other => Self::Download {
                url: String::new(),
                message: other.to_string(),
                status: None,
            },
        }
    }
}
