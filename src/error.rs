use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// A subprocess that exited non-zero (or was killed by a signal).
#[derive(Debug, Error)]
pub struct CommandFailed {
    pub command: String,
    pub log_file: PathBuf,
    /// Exit code, or `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    /// Trailing lines of the captured output.
    pub tail: Vec<String>,
}

impl fmt::Display for CommandFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "'{}' failed with status {}", self.command, code)?,
            None => write!(f, "'{}' was terminated by a signal", self.command)?,
        }
        write!(f, "\n  see {} for details", self.log_file.display())?;
        if !self.tail.is_empty() {
            write!(f, "\n  last {} lines are:", self.tail.len())?;
            for line in &self.tail {
                write!(f, "\n    {}", line)?;
            }
        }
        Ok(())
    }
}

/// The step of package processing an error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Import,
    Patch,
    Status,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Import => "import",
            Phase::Patch => "patch",
            Phase::Status => "status",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    /// The working copy or its configuration is structurally wrong. Never retried.
    #[error("{0}")]
    Config(String),

    /// A subcommand exited non-zero.
    #[error(transparent)]
    Command(#[from] CommandFailed),

    /// A deliberate stop that requires manual intervention (diverged
    /// histories, non-fast-forward pinning).
    #[error("{0}")]
    Refused(String),

    /// The operation could not complete (unknown revision, missing merge-base).
    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A failure attributed to one package.
#[derive(Debug, Error)]
#[error("{package} ({}) failed during {phase}: {kind}", .dir.display())]
pub struct PackageError {
    pub package: String,
    pub dir: PathBuf,
    pub phase: Phase,
    #[source]
    pub kind: ErrorKind,
}

impl PackageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Command(_))
    }

    pub fn is_config(&self) -> bool {
        matches!(self.kind, ErrorKind::Config(_))
    }

    pub fn is_refusal(&self) -> bool {
        matches!(self.kind, ErrorKind::Refused(_))
    }
}
