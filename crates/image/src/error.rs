//! Image preparation error types.

use std::path::PathBuf;

use {
    thiserror::Error,
    turingpi_common::{ErrorKind, FromMessage, Interrupt},
};

use crate::pipeline::Stage;

/// A resource that could not be released while unwinding a failed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFailure {
    pub resource: String,
    pub message: String,
}

impl std::fmt::Display for ReleaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.resource, self.message)
    }
}

fn release_suffix(failures: &[ReleaseFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let joined = failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!(" (release also failed: {joined})")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error(transparent)]
    Container(#[from] turingpi_container::Error),

    #[error("{tool} exited with {exit_code}: {stderr_tail}")]
    ToolFailure {
        tool: String,
        exit_code: i64,
        stderr_tail: String,
    },

    #[error("unsupported partition layout: expected at least 2 partitions, found {found}")]
    UnsupportedLayout { found: usize },

    #[error("unsupported prefix length /{0}: only /8, /16 and /24 are supported")]
    UnsupportedPrefix(u8),

    #[error("verification mismatch at {}: expected {expected}, found {actual}", path.display())]
    VerificationMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("mutation #{index} ({kind}) failed: {source}")]
    Mutation {
        index: usize,
        kind: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("{stage} failed: {source}{}", release_suffix(.release_failures))]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
        release_failures: Vec<ReleaseFailure>,
    },

    #[error(transparent)]
    Interrupted(#[from] Interrupt),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

impl Error {
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InputInvalid(message.into())
    }

    #[must_use]
    pub fn tool(tool: impl Into<String>, exit_code: i64, stderr: &str) -> Self {
        Self::ToolFailure {
            tool: tool.into(),
            exit_code,
            stderr_tail: turingpi_container::error::tail(stderr),
        }
    }

    #[must_use]
    pub fn at_stage(self, stage: Stage) -> Self {
        Self::Stage {
            stage,
            source: Box::new(self),
            release_failures: Vec::new(),
        }
    }

    /// Root classification, looking through stage and mutation wrappers.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InputInvalid(_) => ErrorKind::InputInvalid,
            Self::Container(e) => e.kind(),
            Self::ToolFailure { .. } => ErrorKind::ToolFailure,
            Self::UnsupportedLayout { .. } => ErrorKind::UnsupportedLayout,
            Self::UnsupportedPrefix(_) => ErrorKind::UnsupportedPrefix,
            Self::VerificationMismatch { .. } => ErrorKind::VerificationMismatch,
            Self::Mutation { source, .. } | Self::Stage { source, .. } => source.kind(),
            Self::Interrupted(i) => (*i).into(),
            Self::Io(_) | Self::Message(_) => ErrorKind::Internal,
        }
    }

    /// Stage the failure was attributed to, if wrapped.
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    #[must_use]
    pub fn release_failures(&self) -> &[ReleaseFailure] {
        match self {
            Self::Stage {
                release_failures, ..
            } => release_failures,
            _ => &[],
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

turingpi_common::impl_context!();
