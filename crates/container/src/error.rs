//! Container runtime error types.

use {
    thiserror::Error,
    turingpi_common::{ErrorKind, FromMessage, Interrupt},
};

/// Why the container daemon could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonHint {
    /// No `docker` CLI on PATH and no reachable socket.
    NotInstalled,
    /// The CLI exists but the daemon does not answer.
    NotRunning,
    /// The CLI can reach a daemon that the API client cannot: the selected
    /// context or `DOCKER_HOST` points somewhere else.
    ContextMisconfigured,
}

impl std::fmt::Display for DaemonHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NotInstalled => "docker does not appear to be installed",
            Self::NotRunning => "the docker daemon is not running",
            Self::ContextMisconfigured => {
                "the docker CLI works but the configured context/DOCKER_HOST is unreachable"
            },
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid container spec: {0}")]
    InputInvalid(String),

    #[error("container daemon unavailable ({hint}): {message}")]
    DaemonUnavailable { hint: DaemonHint, message: String },

    #[error("image {image} unavailable: {message}")]
    ImageUnavailable { image: String, message: String },

    #[error("{operation} failed for container {container}: {message}")]
    Lifecycle {
        operation: &'static str,
        container: String,
        message: String,
    },

    #[error("container {container} is not running (state: {state})")]
    NotReady { container: String, state: String },

    #[error("session for container {container} is closed")]
    SessionClosed { container: String },

    #[error("`{command}` exited with {exit_code} in {container}: {}", tail(.stderr))]
    ExecFailed {
        container: String,
        command: String,
        exit_code: i64,
        stdout: String,
        stderr: String,
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
    pub fn lifecycle(
        operation: &'static str,
        container: impl Into<String>,
        err: impl std::fmt::Display,
    ) -> Self {
        Self::Lifecycle {
            operation,
            container: container.into(),
            message: err.to_string(),
        }
    }

    #[must_use]
    pub fn image_unavailable(image: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::ImageUnavailable {
            image: image.into(),
            message: err.to_string(),
        }
    }

    #[must_use]
    pub fn daemon(hint: DaemonHint, message: impl Into<String>) -> Self {
        Self::DaemonUnavailable {
            hint,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InputInvalid(_) => ErrorKind::InputInvalid,
            Self::DaemonUnavailable { .. } => ErrorKind::DaemonUnavailable,
            Self::ImageUnavailable { .. } => ErrorKind::ImageUnavailable,
            Self::Lifecycle { .. } => ErrorKind::ContainerLifecycle,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::SessionClosed { .. } => ErrorKind::SessionClosed,
            Self::ExecFailed { .. } => ErrorKind::ToolFailure,
            Self::Interrupted(i) => (*i).into(),
            Self::Io(_) | Self::Message(_) => ErrorKind::Internal,
        }
    }
}

/// Last few lines of a stream, enough to show the failing command's complaint.
#[must_use]
pub fn tail(text: &str) -> String {
    const LINES: usize = 8;
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(LINES);
    lines[start..].join("\n")
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Self::Message(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

turingpi_common::impl_context!();

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_lines() {
        let text = (1..=12).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let t = tail(&text);
        assert!(t.starts_with("line 5"));
        assert!(t.ends_with("line 12"));
    }

    #[test]
    fn exec_failure_maps_to_tool_failure() {
        let err = Error::ExecFailed {
            container: "c".into(),
            command: "kpartx -av /tmp/x.img".into(),
            exit_code: 1,
            stdout: String::new(),
            stderr: "device busy\n".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ToolFailure);
        assert!(err.to_string().contains("device busy"));
    }

    #[test]
    fn interrupt_kind_is_preserved() {
        let err: Error = Interrupt::DeadlineExceeded.into();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }
}
