use {
    thiserror::Error,
    turingpi_common::{ErrorKind, FromMessage, Interrupt},
};

const TAIL_LINES: usize = 8;

/// Last few lines of remote output, enough to explain a failure.
#[must_use]
pub fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    lines[start..].join("\n")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// The transport itself failed: no connection, authentication refused,
    /// session dropped. Worth retrying.
    #[error("{target}: transport failed: {message}")]
    Transport { target: String, message: String },

    /// The remote command ran and exited non-zero.
    #[error("`{command}` exited with {exit_code}: {stderr_tail}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr_tail: String,
    },

    #[error("timed out waiting for {expected:?}; last output: {output_tail}")]
    ExpectTimeout {
        expected: String,
        output_tail: String,
    },

    #[error("unexpected output from `{command}`: {detail}")]
    Parse { command: String, detail: String },

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
    pub fn transport(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            target: target.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn command_failed(command: impl Into<String>, exit_code: i32, stderr: &str) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stderr_tail: tail(stderr),
        }
    }

    #[must_use]
    pub fn parse(command: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Parse {
            command: command.into(),
            detail: detail.into(),
        }
    }

    /// Whether another attempt could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Io(_)
                | Self::ExpectTimeout { .. }
                | Self::Interrupted(Interrupt::DeadlineExceeded)
        )
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InputInvalid(_) => ErrorKind::InputInvalid,
            Self::CommandFailed { .. } | Self::Parse { .. } => ErrorKind::ToolFailure,
            Self::Transport { .. } => ErrorKind::NotReady,
            Self::ExpectTimeout { .. } => ErrorKind::DeadlineExceeded,
            Self::Interrupted(interrupt) => (*interrupt).into(),
            Self::Io(_) | Self::Message(_) => ErrorKind::Internal,
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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_lines() {
        let text = (1..=12).map(|n| format!("l{n}")).collect::<Vec<_>>().join("\n");
        let kept = tail(&text);
        assert!(kept.starts_with("l5"));
        assert!(kept.ends_with("l12"));
    }

    #[test]
    fn transient_classification() {
        assert!(Error::transport("bmc", "connection refused").is_transient());
        assert!(Error::Interrupted(Interrupt::DeadlineExceeded).is_transient());
        assert!(!Error::Interrupted(Interrupt::Cancelled).is_transient());
        assert!(!Error::command_failed("tpi power on -n 1", 1, "bad node").is_transient());
        assert!(!Error::invalid("node 7").is_transient());
    }

    #[test]
    fn kinds() {
        assert_eq!(
            Error::command_failed("tpi reboot", 2, "").kind(),
            ErrorKind::ToolFailure
        );
        assert_eq!(
            Error::Interrupted(Interrupt::Cancelled).kind(),
            ErrorKind::Cancelled
        );
    }
}
