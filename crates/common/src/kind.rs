/// Stable classification of failures, preserved through stage wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InputInvalid,
    DaemonUnavailable,
    ImageUnavailable,
    ContainerLifecycle,
    NotReady,
    SessionClosed,
    ToolFailure,
    UnsupportedLayout,
    UnsupportedPrefix,
    VerificationMismatch,
    Cancelled,
    DeadlineExceeded,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InputInvalid => "input_invalid",
            Self::DaemonUnavailable => "daemon_unavailable",
            Self::ImageUnavailable => "image_unavailable",
            Self::ContainerLifecycle => "container_lifecycle",
            Self::NotReady => "not_ready",
            Self::SessionClosed => "session_closed",
            Self::ToolFailure => "tool_failure",
            Self::UnsupportedLayout => "unsupported_layout",
            Self::UnsupportedPrefix => "unsupported_prefix",
            Self::VerificationMismatch => "verification_mismatch",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<crate::Interrupt> for ErrorKind {
    fn from(interrupt: crate::Interrupt) -> Self {
        match interrupt {
            crate::Interrupt::Cancelled => Self::Cancelled,
            crate::Interrupt::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}
