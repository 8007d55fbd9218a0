use thiserror::Error;

/// Domain failures surfaced by the explorer core.
///
/// Operations return [`anyhow::Result`]; one of these variants sits at the root
/// of the error chain so callers can classify a failure with [`ErrorKind::of`].
#[derive(Debug, Error)]
pub enum ExplorerError {
    /// The adb executable or server could not be reached at all
    #[error("ADB is not available: {0}")]
    TransportUnavailable(String),
    /// A device command ran but reported failure
    #[error("Command `{command}` failed with exit code {code}: {message}")]
    CommandFailed { command: String, code: i32, message: String },
    /// A listing line did not match any known shape
    #[error("Unrecognized listing line: {0}")]
    ParseRejected(String),
    /// The request was rejected before reaching the transport
    #[error("{0}")]
    PreconditionUnmet(String),
    /// The device is missing, not authorized, or its session dropped
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
    /// Another task with the same identity has not finished yet
    #[error("Task '{0}' is already running")]
    TaskInFlight(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransportUnavailable,
    CommandFailed,
    ParseRejected,
    PreconditionUnmet,
    DeviceUnavailable,
    TaskInFlight,
    Other,
}

impl ErrorKind {
    /// Classifies an error by the first [`ExplorerError`] found in its chain
    pub fn of(error: &anyhow::Error) -> Self {
        error
            .downcast_ref::<ExplorerError>()
            .or_else(|| error.chain().find_map(|cause| cause.downcast_ref::<ExplorerError>()))
            .map_or(Self::Other, |e| match e {
                ExplorerError::TransportUnavailable(_) => Self::TransportUnavailable,
                ExplorerError::CommandFailed { .. } => Self::CommandFailed,
                ExplorerError::ParseRejected(_) => Self::ParseRejected,
                ExplorerError::PreconditionUnmet(_) => Self::PreconditionUnmet,
                ExplorerError::DeviceUnavailable(_) => Self::DeviceUnavailable,
                ExplorerError::TaskInFlight(_) => Self::TaskInFlight,
            })
    }
}

/// Shorthand for rejecting a request before any transport call
pub(crate) fn precondition(message: impl Into<String>) -> anyhow::Error {
    ExplorerError::PreconditionUnmet(message.into()).into()
}
