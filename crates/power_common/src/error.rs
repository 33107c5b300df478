//! Error taxonomy shared by the daemon and its collaborators.

use crate::operation::Operation;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Why an operation could not start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum BusyReason {
    #[error("{0} is already in progress")]
    LeaseHeld(Operation),

    #[error("a process matching '{0}' is already running")]
    ExternallyRunning(String),

    #[error("a live update was already attempted since the controller started")]
    LiveUpdateAlreadyAttempted,

    #[error("a system update is already in progress")]
    UpdateInProgress,

    #[error("a boot action is already staged for the next boot")]
    BootActionPending,
}

/// Errors from power_common and the daemon's operations
#[derive(Debug, Error)]
pub enum PowerError {
    #[error("settings unavailable: {0}")]
    ConfigUnavailable(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("probe timed out after {0}ms")]
    ProbeTimeout(u64),

    #[error("busy: {0}")]
    Busy(#[from] BusyReason),

    #[error("fetch failed: {0}")]
    FetchFailure(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("command `{program}` failed: {message}")]
    Command { program: String, message: String },
}

impl PowerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PowerError>;
