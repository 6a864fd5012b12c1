use serde::Serialize;
use std::io;
use thiserror::Error;

use crate::parsers::ParseError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(String),

    /// Required executable could not be found. The affected TestRun is
    /// marked Failed; the session keeps going.
    #[error("tool unavailable: {0}")]
    ToolUnavailable(String),

    /// The child process exceeded its allotted duration and was killed.
    #[error("tool timed out after {0}s: {1}")]
    ToolTimeout(u64, String),

    /// Cooperative cancellation fired while the child was running.
    #[error("cancelled")]
    Cancelled,

    #[error("parse error: {0}")]
    Parse(String),

    /// Expected, non-exceptional outcome: the run is Skipped, not Failed.
    #[error("insufficient privilege: {0}")]
    PrivilegeInsufficient(String),

    /// Rejected before scheduling, surfaced synchronously to the caller.
    #[error("precondition violation: {0}")]
    PreconditionViolation(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("JSON error: {0}")]
    JsonError(String),

    #[error("system error: {0}")]
    SystemError(String),
}

impl EngineError {
    pub fn io(err: io::Error) -> Self {
        EngineError::Io(err.to_string())
    }

    /// Whether this error maps to a Skipped rather than Failed TestRun.
    pub fn is_skip(&self) -> bool {
        matches!(self, EngineError::PrivilegeInsufficient(_))
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::io(err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::JsonError(err.to_string())
    }
}

impl From<ParseError> for EngineError {
    fn from(err: ParseError) -> Self {
        EngineError::Parse(err.to_string())
    }
}
