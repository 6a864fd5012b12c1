//! Result parsers: pure functions from raw tool text to normalized
//! records. A `ParseError` marks the owning TestRun Failed with the
//! diagnostic retained; it never aborts the session.

pub mod capacity;
pub mod defects;
pub mod smart;
pub mod speed;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ParseError {
    #[error("empty tool output")]
    Empty,

    #[error("unrecognized output format: {0}")]
    Unrecognized(String),

    /// Output started in the expected grammar but broke off or degraded,
    /// typically a tool crash mid-write.
    #[error("malformed output near: {0}")]
    Malformed(String),
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;
