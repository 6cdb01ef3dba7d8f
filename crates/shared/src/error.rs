use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Bad or missing identifiers in the request itself.
    Validation,
    /// A state-machine precondition refused the transition (duplicate
    /// pending, already friends, not friends, already resolved).
    PreconditionFailed,
    NotFound,
    /// Missing/invalid credential or handshake timeout.
    Unauthorized,
    /// Connection drop or timeout on the socket path.
    Transport,
    /// One of the two mirrored document saves failed after the other
    /// succeeded; the relationship is left detectably inconsistent for the
    /// consistency sweep.
    PartialWrite,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
