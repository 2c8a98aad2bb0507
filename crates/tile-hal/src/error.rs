//! HAL transport error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HalError {
    #[error("no active hal connection")]
    NotConnected,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("command {0} timed out waiting for completion")]
    Timeout(String),

    #[error("correlation slot closed before completion")]
    Closed,
}

pub type HalResult<T> = Result<T, HalError>;
