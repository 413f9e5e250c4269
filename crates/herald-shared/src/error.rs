//! Typed failures surfaced at the service boundary.
//!
//! Every manager operation returns one of these kinds; HTTP and CLI layers
//! map them onto their own status codes. Event ingest never produces them;
//! it logs and keeps going.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    /// The connection state machine is not in `Connected`; send-style
    /// operations are rejected until it is.
    #[error("service not ready (state: {state})")]
    NotReady { state: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("already authenticated")]
    AlreadyAuthenticated,

    /// Another process holds the data directory lock. Fatal at startup.
    #[error("data directory '{0}' is locked by another instance")]
    AlreadyRunning(String),

    /// Database failure. Fatal at startup, surfaced as a server error at
    /// runtime.
    #[error("storage error: {0}")]
    Storage(String),

    /// The upstream protocol rejected an operation. Never retried
    /// automatically except by the reconnect loop.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,
}

impl ServiceError {
    pub fn not_ready(state: impl Into<String>) -> Self {
        ServiceError::NotReady {
            state: state.into(),
        }
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ServiceError::InvalidInput(msg.into())
    }
}

impl From<crate::addr::AddrError> for ServiceError {
    fn from(err: crate::addr::AddrError) -> Self {
        ServiceError::InvalidInput(err.to_string())
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
