use thiserror::Error;

use herald_shared::ServiceError;

#[derive(Error, Debug, Clone)]
pub enum WaError {
    #[error("client is not connected")]
    NotConnected,

    #[error("client is not authenticated")]
    NotAuthenticated,

    #[error("pairing failed: {0}")]
    Pairing(String),

    #[error("upstream rejected the operation: {0}")]
    Rejected(String),

    #[error("media transfer failed: {0}")]
    Media(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,
}

impl From<WaError> for ServiceError {
    fn from(err: WaError) -> Self {
        match err {
            WaError::Cancelled => ServiceError::Cancelled,
            WaError::Timeout => ServiceError::Timeout,
            other => ServiceError::Protocol(other.to_string()),
        }
    }
}

pub type WaResult<T> = std::result::Result<T, WaError>;
