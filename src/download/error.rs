use crate::model::ErrorKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("HTTP {status}: {reason}")]
    HttpStatus { status: u16, reason: String },

    #[error("Body ended after {received} of {expected} bytes")]
    ShortBody { expected: u64, received: u64 },

    #[error("Transfer exceeded deadline of {0:?}")]
    Timeout(Duration),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("rsync failed: {0}")]
    Process(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::RequestFailed(_)
            | TransferError::HttpStatus { .. }
            | TransferError::ShortBody { .. } => ErrorKind::NetworkError,
            TransferError::Timeout(_) => ErrorKind::Timeout,
            TransferError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            TransferError::Process(_) => ErrorKind::ProcessError,
            TransferError::InvalidTarget(_) => ErrorKind::ConfigError,
            TransferError::Io(_) => ErrorKind::IoError,
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            // reqwest's own timeouts are connect/read stalls, not the job deadline
            TransferError::RequestFailed(format!("timed out: {e}"))
        } else if e.is_redirect() {
            TransferError::RequestFailed(format!("too many redirects: {e}"))
        } else {
            TransferError::RequestFailed(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
