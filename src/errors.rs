use thiserror::Error;
use crate::types::UploadId;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("HTTP Request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server error: status code {status_code}, message: {message}")]
    Server {
        status_code: u16,
        message: String,
    },

    #[error("Chunk {chunk_index} failed after {attempts} attempts: {message}")]
    TransferExhausted {
        chunk_index: u64,
        attempts: u32,
        message: String,
    },

    #[error("Finalize failed: {0}")]
    Finalize(String),

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("Unknown upload: {0}")]
    UnknownUpload(UploadId),

    #[error("Source file mismatch: expected {expected} bytes, found {actual}")]
    SourceMismatch {
        expected: u64,
        actual: u64,
    },

    #[error("Param error: {0}")]
    Param(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Orchestrator shutdown")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status_code,
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// 取消不算失败，上层据此区分终止原因
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
