use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DccError>;

#[derive(Error, Debug)]
pub enum DccError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chunk decode error: {0}")]
    Codec(#[from] base64::DecodeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Save target unavailable: {0}")]
    SaveTargetUnavailable(String),

    #[error("Transfer of '{0}' finished with zero bytes")]
    ZeroByteResult(String),

    #[error("Unknown transfer: {0}")]
    UnknownTransferKey(String),

    #[error("Failed to finalize transfer (partial data kept at {temp_path:?}): {reason}")]
    FinalizeFailure { temp_path: PathBuf, reason: String },

    #[error("Transfer of '{0}' is already active for this peer")]
    DuplicateTransfer(String),

    #[error("File operation error: {0}")]
    FileOperation(String),

    #[error("Transfer session is closed")]
    SessionClosed,
}

