//! Error types for Soundfield

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum SfError {
    #[error("invalid device name: {0}")]
    InvalidDeviceName(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    #[error("voice pool exhausted")]
    VoicePoolExhausted,

    #[error("device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("state error: {0}")]
    State(String),
}

/// Result type alias
pub type SfResult<T> = Result<T, SfError>;
