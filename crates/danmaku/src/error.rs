//! Danmaku error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, DanmakuError>;

/// Errors raised while decoding a single inbound buffer.
///
/// A decode error is scoped to the buffer that produced it: the session logs
/// it, drops the buffer and keeps reading.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("invalid total length {declared} (header {header_len}, buffer {available})")]
    InvalidLength {
        declared: usize,
        header_len: usize,
        available: usize,
    },

    #[error("invalid header length {0}")]
    InvalidHeaderLength(u16),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("{scheme} decompression failed: {reason}")]
    Decompress { scheme: &'static str, reason: String },

    #[error("compressed frames nested deeper than {0} levels")]
    DepthExceeded(usize),

    #[error("decompressed body exceeds {limit} bytes")]
    SizeExceeded { limit: usize },
}

/// Errors that can occur in the live danmaku pipeline.
#[derive(Error, Debug)]
pub enum DanmakuError {
    /// Connection-related errors (open, send, close)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol encoding/semantics errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame decoding errors
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// WebSocket transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON payload errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration or arguments
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl DanmakuError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
