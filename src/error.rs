//! Error types for the lifecycle controller.

/// Top-level error type for conversation lifecycle handling.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Persistence endpoint rejected the request or could not be reached.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Transport channel (remote model data channel) is unavailable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, LifecycleError>;
