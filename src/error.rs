use thiserror::Error;

/// Every failure the hardware link can report.
///
/// Only `Config` (at startup) and `Protocol` (inside the simulator) are
/// fatal; everything else is local to the call that produced it.
#[derive(Debug, Error)]
pub enum HalError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Value error: {0}")]
    Value(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Read-only: {0}")]
    ReadOnly(String),

    #[error("Not found: {subsystem}/{name}")]
    NotFound { subsystem: String, name: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HalError {
    pub fn not_found(subsystem: &str, name: &str) -> Self {
        HalError::NotFound {
            subsystem: subsystem.to_string(),
            name: name.to_string(),
        }
    }

    /// True for errors that must stop the process that raised them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HalError::Config(_) | HalError::Protocol(_))
    }
}

pub type HalResult<T> = Result<T, HalError>;
