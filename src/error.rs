use thiserror::Error;

use crate::graph_utils::graph::NodeId;

/// Errors surfaced by the canvas engine and its backend clients.
///
/// None of these are fatal: callers log them, leave the graph untouched and
/// show a dismissible banner.
#[derive(Debug, Error)]
pub enum CanvasError {
    #[error("backend unavailable after {attempts} attempt(s): {message}")]
    TransientNetwork { message: String, attempts: u32 },

    #[error("no data available: {message}")]
    InvalidPayload { message: String },

    #[error("node {0} does not exist")]
    MissingNode(NodeId),

    #[error("graph integrity: {message}")]
    GraphIntegrity { message: String },

    #[error("a generation is already running on node {0}")]
    GenerationInFlight(NodeId),

    #[error("cancelled")]
    UserAbort,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type CanvasResult<T> = Result<T, CanvasError>;

impl CanvasError {
    pub fn integrity(message: impl Into<String>) -> Self {
        CanvasError::GraphIntegrity { message: message.into() }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        CanvasError::InvalidPayload { message: message.into() }
    }

    /// Retried automatically by the service layer.
    pub fn is_transient(&self) -> bool {
        matches!(self, CanvasError::TransientNetwork { .. })
    }

    /// Explicit cancellation is success-with-no-effect, not a failure to report.
    pub fn is_user_abort(&self) -> bool {
        matches!(self, CanvasError::UserAbort)
    }
}

impl From<serde_json::Error> for CanvasError {
    fn from(e: serde_json::Error) -> Self {
        CanvasError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for CanvasError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            CanvasError::invalid_payload(e.to_string())
        } else {
            CanvasError::TransientNetwork { message: e.to_string(), attempts: 1 }
        }
    }
}
