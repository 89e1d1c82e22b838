use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConclaveError {
    // Lookup errors
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // Handler errors
    #[error("Handler failed: {target}: {message}")]
    Handler { target: String, message: String },

    #[error("Handler timed out after {timeout_ms}ms: {target}")]
    Timeout { target: String, timeout_ms: u64 },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    // Precondition errors
    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    // Messaging errors
    #[error("No reply to message {message_id} within {wait_ms}ms")]
    ReplyTimeout { message_id: String, wait_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // State provider errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConclaveError {
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn handler(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::ToolNotFound(_))
    }

    /// Timeouts count as handler failures: the handler did not produce a result.
    pub fn is_handler_failure(&self) -> bool {
        matches!(self, Self::Handler { .. } | Self::Timeout { .. })
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_) | Self::InvalidTransition { .. })
    }
}

pub type Result<T> = std::result::Result<T, ConclaveError>;
