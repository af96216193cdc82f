use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaestroError {
    // Topology errors
    #[error("Invalid topology: {0}")]
    Validation(String),

    #[error("Routing error: {0}")]
    Routing(String),

    // Unit errors
    #[error("Unit execution failed: {node}: {message}")]
    Execution { node: String, message: String },

    #[error("Unit timeout after {timeout_ms}ms: {node}")]
    NodeTimeout { node: String, timeout_ms: u64 },

    #[error("Result already recorded for {node} (execution {execution_index})")]
    DuplicateResult { node: String, execution_index: u32 },

    // Run termination
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MaestroError {
    /// Shorthand for a unit failure attributed to `node`.
    pub fn execution(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            node: node.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MaestroError>;
