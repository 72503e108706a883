use uuid::Uuid;

/// Result type alias for memory-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the memory engine
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Ingest error: {0}")]
    Ingest(String),

    #[error("Record not found: {0}")]
    NotFound(Uuid),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is recoverable (can retry with backoff)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Storage(_) => true,
            Error::Llm(_) => true,
            Error::Ingest(_) => true,
            Error::NotFound(_) => false,
            Error::Workflow(_) => false,
            Error::Serialization(_) => false,
            Error::InvalidInput(_) => false,
            Error::InvalidConfig(_) => false,
            Error::Io(_) => true,
        }
    }
}
