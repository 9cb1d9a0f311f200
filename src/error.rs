//! Error handling for the RAG service

use thiserror::Error;

/// Result type alias for the RAG service
pub type Result<T> = std::result::Result<T, RagError>;

/// Main error type for the RAG service
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: operation exceeded its deadline")]
    Timeout,

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Vector store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors related to language model operations
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout: request took too long")]
    Timeout,

    #[error("All providers failed")]
    AllProvidersFailed,
}

/// Errors related to vector store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store not connected")]
    NotConnected,

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Search failed: {0}")]
    SearchFailed(String),

    #[error("Storage failed: {0}")]
    StorageFailed(String),

    #[error("Operation queue full")]
    QueueFull,

    #[error("Collection error: {0}")]
    Collection(String),
}

impl RagError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::Timeout
                | RagError::Unavailable(_)
                | RagError::Llm(LlmError::Timeout)
                | RagError::Llm(LlmError::ConnectionFailed(_))
                | RagError::Store(StoreError::NotConnected)
                | RagError::Http(_)
        )
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            RagError::InvalidInput(_) => "invalid_input",
            RagError::UnsupportedFormat(_) => "unsupported_format",
            RagError::Decode(_) => "decode",
            RagError::NotFound(_) => "not_found",
            RagError::Timeout => "timeout",
            RagError::Unavailable(_) => "unavailable",
            RagError::Generation(_) => "generation",
            RagError::Retrieval(_) => "retrieval",
            RagError::Cancelled => "cancelled",
            RagError::Llm(_) => "llm",
            RagError::Store(_) => "store",
            RagError::Config(_) => "config",
            RagError::Io(_) => "io",
            RagError::Serialization(_) => "serialization",
            RagError::Http(_) => "http",
            RagError::Database(_) => "database",
            RagError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(RagError::Timeout.is_retryable());
        assert!(RagError::Llm(LlmError::ConnectionFailed("refused".into())).is_retryable());
        assert!(RagError::Unavailable("qdrant down".into()).is_retryable());

        assert!(!RagError::InvalidInput("empty text".into()).is_retryable());
        assert!(!RagError::UnsupportedFormat(".exe".into()).is_retryable());
        assert!(!RagError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(RagError::Timeout.category(), "timeout");
        assert_eq!(
            RagError::Store(StoreError::NotConnected).category(),
            "store"
        );
        assert_eq!(RagError::NotFound("doc".into()).category(), "not_found");
    }

    #[test]
    fn test_dimension_error_message() {
        let err = StoreError::InvalidDimension {
            expected: 384,
            actual: 768,
        };
        assert!(err.to_string().contains("384"));
        assert!(err.to_string().contains("768"));
    }
}
