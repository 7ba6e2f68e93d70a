//! Error types for the chat relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Memory store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Model stream failure: {0}")]
    ModelStreamFailure(String),

    #[error("Token budget invariant violation: {0}")]
    BudgetInvariantViolation(String),

    #[error("Address resolution failure: {0}")]
    AddressResolutionFailure(String),

    #[error("Dispatch error: {0}")]
    DispatchError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Summarization error: {0}")]
    SummarizationError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
