//! Error types for the finance assistant core

use thiserror::Error;

/// Result type alias for assistant operations
pub type Result<T> = std::result::Result<T, AssistantError>;

#[derive(Error, Debug)]
pub enum AssistantError {

    // =============================
    // Turn Pipeline Errors
    // =============================

    #[error("Classification error: {0}")]
    ClassificationError(String),

    #[error("Handoff limit exceeded: {0}")]
    HandoffLimitExceeded(String),

    #[error("Timeout exceeded: {0}")]
    TimeoutExceeded(String),

    #[error("Capability execution error: {0}")]
    CapabilityExecutionError(String),

    #[error("Empty result: {0}")]
    EmptyResult(String),

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
