//! Common error types for lmshim
//!
//! This module defines the error type shared by the predictor and its binary.
//! Every error carries a short `kind()` label used when counting failures.

use thiserror::Error;

/// Main error type for lmshim
#[derive(Error, Debug)]
pub enum LmShimError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model hub resolution or download errors
    #[error("Hub error: {0}")]
    Hub(String),

    /// Model loading errors
    #[error("Model error: {0}")]
    Model(String),

    /// Tokenizer loading, encoding or decoding errors
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Tensor runtime errors
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The model stayed locked by another generation past the wait limit
    #[error("Model busy: {0}")]
    Busy(String),

    /// Generation produced nothing to decode
    #[error("No results returned from model")]
    EmptyOutput,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for LmShimError {
    fn from(err: config::ConfigError) -> Self {
        LmShimError::Config(err.to_string())
    }
}

impl LmShimError {
    /// Short label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            LmShimError::Config(_) => "config",
            LmShimError::Hub(_) => "hub",
            LmShimError::Model(_) => "model",
            LmShimError::Tokenizer(_) => "tokenizer",
            LmShimError::Tensor(_) => "tensor",
            LmShimError::Serialization(_) => "serialization",
            LmShimError::Io(_) => "io",
            LmShimError::InvalidInput(_) => "invalid_input",
            LmShimError::Busy(_) => "busy",
            LmShimError::EmptyOutput => "empty_output",
            LmShimError::Internal(_) => "internal",
        }
    }

    /// Whether the caller, not the model, is at fault
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            LmShimError::InvalidInput(_) | LmShimError::Serialization(_)
        )
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        LmShimError::Config(msg.into())
    }

    /// Create a hub error
    pub fn hub(msg: impl Into<String>) -> Self {
        LmShimError::Hub(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        LmShimError::Model(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        LmShimError::Tokenizer(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        LmShimError::InvalidInput(msg.into())
    }

    /// Create a busy error
    pub fn busy(msg: impl Into<String>) -> Self {
        LmShimError::Busy(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        LmShimError::Internal(msg.into())
    }
}

/// Result type alias for lmshim operations
pub type Result<T> = std::result::Result<T, LmShimError>;
