//! Error type for every failure in the encoding and training pipeline.
//!
//! # Error Categories
//!
//! | Category | Variants | Recovery Strategy |
//! |----------|----------|-------------------|
//! | Configuration | ConfigError, UnknownTowerFamily | Fix configuration before any batch runs |
//! | Validation | ShapeMismatch, EmptyInput | Fix the batch layout |
//! | Processing | EncodingError, TokenizationError, TensorError | Propagated as-is, never retried |
//! | Storage | CheckpointError, IoError, SerializationError | Fix the checkpoint or path |
//! | Index | Index, DocumentNotFound | Rebuild the index or store |
//!
//! Errors propagate. Nothing in this crate retries or substitutes a default
//! on failure, and a batch either fully succeeds or the whole call fails.

use std::path::PathBuf;

use bpr_core::IndexError;
use thiserror::Error;

use crate::towers::TowerRole;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    // === Configuration ===
    /// Invalid construction arguments. Raised before any batch is processed.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// No factory registered for the requested tower family.
    #[error("Unknown tower family '{family}' (registered: {available:?})")]
    UnknownTowerFamily {
        family: String,
        available: Vec<String>,
    },

    // === Validation ===
    /// Batch layout disagrees with the configured counts or dimensions.
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("Empty input not allowed")]
    EmptyInput,

    // === Processing ===
    /// An encoder tower failed during its forward pass.
    #[error("Encoding failed in {tower} tower: {message}")]
    EncodingError { tower: TowerRole, message: String },

    #[error("Tokenization error: {message}")]
    TokenizationError { message: String },

    /// Tensor operation failed outside a tower forward.
    #[error("Tensor error: {message}")]
    TensorError { message: String },

    // === Storage ===
    #[error("Checkpoint error at '{path}': {message}")]
    CheckpointError { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    // === Index ===
    #[error(transparent)]
    Index(#[from] IndexError),

    /// A shortlisted candidate id has no document in the store.
    #[error("Document for candidate {id} not found in store")]
    DocumentNotFound { id: u64 },
}

pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

impl EmbeddingError {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Shorthand for a shape mismatch with displayable expected/actual values.
    pub fn shape(
        context: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_config_error_message() {
        let err = EmbeddingError::config("gamma must be > 0");
        let msg = err.to_string();
        assert!(msg.contains("Configuration error"), "got: {}", msg);
        assert!(msg.contains("gamma"), "got: {}", msg);
    }

    #[test]
    fn test_shape_mismatch_carries_context() {
        let err = EmbeddingError::shape("similarity head passages", 12, 10);
        let msg = err.to_string();
        assert!(msg.contains("similarity head passages"));
        assert!(msg.contains("expected 12"));
        assert!(msg.contains("got 10"));
    }

    #[test]
    fn test_encoding_error_names_tower() {
        let err = EmbeddingError::EncodingError {
            tower: TowerRole::Query,
            message: "matmul failed".to_string(),
        };
        assert!(err.to_string().contains("query tower"), "got: {}", err);
    }

    #[test]
    fn test_index_error_is_transparent() {
        let err: EmbeddingError = IndexError::NotFound { id: 3 }.into();
        assert_eq!(err.to_string(), IndexError::NotFound { id: 3 }.to_string());
    }

    #[test]
    fn test_io_error_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "weights missing");
        let err: EmbeddingError = io.into();
        assert!(err.to_string().contains("weights missing"));
        assert!(err.source().is_some());
    }
}
