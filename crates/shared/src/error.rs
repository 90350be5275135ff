//! Error types shared across Tierledger crates

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Metadata limit exceeded: {0}")]
    MetadataLimit(String),
}
