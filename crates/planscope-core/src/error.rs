//! Error types for planscope collaborators

use thiserror::Error;

/// Error reported by schema metadata collaborators
///
/// The analysis pipeline never propagates these; they are folded into
/// `SchemaLookup::Unavailable` at the boundary.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Metadata lookup failed: {0}")]
    Lookup(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for collaborator operations
pub type Result<T> = std::result::Result<T, CoreError>;
