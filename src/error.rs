// Error taxonomy for the consolidation engine.
//
// Two outcomes deliberately NOT modeled as errors:
// - a low-confidence match (the registry creates a new venue instead)
// - a cache miss (the cache computes the value)

use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, ConsolidationError>;

#[derive(Error, Debug)]
pub enum ConsolidationError {
    /// A record is missing fields required for the requested operation
    #[error("validation error: {0}")]
    Validation(String),

    /// A contextual source could not be read; its block is omitted downstream
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A transactional duplicate merge failed and was rolled back
    #[error("consolidation conflict: {0}")]
    ConsolidationConflict(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}
