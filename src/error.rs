//! Error taxonomy for the ingestion and retrieval pipeline.
//!
//! Variants divide into fail-fast errors (bad input, scope violations) and
//! transient errors that the owning stage retries before surfacing
//! (embedding and index availability). `TenantScopeViolation` is always
//! fatal and never retried.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The declared or sniffed file type is not one the extractor supports.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The file type is supported but the content could not be extracted.
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    /// Upload rejected before extraction: exceeds the configured ceiling.
    #[error("upload of {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    /// The embedding service failed after retries were exhausted.
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Writing chunk entries to the search index failed.
    #[error("index write failed: {0}")]
    IndexWriteFailed(String),

    /// The search index could not serve a query (degraded service).
    #[error("search index unavailable: {0}")]
    IndexUnavailable(String),

    /// An operation referenced data owned by a different tenant.
    #[error("tenant scope violation: {0}")]
    TenantScopeViolation(String),

    /// A referenced document, chunk, or job does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Another ingestion run claimed the document first.
    #[error("ingestion conflict: {0}")]
    Conflict(String),

    /// The document was deleted while its ingestion was in flight.
    #[error("ingestion cancelled: document was deleted")]
    Cancelled,

    /// Blob storage operation failed.
    #[error("blob storage error: {0}")]
    BlobStore(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("metadata store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error class is worth retrying at the stage that saw it.
    /// Scope violations and malformed input never are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::EmbeddingUnavailable(_) | Error::IndexWriteFailed(_) | Error::IndexUnavailable(_)
        )
    }
}
