//! Error taxonomy for the indexing and retrieval core.
//!
//! Collaborator seams (embedding providers, revision source, loaders,
//! record stores) report `anyhow` errors; the core wraps them into the
//! typed [`IndexError`] variants below so callers can tell a transient
//! per-document failure from a fatal configuration problem.

use std::time::Duration;

/// Result alias used by the core API.
pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Chunk overlap must be strictly smaller than the target size.
    #[error("invalid chunk config: overlap ({overlap}) must be smaller than target size ({target_size})")]
    InvalidChunkConfig { target_size: usize, overlap: usize },

    /// Fatal configuration problem detected at startup.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A vector does not match the dimensionality recorded for the collection.
    #[error("dimension mismatch: collection expects {expected} dims, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The embedding capability failed for a document or query.
    #[error("embedding failed: {0:#}")]
    Embedding(anyhow::Error),

    /// A store operation failed after exhausting retries.
    #[error("storage failure: {source}")]
    Storage {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Stored or submitted data is malformed. Retrying the call cannot help.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// An embedding or storage call exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The query was rejected before reaching the index.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The vector index could not serve a query.
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// Tracker and index disagree about a source's chunks.
    #[error("inconsistent state for '{source_id}': record says {expected} chunks, index holds {actual}")]
    InconsistentState {
        source_id: String,
        expected: usize,
        actual: usize,
    },

    /// Metadata values must be scalars by the time they reach the store.
    #[error("metadata key '{key}' holds a non-scalar value")]
    NonScalarMetadata { key: String },

    /// The document loader could not produce text for a path.
    #[error("failed to load document: {0:#}")]
    Load(anyhow::Error),
}

impl IndexError {
    pub fn storage<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            source: Box::new(source),
        }
    }

    /// Storage failure reported by an `anyhow` collaborator (record store).
    pub fn storage_any(err: anyhow::Error) -> Self {
        Self::Storage { source: err.into() }
    }

    /// Wrap a plain message as a storage failure.
    pub fn storage_msg<S: Into<String>>(message: S) -> Self {
        let message: String = message.into();
        Self::Storage {
            source: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether retrying the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. } | Self::Timeout { .. } | Self::Embedding(_)
        )
    }
}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        Self::storage(err)
    }
}
