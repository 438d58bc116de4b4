//! Index statistics and the consistency check.
//!
//! [`verify`] compares every processing record with the chunks actually
//! stored for its source and lists every disagreement. Nothing is repaired
//! here: a mismatch can mean lost data, and fixing it is an explicit
//! `rebuild`.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::embedding::EmbeddingGateway;
use crate::error::{IndexError, Result};
use crate::fingerprint::FingerprintTracker;
use crate::store::{MetadataFilter, VectorIndex};

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub total_chunks: usize,
    pub unique_sources: usize,
    /// Number of processing records.
    pub processed_documents: usize,
    /// Collection dimensionality, once anything was written.
    pub dims: Option<usize>,
    pub model: String,
}

/// A disagreement between the tracker and the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inconsistency {
    /// The record's chunk count differs from the stored chunk count.
    ChunkCountMismatch {
        source_id: String,
        expected: usize,
        actual: usize,
    },
    /// Chunks are stored for a source that has no record.
    Orphaned { source_id: String, chunks: usize },
}

impl Inconsistency {
    pub fn source_id(&self) -> &str {
        match self {
            Self::ChunkCountMismatch { source_id, .. } | Self::Orphaned { source_id, .. } => {
                source_id
            }
        }
    }

    pub fn to_error(&self) -> IndexError {
        match self {
            Self::ChunkCountMismatch {
                source_id,
                expected,
                actual,
            } => IndexError::InconsistentState {
                source_id: source_id.clone(),
                expected: *expected,
                actual: *actual,
            },
            Self::Orphaned { source_id, chunks } => IndexError::InconsistentState {
                source_id: source_id.clone(),
                expected: 0,
                actual: *chunks,
            },
        }
    }
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChunkCountMismatch {
                source_id,
                expected,
                actual,
            } => write!(
                f,
                "{}: record says {} chunks, index holds {}",
                source_id, expected, actual
            ),
            Self::Orphaned { source_id, chunks } => {
                write!(f, "{}: {} chunks without a processing record", source_id, chunks)
            }
        }
    }
}

pub async fn collect_stats(
    tracker: &FingerprintTracker,
    index: &dyn VectorIndex,
    embedder: &dyn EmbeddingGateway,
) -> Result<IndexStats> {
    Ok(IndexStats {
        total_chunks: index.count().await?,
        unique_sources: index.unique_sources().await?.len(),
        processed_documents: tracker.records().await?.len(),
        dims: index.dims().await?,
        model: embedder.model_name().to_string(),
    })
}

/// Check every record and every stored source.
pub async fn verify(
    tracker: &FingerprintTracker,
    index: &dyn VectorIndex,
) -> Result<Vec<Inconsistency>> {
    let records = tracker.records().await?;
    let recorded: BTreeSet<&str> = records.iter().map(|r| r.source_id.as_str()).collect();

    let mut found = Vec::new();
    for record in &records {
        let actual = index
            .filter(&MetadataFilter::source(&record.source_id))
            .await?
            .len();
        if actual != record.chunk_count {
            found.push(Inconsistency::ChunkCountMismatch {
                source_id: record.source_id.clone(),
                expected: record.chunk_count,
                actual,
            });
        }
    }

    for source_id in index.unique_sources().await? {
        if !recorded.contains(source_id.as_str()) {
            let chunks = index
                .filter(&MetadataFilter::source(&source_id))
                .await?
                .len();
            found.push(Inconsistency::Orphaned { source_id, chunks });
        }
    }

    for inconsistency in &found {
        tracing::warn!(%inconsistency, "index inconsistency");
    }
    Ok(found)
}

/// Check only the given sources.
pub async fn verify_sources(
    tracker: &FingerprintTracker,
    index: &dyn VectorIndex,
    source_ids: &[String],
) -> Result<Vec<Inconsistency>> {
    let mut found = Vec::new();
    for source_id in source_ids {
        let actual = index
            .filter(&MetadataFilter::source(source_id))
            .await?
            .len();
        match tracker.record(source_id).await? {
            Some(record) if record.chunk_count != actual => {
                found.push(Inconsistency::ChunkCountMismatch {
                    source_id: source_id.clone(),
                    expected: record.chunk_count,
                    actual,
                })
            }
            None if actual > 0 => found.push(Inconsistency::Orphaned {
                source_id: source_id.clone(),
                chunks: actual,
            }),
            _ => {}
        }
    }
    Ok(found)
}

/// Fails with [`IndexError::InconsistentState`] on the first finding among
/// `source_ids`.
pub async fn ensure_consistent(
    tracker: &FingerprintTracker,
    index: &dyn VectorIndex,
    source_ids: &[String],
) -> Result<()> {
    match verify_sources(tracker, index, source_ids).await?.first() {
        Some(inconsistency) => Err(inconsistency.to_error()),
        None => Ok(()),
    }
}
