//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the storage contract for chunk records:
//! upsert, delete by source, metadata-only filtering, and nearest-neighbour
//! query by cosine distance. Two backends ship with the crate:
//!
//! | Backend | Module | Use |
//! |---------|--------|-----|
//! | [`InMemoryVectorIndex`](memory::InMemoryVectorIndex) | [`memory`] | tests, ephemeral indexes |
//! | [`SqliteVectorIndex`](sqlite::SqliteVectorIndex) | [`sqlite`] | persistent local index |
//!
//! # Contract
//!
//! - `write` upserts by `chunk_id` and is all-or-nothing per call.
//! - `delete_by_source` removes every chunk of a source or none of them.
//! - The collection's dimensionality is fixed by the first write. A record
//!   or query vector of any other length fails with
//!   [`IndexError::DimensionMismatch`] before anything is modified.
//! - `query` orders hits by ascending cosine distance, ties by `chunk_id`.
//!
//! Implementations must be `Send + Sync`; writes to disjoint sources may
//! arrive concurrently.

pub mod memory;
pub mod sqlite;

use std::cmp::Ordering;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{IndexError, Result};
use crate::models::{ChunkRecord, MetadataValue};

/// A record returned by [`VectorIndex::query`] with its cosine distance.
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub record: ChunkRecord,
    /// `1 - cosine_similarity`, in `[0, 2]`.
    pub distance: f32,
}

/// One metadata predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Scalar equality. Values of different kinds compare by their display
    /// form, so `"3"` matches `Int(3)`.
    Eq { key: String, value: MetadataValue },
    /// Case-insensitive membership in a flattened list value such as `tags`.
    ListContains { key: String, item: String },
}

impl Condition {
    fn matches(&self, record: &ChunkRecord) -> bool {
        match self {
            Condition::Eq { key, value } => match record.metadata.get(key) {
                Some(v) => v == value || v.to_string() == value.to_string(),
                None => false,
            },
            Condition::ListContains { key, item } => record
                .metadata
                .get(key)
                .map(|v| {
                    v.list_items()
                        .iter()
                        .any(|i| i.eq_ignore_ascii_case(item))
                })
                .unwrap_or(false),
        }
    }
}

/// Conjunction of a source restriction and metadata conditions.
///
/// An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    pub source_id: Option<String>,
    pub conditions: Vec<Condition>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter matching every chunk of one source.
    pub fn source(source_id: impl Into<String>) -> Self {
        Self {
            source_id: Some(source_id.into()),
            conditions: Vec::new(),
        }
    }

    pub fn equals(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.conditions.push(Condition::Eq {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn contains(mut self, key: impl Into<String>, item: impl Into<String>) -> Self {
        self.conditions.push(Condition::ListContains {
            key: key.into(),
            item: item.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.source_id.is_none() && self.conditions.is_empty()
    }

    pub fn matches(&self, record: &ChunkRecord) -> bool {
        if let Some(source_id) = &self.source_id {
            if &record.source_id != source_id {
                return false;
            }
        }
        self.conditions.iter().all(|c| c.matches(record))
    }
}

/// Storage contract for chunk vectors, text, and scalar metadata.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Upsert records by `chunk_id`.
    async fn write(&self, records: &[ChunkRecord]) -> Result<()>;

    /// Remove every chunk of a source. Returns the number removed.
    async fn delete_by_source(&self, source_id: &str) -> Result<usize>;

    /// Metadata-only query, ordered by `(source_id, ordinal, chunk_id)`.
    async fn filter(&self, filter: &MetadataFilter) -> Result<Vec<ChunkRecord>>;

    /// Nearest neighbours of `vector` among records matching `filter`.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryHit>>;

    /// Total number of stored chunks.
    async fn count(&self) -> Result<usize>;

    /// Distinct source ids, sorted.
    async fn unique_sources(&self) -> Result<Vec<String>>;

    /// Dimensionality recorded for the collection, if any record was written.
    async fn dims(&self) -> Result<Option<usize>>;
}

/// Check a batch against the collection's dimensionality.
///
/// Returns the dimensionality the collection has after the write.
pub(crate) fn validate_batch(records: &[ChunkRecord], dims: Option<usize>) -> Result<Option<usize>> {
    let mut expected = dims;
    for record in records {
        let actual = record.vector.len();
        if actual == 0 {
            return Err(IndexError::Corrupt(format!(
                "chunk {} has an empty vector",
                record.chunk_id
            )));
        }
        match expected {
            Some(e) if e != actual => {
                return Err(IndexError::DimensionMismatch {
                    expected: e,
                    actual,
                })
            }
            Some(_) => {}
            None => expected = Some(actual),
        }
    }
    Ok(expected)
}

/// Rank candidates by cosine distance to `vector` and keep the top `k`.
pub(crate) fn rank_hits<I>(vector: &[f32], candidates: I, k: usize) -> Vec<QueryHit>
where
    I: IntoIterator<Item = ChunkRecord>,
{
    let mut hits: Vec<QueryHit> = candidates
        .into_iter()
        .map(|record| {
            let distance = 1.0 - cosine_similarity(vector, &record.vector);
            QueryHit { record, distance }
        })
        .collect();

    hits.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.record.chunk_id.cmp(&b.record.chunk_id))
    });
    hits.truncate(k);
    hits
}

/// Reject a query vector whose length differs from the collection's.
pub(crate) fn check_query_dims(dims: Option<usize>, vector: &[f32]) -> Result<()> {
    match dims {
        Some(expected) if expected != vector.len() => Err(IndexError::DimensionMismatch {
            expected,
            actual: vector.len(),
        }),
        _ => Ok(()),
    }
}

/// Sort key shared by both backends' `filter`.
pub(crate) fn record_order(a: &ChunkRecord, b: &ChunkRecord) -> Ordering {
    a.source_id
        .cmp(&b.source_id)
        .then_with(|| a.ordinal().cmp(&b.ordinal()))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}
