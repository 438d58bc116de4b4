//! In-memory [`VectorIndex`] implementation for tests and ephemeral indexes.
//!
//! Records live in a `BTreeMap` behind `std::sync::RwLock`. Query is a
//! brute-force cosine scan over all matching records.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{IndexError, Result};
use crate::models::ChunkRecord;

use super::{
    check_query_dims, rank_hits, record_order, validate_batch, MetadataFilter, QueryHit,
    VectorIndex,
};

#[derive(Default)]
struct State {
    dims: Option<usize>,
    records: BTreeMap<String, ChunkRecord>,
}

/// In-memory vector index.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    state: RwLock<State>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index whose dimensionality is fixed up front.
    pub fn with_dims(dims: usize) -> Self {
        Self {
            state: RwLock::new(State {
                dims: Some(dims),
                records: BTreeMap::new(),
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| IndexError::storage_msg("in-memory index lock poisoned"))
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| IndexError::storage_msg("in-memory index lock poisoned"))
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn write(&self, records: &[ChunkRecord]) -> Result<()> {
        let mut state = self.write_lock()?;
        let dims = validate_batch(records, state.dims)?;
        state.dims = dims;
        for record in records {
            state
                .records
                .insert(record.chunk_id.clone(), record.clone());
        }
        Ok(())
    }

    async fn delete_by_source(&self, source_id: &str) -> Result<usize> {
        let mut state = self.write_lock()?;
        let before = state.records.len();
        state.records.retain(|_, r| r.source_id != source_id);
        Ok(before - state.records.len())
    }

    async fn filter(&self, filter: &MetadataFilter) -> Result<Vec<ChunkRecord>> {
        let state = self.read()?;
        let mut out: Vec<ChunkRecord> = state
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        out.sort_by(record_order);
        Ok(out)
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryHit>> {
        let state = self.read()?;
        check_query_dims(state.dims, vector)?;
        let candidates = state
            .records
            .values()
            .filter(|r| filter.map(|f| f.matches(r)).unwrap_or(true))
            .cloned();
        Ok(rank_hits(vector, candidates, k))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read()?.records.len())
    }

    async fn unique_sources(&self) -> Result<Vec<String>> {
        let state = self.read()?;
        let sources: BTreeSet<&String> = state.records.values().map(|r| &r.source_id).collect();
        Ok(sources.into_iter().cloned().collect())
    }

    async fn dims(&self) -> Result<Option<usize>> {
        Ok(self.read()?.dims)
    }
}
