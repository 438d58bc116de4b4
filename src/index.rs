//! The assembled index: storage, tracker, coordinator and retrieval behind
//! one handle.
//!
//! [`ContextIndex::open`] builds the production wiring from a [`Config`]:
//! SQLite for vectors, a JSON file for processing records, git for revisions
//! (when the root is a work tree) and the configured embedding provider.
//! [`ContextIndex::assemble`] accepts prebuilt parts instead, which is how
//! the tests run everything in memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::embedding::{create_embedder, EmbeddingGateway};
use crate::error::{IndexError, Result};
use crate::fingerprint::{FingerprintTracker, JsonRecordStore, TrackerSummary};
use crate::ingest::{
    CancelToken, CoordinatorSettings, FailedDocument, IndexCoordinator, IngestSummary,
};
use crate::loader::{scan, Candidate, DocumentLoader, FsLoader};
use crate::models::ProcessingRecord;
use crate::revision::GitRevisions;
use crate::search::{Query, RetrievalEngine, SearchResult};
use crate::stats::{self, IndexStats, Inconsistency};
use crate::store::sqlite::SqliteVectorIndex;
use crate::store::VectorIndex;

/// Prebuilt collaborators for [`ContextIndex::assemble`].
pub struct Components {
    pub tracker: Arc<FingerprintTracker>,
    pub loader: Arc<dyn DocumentLoader>,
    pub embedder: Arc<dyn EmbeddingGateway>,
    pub index: Arc<dyn VectorIndex>,
}

pub struct ContextIndex {
    config: Config,
    tracker: Arc<FingerprintTracker>,
    loader: Arc<dyn DocumentLoader>,
    embedder: Arc<dyn EmbeddingGateway>,
    index: Arc<dyn VectorIndex>,
    coordinator: IndexCoordinator,
    retrieval: RetrievalEngine,
}

impl ContextIndex {
    pub async fn open(config: Config) -> Result<Self> {
        let index = SqliteVectorIndex::open(&config.index.db_path).await?;
        let embedder = create_embedder(&config.embedding)
            .map_err(|e| IndexError::config(format!("{:#}", e)))?;

        let mut tracker =
            FingerprintTracker::new(Arc::new(JsonRecordStore::new(&config.index.state_path)));
        if config.ingest.use_revisions {
            match GitRevisions::discover(&config.ingest.root).await {
                Some(git) => tracker = tracker.with_revisions(Arc::new(git)),
                None => tracing::info!(
                    root = %config.ingest.root.display(),
                    "no git work tree, change detection uses content hashes only"
                ),
            }
        }

        Self::assemble(
            config,
            Components {
                tracker: Arc::new(tracker),
                loader: Arc::new(FsLoader),
                embedder,
                index: Arc::new(index),
            },
        )
        .await
    }

    /// Wire prebuilt parts together.
    ///
    /// Fails with [`IndexError::DimensionMismatch`] when the collection was
    /// created with a different dimensionality than the embedder produces.
    pub async fn assemble(config: Config, parts: Components) -> Result<Self> {
        let settings = CoordinatorSettings::from_config(&config)?;

        if parts.embedder.dims() > 0 {
            if let Some(expected) = parts.index.dims().await? {
                if expected != parts.embedder.dims() {
                    tracing::error!(
                        expected,
                        actual = parts.embedder.dims(),
                        model = parts.embedder.model_name(),
                        "embedder does not match the existing collection"
                    );
                    return Err(IndexError::DimensionMismatch {
                        expected,
                        actual: parts.embedder.dims(),
                    });
                }
            }
        }

        let coordinator = IndexCoordinator::new(
            parts.tracker.clone(),
            parts.loader.clone(),
            parts.embedder.clone(),
            parts.index.clone(),
            settings,
        );
        let retrieval =
            RetrievalEngine::new(parts.embedder.clone(), parts.index.clone(), config.ranking());

        Ok(Self {
            config,
            tracker: parts.tracker,
            loader: parts.loader,
            embedder: parts.embedder,
            index: parts.index,
            coordinator,
            retrieval,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn root(&self) -> &Path {
        &self.config.ingest.root
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.coordinator.cancel_token()
    }

    fn require_embedder(&self) -> Result<()> {
        if self.config.embedding.is_enabled() {
            Ok(())
        } else {
            Err(IndexError::config(
                "embedding provider is disabled; set [embedding] provider to index documents",
            ))
        }
    }

    /// Ingest explicit paths, relative to the root or absolute under it.
    ///
    /// A path that no longer exists is treated as a deletion.
    pub async fn ingest(&self, paths: &[PathBuf]) -> Result<IngestSummary> {
        self.require_embedder()?;

        let mut present = Vec::new();
        let mut failed = Vec::new();
        let mut removed = 0;

        for path in paths {
            let candidate = match Candidate::from_path(self.root(), path) {
                Ok(candidate) => candidate,
                Err(e) => {
                    failed.push(FailedDocument {
                        source_id: path.display().to_string(),
                        path: path.clone(),
                        error: IndexError::Load(e),
                    });
                    continue;
                }
            };
            if candidate.path.exists() {
                present.push(candidate);
            } else if self.forget(&candidate.source_id).await? {
                removed += 1;
            }
        }

        let mut summary = self.coordinator.ingest(present).await;
        summary.failed.extend(failed);
        summary.removed += removed;
        Ok(summary)
    }

    /// Scan the root, ingest whatever changed and drop documents that are
    /// gone.
    pub async fn sync(&self) -> Result<IngestSummary> {
        self.require_embedder()?;

        let candidates = self.candidates()?;
        tracing::info!(root = %self.root().display(), candidates = candidates.len(), "sync started");

        let mut summary = self.coordinator.ingest(candidates.clone()).await;
        if self.cancel_token().is_cancelled() {
            return Ok(summary);
        }
        summary.removed += self.coordinator.prune(&candidates).await?.len();
        Ok(summary)
    }

    /// Reprocess one document regardless of its fingerprint.
    pub async fn rebuild(&self, path: &Path) -> Result<ProcessingRecord> {
        self.require_embedder()?;
        let candidate = Candidate::from_path(self.root(), path).map_err(IndexError::Load)?;
        let record = self.coordinator.rebuild(&candidate).await?;
        stats::ensure_consistent(
            &self.tracker,
            self.index.as_ref(),
            std::slice::from_ref(&record.source_id),
        )
        .await?;
        Ok(record)
    }

    pub async fn remove_document(&self, source_id: &str) -> Result<usize> {
        self.coordinator.remove_document(source_id).await
    }

    pub async fn search(&self, query: &Query) -> Result<Vec<SearchResult>> {
        self.retrieval.search(query).await
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        stats::collect_stats(&self.tracker, self.index.as_ref(), self.embedder.as_ref()).await
    }

    pub async fn verify(&self) -> Result<Vec<Inconsistency>> {
        stats::verify(&self.tracker, self.index.as_ref()).await
    }

    /// Processed vs pending counts over the documents currently on disk.
    pub async fn status(&self) -> Result<TrackerSummary> {
        let candidates = self.candidates()?;
        Ok(self.tracker.summary(&candidates, self.loader.as_ref()).await)
    }

    fn candidates(&self) -> Result<Vec<Candidate>> {
        let ingest = &self.config.ingest;
        scan(&ingest.root, &ingest.include_globs, &ingest.exclude_globs)
            .map_err(|e| IndexError::config(format!("{:#}", e)))
    }

    /// Remove a source if anything is known about it.
    async fn forget(&self, source_id: &str) -> Result<bool> {
        let had_record = self.tracker.record(source_id).await?.is_some();
        let chunks = self.coordinator.remove_document(source_id).await?;
        Ok(had_record || chunks > 0)
    }
}
