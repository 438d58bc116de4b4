//! Ingestion pipeline orchestration.
//!
//! The [`IndexCoordinator`] drives each changed document through
//! read → chunk → embed → delete-then-write → mark:
//!
//! 1. load and hash the document
//! 2. chunk it
//! 3. embed every chunk in one gateway call, under the in-flight limit
//! 4. `delete_by_source`, then `write` the new chunks
//! 5. upsert the processing record
//!
//! A failure in any step fails only that document and shows up in
//! [`IngestSummary::failed`]. It keeps its old record unless its old chunks
//! were already deleted, in which case the record is cleared so the document
//! stays pending. Storage steps are
//! retried with exponential backoff; embedding failures are not retried here
//! because the gateway owns its own retry policy.
//!
//! # Concurrency
//!
//! Documents run on a bounded pool (`concurrency`). Embedding calls are
//! further limited by a semaphore (`max_inflight_embeddings`), so excess
//! documents queue instead of flooding the provider. Work on one source id
//! is serialized by a per-source lock; distinct sources never wait on each
//! other.
//!
//! # Cancellation
//!
//! [`CancelToken::cancel`] stops new documents from starting. A document
//! already past its first step runs to completion or failure.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;

use crate::chunk::{chunk_document, ChunkConfig};
use crate::config::Config;
use crate::embedding::EmbeddingGateway;
use crate::error::{IndexError, Result};
use crate::fingerprint::{FingerprintTracker, RevisionSnapshot};
use crate::loader::{Candidate, DocumentLoader};
use crate::models::{ChunkRecord, ProcessingRecord};
use crate::stats::{self, Inconsistency};
use crate::store::{validate_batch, VectorIndex};

/// Tuning for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub chunking: ChunkConfig,
    pub concurrency: usize,
    pub max_inflight_embeddings: usize,
    pub storage_retries: u32,
    pub retry_backoff: Duration,
    pub storage_timeout: Duration,
    pub embed_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            chunking: ChunkConfig::default(),
            concurrency: 4,
            max_inflight_embeddings: 2,
            storage_retries: 3,
            retry_backoff: Duration::from_millis(200),
            storage_timeout: Duration::from_secs(30),
            embed_timeout: Duration::from_secs(60),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            chunking: config.chunk_config()?,
            concurrency: config.ingest.concurrency.max(1),
            max_inflight_embeddings: config.ingest.max_inflight_embeddings.max(1),
            storage_retries: config.ingest.storage_retries,
            retry_backoff: Duration::from_millis(config.ingest.retry_backoff_ms),
            storage_timeout: config.storage_timeout(),
            embed_timeout: config.embed_timeout(),
        })
    }
}

/// Shared flag that stops a batch between documents.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FailedDocument {
    pub source_id: String,
    pub path: std::path::PathBuf,
    pub error: IndexError,
}

/// Outcome of an ingest or sync pass.
#[derive(Debug, Default)]
pub struct IngestSummary {
    pub processed: usize,
    /// Candidates whose record was already current.
    pub skipped: usize,
    pub failed: Vec<FailedDocument>,
    /// Documents never started because the batch was cancelled.
    pub cancelled: usize,
    /// Sources removed because their document disappeared.
    pub removed: usize,
    pub chunks_written: usize,
    /// Findings of the post-ingest check over processed sources.
    pub inconsistencies: Vec<Inconsistency>,
}

enum Outcome {
    Done(Result<ProcessingRecord>),
    Cancelled,
}

pub struct IndexCoordinator {
    tracker: Arc<FingerprintTracker>,
    loader: Arc<dyn DocumentLoader>,
    embedder: Arc<dyn EmbeddingGateway>,
    index: Arc<dyn VectorIndex>,
    settings: CoordinatorSettings,
    embed_permits: Semaphore,
    source_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancel: CancelToken,
}

impl IndexCoordinator {
    pub fn new(
        tracker: Arc<FingerprintTracker>,
        loader: Arc<dyn DocumentLoader>,
        embedder: Arc<dyn EmbeddingGateway>,
        index: Arc<dyn VectorIndex>,
        settings: CoordinatorSettings,
    ) -> Self {
        let permits = settings.max_inflight_embeddings.max(1);
        Self {
            tracker,
            loader,
            embedder,
            index,
            settings,
            embed_permits: Semaphore::new(permits),
            source_locks: Mutex::new(HashMap::new()),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn tracker(&self) -> &FingerprintTracker {
        &self.tracker
    }

    /// Process every candidate whose fingerprint is stale.
    ///
    /// Always returns a summary; per-document errors are collected in
    /// `failed`.
    pub async fn ingest(&self, candidates: Vec<Candidate>) -> IngestSummary {
        let candidates: Vec<Candidate> = candidates
            .into_iter()
            .map(|c| (c.source_id.clone(), c))
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect();

        let snapshot = self.tracker.snapshot().await;
        let pending = self
            .tracker
            .unprocessed_at(&snapshot, &candidates, self.loader.as_ref())
            .await;

        tracing::info!(
            candidates = candidates.len(),
            pending = pending.len(),
            "ingest planned"
        );

        let skipped = candidates.len() - pending.len();
        let mut summary = self.run_batch(pending, &snapshot).await;
        summary.skipped = skipped;
        summary
    }

    /// Reprocess one document regardless of its fingerprint.
    pub async fn rebuild(&self, candidate: &Candidate) -> Result<ProcessingRecord> {
        let snapshot = self.tracker.snapshot().await;
        self.process(candidate, &snapshot).await
    }

    async fn run_batch(&self, pending: Vec<Candidate>, snapshot: &RevisionSnapshot) -> IngestSummary {
        let outcomes: Vec<(Candidate, Outcome)> = stream::iter(pending)
            .map(|candidate| async move {
                if self.cancel.is_cancelled() {
                    return (candidate, Outcome::Cancelled);
                }
                let result = self.process(&candidate, snapshot).await;
                (candidate, Outcome::Done(result))
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut summary = IngestSummary::default();
        let mut processed_ids = Vec::new();

        for (candidate, outcome) in outcomes {
            match outcome {
                Outcome::Done(Ok(record)) => {
                    summary.processed += 1;
                    summary.chunks_written += record.chunk_count;
                    processed_ids.push(record.source_id);
                }
                Outcome::Done(Err(error)) => {
                    tracing::error!(
                        source_id = %candidate.source_id,
                        error = %error,
                        "document failed"
                    );
                    summary.failed.push(FailedDocument {
                        source_id: candidate.source_id,
                        path: candidate.path,
                        error,
                    });
                }
                Outcome::Cancelled => summary.cancelled += 1,
            }
        }

        if summary.cancelled > 0 {
            tracing::warn!(cancelled = summary.cancelled, "ingest cancelled");
        }

        processed_ids.sort();
        match stats::verify_sources(&self.tracker, self.index.as_ref(), &processed_ids).await {
            Ok(found) => {
                for inconsistency in &found {
                    tracing::warn!(%inconsistency, "post-ingest check failed");
                }
                summary.inconsistencies = found;
            }
            Err(e) => tracing::warn!(error = %e, "post-ingest check could not run"),
        }

        summary
    }

    /// Run one document through the pipeline.
    async fn process(&self, candidate: &Candidate, snapshot: &RevisionSnapshot) -> Result<ProcessingRecord> {
        self.serialized(&candidate.source_id, self.process_locked(candidate, snapshot))
            .await
    }

    async fn process_locked(
        &self,
        candidate: &Candidate,
        snapshot: &RevisionSnapshot,
    ) -> Result<ProcessingRecord> {
        let doc = self
            .loader
            .load(&candidate.path)
            .await
            .map_err(IndexError::Load)?
            .into_source_document(candidate);

        let mut chunks = chunk_document(&doc, &self.settings.chunking);

        if !chunks.is_empty() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embed(&texts).await?;
            if vectors.len() != chunks.len() {
                return Err(IndexError::Embedding(anyhow::anyhow!(
                    "provider returned {} vectors for {} chunks",
                    vectors.len(),
                    chunks.len()
                )));
            }
            for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                chunk.vector = Some(vector);
            }
        }

        let records = chunks
            .into_iter()
            .map(ChunkRecord::from_chunk)
            .collect::<Result<Vec<_>>>()?;

        // Reject a dimension change before the old chunks are deleted.
        if !records.is_empty() {
            let dims = self.with_storage("dims", || self.index.dims()).await?;
            validate_batch(&records, dims)?;
        }

        let removed = self
            .with_storage("delete", || self.index.delete_by_source(&doc.source_id))
            .await?;

        if !records.is_empty() {
            if let Err(e) = self.with_storage("write", || self.index.write(&records)).await {
                // The old chunks are gone; drop the record that described them.
                self.clear_record(&doc.source_id, "write").await;
                return Err(e);
            }
        }

        let record = ProcessingRecord {
            source_id: doc.source_id.clone(),
            last_processed_revision: snapshot.revision_for(&doc.source_id),
            content_hash: doc.content_hash.clone(),
            processed_at: Utc::now(),
            chunk_count: records.len(),
        };
        if let Err(e) = self
            .with_storage("mark", || self.tracker.mark_processed(record.clone()))
            .await
        {
            // The old record would describe chunks that were just replaced.
            self.clear_record(&doc.source_id, "mark").await;
            return Err(e);
        }

        tracing::debug!(
            source_id = %doc.source_id,
            chunks = records.len(),
            replaced = removed,
            "document indexed"
        );
        Ok(record)
    }

    async fn clear_record(&self, source_id: &str, failed_step: &'static str) {
        if let Err(e) = self.tracker.unmark(source_id).await {
            tracing::warn!(
                source_id,
                failed_step,
                error = %e,
                "could not clear record after failed step"
            );
        }
    }

    /// Deletion flow: vectors first, then the record.
    pub async fn remove_document(&self, source_id: &str) -> Result<usize> {
        self.serialized(source_id, async {
            let removed = self
                .with_storage("delete", || self.index.delete_by_source(source_id))
                .await?;
            self.with_storage("unmark", || self.tracker.unmark(source_id))
                .await?;

            tracing::info!(source_id, chunks = removed, "document removed");
            Ok::<_, IndexError>(removed)
        })
        .await
    }

    /// Remove every known source that is not among `live`.
    pub async fn prune(&self, live: &[Candidate]) -> Result<Vec<String>> {
        let live: std::collections::HashSet<&str> =
            live.iter().map(|c| c.source_id.as_str()).collect();

        let mut known: std::collections::BTreeSet<String> = self
            .tracker
            .records()
            .await?
            .into_iter()
            .map(|r| r.source_id)
            .collect();
        known.extend(
            self.with_storage("unique_sources", || self.index.unique_sources())
                .await?,
        );

        let mut removed = Vec::new();
        for source_id in known {
            if live.contains(source_id.as_str()) {
                continue;
            }
            self.remove_document(&source_id).await?;
            removed.push(source_id);
        }
        Ok(removed)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let _permit = self
            .embed_permits
            .acquire()
            .await
            .map_err(|e| IndexError::Embedding(anyhow::anyhow!(e)))?;

        match tokio::time::timeout(self.settings.embed_timeout, self.embedder.embed(texts)).await {
            Ok(Ok(vectors)) => Ok(vectors),
            Ok(Err(e)) => Err(IndexError::Embedding(e)),
            Err(_) => Err(IndexError::Timeout {
                operation: "embed",
                after: self.settings.embed_timeout,
            }),
        }
    }

    /// Run a storage call with a timeout, retrying transient failures.
    async fn with_storage<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let outcome = match tokio::time::timeout(self.settings.storage_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(IndexError::Timeout {
                    operation,
                    after: self.settings.storage_timeout,
                }),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.settings.storage_retries => {
                    attempt += 1;
                    let delay = self.settings.retry_backoff * (1u32 << (attempt - 1).min(5));
                    tracing::warn!(operation, attempt, ?delay, error = %e, "storage call failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `work` while holding the lock for `source_id`.
    async fn serialized<T, Fut>(&self, source_id: &str, work: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.source_lock(source_id)?;
        let result = {
            let _guard = lock.lock().await;
            work.await
        };
        self.release_source_lock(source_id, lock);
        result
    }

    fn source_lock(&self, source_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .source_locks
            .lock()
            .map_err(|_| IndexError::storage_msg("source lock table poisoned"))?;
        Ok(locks.entry(source_id.to_string()).or_default().clone())
    }

    /// Drop the table entry once no other task holds or waits on it.
    fn release_source_lock(&self, source_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let Ok(mut locks) = self.source_locks.lock() else {
            return;
        };
        // One reference in the table, one in `lock`.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(source_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::fingerprint::{MemoryRecordStore, RecordStore};
    use crate::loader::MemoryLoader;
    use crate::store::memory::InMemoryVectorIndex;
    use crate::store::MetadataFilter;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        loader: Arc<MemoryLoader>,
        index: Arc<InMemoryVectorIndex>,
        coordinator: IndexCoordinator,
    }

    fn test_settings() -> CoordinatorSettings {
        CoordinatorSettings {
            chunking: ChunkConfig::new(64, 8).unwrap(),
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn harness_with(embedder: Arc<dyn EmbeddingGateway>, index: Arc<InMemoryVectorIndex>) -> Harness {
        build(embedder, index, Arc::new(MemoryRecordStore::new()), test_settings())
    }

    fn build(
        embedder: Arc<dyn EmbeddingGateway>,
        index: Arc<InMemoryVectorIndex>,
        records: Arc<dyn RecordStore>,
        settings: CoordinatorSettings,
    ) -> Harness {
        let loader = Arc::new(MemoryLoader::new());
        let tracker = Arc::new(FingerprintTracker::new(records));
        let coordinator =
            IndexCoordinator::new(tracker, loader.clone(), embedder, index.clone(), settings);
        Harness {
            loader,
            index,
            coordinator,
        }
    }

    fn harness() -> Harness {
        harness_with(
            Arc::new(HashingEmbedder::new(32)),
            Arc::new(InMemoryVectorIndex::new()),
        )
    }

    fn doc(h: &Harness, id: &str, raw: &str) -> Candidate {
        let path = PathBuf::from(format!("/docs/{}", id));
        h.loader.insert(path.clone(), raw);
        Candidate::new(id, path)
    }

    /// Fails whenever a text contains "poison".
    struct PickyEmbedder {
        inner: HashingEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingGateway for PickyEmbedder {
        fn model_name(&self) -> &str {
            "picky"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|t| t.contains("poison")) {
                anyhow::bail!("provider rejected input");
            }
            self.inner.embed(texts).await
        }
    }

    /// Records the peak number of concurrent `embed` calls.
    struct CountingEmbedder {
        inner: HashingEmbedder,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingGateway for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.inner.embed(texts).await
        }
    }

    /// Stalls on any text containing "slow".
    struct SlowEmbedder {
        inner: HashingEmbedder,
    }

    #[async_trait]
    impl EmbeddingGateway for SlowEmbedder {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("slow")) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            self.inner.embed(texts).await
        }
    }

    /// Memory record store whose `set` fails on one numbered call.
    struct FlakyRecordStore {
        inner: MemoryRecordStore,
        sets: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl RecordStore for FlakyRecordStore {
        async fn get(&self, source_id: &str) -> anyhow::Result<Option<ProcessingRecord>> {
            self.inner.get(source_id).await
        }
        async fn set(&self, record: ProcessingRecord) -> anyhow::Result<()> {
            if self.sets.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                anyhow::bail!("record file is read-only");
            }
            self.inner.set(record).await
        }
        async fn delete(&self, source_id: &str) -> anyhow::Result<bool> {
            self.inner.delete(source_id).await
        }
        async fn all(&self) -> anyhow::Result<Vec<ProcessingRecord>> {
            self.inner.all().await
        }
    }

    #[tokio::test]
    async fn test_ingest_then_skip_unchanged() {
        let h = harness();
        let a = doc(&h, "a.md", "Alpha document about rust.");
        let b = doc(&h, "b.md", "Beta document about search.");

        let first = h.coordinator.ingest(vec![a.clone(), b.clone()]).await;
        assert_eq!(first.processed, 2);
        assert!(first.failed.is_empty());
        assert!(first.inconsistencies.is_empty());

        let second = h.coordinator.ingest(vec![a, b]).await;
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 2);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_isolated() {
        let embedder = Arc::new(PickyEmbedder {
            inner: HashingEmbedder::new(16),
            calls: AtomicUsize::new(0),
        });
        let h = harness_with(embedder, Arc::new(InMemoryVectorIndex::new()));
        let good = doc(&h, "good.md", "Perfectly fine text.");
        let bad = doc(&h, "bad.md", "This one carries poison.");

        let summary = h.coordinator.ingest(vec![good, bad.clone()]).await;
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].source_id, "bad.md");
        assert!(matches!(summary.failed[0].error, IndexError::Embedding(_)));
        assert!(h
            .index
            .filter(&MetadataFilter::source("bad.md"))
            .await
            .unwrap()
            .is_empty());
        assert!(h.coordinator.tracker().record("bad.md").await.unwrap().is_none());

        // Still pending on the next pass.
        let again = h.coordinator.ingest(vec![bad]).await;
        assert_eq!(again.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_fails_document() {
        let index = Arc::new(InMemoryVectorIndex::with_dims(8));
        let h = harness_with(Arc::new(HashingEmbedder::new(16)), index);
        let a = doc(&h, "a.md", "Some text.");

        let summary = h.coordinator.ingest(vec![a]).await;
        assert_eq!(summary.failed.len(), 1);
        assert!(matches!(
            summary.failed[0].error,
            IndexError::DimensionMismatch {
                expected: 8,
                actual: 16
            }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_batch_starts_nothing() {
        let h = harness();
        let docs: Vec<_> = (0..5)
            .map(|i| doc(&h, &format!("d{}.md", i), "text"))
            .collect();
        h.coordinator.cancel_token().cancel();

        let summary = h.coordinator.ingest(docs).await;
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.cancelled, 5);
        assert_eq!(h.index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_and_prune() {
        let h = harness();
        let a = doc(&h, "a.md", "Alpha.");
        let b = doc(&h, "b.md", "Beta.");
        h.coordinator.ingest(vec![a.clone(), b]).await;

        let removed = h.coordinator.prune(&[a]).await.unwrap();
        assert_eq!(removed, vec!["b.md".to_string()]);
        assert_eq!(h.index.unique_sources().await.unwrap(), vec!["a.md".to_string()]);
        assert!(h.coordinator.tracker().record("b.md").await.unwrap().is_none());

        assert_eq!(h.coordinator.remove_document("missing.md").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_document_has_zero_chunks() {
        let h = harness();
        let a = doc(&h, "a.md", "Now with words.");
        h.coordinator.ingest(vec![a.clone()]).await;
        assert_eq!(h.index.count().await.unwrap(), 1);

        h.loader.insert("/docs/a.md", "   \n");
        let summary = h.coordinator.ingest(vec![a]).await;
        assert_eq!(summary.processed, 1);
        assert!(summary.inconsistencies.is_empty());
        assert_eq!(h.index.count().await.unwrap(), 0);
        let record = h.coordinator.tracker().record("a.md").await.unwrap().unwrap();
        assert_eq!(record.chunk_count, 0);
    }

    #[tokio::test]
    async fn test_embedding_calls_respect_inflight_limit() {
        let embedder = Arc::new(CountingEmbedder {
            inner: HashingEmbedder::new(16),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let settings = CoordinatorSettings {
            concurrency: 8,
            max_inflight_embeddings: 2,
            ..test_settings()
        };
        let h = build(
            embedder.clone(),
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(MemoryRecordStore::new()),
            settings,
        );
        let docs: Vec<_> = (0..8)
            .map(|i| doc(&h, &format!("d{}.md", i), &format!("Document number {}.", i)))
            .collect();

        let summary = h.coordinator.ingest(docs).await;
        assert_eq!(summary.processed, 8);
        let peak = embedder.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 2, "peak concurrent embeds: {}", peak);
    }

    #[tokio::test]
    async fn test_embed_timeout_fails_only_that_document() {
        let settings = CoordinatorSettings {
            embed_timeout: Duration::from_millis(50),
            ..test_settings()
        };
        let h = build(
            Arc::new(SlowEmbedder {
                inner: HashingEmbedder::new(16),
            }),
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(MemoryRecordStore::new()),
            settings,
        );
        let docs = vec![
            doc(&h, "a.md", "Quick alpha."),
            doc(&h, "b.md", "A slow document."),
            doc(&h, "c.md", "Quick gamma."),
        ];

        let summary = h.coordinator.ingest(docs).await;
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].source_id, "b.md");
        assert!(matches!(
            summary.failed[0].error,
            IndexError::Timeout {
                operation: "embed",
                ..
            }
        ));
        assert!(h.coordinator.tracker().record("b.md").await.unwrap().is_none());
        assert_eq!(
            h.index.unique_sources().await.unwrap(),
            vec!["a.md".to_string(), "c.md".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_mark_clears_stale_record() {
        let records = Arc::new(FlakyRecordStore {
            inner: MemoryRecordStore::new(),
            sets: AtomicUsize::new(0),
            fail_on: 2,
        });
        let settings = CoordinatorSettings {
            storage_retries: 0,
            ..test_settings()
        };
        let h = build(
            Arc::new(HashingEmbedder::new(16)),
            Arc::new(InMemoryVectorIndex::new()),
            records,
            settings,
        );
        let long = "First paragraph with enough words to fill a chunk.\n\n\
                    Second paragraph with enough words to fill a chunk.\n\n\
                    Third paragraph with enough words to fill a chunk.";
        let a = doc(&h, "a.md", long);

        let first = h.coordinator.ingest(vec![a.clone()]).await;
        assert_eq!(first.processed, 1);
        let before = h.coordinator.tracker().record("a.md").await.unwrap().unwrap();
        assert!(before.chunk_count >= 2, "got {} chunks", before.chunk_count);

        h.loader.insert("/docs/a.md", "Short now.");
        let second = h.coordinator.ingest(vec![a.clone()]).await;
        assert_eq!(second.processed, 0);
        assert_eq!(second.failed.len(), 1);
        assert!(matches!(second.failed[0].error, IndexError::Storage { .. }));
        assert!(h.coordinator.tracker().record("a.md").await.unwrap().is_none());
        assert_eq!(h.index.count().await.unwrap(), 1);

        // Still pending, and the next pass records the new chunk count.
        let third = h.coordinator.ingest(vec![a]).await;
        assert_eq!(third.processed, 1);
        assert!(third.inconsistencies.is_empty());
        let after = h.coordinator.tracker().record("a.md").await.unwrap().unwrap();
        assert_eq!(after.chunk_count, 1);
    }

    #[tokio::test]
    async fn test_corrupt_data_is_not_retried() {
        let h = harness();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let err = h
            .coordinator
            .with_storage("write", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IndexError::Corrupt("chunk c0 has an empty vector".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Corrupt(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        calls.store(0, Ordering::SeqCst);
        let err = h
            .coordinator
            .with_storage("write", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IndexError::storage_msg("database is locked"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Storage { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_source_locks_are_released() {
        let h = harness();
        let docs: Vec<_> = (0..4)
            .map(|i| doc(&h, &format!("d{}.md", i), "Some text."))
            .collect();

        h.coordinator.ingest(docs).await;
        h.coordinator.remove_document("d0.md").await.unwrap();
        assert!(h.coordinator.source_locks.lock().unwrap().is_empty());
    }
}
