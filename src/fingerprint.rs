//! Processing records and change detection.
//!
//! A [`ProcessingRecord`] says "the chunks stored for this source were built
//! from this content at this revision". The [`FingerprintTracker`] compares
//! candidates against their records and returns the ones that need work.
//!
//! # Classification
//!
//! | Situation | Result |
//! |-----------|--------|
//! | no record | unprocessed |
//! | path in `changed_files(record.revision, current)` | unprocessed |
//! | path uncommitted, or record has no revision, or diff failed | compare content hash |
//! | otherwise | up to date |
//!
//! Missing a changed document is never acceptable; reprocessing an unchanged
//! one is. So every uncertainty resolves to a hash comparison, and a
//! document that cannot be loaded for that comparison counts as changed.
//!
//! # Stores
//!
//! Records live behind the [`RecordStore`] trait. [`MemoryRecordStore`] is
//! for tests; [`JsonRecordStore`] keeps a single JSON file written with a
//! temp-file-and-rename swap. An unreadable or corrupt file is treated as an
//! empty store, which makes the next ingest reprocess everything.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::error::IndexError;
use crate::loader::{Candidate, DocumentLoader};
use crate::models::ProcessingRecord;
use crate::revision::RevisionSource;

/// Keyed persistence for processing records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, source_id: &str) -> Result<Option<ProcessingRecord>>;
    /// Insert or replace the record for `record.source_id`.
    async fn set(&self, record: ProcessingRecord) -> Result<()>;
    /// Returns whether a record was removed.
    async fn delete(&self, source_id: &str) -> Result<bool>;
    async fn all(&self) -> Result<Vec<ProcessingRecord>>;
}

// ============ Memory store ============

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<String, ProcessingRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("record store lock poisoned")
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, source_id: &str) -> Result<Option<ProcessingRecord>> {
        Ok(self.records.read().map_err(poisoned)?.get(source_id).cloned())
    }

    async fn set(&self, record: ProcessingRecord) -> Result<()> {
        self.records
            .write()
            .map_err(poisoned)?
            .insert(record.source_id.clone(), record);
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<bool> {
        Ok(self
            .records
            .write()
            .map_err(poisoned)?
            .remove(source_id)
            .is_some())
    }

    async fn all(&self) -> Result<Vec<ProcessingRecord>> {
        Ok(self.records.read().map_err(poisoned)?.values().cloned().collect())
    }
}

// ============ JSON file store ============

/// Records persisted as `{source_id: record}` in one JSON file.
///
/// The file is read once, on first access. Every mutation rewrites it
/// atomically while holding the store's lock, so concurrent updates to
/// different keys are serialized.
pub struct JsonRecordStore {
    path: PathBuf,
    state: tokio::sync::Mutex<Option<BTreeMap<String, ProcessingRecord>>>,
}

impl JsonRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(path: &Path) -> BTreeMap<String, ProcessingRecord> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "record store unreadable; treating as empty");
                return BTreeMap::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "record store corrupt; treating as empty");
                BTreeMap::new()
            }
        }
    }

    async fn persist(&self, records: &BTreeMap<String, ProcessingRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create directory {}", parent.display())
                })?;
            }
        }

        let json = serde_json::to_string_pretty(records)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn get(&self, source_id: &str) -> Result<Option<ProcessingRecord>> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(Self::read_file(&self.path).await);
        }
        Ok(state.as_ref().and_then(|m| m.get(source_id).cloned()))
    }

    async fn set(&self, record: ProcessingRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut records = match state.take() {
            Some(records) => records,
            None => Self::read_file(&self.path).await,
        };
        let previous = records.insert(record.source_id.clone(), record.clone());

        let result = self.persist(&records).await;
        if result.is_err() {
            // Keep memory in line with the file.
            match previous {
                Some(prev) => records.insert(record.source_id.clone(), prev),
                None => records.remove(&record.source_id),
            };
        }
        *state = Some(records);
        result
    }

    async fn delete(&self, source_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let mut records = match state.take() {
            Some(records) => records,
            None => Self::read_file(&self.path).await,
        };

        let removed = records.remove(source_id);
        let result = match &removed {
            Some(_) => self.persist(&records).await,
            None => Ok(()),
        };
        if result.is_err() {
            if let Some(prev) = removed.clone() {
                records.insert(source_id.to_string(), prev);
            }
        }
        *state = Some(records);
        result.map(|_| removed.is_some())
    }

    async fn all(&self) -> Result<Vec<ProcessingRecord>> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(Self::read_file(&self.path).await);
        }
        Ok(state
            .as_ref()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }
}

// ============ Tracker ============

/// Revision state captured at the start of an ingest pass.
#[derive(Debug, Clone, Default)]
pub struct RevisionSnapshot {
    /// `None` when no revision source is configured or it failed.
    pub current: Option<String>,
    /// Source ids under version control at `current`.
    pub tracked: HashSet<String>,
    /// Source ids with uncommitted changes.
    pub uncommitted: HashSet<String>,
}

impl RevisionSnapshot {
    /// Whether revision diffs can be trusted for this source.
    ///
    /// Untracked and ignored files never show up in a diff, and uncommitted
    /// content does not belong to any revision.
    pub fn covers(&self, source_id: &str) -> bool {
        self.current.is_some()
            && self.tracked.contains(source_id)
            && !self.uncommitted.contains(source_id)
    }

    /// Revision to record for a document processed under this snapshot.
    /// Sources the revision history does not cover carry none and are
    /// always hash-checked.
    pub fn revision_for(&self, source_id: &str) -> Option<String> {
        if self.covers(source_id) {
            self.current.clone()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSummary {
    /// Candidates whose record matches their current content.
    pub processed_count: usize,
    /// Candidates that need (re)processing.
    pub pending_count: usize,
}

pub struct FingerprintTracker {
    store: Arc<dyn RecordStore>,
    revisions: Option<Arc<dyn RevisionSource>>,
}

impl FingerprintTracker {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            revisions: None,
        }
    }

    pub fn with_revisions(mut self, revisions: Arc<dyn RevisionSource>) -> Self {
        self.revisions = Some(revisions);
        self
    }

    /// Capture the current revision and the uncommitted set.
    ///
    /// Any revision failure yields an empty snapshot, which sends every
    /// document through hash comparison.
    pub async fn snapshot(&self) -> RevisionSnapshot {
        let Some(revisions) = &self.revisions else {
            return RevisionSnapshot::default();
        };

        let current = match revisions.current_revision().await {
            Ok(rev) => rev,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "revision unavailable; falling back to content hashes");
                return RevisionSnapshot::default();
            }
        };

        let tracked = match revisions.tracked_files().await {
            Ok(files) => files.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "cannot list tracked files; falling back to content hashes");
                return RevisionSnapshot::default();
            }
        };

        match revisions.uncommitted_files().await {
            Ok(files) => RevisionSnapshot {
                current: Some(current),
                tracked,
                uncommitted: files.into_iter().collect(),
            },
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "cannot list uncommitted files; falling back to content hashes");
                RevisionSnapshot::default()
            }
        }
    }

    /// All records, or an empty map if the store fails.
    async fn load_records(&self) -> HashMap<String, ProcessingRecord> {
        match self.store.all().await {
            Ok(records) => records
                .into_iter()
                .map(|r| (r.source_id.clone(), r))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "record store failed; treating as empty");
                HashMap::new()
            }
        }
    }

    /// Candidates that have no record or whose content may have changed.
    pub async fn unprocessed(
        &self,
        candidates: &[Candidate],
        loader: &dyn DocumentLoader,
    ) -> Vec<Candidate> {
        let snapshot = self.snapshot().await;
        self.unprocessed_at(&snapshot, candidates, loader).await
    }

    /// [`unprocessed`](Self::unprocessed) against an existing snapshot.
    pub async fn unprocessed_at(
        &self,
        snapshot: &RevisionSnapshot,
        candidates: &[Candidate],
        loader: &dyn DocumentLoader,
    ) -> Vec<Candidate> {
        let records = self.load_records().await;
        let diffs = self.diffs_since(snapshot, records.values()).await;

        let mut out = Vec::new();
        for candidate in candidates {
            let Some(record) = records.get(&candidate.source_id) else {
                out.push(candidate.clone());
                continue;
            };

            let committed_diff = match &record.last_processed_revision {
                Some(rev) if snapshot.covers(&candidate.source_id) => {
                    diffs.get(rev).and_then(|d| d.as_ref())
                }
                _ => None,
            };

            let changed = match committed_diff {
                Some(changed_files) => changed_files.contains(&candidate.source_id),
                None => self.content_changed(candidate, record, loader).await,
            };

            if changed {
                out.push(candidate.clone());
            }
        }
        out
    }

    /// `changed_files(rev, current)` for each distinct record revision.
    /// `None` marks a revision whose diff could not be computed.
    async fn diffs_since<'a, I>(
        &self,
        snapshot: &RevisionSnapshot,
        records: I,
    ) -> HashMap<String, Option<HashSet<String>>>
    where
        I: Iterator<Item = &'a ProcessingRecord>,
    {
        let mut diffs = HashMap::new();
        let (Some(revisions), Some(current)) = (&self.revisions, &snapshot.current) else {
            return diffs;
        };

        let revs: HashSet<&String> = records
            .filter_map(|r| r.last_processed_revision.as_ref())
            .collect();

        for rev in revs {
            let diff = match revisions.changed_files(rev, current).await {
                Ok(files) => Some(files.into_iter().collect()),
                Err(e) => {
                    tracing::warn!(from = %rev, to = %current, error = %format!("{:#}", e), "revision diff failed; comparing content hashes");
                    None
                }
            };
            diffs.insert(rev.clone(), diff);
        }
        diffs
    }

    async fn content_changed(
        &self,
        candidate: &Candidate,
        record: &ProcessingRecord,
        loader: &dyn DocumentLoader,
    ) -> bool {
        match loader.load(&candidate.path).await {
            Ok(doc) => doc.content_hash != record.content_hash,
            Err(e) => {
                tracing::debug!(source_id = %candidate.source_id, error = %format!("{:#}", e), "load failed during hash check");
                true
            }
        }
    }

    /// Upsert a record. Idempotent.
    pub async fn mark_processed(&self, record: ProcessingRecord) -> crate::error::Result<()> {
        self.store
            .set(record)
            .await
            .map_err(IndexError::storage_any)
    }

    /// Remove a record. Returns whether one existed.
    pub async fn unmark(&self, source_id: &str) -> crate::error::Result<bool> {
        self.store
            .delete(source_id)
            .await
            .map_err(IndexError::storage_any)
    }

    pub async fn record(&self, source_id: &str) -> crate::error::Result<Option<ProcessingRecord>> {
        self.store
            .get(source_id)
            .await
            .map_err(IndexError::storage_any)
    }

    pub async fn records(&self) -> crate::error::Result<Vec<ProcessingRecord>> {
        self.store.all().await.map_err(IndexError::storage_any)
    }

    pub async fn summary(
        &self,
        candidates: &[Candidate],
        loader: &dyn DocumentLoader,
    ) -> TrackerSummary {
        let pending = self.unprocessed(candidates, loader).await.len();
        TrackerSummary {
            processed_count: candidates.len() - pending,
            pending_count: pending,
        }
    }
}
