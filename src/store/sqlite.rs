//! SQLite-backed [`VectorIndex`] implementation.
//!
//! Schema:
//!
//! ```sql
//! chunks(chunk_id TEXT PRIMARY KEY, source_id TEXT, ordinal INTEGER,
//!        text TEXT, metadata_json TEXT, embedding BLOB)
//! collection(key TEXT PRIMARY KEY, value TEXT)   -- key 'dims'
//! ```
//!
//! Vectors are stored as little-endian f32 BLOBs (see
//! [`vec_to_blob`](crate::embedding::vec_to_blob)). Every write and delete runs
//! in a single transaction. Query is brute-force cosine similarity over the
//! rows matching the filter.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{IndexError, Result};
use crate::models::{ChunkRecord, Metadata};

use super::{
    check_query_dims, rank_hits, record_order, validate_batch, MetadataFilter, QueryHit,
    VectorIndex,
};

const DIMS_KEY: &str = "dims";

/// SQLite implementation of the [`VectorIndex`] trait.
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(IndexError::storage)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let index = Self { pool };
        index.migrate().await?;
        Ok(index)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                text TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collection (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source_id ON chunks(source_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_rows(&self, source_id: Option<&str>) -> Result<Vec<ChunkRecord>> {
        let rows = match source_id {
            Some(source_id) => {
                sqlx::query(
                    "SELECT chunk_id, source_id, text, metadata_json, embedding FROM chunks WHERE source_id = ?",
                )
                .bind(source_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT chunk_id, source_id, text, metadata_json, embedding FROM chunks")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: &SqliteRow) -> Result<ChunkRecord> {
    let metadata_json: String = row.try_get("metadata_json")?;
    let metadata: Metadata = serde_json::from_str(&metadata_json).map_err(|e| {
        IndexError::Corrupt(format!("metadata_json of a stored chunk does not parse: {}", e))
    })?;
    let blob: Vec<u8> = row.try_get("embedding")?;

    Ok(ChunkRecord {
        chunk_id: row.try_get("chunk_id")?,
        source_id: row.try_get("source_id")?,
        vector: blob_to_vec(&blob),
        text: row.try_get("text")?,
        metadata,
    })
}

async fn read_dims(tx: &mut Transaction<'_, Sqlite>) -> Result<Option<usize>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM collection WHERE key = ?")
        .bind(DIMS_KEY)
        .fetch_optional(&mut **tx)
        .await?;

    value
        .map(|v| {
            v.parse::<usize>()
                .map_err(|e| IndexError::Corrupt(format!("collection dims '{}': {}", v, e)))
        })
        .transpose()
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn write(&self, records: &[ChunkRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        let current = read_dims(&mut tx).await?;
        let dims = validate_batch(records, current)?;
        if current.is_none() {
            if let Some(d) = dims {
                sqlx::query("INSERT INTO collection (key, value) VALUES (?, ?)")
                    .bind(DIMS_KEY)
                    .bind(d.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for record in records {
            let metadata_json =
                serde_json::to_string(&record.metadata).map_err(IndexError::storage)?;
            let ordinal = record.ordinal().unwrap_or(0) as i64;

            sqlx::query(
                r#"
                INSERT INTO chunks (chunk_id, source_id, ordinal, text, metadata_json, embedding)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    source_id = excluded.source_id,
                    ordinal = excluded.ordinal,
                    text = excluded.text,
                    metadata_json = excluded.metadata_json,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&record.chunk_id)
            .bind(&record.source_id)
            .bind(ordinal)
            .bind(&record.text)
            .bind(&metadata_json)
            .bind(vec_to_blob(&record.vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_source(&self, source_id: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM chunks WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() as usize)
    }

    async fn filter(&self, filter: &MetadataFilter) -> Result<Vec<ChunkRecord>> {
        let mut out: Vec<ChunkRecord> = self
            .fetch_rows(filter.source_id.as_deref())
            .await?
            .into_iter()
            .filter(|r| filter.matches(r))
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
        check_query_dims(self.dims().await?, vector)?;

        let source_id = filter.and_then(|f| f.source_id.as_deref());
        let candidates = self
            .fetch_rows(source_id)
            .await?
            .into_iter()
            .filter(|r| filter.map(|f| f.matches(r)).unwrap_or(true));
        Ok(rank_hits(vector, candidates, k))
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn unique_sources(&self) -> Result<Vec<String>> {
        let sources: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT source_id FROM chunks ORDER BY source_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(sources)
    }

    async fn dims(&self) -> Result<Option<usize>> {
        let mut tx = self.pool.begin().await?;
        let dims = read_dims(&mut tx).await?;
        tx.commit().await?;
        Ok(dims)
    }
}
