//! Core data models used throughout the index.
//!
//! These types represent the documents, chunks, processing records and
//! stored vector records that flow through the ingestion and retrieval
//! pipeline.
//!
//! Metadata is a closed set of scalar kinds ([`MetadataValue`]). Loosely
//! typed input (YAML frontmatter, JSON) is flattened with
//! [`flatten_metadata`] before it can reach a vector store: lists become
//! delimited strings and nested objects are stringified.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{IndexError, Result};

/// Well-known metadata keys.
pub mod keys {
    pub const TITLE: &str = "title";
    pub const TAGS: &str = "tags";
    pub const CATEGORY: &str = "category";
    pub const CREATED_AT: &str = "created_at";
    pub const UPDATED_AT: &str = "updated_at";
    pub const AUTHOR: &str = "author";
    pub const SOURCE_URL: &str = "source_url";
    pub const QUALITY_SCORE: &str = "quality_score";
    pub const SOURCE_ID: &str = "source_id";
    pub const PATH: &str = "path";
    pub const ORDINAL: &str = "ordinal";
    pub const TOTAL_CHUNKS: &str = "total_chunks";
    pub const CHUNK_HASH: &str = "chunk_hash";
    pub const CONTENT_HASH: &str = "content_hash";
}

/// Separator used when a list is flattened into a single string.
pub const LIST_SEPARATOR: &str = ", ";

/// A scalar metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view; numeric strings are parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Str(s) => s.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }

    /// Items of a flattened list value.
    pub fn list_items(&self) -> Vec<String> {
        match self {
            Self::Str(s) => s
                .split(LIST_SEPARATOR.trim())
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            other => vec![other.to_string()],
        }
    }

    /// Convert a JSON value that must already be scalar.
    ///
    /// Returns `Ok(None)` for `null`, and [`IndexError::NonScalarMetadata`]
    /// for arrays and objects.
    pub fn from_json(key: &str, value: &serde_json::Value) -> Result<Option<Self>> {
        use serde_json::Value;
        match value {
            Value::Null => Ok(None),
            Value::Bool(b) => Ok(Some(Self::Bool(*b))),
            Value::Number(n) => Ok(Some(match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            })),
            Value::String(s) => Ok(Some(Self::Str(s.clone()))),
            Value::Array(_) | Value::Object(_) => Err(IndexError::NonScalarMetadata {
                key: key.to_string(),
            }),
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Scalar-only metadata map. Ordered so serialization is deterministic.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Flatten loosely typed JSON into scalar metadata.
///
/// - scalars pass through, `null` is dropped
/// - arrays become [`LIST_SEPARATOR`]-joined strings (non-scalar items are
///   stringified as compact JSON)
/// - objects are stringified as compact JSON
pub fn flatten_metadata(map: &serde_json::Map<String, serde_json::Value>) -> Metadata {
    use serde_json::Value;

    let mut out = Metadata::new();
    for (key, value) in map {
        let flat = match value {
            Value::Null => None,
            Value::Array(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .filter(|v| !v.is_null())
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        Value::Bool(_) | Value::Number(_) => v.to_string(),
                        other => other.to_string(),
                    })
                    .collect();
                Some(MetadataValue::Str(parts.join(LIST_SEPARATOR)))
            }
            Value::Object(_) => Some(MetadataValue::Str(value.to_string())),
            scalar => MetadataValue::from_json(key, scalar).ok().flatten(),
        };
        if let Some(v) = flat {
            out.insert(key.clone(), v);
        }
    }
    out
}

/// SHA-256 hex digest of a text.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lowercased alphanumeric tokens of a text.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// A document as read from its source, ready for chunking.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Stable id derived from the document path.
    pub source_id: String,
    pub path: PathBuf,
    /// Body text with any frontmatter removed.
    pub content: String,
    /// Flattened frontmatter metadata.
    pub metadata: Metadata,
    pub content_hash: String,
}

impl SourceDocument {
    pub fn new(source_id: String, path: PathBuf, content: String, metadata: Metadata) -> Self {
        let content_hash = hash_text(&content);
        Self {
            source_id,
            path,
            content,
            metadata,
            content_hash,
        }
    }

    /// Override the hash, e.g. with one taken over the raw file including
    /// frontmatter so metadata-only edits are detected too.
    pub fn with_content_hash(mut self, content_hash: String) -> Self {
        self.content_hash = content_hash;
        self
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata.get(keys::TITLE).and_then(|v| v.as_str())
    }
}

/// A chunk of a document's text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: String,
    pub source_id: String,
    pub ordinal: usize,
    pub total_chunks: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    /// Document metadata plus chunk position fields.
    pub metadata: Metadata,
    /// Populated after embedding.
    pub vector: Option<Vec<f32>>,
}

/// Proof that a source's stored chunks were produced from a given version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub source_id: String,
    /// Revision current at processing time, if a revision source was available.
    pub last_processed_revision: Option<String>,
    pub content_hash: String,
    pub processed_at: DateTime<Utc>,
    pub chunk_count: usize,
}

/// A row in the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub source_id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: Metadata,
}

impl ChunkRecord {
    /// Build a record from an embedded chunk. Fails if the chunk has no vector.
    pub fn from_chunk(chunk: Chunk) -> Result<Self> {
        let vector = chunk.vector.ok_or_else(|| {
            IndexError::Embedding(anyhow::anyhow!(
                "chunk {} of '{}' has no vector",
                chunk.ordinal,
                chunk.source_id
            ))
        })?;
        Ok(Self {
            chunk_id: chunk.chunk_id,
            source_id: chunk.source_id,
            vector,
            text: chunk.text,
            metadata: chunk.metadata,
        })
    }

    pub fn ordinal(&self) -> Option<usize> {
        match self.metadata.get(keys::ORDINAL) {
            Some(MetadataValue::Int(i)) if *i >= 0 => Some(*i as usize),
            _ => None,
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata.get(keys::TITLE).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_lists_and_objects() {
        let value = json!({
            "title": "Notes",
            "tags": ["ml", "rust", 3],
            "author": { "name": "Ada" },
            "draft": false,
            "score": 7,
            "weight": 0.5,
            "missing": null
        });
        let flat = flatten_metadata(value.as_object().unwrap());

        assert_eq!(flat.get("title"), Some(&MetadataValue::Str("Notes".into())));
        assert_eq!(
            flat.get("tags"),
            Some(&MetadataValue::Str("ml, rust, 3".into()))
        );
        assert_eq!(
            flat.get("author"),
            Some(&MetadataValue::Str(r#"{"name":"Ada"}"#.into()))
        );
        assert_eq!(flat.get("draft"), Some(&MetadataValue::Bool(false)));
        assert_eq!(flat.get("score"), Some(&MetadataValue::Int(7)));
        assert_eq!(flat.get("weight"), Some(&MetadataValue::Float(0.5)));
        assert!(!flat.contains_key("missing"));
    }

    #[test]
    fn test_from_json_rejects_non_scalar() {
        let err = MetadataValue::from_json("tags", &json!(["a"])).unwrap_err();
        assert!(matches!(err, IndexError::NonScalarMetadata { key } if key == "tags"));
        assert!(MetadataValue::from_json("obj", &json!({"a": 1})).is_err());
        assert_eq!(MetadataValue::from_json("n", &json!(null)).unwrap(), None);
    }

    #[test]
    fn test_list_items() {
        let v = MetadataValue::Str("ml, rust,  search".into());
        assert_eq!(v.list_items(), vec!["ml", "rust", "search"]);
    }

    #[test]
    fn test_as_f64_parses_strings() {
        assert_eq!(MetadataValue::Str(" 7.5 ".into()).as_f64(), Some(7.5));
        assert_eq!(MetadataValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(MetadataValue::Bool(true).as_f64(), None);
    }

    #[test]
    fn test_metadata_serde_untagged() {
        let mut m = Metadata::new();
        m.insert("a".into(), MetadataValue::Int(1));
        m.insert("b".into(), MetadataValue::Str("x".into()));
        m.insert("c".into(), MetadataValue::Float(1.5));
        m.insert("d".into(), MetadataValue::Bool(true));
        let s = serde_json::to_string(&m).unwrap();
        assert_eq!(s, r#"{"a":1,"b":"x","c":1.5,"d":true}"#);
        let back: Metadata = serde_json::from_str(&s).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Machine-Learning, in 2024: GPUs!"),
            vec!["machine", "learning", "in", "2024", "gpus"]
        );
        assert!(tokenize(" .,; ").is_empty());
    }

    #[test]
    fn test_document_hash_is_content_hash() {
        let doc = SourceDocument::new(
            "a.md".into(),
            PathBuf::from("/docs/a.md"),
            "hello".into(),
            Metadata::new(),
        );
        assert_eq!(doc.content_hash, hash_text("hello"));
        assert_eq!(doc.content_hash.len(), 64);
    }
}
