//! Document loading and discovery.
//!
//! A [`DocumentLoader`] turns a path into text plus flattened metadata.
//! Parsing beyond plain text is out of scope: a leading YAML frontmatter
//! block is the only structure recognised.
//!
//! ```text
//! ---
//! title: Gradient descent
//! tags: [ml, optimisation]
//! created_at: 2024-03-01
//! ---
//! # Gradient descent
//! ...
//! ```
//!
//! When no `title` is given, the first `# ` heading is used, else the file
//! stem. The content hash covers the raw file, frontmatter included, so a
//! metadata-only edit still marks the document as changed.
//!
//! [`scan`] walks a root directory with include/exclude globs. `.git`,
//! `target` and `node_modules` are always excluded.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::models::{flatten_metadata, hash_text, keys, Metadata, MetadataValue, SourceDocument};

/// A document path together with its stable id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Candidate {
    /// Path relative to the indexed root, `/`-separated.
    pub source_id: String,
    pub path: PathBuf,
}

impl Candidate {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }

    /// Build a candidate for `path`, which may be relative to `root` or an
    /// absolute path under it.
    pub fn from_path(root: &Path, path: &Path) -> Result<Self> {
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };

        let relative = match full.strip_prefix(root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => {
                let root_c = root
                    .canonicalize()
                    .with_context(|| format!("Failed to resolve root {}", root.display()))?;
                let full_c = full
                    .canonicalize()
                    .with_context(|| format!("Failed to resolve {}", full.display()))?;
                match full_c.strip_prefix(&root_c) {
                    Ok(rel) => rel.to_path_buf(),
                    Err(_) => bail!("{} is not under {}", path.display(), root.display()),
                }
            }
        };

        let source_id = source_id_for(&relative);
        if source_id.is_empty() {
            bail!("{} does not name a document", path.display());
        }
        Ok(Self {
            source_id,
            path: full,
        })
    }
}

/// `/`-joined normal components of a relative path.
pub fn source_id_for(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Text and metadata produced by a loader.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    /// Body with frontmatter removed.
    pub text: String,
    pub metadata: Metadata,
    /// SHA-256 of the raw input.
    pub content_hash: String,
}

impl LoadedDocument {
    pub fn into_source_document(self, candidate: &Candidate) -> SourceDocument {
        SourceDocument::new(
            candidate.source_id.clone(),
            candidate.path.clone(),
            self.text,
            self.metadata,
        )
        .with_content_hash(self.content_hash)
    }
}

#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn load(&self, path: &Path) -> Result<LoadedDocument>;
}

/// Reads UTF-8 files from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsLoader;

#[async_trait]
impl DocumentLoader for FsLoader {
    async fn load(&self, path: &Path) -> Result<LoadedDocument> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        parse_document(&raw, path)
    }
}

/// Loader over an in-memory map of path to raw text.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    files: RwLock<HashMap<PathBuf, String>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, raw: impl Into<String>) {
        if let Ok(mut files) = self.files.write() {
            files.insert(path.into(), raw.into());
        }
    }

    pub fn remove(&self, path: &Path) {
        if let Ok(mut files) = self.files.write() {
            files.remove(path);
        }
    }
}

#[async_trait]
impl DocumentLoader for MemoryLoader {
    async fn load(&self, path: &Path) -> Result<LoadedDocument> {
        let raw = {
            let files = self
                .files
                .read()
                .map_err(|_| anyhow::anyhow!("memory loader lock poisoned"))?;
            files
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("No such document: {}", path.display()))?
        };
        parse_document(&raw, path)
    }
}

/// Split frontmatter from body and build metadata.
pub fn parse_document(raw: &str, path: &Path) -> Result<LoadedDocument> {
    let (frontmatter, body) = split_frontmatter(raw);

    let mut metadata = match frontmatter {
        Some(yaml) => parse_frontmatter(yaml)
            .with_context(|| format!("Invalid frontmatter in {}", path.display()))?,
        None => Metadata::new(),
    };

    if !metadata.contains_key(keys::TITLE) {
        let title = first_heading(body).map(str::to_string).or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
        });
        if let Some(title) = title {
            metadata.insert(keys::TITLE.into(), MetadataValue::Str(title));
        }
    }

    Ok(LoadedDocument {
        text: body.to_string(),
        metadata,
        content_hash: hash_text(raw),
    })
}

/// Returns `(Some(yaml), body)` when `raw` opens with a `---` line that is
/// later closed by `---` or `...`.
fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    let rest = match raw
        .strip_prefix("---\n")
        .or_else(|| raw.strip_prefix("---\r\n"))
    {
        Some(rest) => rest,
        None => return (None, raw),
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "---" || trimmed == "..." {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(yaml), body);
        }
        offset += line.len();
    }
    (None, raw)
}

fn parse_frontmatter(yaml: &str) -> Result<Metadata> {
    let value: serde_json::Value = serde_yaml::from_str(yaml)?;
    match value {
        serde_json::Value::Object(map) => Ok(flatten_metadata(&map)),
        serde_json::Value::Null => Ok(Metadata::new()),
        _ => bail!("frontmatter must be a mapping"),
    }
}

fn first_heading(body: &str) -> Option<&str> {
    body.lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Find candidate documents under `root`.
///
/// Globs match the `/`-separated path relative to `root`. Results are sorted
/// by `source_id`.
pub fn scan(root: &Path, include_globs: &[String], exclude_globs: &[String]) -> Result<Vec<Candidate>> {
    if !root.exists() {
        bail!("Document root does not exist: {}", root.display());
    }

    let include_set = build_globset(include_globs)?;

    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut candidates = Vec::new();

    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let source_id = source_id_for(relative);

        if exclude_set.is_match(&source_id) || !include_set.is_match(&source_id) {
            continue;
        }

        candidates.push(Candidate::new(source_id, path));
    }

    candidates.sort();
    Ok(candidates)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frontmatter_flattened() {
        let raw = "---\ntitle: Gradient descent\ntags: [ml, optimisation]\nquality_score: 8\ncreated_at: 2024-03-01\nauthor:\n  name: Ada\n---\nBody text.\n";
        let doc = parse_document(raw, Path::new("/docs/gd.md")).unwrap();

        assert_eq!(doc.text, "Body text.\n");
        assert_eq!(
            doc.metadata.get("title"),
            Some(&MetadataValue::Str("Gradient descent".into()))
        );
        assert_eq!(
            doc.metadata.get("tags"),
            Some(&MetadataValue::Str("ml, optimisation".into()))
        );
        assert_eq!(doc.metadata.get("quality_score"), Some(&MetadataValue::Int(8)));
        assert_eq!(
            doc.metadata.get("created_at"),
            Some(&MetadataValue::Str("2024-03-01".into()))
        );
        assert_eq!(
            doc.metadata.get("author"),
            Some(&MetadataValue::Str(r#"{"name":"Ada"}"#.into()))
        );
        assert_eq!(doc.content_hash, hash_text(raw));
    }

    #[test]
    fn test_title_defaults() {
        let doc = parse_document("intro\n# Real Title\ntext", Path::new("/d/x.md")).unwrap();
        assert_eq!(doc.metadata.get("title").unwrap().as_str(), Some("Real Title"));

        let doc = parse_document("no heading", Path::new("/d/notes-2024.md")).unwrap();
        assert_eq!(doc.metadata.get("title").unwrap().as_str(), Some("notes-2024"));
    }

    #[test]
    fn test_unterminated_frontmatter_is_body() {
        let raw = "---\ntitle: x\nno closing line";
        let (fm, body) = split_frontmatter(raw);
        assert!(fm.is_none());
        assert_eq!(body, raw);
    }

    #[test]
    fn test_invalid_frontmatter_fails() {
        assert!(parse_document("---\n- a\n- b\n---\nbody", Path::new("a.md")).is_err());
        assert!(parse_document("---\ntitle: [unclosed\n---\nbody", Path::new("a.md")).is_err());
    }

    #[test]
    fn test_metadata_edit_changes_hash() {
        let a = parse_document("---\ntags: [a]\n---\nbody", Path::new("a.md")).unwrap();
        let b = parse_document("---\ntags: [b]\n---\nbody", Path::new("a.md")).unwrap();
        assert_eq!(a.text, b.text);
        assert_ne!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_candidate_from_path() {
        let root = Path::new("/docs");
        let c = Candidate::from_path(root, Path::new("notes/a.md")).unwrap();
        assert_eq!(c.source_id, "notes/a.md");
        assert_eq!(c.path, PathBuf::from("/docs/notes/a.md"));

        let c = Candidate::from_path(root, Path::new("/docs/./b.md")).unwrap();
        assert_eq!(c.source_id, "b.md");
    }

    #[test]
    fn test_scan_applies_globs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("notes/drafts")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("a.md"), "a").unwrap();
        std::fs::write(root.join("notes/b.txt"), "b").unwrap();
        std::fs::write(root.join("notes/drafts/c.md"), "c").unwrap();
        std::fs::write(root.join("notes/image.png"), "png").unwrap();
        std::fs::write(root.join("node_modules/pkg/readme.md"), "x").unwrap();

        let found = scan(
            root,
            &["**/*.md".into(), "**/*.txt".into()],
            &["**/drafts/**".into()],
        )
        .unwrap();
        let ids: Vec<_> = found.iter().map(|c| c.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a.md", "notes/b.txt"]);
    }

    #[tokio::test]
    async fn test_memory_loader() {
        let loader = MemoryLoader::new();
        loader.insert("/m/a.md", "# A\nhello");
        let doc = loader.load(Path::new("/m/a.md")).await.unwrap();
        assert_eq!(doc.metadata.get("title").unwrap().as_str(), Some("A"));

        loader.remove(Path::new("/m/a.md"));
        assert!(loader.load(Path::new("/m/a.md")).await.is_err());
    }
}
