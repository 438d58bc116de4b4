//! Revision capability.
//!
//! The fingerprint tracker asks a [`RevisionSource`] which files changed
//! between the revision a document was processed at and the current one.
//! Any failure here is non-fatal: the tracker falls back to content-hash
//! comparison for the affected documents.
//!
//! [`GitRevisions`] implements the trait by shelling out to `git`. All paths
//! it reports are relative to the indexed root, using `/` separators, which
//! is the same form as a document's `source_id`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

#[async_trait]
pub trait RevisionSource: Send + Sync {
    /// Identifier of the current revision.
    async fn current_revision(&self) -> Result<String>;

    /// Paths changed between two revisions.
    async fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>>;

    /// Paths under version control at the current revision. Only these can
    /// appear in a diff; everything else is hash-checked.
    async fn tracked_files(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Paths that differ from the current revision without being committed
    /// (modified or untracked).
    async fn uncommitted_files(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Git-backed revision source rooted at the indexed directory.
#[derive(Debug, Clone)]
pub struct GitRevisions {
    root: PathBuf,
}

impl GitRevisions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns `Some` only if `root` is inside a git work tree and git is
    /// installed.
    pub async fn discover(root: &Path) -> Option<Self> {
        let source = Self::new(root);
        match source.git(&["rev-parse", "--is-inside-work-tree"]).await {
            Ok(out) if out.trim() == "true" => Some(source),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(root = %root.display(), error = %e, "not a git work tree");
                None
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .await
            .with_context(|| format!("Failed to execute 'git {}'", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Split `-z` output into paths.
fn split_nul(output: &str) -> Vec<String> {
    output
        .split('\0')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl RevisionSource for GitRevisions {
    async fn current_revision(&self) -> Result<String> {
        let sha = self.git(&["rev-parse", "HEAD"]).await?;
        Ok(sha.trim().to_string())
    }

    async fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>> {
        if from == to {
            return Ok(Vec::new());
        }
        let out = self
            .git(&["diff", "--name-only", "--relative", "--no-renames", "-z", from, to])
            .await?;
        Ok(split_nul(&out))
    }

    async fn tracked_files(&self) -> Result<Vec<String>> {
        Ok(split_nul(&self.git(&["ls-files", "-z"]).await?))
    }

    async fn uncommitted_files(&self) -> Result<Vec<String>> {
        // Staged and unstaged edits against HEAD, plus untracked files.
        let mut files = split_nul(
            &self
                .git(&["diff", "--name-only", "--relative", "--no-renames", "-z", "HEAD"])
                .await?,
        );
        files.extend(split_nul(
            &self
                .git(&["ls-files", "--modified", "--others", "--exclude-standard", "-z"])
                .await?,
        ));
        files.sort();
        files.dedup();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn git_available() -> bool {
        StdCommand::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn run(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap()
            .status;
        assert!(status.success(), "git {:?} failed", args);
    }

    fn init_repo(dir: &Path) {
        run(dir, &["init", "-q"]);
        run(dir, &["config", "user.email", "test@example.com"]);
        run(dir, &["config", "user.name", "Test"]);
        run(dir, &["config", "commit.gpgsign", "false"]);
    }

    #[test]
    fn test_split_nul() {
        assert_eq!(split_nul("a.md\0dir/b.md\0"), vec!["a.md", "dir/b.md"]);
        assert!(split_nul("").is_empty());
    }

    #[tokio::test]
    async fn test_git_changed_and_uncommitted_files() {
        if !git_available() {
            eprintln!("git not installed; skipping");
            return;
        }
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        init_repo(root);

        std::fs::create_dir_all(root.join("notes")).unwrap();
        std::fs::write(root.join("a.md"), "alpha").unwrap();
        std::fs::write(root.join("notes/b.md"), "beta").unwrap();
        run(root, &["add", "."]);
        run(root, &["commit", "-q", "-m", "first"]);

        let git = GitRevisions::discover(root).await.expect("work tree");
        let first = git.current_revision().await.unwrap();
        assert_eq!(first.len(), 40);

        std::fs::write(root.join("notes/b.md"), "beta v2").unwrap();
        run(root, &["commit", "-q", "-am", "second"]);
        let second = git.current_revision().await.unwrap();

        assert_eq!(
            git.changed_files(&first, &second).await.unwrap(),
            vec!["notes/b.md"]
        );
        assert!(git.changed_files(&second, &second).await.unwrap().is_empty());

        std::fs::write(root.join("a.md"), "alpha edited").unwrap();
        std::fs::write(root.join("c.md"), "new").unwrap();
        assert_eq!(git.uncommitted_files().await.unwrap(), vec!["a.md", "c.md"]);
    }

    #[tokio::test]
    async fn test_ignored_documents_stay_hash_checked() {
        use crate::fingerprint::{FingerprintTracker, MemoryRecordStore};
        use crate::loader::{scan, DocumentLoader, FsLoader};
        use crate::models::ProcessingRecord;
        use std::sync::Arc;

        if !git_available() {
            eprintln!("git not installed; skipping");
            return;
        }
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        init_repo(root);

        std::fs::create_dir_all(root.join("drafts")).unwrap();
        std::fs::write(root.join(".gitignore"), "drafts/\n").unwrap();
        std::fs::write(root.join("a.md"), "alpha").unwrap();
        std::fs::write(root.join("drafts/d.md"), "draft").unwrap();
        run(root, &["add", "."]);
        run(root, &["commit", "-q", "-m", "first"]);

        let git = GitRevisions::discover(root).await.expect("work tree");
        assert_eq!(git.tracked_files().await.unwrap(), vec![".gitignore", "a.md"]);

        let candidates = scan(root, &["**/*.md".to_string()], &[]).unwrap();
        let ids: Vec<_> = candidates.iter().map(|c| c.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a.md", "drafts/d.md"]);

        let tracker = FingerprintTracker::new(Arc::new(MemoryRecordStore::new()))
            .with_revisions(Arc::new(git));
        let snapshot = tracker.snapshot().await;
        assert!(snapshot.revision_for("a.md").is_some());
        assert_eq!(snapshot.revision_for("drafts/d.md"), None);

        for candidate in &candidates {
            let doc = FsLoader.load(&candidate.path).await.unwrap();
            tracker
                .mark_processed(ProcessingRecord {
                    source_id: candidate.source_id.clone(),
                    last_processed_revision: snapshot.revision_for(&candidate.source_id),
                    content_hash: doc.content_hash,
                    processed_at: chrono::Utc::now(),
                    chunk_count: 1,
                })
                .await
                .unwrap();
        }
        assert!(tracker.unprocessed(&candidates, &FsLoader).await.is_empty());

        std::fs::write(root.join("drafts/d.md"), "draft edited").unwrap();
        let pending = tracker.unprocessed(&candidates, &FsLoader).await;
        let ids: Vec<_> = pending.iter().map(|c| c.source_id.as_str()).collect();
        assert_eq!(ids, vec!["drafts/d.md"]);
    }

    #[tokio::test]
    async fn test_discover_outside_repo() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::TempDir::new().unwrap();
        // A temp dir may itself live inside a checkout; only assert when it
        // clearly does not.
        if StdCommand::new("git")
            .args(["rev-parse", "--is-inside-work-tree"])
            .current_dir(tmp.path())
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
        {
            return;
        }
        assert!(GitRevisions::discover(tmp.path()).await.is_none());
    }
}
