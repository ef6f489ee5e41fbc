//! Local filesystem mirror of the object store.
//!
//! Documents are kept under `<root>/<key>` (e.g.
//! `<root>/users/<tenant>/facebook/data.json`). Each write goes to its own
//! temporary file, is synced, and is renamed into place, so readers never see
//! a partial document.

use super::{digest, DigestLookup, DocumentWriter};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a storage key onto a path under `root`, refusing anything that
    /// could escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(anyhow!("invalid object key '{}'", key));
        }
        Ok(self.root.join(relative))
    }

    /// Reads the document stored at `key`, if any.
    pub async fn read(&self, key: &str) -> Result<Option<Value>> {
        let path = self.resolve(key)?;
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let value = serde_json::from_slice(&contents)
            .with_context(|| format!("Stored document at {} is not valid JSON", path.display()))?;
        Ok(Some(value))
    }
}

#[async_trait]
impl DigestLookup for FsObjectStore {
    async fn previous_digest(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read(key).await?.map(|value| digest(&value)))
    }
}

#[async_trait]
impl DocumentWriter for FsObjectStore {
    async fn write(&self, key: &str, _document: &Value, body: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        // Each write stages into its own temp file beside the target, so
        // concurrent writers to one key never share a staging path
        let staged_body = body.to_vec();
        let target = path.clone();
        tokio::task::spawn_blocking(move || persist_atomically(&target, &staged_body))
            .await
            .context("Document write task failed")??;

        debug!(key, bytes = body.len(), "Document written to local store");
        Ok(())
    }
}

/// Writes `body` to a fresh temp file in `path`'s directory, syncs it, then
/// renames it over `path`.
fn persist_atomically(path: &Path, body: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("object path {} has no parent", path.display()))?;

    let mut staged = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    staged
        .write_all(body)
        .with_context(|| format!("Failed to write {}", staged.path().display()))?;
    staged
        .as_file()
        .sync_all()
        .with_context(|| format!("Failed to sync {}", staged.path().display()))?;
    staged
        .persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move document into {}", path.display()))?;
    Ok(())
}
