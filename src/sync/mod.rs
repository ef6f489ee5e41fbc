//! Idempotent sync gate for outbound JSON documents.
//!
//! Before a derived document is persisted to the object store, its canonical
//! SHA-256 digest is compared with the digest of what is already stored under
//! the same key. Identical content (regardless of key order) is never written
//! twice.
//!
//! The gate does no retries: a failed write is reported to the caller, and
//! retrying is the writer's business.

mod canonical;
mod fs_store;

pub use canonical::{canonical_json, digest, digest_bytes};
pub use fs_store::FsObjectStore;

use crate::credentials::Platform;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, error, info};

/// Source of the digest of the document currently stored at a key.
#[async_trait]
pub trait DigestLookup: Send + Sync {
    /// `Ok(None)` when nothing is stored at `key`.
    async fn previous_digest(&self, key: &str) -> anyhow::Result<Option<String>>;
}

/// Object-store client that persists a document.
#[async_trait]
pub trait DocumentWriter: Send + Sync {
    /// `body` is the canonical serialization of `document`.
    async fn write(&self, key: &str, document: &Value, body: &[u8]) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Skipped,
    Written,
}

/// Result of [`upload_if_changed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub status: SyncStatus,
    pub digest: String,
    /// Size of the canonical serialization
    pub bytes: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to look up previous digest for '{key}': {source}")]
    Lookup {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to write '{key}' (digest {digest}, {bytes} bytes): {source}")]
    Write {
        key: String,
        digest: String,
        bytes: usize,
        #[source]
        source: anyhow::Error,
    },
}

/// Storage key of a tenant's document for one platform.
pub fn object_key(tenant_uuid: &str, platform: Platform) -> String {
    format!("users/{}/{}/data.json", tenant_uuid, platform.as_str())
}

/// Whether `candidate` differs from what is stored at `key`.
///
/// True when nothing is stored yet.
pub async fn has_changed(
    candidate: &Value,
    key: &str,
    lookup: &dyn DigestLookup,
) -> Result<bool, SyncError> {
    differs_from_stored(&digest(candidate), key, lookup).await
}

/// Writes `candidate` to `key` through `writer` only if its content changed.
pub async fn upload_if_changed(
    candidate: &Value,
    key: &str,
    lookup: &dyn DigestLookup,
    writer: &dyn DocumentWriter,
) -> Result<SyncOutcome, SyncError> {
    let body = canonical_json(candidate);
    let digest = digest_bytes(body.as_bytes());
    let bytes = body.len();

    if !differs_from_stored(&digest, key, lookup).await? {
        debug!(key, digest = %digest, "No changes detected, upload skipped");
        return Ok(SyncOutcome {
            status: SyncStatus::Skipped,
            digest,
            bytes,
        });
    }

    let start = Instant::now();
    if let Err(source) = writer.write(key, candidate, body.as_bytes()).await {
        error!(key, digest = %digest, bytes, error = %source, "Document upload failed");
        return Err(SyncError::Write {
            key: key.to_string(),
            digest,
            bytes,
            source,
        });
    }

    info!(
        key,
        digest = %digest,
        bytes,
        duration_ms = start.elapsed().as_millis() as u64,
        "Document uploaded"
    );

    Ok(SyncOutcome {
        status: SyncStatus::Written,
        digest,
        bytes,
    })
}

async fn differs_from_stored(
    digest: &str,
    key: &str,
    lookup: &dyn DigestLookup,
) -> Result<bool, SyncError> {
    let previous = lookup
        .previous_digest(key)
        .await
        .map_err(|source| SyncError::Lookup {
            key: key.to_string(),
            source,
        })?;

    // Object stores report ETags wrapped in quotes
    Ok(match previous {
        Some(previous) => !previous.trim_matches('"').eq_ignore_ascii_case(digest),
        None => true,
    })
}
