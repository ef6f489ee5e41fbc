// Integration tests for the content-hash gate in front of document writes.

use async_trait::async_trait;
use relay_core::credentials::Platform;
use relay_core::sync::{
    digest, has_changed, object_key, upload_if_changed, DigestLookup, DocumentWriter,
    FsObjectStore, SyncStatus,
};
use serde_json::{json, Value};
use std::sync::Mutex;

/// Lookup that returns whatever digest the test last recorded.
#[derive(Default)]
struct RecordedDigest(Mutex<Option<String>>);

#[async_trait]
impl DigestLookup for RecordedDigest {
    async fn previous_digest(&self, _key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.0.lock().unwrap().clone())
    }
}

/// Writer that only counts invocations.
#[derive(Default)]
struct CountingWriter(Mutex<usize>);

#[async_trait]
impl DocumentWriter for CountingWriter {
    async fn write(&self, _key: &str, _document: &Value, _body: &[u8]) -> anyhow::Result<()> {
        *self.0.lock().unwrap() += 1;
        Ok(())
    }
}

#[tokio::test]
async fn key_order_does_not_trigger_rewrite() {
    let lookup = RecordedDigest::default();
    let writer = CountingWriter::default();

    let first = upload_if_changed(&json!({"a": 1, "b": 2}), "k", &lookup, &writer)
        .await
        .unwrap();
    assert_eq!(first.status, SyncStatus::Written);
    assert_eq!(*writer.0.lock().unwrap(), 1);

    *lookup.0.lock().unwrap() = Some(first.digest.clone());

    let second = upload_if_changed(&json!({"b": 2, "a": 1}), "k", &lookup, &writer)
        .await
        .unwrap();
    assert_eq!(second.status, SyncStatus::Skipped);
    assert_eq!(second.digest, first.digest);
    assert_eq!(*writer.0.lock().unwrap(), 1);
}

#[tokio::test]
async fn tenant_document_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsObjectStore::new(dir.path());
    let key = object_key("tenant-42", Platform::Shopify);
    let orders = json!({"orders": [{"id": 1, "total": "9.99"}], "shop": "shop.example"});

    assert!(has_changed(&orders, &key, &store).await.unwrap());

    let written = upload_if_changed(&orders, &key, &store, &store).await.unwrap();
    assert_eq!(written.status, SyncStatus::Written);
    assert!(dir.path().join("users/tenant-42/shopify/data.json").exists());

    assert!(!has_changed(&orders, &key, &store).await.unwrap());
    let skipped = upload_if_changed(&orders, &key, &store, &store).await.unwrap();
    assert_eq!(skipped.status, SyncStatus::Skipped);

    let updated = json!({"orders": [], "shop": "shop.example"});
    let rewritten = upload_if_changed(&updated, &key, &store, &store).await.unwrap();
    assert_eq!(rewritten.status, SyncStatus::Written);
    assert_eq!(rewritten.digest, digest(&updated));
    assert_eq!(store.read(&key).await.unwrap(), Some(updated));
}
