//! Snapshot persistence: the [`BlobStore`] trait, the snapshot record
//! shape, and an in-memory backend.
//!
//! Snapshots are pure cache. Losing one costs a longer replay, never
//! correctness, which is why absence is `Ok(None)` rather than an error
//! and why a snapshot whose upcaster checksum disagrees with the current
//! registry is simply ignored and rewritten.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SnapshotConfig;
use crate::error::Error;

/// Backend holding snapshot blobs keyed by string.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob. A missing key is `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Write a blob, replacing any existing value.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), Error>;

    /// Delete a blob. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// List all keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error>;
}

/// Cached aggregate state at a specific version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Version of the commit whose fold produced `state`.
    pub version: u64,
    /// The folded state, opaque to the store.
    pub state: serde_json::Value,
    /// `committed_at` of the head commit at snapshot time. Lets a
    /// time-bounded hydrate decide whether the snapshot is usable.
    pub head_commit_timestamp: DateTime<Utc>,
    /// Checksum of the upcaster configuration active when this snapshot
    /// was written. `None` when no upcasters were registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upcasters_checksum: Option<String>,
}

/// Blob key for one instance's snapshot: `{prefix}{type}_{key}`.
pub fn snapshot_key(config: &SnapshotConfig, aggregate_type: &str, aggregate_key: &str) -> String {
    format!("{}{}_{}", config.prefix, aggregate_type, aggregate_key)
}

/// Read and decode an instance's snapshot, if one exists.
///
/// # Errors
///
/// Propagates blob store failures; a stored blob that fails to parse is
/// [`Error::Codec`].
pub async fn read_snapshot(
    blobs: &dyn BlobStore,
    config: &SnapshotConfig,
    aggregate_type: &str,
    aggregate_key: &str,
) -> Result<Option<SnapshotRecord>, Error> {
    let key = snapshot_key(config, aggregate_type, aggregate_key);
    match blobs.get(&key).await? {
        None => Ok(None),
        Some(bytes) => {
            let record: SnapshotRecord = serde_json::from_slice(&bytes)?;
            Ok(Some(record))
        }
    }
}

/// Encode and write an instance's snapshot, replacing any existing one.
///
/// # Errors
///
/// Propagates blob store failures.
pub async fn write_snapshot(
    blobs: &dyn BlobStore,
    config: &SnapshotConfig,
    aggregate_type: &str,
    aggregate_key: &str,
    record: &SnapshotRecord,
) -> Result<(), Error> {
    let key = snapshot_key(config, aggregate_type, aggregate_key);
    let bytes = serde_json::to_vec(record)?;
    blobs.put(&key, bytes).await
}

/// In-memory [`BlobStore`] over a `BTreeMap`.
#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    /// Create an empty blob store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), Error> {
        self.lock().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.lock().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn config_with_prefix(prefix: &str) -> SnapshotConfig {
        SnapshotConfig {
            prefix: prefix.to_string(),
            ..SnapshotConfig::default()
        }
    }

    fn record(version: u64) -> SnapshotRecord {
        SnapshotRecord {
            version,
            state: json!({"items": ["a", "b"]}),
            head_commit_timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            upcasters_checksum: None,
        }
    }

    #[test]
    fn snapshot_key_is_prefix_type_underscore_key() {
        let config = config_with_prefix("snap/");
        assert_eq!(snapshot_key(&config, "Cart", "user-1"), "snap/Cart_user-1");
        assert_eq!(
            snapshot_key(&SnapshotConfig::default(), "Cart", "@"),
            "Cart_@"
        );
    }

    #[tokio::test]
    async fn missing_snapshot_reads_as_none() {
        let blobs = InMemoryBlobStore::new();
        let got = read_snapshot(&blobs, &SnapshotConfig::default(), "Cart", "u")
            .await
            .expect("read should succeed");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let blobs = InMemoryBlobStore::new();
        let config = config_with_prefix("s3-prefix/");
        let snap = SnapshotRecord {
            upcasters_checksum: Some("abc123".into()),
            ..record(42)
        };

        write_snapshot(&blobs, &config, "Cart", "u", &snap)
            .await
            .expect("write should succeed");
        let got = read_snapshot(&blobs, &config, "Cart", "u")
            .await
            .expect("read should succeed")
            .expect("snapshot should exist");
        assert_eq!(got, snap);
    }

    #[tokio::test]
    async fn rewrite_replaces_the_previous_snapshot() {
        let blobs = InMemoryBlobStore::new();
        let config = SnapshotConfig::default();
        write_snapshot(&blobs, &config, "Cart", "u", &record(10))
            .await
            .unwrap();
        write_snapshot(&blobs, &config, "Cart", "u", &record(20))
            .await
            .unwrap();

        let got = read_snapshot(&blobs, &config, "Cart", "u")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.version, 20);
    }

    #[test]
    fn checksum_absent_in_json_when_none() {
        let bytes = serde_json::to_vec(&record(1)).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(
            !text.contains("upcasters_checksum"),
            "checksum field should be omitted when None: {text}"
        );
    }

    #[tokio::test]
    async fn corrupt_blob_is_a_codec_error() {
        let blobs = InMemoryBlobStore::new();
        let config = SnapshotConfig::default();
        blobs
            .put(&snapshot_key(&config, "Cart", "u"), b"{not json".to_vec())
            .await
            .unwrap();

        let err = read_snapshot(&blobs, &config, "Cart", "u").await.unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[tokio::test]
    async fn list_filters_by_prefix_and_delete_is_idempotent() {
        let blobs = InMemoryBlobStore::new();
        blobs.put("a/1", vec![1]).await.unwrap();
        blobs.put("a/2", vec![2]).await.unwrap();
        blobs.put("b/1", vec![3]).await.unwrap();

        assert_eq!(blobs.list("a/").await.unwrap(), vec!["a/1", "a/2"]);

        blobs.delete("a/1").await.unwrap();
        blobs.delete("a/1").await.unwrap();
        assert_eq!(blobs.list("a/").await.unwrap(), vec!["a/2"]);
    }
}
