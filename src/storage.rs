//! Artifact storage
//!
//! Generated snapshots and SQL documents are kept as single blobs and handed
//! out through time-limited signed links. Publishing is best-effort: a failed
//! upload or link never fails the backup that produced the artifact.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

static OBJECT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,199}$").expect("valid regex"));

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object name: {0}")]
    InvalidName(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("link expired")]
    Expired,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not build link: {0}")]
    Url(String),
}

/// A stored artifact as served to a download
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

/// Blob store with signed retrieval links
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Link to `name` valid for `ttl`
    async fn signed_url(&self, name: &str, ttl: Duration) -> Result<String, StorageError>;

    /// Read `name` if `signature` matches and `expires` (unix seconds) has not passed
    async fn open_signed(
        &self,
        name: &str,
        expires: i64,
        signature: &str,
    ) -> Result<StoredObject, StorageError>;
}

pub fn content_type_for(name: &str) -> &'static str {
    if name.ends_with(".json") {
        "application/json"
    } else if name.ends_with(".sql") {
        "application/sql"
    } else {
        "application/octet-stream"
    }
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    if OBJECT_NAME.is_match(name) && !name.contains("..") {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

/// Filesystem store; links point at this service's download route
pub struct LocalObjectStore {
    root: PathBuf,
    base_url: String,
    secret: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
            secret: secret.into(),
        }
    }

    fn sign(&self, name: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(expires.to_string().as_bytes());
        to_hex(&hasher.finalize())
    }

    fn link(&self, name: &str, expires: i64) -> Result<String, StorageError> {
        let mut url = Url::parse(&format!(
            "{}/api/backup/files/{}",
            self.base_url.trim_end_matches('/'),
            name
        ))
        .map_err(|e| StorageError::Url(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &self.sign(name, expires));
        Ok(url.into())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        validate_name(name)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.root.join(name), bytes).await?;
        Ok(())
    }

    async fn signed_url(&self, name: &str, ttl: Duration) -> Result<String, StorageError> {
        validate_name(name)?;
        if !tokio::fs::try_exists(self.root.join(name)).await? {
            return Err(StorageError::NotFound(name.to_string()));
        }
        self.link(name, (Utc::now() + ttl).timestamp())
    }

    async fn open_signed(
        &self,
        name: &str,
        expires: i64,
        signature: &str,
    ) -> Result<StoredObject, StorageError> {
        validate_name(name)?;
        // Compare digests so the comparison time doesn't depend on the guess
        let expected = Sha256::digest(self.sign(name, expires).as_bytes());
        if Sha256::digest(signature.as_bytes()) != expected {
            return Err(StorageError::InvalidSignature);
        }
        if Utc::now().timestamp() > expires {
            return Err(StorageError::Expired);
        }

        match tokio::fs::read(self.root.join(name)).await {
            Ok(bytes) => Ok(StoredObject {
                bytes,
                content_type: content_type_for(name),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Result of a publish attempt
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOutcome {
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Uploads artifacts and issues their download links
#[derive(Clone)]
pub struct StoragePublisher {
    store: Arc<dyn ObjectStore>,
    ttl: Duration,
}

impl StoragePublisher {
    pub fn new(store: Arc<dyn ObjectStore>, ttl_hours: i64) -> Self {
        Self {
            store,
            ttl: Duration::hours(ttl_hours.max(1)),
        }
    }

    /// Store `bytes` as `file_name` and request a link. Never fails; the
    /// outcome carries the error instead.
    pub async fn publish(&self, file_name: &str, bytes: Vec<u8>) -> PublishOutcome {
        let size = bytes.len();
        let mut outcome = PublishOutcome {
            file_name: file_name.to_string(),
            ..Default::default()
        };

        if let Err(e) = self.store.put(file_name, bytes).await {
            warn!("Upload of {} failed: {}", file_name, e);
            outcome.error = Some(format!("upload failed: {}", e));
            return outcome;
        }

        match self.store.signed_url(file_name, self.ttl).await {
            Ok(url) => {
                info!("Published {} ({} bytes)", file_name, size);
                outcome.download_url = Some(url);
            }
            Err(e) => {
                warn!("Signed link for {} failed: {}", file_name, e);
                outcome.error = Some(format!("signed link failed: {}", e));
            }
        }
        outcome
    }
}


#[cfg(test)]
mod tests {
    use super::memory::InMemoryObjectStore;
    use super::*;

    fn scratch_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pgvault-{}-{}", label, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_signed_link_round_trip() {
        let store = LocalObjectStore::new(scratch_dir("link"), "http://localhost:3000/", "secret");
        store.put("backup-1.json", b"{}".to_vec()).await.unwrap();

        let link = store.signed_url("backup-1.json", Duration::hours(24)).await.unwrap();
        let url = Url::parse(&link).unwrap();
        assert_eq!(url.path(), "/api/backup/files/backup-1.json");

        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        let expires: i64 = params["expires"].parse().unwrap();
        let object = store
            .open_signed("backup-1.json", expires, &params["signature"])
            .await
            .unwrap();

        assert_eq!(object.bytes, b"{}");
        assert_eq!(object.content_type, "application/json");
    }

    #[tokio::test]
    async fn test_tampered_or_expired_link_is_refused() {
        let store = LocalObjectStore::new(scratch_dir("tamper"), "http://localhost:3000", "secret");
        store.put("backup-2.sql", b"BEGIN;".to_vec()).await.unwrap();

        let future = (Utc::now() + Duration::hours(1)).timestamp();
        assert!(matches!(
            store.open_signed("backup-2.sql", future, "deadbeef").await,
            Err(StorageError::InvalidSignature)
        ));

        let past = (Utc::now() - Duration::hours(1)).timestamp();
        let signature = store.sign("backup-2.sql", past);
        assert!(matches!(
            store.open_signed("backup-2.sql", past, &signature).await,
            Err(StorageError::Expired)
        ));
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let store = LocalObjectStore::new(scratch_dir("names"), "http://localhost:3000", "secret");
        assert!(matches!(
            store.put("../etc/passwd", vec![]).await,
            Err(StorageError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported_not_raised() {
        let store = Arc::new(InMemoryObjectStore {
            fail_put: true,
            ..Default::default()
        });
        let publisher = StoragePublisher::new(store, 24);

        let outcome = publisher.publish("backup-3.json", b"{}".to_vec()).await;

        assert!(outcome.error.is_some());
        assert!(outcome.download_url.is_none());
        assert_eq!(outcome.file_name, "backup-3.json");
    }

    #[tokio::test]
    async fn test_publish_issues_day_long_link() {
        let publisher = StoragePublisher::new(Arc::new(InMemoryObjectStore::default()), 24);

        let outcome = publisher.publish("backup-4.json", b"{}".to_vec()).await;

        assert_eq!(outcome.download_url.as_deref(), Some("memory://backup-4.json?ttl=24"));
    }
}
