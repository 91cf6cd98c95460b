// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Collaborator abstractions for object storage and the metadata database.
//!
//! The ingestion pipeline never talks to a concrete backend. It is handed an
//! [`ObjectStore`] and a [`MetadataStore`] and only uses the narrow operations
//! those traits expose.
//!
//! # Implementations
//!
//! - [`MemoryObjectStore`] / [`MemoryMetadataStore`]: in-process storage with
//!   call counters, for tests and dry runs.
//! - [`LocalObjectStore`]: objects written below a root directory, addressed
//!   by `file://` URLs.
//! - [`JsonlMetadataStore`]: records appended as JSON lines per table.
//!
//! # Examples
//!
//! ```rust
//! use dataset_ingest::{MemoryObjectStore, ObjectStore};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), dataset_ingest::Error> {
//! let store = MemoryObjectStore::new();
//! let stored = store
//!     .upload("datasets", "p/s/images/Training/a.png", b"png", "image/png")
//!     .await?;
//! assert_eq!(store.fetch(&stored.public_url).await?, b"png");
//! # Ok(())
//! # }
//! ```

use crate::{Error, ImageRecord};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::{
        RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::io::AsyncWriteExt as _;
use url::Url;

/// Location of an uploaded object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Path of the object within its bucket.
    pub path: String,
    /// Durable, publicly reachable URL.
    pub public_url: String,
}

/// Resize strategy requested from an image transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    Cover,
    Contain,
    Fill,
}

/// Server-side image transform attached to a retrieval URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTransform {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resize: Option<ResizeMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
}

/// Options for issuing a short-lived retrieval URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalOptions {
    pub ttl_seconds: u64,
    pub transform: Option<ImageTransform>,
}

impl RetrievalOptions {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            ttl_seconds,
            transform: None,
        }
    }

    pub fn with_transform(mut self, transform: ImageTransform) -> Self {
        self.transform = Some(transform);
        self
    }
}

/// Object storage collaborator.
///
/// Implementations must be thread-safe (`Send + Sync`) since they are shared
/// across every file processed by a session.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `path` inside `bucket`, replacing any existing object.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredObject, Error>;

    /// Issue a short-lived URL granting read access to an object.
    async fn issue_retrieval_url(
        &self,
        bucket: &str,
        path: &str,
        options: &RetrievalOptions,
    ) -> Result<String, Error>;

    /// Download the bytes behind a URL previously returned by this store.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, Error>;
}

/// Metadata database collaborator.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert all records into `table` as one batch.
    async fn insert_many(&self, table: &str, records: &[ImageRecord]) -> Result<(), Error>;

    /// Apply a partial update to the row identified by `id`.
    async fn update(&self, table: &str, id: &str, patch: &serde_json::Value)
    -> Result<(), Error>;
}

fn object_key(bucket: &str, path: &str) -> String {
    format!("{}/{}", bucket, path.trim_start_matches('/'))
}

#[derive(Debug, Clone)]
struct MemoryObject {
    bytes: Vec<u8>,
    content_type: String,
}

/// In-memory object storage (no persistence).
///
/// Public URLs take the form `memory://{bucket}/{path}` and retrieval URLs
/// append a query string. Both resolve through [`ObjectStore::fetch`].
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, MemoryObject>>,
    uploads: AtomicUsize,
    issued: AtomicUsize,
    fetches: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes stored at `bucket/path`, if any.
    pub fn object(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .ok()?
            .get(&object_key(bucket, path))
            .map(|o| o.bytes.clone())
    }

    /// Content type recorded for `bucket/path`, if any.
    pub fn content_type(&self, bucket: &str, path: &str) -> Option<String> {
        self.objects
            .read()
            .ok()?
            .get(&object_key(bucket, path))
            .map(|o| o.content_type.clone())
    }

    /// All stored keys (`bucket/path`), sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn issue_count(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredObject, Error> {
        let key = object_key(bucket, path);
        let mut objects = self
            .objects
            .write()
            .map_err(|e| Error::Storage(format!("Failed to acquire write lock: {}", e)))?;
        objects.insert(
            key.clone(),
            MemoryObject {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        self.uploads.fetch_add(1, Ordering::SeqCst);

        Ok(StoredObject {
            path: path.to_string(),
            public_url: format!("memory://{}", key),
        })
    }

    async fn issue_retrieval_url(
        &self,
        bucket: &str,
        path: &str,
        options: &RetrievalOptions,
    ) -> Result<String, Error> {
        let key = object_key(bucket, path);
        let exists = self
            .objects
            .read()
            .map_err(|e| Error::Storage(format!("Failed to acquire read lock: {}", e)))?
            .contains_key(&key);
        if !exists {
            return Err(Error::UrlIssue(format!("No object at {}", key)));
        }

        let serial = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "memory://{}?ttl={}&sig={}",
            key, options.ttl_seconds, serial
        ))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, Error> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let key = url
            .strip_prefix("memory://")
            .ok_or_else(|| Error::UnsupportedFormat(format!("Not a memory URL: {}", url)))?;
        let key = key.split('?').next().unwrap_or(key);

        self.objects
            .read()
            .map_err(|e| Error::Storage(format!("Failed to acquire read lock: {}", e)))?
            .get(key)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| Error::Storage(format!("No object at {}", key)))
    }
}

/// In-memory metadata database.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    tables: RwLock<HashMap<String, Vec<ImageRecord>>>,
    updates: RwLock<Vec<(String, String, serde_json::Value)>>,
    inserts: AtomicUsize,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records inserted into `table`, in insertion order.
    pub fn records(&self, table: &str) -> Vec<ImageRecord> {
        self.tables
            .read()
            .ok()
            .and_then(|tables| tables.get(table).cloned())
            .unwrap_or_default()
    }

    /// Number of `insert_many` calls received.
    pub fn insert_calls(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    /// Patches received through `update`, as `(table, id, patch)`.
    pub fn updates(&self) -> Vec<(String, String, serde_json::Value)> {
        self.updates
            .read()
            .map(|updates| updates.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert_many(&self, table: &str, records: &[ImageRecord]) -> Result<(), Error> {
        let mut tables = self
            .tables
            .write()
            .map_err(|e| Error::Database(format!("Failed to acquire write lock: {}", e)))?;
        tables
            .entry(table.to_string())
            .or_default()
            .extend_from_slice(records);
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error> {
        let mut updates = self
            .updates
            .write()
            .map_err(|e| Error::Database(format!("Failed to acquire write lock: {}", e)))?;
        updates.push((table.to_string(), id.to_string(), patch.clone()));
        Ok(())
    }
}

/// Rejects absolute paths and parent-directory components so every object
/// stays below the store root.
fn relative_object_path(bucket: &str, path: &str) -> Result<PathBuf, Error> {
    let joined = PathBuf::from(bucket).join(path.trim_start_matches('/'));
    if joined
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(Error::InvalidParameters(format!(
            "Object path escapes the store root: {}/{}",
            bucket, path
        )));
    }
    Ok(joined)
}

/// Filesystem-backed object storage.
///
/// Objects are written to `{root}/{bucket}/{path}`. Public URLs are `file://`
/// URLs; retrieval URLs add an expiry timestamp and an opaque token. Fetching
/// also accepts `http(s)://` URLs, which are downloaded with `reqwest`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    http: reqwest::Client,
}

impl LocalObjectStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, Error> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = root.as_ref().canonicalize()?;
        debug!("LocalObjectStore rooted at {:?}", root);
        Ok(Self {
            root,
            http: reqwest::Client::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_url(&self, relative: &Path) -> Result<Url, Error> {
        let absolute = self.root.join(relative);
        Url::from_file_path(&absolute).map_err(|_| {
            Error::InvalidParameters(format!("Cannot express {:?} as a file URL", absolute))
        })
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<StoredObject, Error> {
        let relative = relative_object_path(bucket, path)?;
        let target = self.root.join(&relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        debug!("Stored {} bytes at {:?}", bytes.len(), target);

        Ok(StoredObject {
            path: path.to_string(),
            public_url: self.file_url(&relative)?.to_string(),
        })
    }

    async fn issue_retrieval_url(
        &self,
        bucket: &str,
        path: &str,
        options: &RetrievalOptions,
    ) -> Result<String, Error> {
        let relative = relative_object_path(bucket, path)?;
        if !tokio::fs::try_exists(self.root.join(&relative)).await? {
            return Err(Error::UrlIssue(format!("No object at {}/{}", bucket, path)));
        }

        let expires = Utc::now().timestamp() + options.ttl_seconds as i64;
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(format!("{}/{}:{}", bucket, path, expires));

        let mut url = self.file_url(&relative)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("expires", &expires.to_string());
            query.append_pair("token", &token);
            if let Some(transform) = &options.transform {
                if let Some(width) = transform.width {
                    query.append_pair("width", &width.to_string());
                }
                if let Some(height) = transform.height {
                    query.append_pair("height", &height.to_string());
                }
            }
        }
        Ok(url.to_string())
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, Error> {
        let parsed = Url::parse(url)?;
        match parsed.scheme() {
            "file" => {
                let path = parsed
                    .to_file_path()
                    .map_err(|_| Error::InvalidParameters(format!("Invalid file URL: {}", url)))?;
                Ok(tokio::fs::read(path).await?)
            }
            "http" | "https" => {
                let resp = self.http.get(parsed).send().await?.error_for_status()?;
                Ok(resp.bytes().await?.to_vec())
            }
            other => Err(Error::UnsupportedFormat(format!(
                "Unsupported URL scheme: {}",
                other
            ))),
        }
    }
}

/// Metadata database writing one JSON document per line.
///
/// Inserts append to `{root}/{table}.jsonl`. Patches append
/// `{"id": .., "patch": ..}` lines to `{root}/{table}.updates.jsonl`.
#[derive(Debug)]
pub struct JsonlMetadataStore {
    root: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlMetadataStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, Error> {
        std::fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", table))
    }

    async fn append_lines(&self, path: PathBuf, lines: String) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonlMetadataStore {
    async fn insert_many(&self, table: &str, records: &[ImageRecord]) -> Result<(), Error> {
        let mut lines = String::new();
        for record in records {
            lines.push_str(&serde_json::to_string(record)?);
            lines.push('\n');
        }
        self.append_lines(self.table_path(table), lines).await
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error> {
        let mut line = serde_json::to_string(&serde_json::json!({ "id": id, "patch": patch }))?;
        line.push('\n');
        self.append_lines(self.root.join(format!("{}.updates.jsonl", table)), line)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProcessingStatus;
    use tempfile::TempDir;

    fn record(name: &str) -> ImageRecord {
        ImageRecord {
            step_id: "step-1".to_string(),
            image_url: format!("memory://datasets/{}", name),
            thumbnail_url: format!("memory://datasets/{}", name),
            display_url: format!("memory://datasets/{}", name),
            image_name: name.to_string(),
            file_size: 3,
            image_group: "Training".to_string(),
            processing_status: ProcessingStatus::Completed,
            no_annotations_needed: false,
            annotations: None,
        }
    }

    #[tokio::test]
    async fn test_memory_store_upload_fetch() {
        let store = MemoryObjectStore::new();
        let stored = store
            .upload("datasets", "p/s/images/Training/a.png", b"abc", "image/png")
            .await
            .unwrap();
        assert_eq!(stored.public_url, "memory://datasets/p/s/images/Training/a.png");
        assert_eq!(store.fetch(&stored.public_url).await.unwrap(), b"abc");
        assert_eq!(
            store.content_type("datasets", "p/s/images/Training/a.png"),
            Some("image/png".to_string())
        );

        let url = store
            .issue_retrieval_url(
                "datasets",
                "p/s/images/Training/a.png",
                &RetrievalOptions::new(60),
            )
            .await
            .unwrap();
        assert_eq!(store.fetch(&url).await.unwrap(), b"abc");
        assert_eq!(store.upload_count(), 1);
        assert_eq!(store.issue_count(), 1);
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_issue_missing_object() {
        let store = MemoryObjectStore::new();
        let result = store
            .issue_retrieval_url("datasets", "missing.png", &RetrievalOptions::new(60))
            .await;
        assert!(matches!(result, Err(Error::UrlIssue(_))));
    }

    #[tokio::test]
    async fn test_memory_metadata_store() {
        let db = MemoryMetadataStore::new();
        db.insert_many("step_images", &[record("a.png"), record("b.png")])
            .await
            .unwrap();
        db.insert_many("step_images", &[record("c.png")]).await.unwrap();
        db.update("step_images", "1", &serde_json::json!({"image_group": "Validation"}))
            .await
            .unwrap();

        let names: Vec<_> = db
            .records("step_images")
            .into_iter()
            .map(|r| r.image_name)
            .collect();
        assert_eq!(names, ["a.png", "b.png", "c.png"]);
        assert_eq!(db.insert_calls(), 2);
        assert_eq!(db.updates().len(), 1);
        assert!(db.records("other").is_empty());
    }

    #[tokio::test]
    async fn test_local_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(temp_dir.path().join("objects")).unwrap();

        let stored = store
            .upload("datasets", "p/s/labels/Training/a.txt", b"0 0.5 0.5 1 1", "text/plain")
            .await
            .unwrap();
        assert!(stored.public_url.starts_with("file://"));
        assert!(
            store
                .root()
                .join("datasets/p/s/labels/Training/a.txt")
                .exists()
        );
        assert_eq!(store.fetch(&stored.public_url).await.unwrap(), b"0 0.5 0.5 1 1");

        let options = RetrievalOptions::new(60).with_transform(ImageTransform {
            width: Some(64),
            ..Default::default()
        });
        let url = store
            .issue_retrieval_url("datasets", "p/s/labels/Training/a.txt", &options)
            .await
            .unwrap();
        assert!(url.contains("expires="));
        assert!(url.contains("width=64"));
        assert_eq!(store.fetch(&url).await.unwrap(), b"0 0.5 0.5 1 1");
    }

    #[tokio::test]
    async fn test_local_store_rejects_escaping_paths() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(temp_dir.path()).unwrap();
        let result = store
            .upload("datasets", "../outside.png", b"x", "image/png")
            .await;
        assert!(matches!(result, Err(Error::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_jsonl_store_appends_lines() {
        let temp_dir = TempDir::new().unwrap();
        let db = JsonlMetadataStore::new(temp_dir.path()).unwrap();
        db.insert_many("step_images", &[record("a.png")]).await.unwrap();
        db.insert_many("step_images", &[record("b.png")]).await.unwrap();

        let contents = std::fs::read_to_string(db.table_path("step_images")).unwrap();
        let lines: Vec<ImageRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].image_name, "b.png");
    }
}
