use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::metrics::CACHE_EVICTIONS;

/// Hard cap on a cached blob. On-demand entries are almost always larger;
/// the cache exists to serve their probe-sized head reads, not the media.
pub const BLOB_CAP: u64 = 1024 * 1024;

pub const DEFAULT_MAX_ITEMS: usize = 100;
pub const MAX_ITEMS_CAP: usize = 100_000;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache download error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cache download got status {0}")]
    Status(reqwest::StatusCode),
}

/// Metadata record for one URL. The record outlives its blob: eviction
/// removes the bytes but keeps the record so stat and conditional requests
/// still have something to work with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    pub declared_size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub cached_at: DateTime<Utc>,
    /// True iff the stored bytes are the whole object.
    pub complete: bool,
    pub last_access: DateTime<Utc>,
    pub stored_size: u64,
    /// Whether the blob file currently exists; recomputed on load, never
    /// trusted from disk.
    #[serde(skip)]
    pub has_blob: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadPhase {
    Running,
    Done,
    Failed(String),
}

/// Shared handle onto an in-flight download; late callers for the same key
/// get the same handle.
pub struct Download {
    rx: watch::Receiver<DownloadPhase>,
}

impl Download {
    fn pair() -> (watch::Sender<DownloadPhase>, Arc<Download>) {
        let (tx, rx) = watch::channel(DownloadPhase::Running);
        (tx, Arc::new(Download { rx }))
    }

    fn finished(phase: DownloadPhase) -> Arc<Download> {
        let (_tx, rx) = watch::channel(phase);
        Arc::new(Download { rx })
    }

    pub async fn wait(&self) -> DownloadPhase {
        let mut rx = self.rx.clone();
        let result = match rx.wait_for(|p| *p != DownloadPhase::Running).await {
            Ok(phase) => phase.clone(),
            Err(_) => DownloadPhase::Failed("download abandoned".into()),
        };
        result
    }

    pub fn phase(&self) -> DownloadPhase {
        self.rx.borrow().clone()
    }
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    inflight: HashMap<String, Arc<Download>>,
}

struct CacheInner {
    dir: PathBuf,
    max_items: usize,
    client: Client,
    state: Mutex<CacheState>,
}

/// URL-addressed, size-capped, LRU blob store. One blob file per key (hex
/// md5 of the URL, no extension) plus a `<key>.json` metadata record; both
/// survive restarts. Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct FileCache {
    inner: Arc<CacheInner>,
}

pub fn key_for(url: &str) -> String {
    format!("{:x}", md5::compute(url.as_bytes()))
}

impl FileCache {
    pub fn new(
        dir: impl Into<PathBuf>,
        max_items: usize,
        client: Client,
    ) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                dir,
                max_items: max_items.clamp(1, MAX_ITEMS_CAP),
                client,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    inflight: HashMap::new(),
                }),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.inner.dir.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.inner.dir.join(format!("{key}.json"))
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.inner.dir.join(format!("{key}.tmp"))
    }

    /// Re-reads the metadata records left by a previous run.
    pub async fn load(&self) -> Result<(), CacheError> {
        let mut loaded = 0usize;
        let mut dir = tokio::fs::read_dir(&self.inner.dir).await?;
        let mut state = self.inner.state.lock().await;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(key) = name.strip_suffix(".json") else {
                continue;
            };
            match tokio::fs::read(&path).await {
                Ok(raw) => match serde_json::from_slice::<CacheEntry>(&raw) {
                    Ok(mut entry) => {
                        entry.has_blob = self.blob_path(key).exists();
                        state.entries.insert(key.to_string(), entry);
                        loaded += 1;
                    }
                    Err(e) => warn!("Discarding unreadable cache record {}: {}", name, e),
                },
                Err(e) => warn!("Failed to read cache record {}: {}", name, e),
            }
        }
        info!(
            "File cache loaded: dir={} records={}",
            self.inner.dir.display(),
            loaded
        );
        Ok(())
    }

    pub async fn lookup(&self, url: &str) -> Option<CacheEntry> {
        let state = self.inner.state.lock().await;
        state.entries.get(&key_for(url)).cloned()
    }

    /// Path to the complete blob for a URL, bumping its LRU position.
    /// Metadata without a blob is a miss by design.
    pub async fn open_blob(&self, url: &str) -> Option<(CacheEntry, PathBuf)> {
        let key = key_for(url);
        let mut state = self.inner.state.lock().await;
        let entry = state.entries.get_mut(&key)?;
        if !entry.complete || !entry.has_blob {
            return None;
        }
        let path = self.blob_path(&key);
        if !path.exists() {
            // Blob vanished underneath us; keep the metadata for later
            // conditional requests and report a miss.
            entry.has_blob = false;
            return None;
        }
        entry.last_access = Utc::now();
        let snapshot = entry.clone();
        let meta = self.meta_path(&key);
        let raw = serde_json::to_vec_pretty(&snapshot).ok();
        drop(state);
        if let Some(raw) = raw {
            if let Err(e) = tokio::fs::write(&meta, raw).await {
                debug!("Failed to persist access time for {}: {}", key, e);
            }
        }
        Some((snapshot, path))
    }

    /// Records upstream metadata (from a HEAD or a probing GET) without
    /// touching blob state.
    pub async fn record_remote_metadata(
        &self,
        url: &str,
        declared_size: Option<u64>,
        last_modified: Option<DateTime<Utc>>,
        etag: Option<String>,
        content_type: Option<String>,
    ) {
        let key = key_for(url);
        let mut state = self.inner.state.lock().await;
        let now = Utc::now();
        let entry = state
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry {
                url: url.to_string(),
                declared_size: None,
                last_modified: None,
                etag: None,
                content_type: None,
                cached_at: now,
                complete: false,
                last_access: now,
                stored_size: 0,
                has_blob: false,
            });
        if declared_size.is_some() {
            entry.declared_size = declared_size;
        }
        if last_modified.is_some() {
            entry.last_modified = last_modified;
        }
        if etag.is_some() {
            entry.etag = etag;
        }
        if content_type.is_some() {
            entry.content_type = content_type;
        }
        let snapshot = entry.clone();
        let meta = self.meta_path(&key);
        drop(state);
        if let Ok(raw) = serde_json::to_vec_pretty(&snapshot) {
            let _ = tokio::fs::write(&meta, raw).await;
        }
    }

    /// Kicks off (or joins) the background population of a URL. At most one
    /// download runs per key; callers that arrive late receive the handle of
    /// the one in flight. A URL that is already completely cached resolves
    /// immediately.
    pub async fn start_caching(&self, url: &str) -> Arc<Download> {
        let key = key_for(url);
        let mut state = self.inner.state.lock().await;

        if let Some(existing) = state.inflight.get(&key) {
            return Arc::clone(existing);
        }
        if let Some(entry) = state.entries.get(&key) {
            if entry.complete && entry.has_blob {
                return Download::finished(DownloadPhase::Done);
            }
        }

        let (tx, download) = Download::pair();
        state.inflight.insert(key.clone(), Arc::clone(&download));
        drop(state);

        let cache = self.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            let outcome = cache.download(&url).await;
            cache.release_inflight(&key).await;
            match outcome {
                Ok(()) => {
                    let _ = tx.send(DownloadPhase::Done);
                }
                Err(e) => {
                    warn!("Cache download failed: url={} err={}", url, e);
                    let _ = tx.send(DownloadPhase::Failed(e.to_string()));
                }
            }
        });

        download
    }

    async fn download(&self, url: &str) -> Result<(), CacheError> {
        let response = self.inner.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(CacheError::Status(response.status()));
        }

        let declared_size = response.content_length();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = Vec::new();
        let mut capped = false;
        let mut response = response;
        while let Some(chunk) = response.chunk().await? {
            let room = (BLOB_CAP as usize).saturating_sub(body.len());
            let take = room.min(chunk.len());
            body.extend_from_slice(&chunk[..take]);
            if take < chunk.len() {
                capped = true;
                break;
            }
        }

        let complete = !capped
            && declared_size
                .map(|d| d == body.len() as u64)
                .unwrap_or(true);

        self.publish(
            url,
            body,
            BlobMeta {
                declared_size,
                last_modified,
                etag,
                content_type,
                complete,
            },
        )
        .await
    }

    /// Atomically publishes a blob: temp file, then metadata, then rename.
    async fn publish(&self, url: &str, data: Vec<u8>, meta: BlobMeta) -> Result<(), CacheError> {
        let key = key_for(url);
        let tmp = self.tmp_path(&key);
        let blob = self.blob_path(&key);
        let meta_file = self.meta_path(&key);

        tokio::fs::write(&tmp, &data).await?;

        let mut state = self.inner.state.lock().await;
        let now = Utc::now();
        let entry = CacheEntry {
            url: url.to_string(),
            declared_size: meta.declared_size,
            last_modified: meta.last_modified,
            etag: meta.etag,
            content_type: meta.content_type,
            cached_at: now,
            complete: meta.complete,
            last_access: now,
            stored_size: data.len() as u64,
            has_blob: true,
        };
        let raw = serde_json::to_vec_pretty(&entry)
            .map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
        tokio::fs::write(&meta_file, raw).await?;
        tokio::fs::rename(&tmp, &blob).await?;
        state.entries.insert(key.clone(), entry);
        debug!(
            "Cached blob: key={} bytes={} complete={}",
            key,
            data.len(),
            meta.complete
        );

        self.evict_locked(&mut state).await;
        Ok(())
    }

    /// Removes the oldest blobs until the item bound holds. Blobs only;
    /// metadata records stay behind.
    async fn evict_locked(&self, state: &mut CacheState) {
        loop {
            let blob_count = state.entries.values().filter(|e| e.has_blob).count();
            if blob_count <= self.inner.max_items {
                return;
            }
            let oldest = state
                .entries
                .iter()
                .filter(|(_, e)| e.has_blob)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            let Some(key) = oldest else { return };
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.has_blob = false;
                entry.complete = false;
                entry.stored_size = 0;
                let snapshot = entry.clone();
                if let Ok(raw) = serde_json::to_vec_pretty(&snapshot) {
                    let _ = tokio::fs::write(self.meta_path(&key), raw).await;
                }
            }
            if let Err(e) = tokio::fs::remove_file(self.blob_path(&key)).await {
                warn!("Failed to evict blob {}: {}", key, e);
            }
            CACHE_EVICTIONS.inc();
            debug!("Evicted cache blob: key={}", key);
        }
    }

    pub(crate) async fn release_inflight(&self, key: &str) {
        let mut state = self.inner.state.lock().await;
        state.inflight.remove(key);
    }

    /// Starts teeing a client-driven upstream read into the cache. `None`
    /// when a download for the key is already in flight or the URL is
    /// already fully cached; the caller then streams without teeing.
    pub async fn begin_tee(
        &self,
        url: &str,
        declared_size: Option<u64>,
        last_modified: Option<DateTime<Utc>>,
        etag: Option<String>,
        content_type: Option<String>,
    ) -> Option<CacheWriter> {
        let key = key_for(url);
        let mut state = self.inner.state.lock().await;
        if state.inflight.contains_key(&key) {
            return None;
        }
        if let Some(entry) = state.entries.get(&key) {
            if entry.complete && entry.has_blob {
                return None;
            }
        }
        let (tx, download) = Download::pair();
        state.inflight.insert(key.clone(), download);
        Some(CacheWriter {
            cache: self.clone(),
            key,
            url: url.to_string(),
            tx: Some(tx),
            buf: Vec::new(),
            capped: false,
            declared_size,
            last_modified,
            etag,
            content_type,
            finished: false,
        })
    }

    /// Number of blobs currently stored.
    pub async fn blob_count(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.entries.values().filter(|e| e.has_blob).count()
    }

    /// Number of metadata records, including blob-less ones.
    pub async fn record_count(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.entries.len()
    }
}

struct BlobMeta {
    declared_size: Option<u64>,
    last_modified: Option<DateTime<Utc>>,
    etag: Option<String>,
    content_type: Option<String>,
    complete: bool,
}

/// Accumulates bytes copied off a client-facing stream. Publishing happens
/// on `finish`; a writer dropped mid-stream (client went away) releases its
/// in-flight slot and caches nothing.
pub struct CacheWriter {
    cache: FileCache,
    key: String,
    url: String,
    tx: Option<watch::Sender<DownloadPhase>>,
    buf: Vec<u8>,
    capped: bool,
    declared_size: Option<u64>,
    last_modified: Option<DateTime<Utc>>,
    etag: Option<String>,
    content_type: Option<String>,
    finished: bool,
}

impl CacheWriter {
    /// Copies a chunk, silently ignoring everything past the blob cap.
    pub fn write(&mut self, chunk: &[u8]) {
        if self.capped {
            return;
        }
        let room = (BLOB_CAP as usize).saturating_sub(self.buf.len());
        let take = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..take]);
        if take < chunk.len() {
            self.capped = true;
        }
    }

    /// Publishes the accumulated bytes. `clean_eof` says the upstream body
    /// ended normally; anything else discards the data.
    pub async fn finish(mut self, clean_eof: bool) {
        self.finished = true;
        let tx = self.tx.take();

        if !clean_eof && !self.capped {
            self.cache.release_inflight(&self.key).await;
            if let Some(tx) = tx {
                let _ = tx.send(DownloadPhase::Failed("upstream read aborted".into()));
            }
            return;
        }

        let stored = self.buf.len() as u64;
        let complete = !self.capped
            && self
                .declared_size
                .map(|d| d == stored)
                .unwrap_or(clean_eof);

        let result = self
            .cache
            .publish(
                &self.url,
                std::mem::take(&mut self.buf),
                BlobMeta {
                    declared_size: self.declared_size,
                    last_modified: self.last_modified.take(),
                    etag: self.etag.take(),
                    content_type: self.content_type.take(),
                    complete,
                },
            )
            .await;

        self.cache.release_inflight(&self.key).await;
        if let Some(tx) = tx {
            match result {
                Ok(()) => {
                    let _ = tx.send(DownloadPhase::Done);
                }
                Err(e) => {
                    let _ = tx.send(DownloadPhase::Failed(e.to_string()));
                }
            }
        }
    }

    /// True once the cap was hit; callers can stop copying.
    pub fn capped(&self) -> bool {
        self.capped
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let cache = self.cache.clone();
        let key = std::mem::take(&mut self.key);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(DownloadPhase::Failed("writer dropped".into()));
        }
        tokio::spawn(async move {
            cache.release_inflight(&key).await;
        });
    }
}
