//! Gemini context cache manager.
//!
//! Keeps the system instruction, tool declarations and large files the
//! model has read in a server-side cached content entry, and tracks what
//! went into it in `gemini_cache_meta.json`. A cache is reused only while
//! the model, prompt, tool schemas and every cached file are unchanged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tooldrive_core::config::Config;
use tooldrive_core::context::FileAccessObserver;
use tooldrive_core::message::ToolSpec;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::CacheBackend;
use crate::schema::canonical_json;

pub const META_FILE_NAME: &str = "gemini_cache_meta.json";
const CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_MIN_FILE_SIZE: u64 = 32 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheMetadata {
    pub cache_name: Option<String>,
    pub model: Option<String>,
    pub system_instruction_hash: Option<String>,
    pub tools_hash: Option<String>,
    /// Path to sha256 of the bytes that were uploaded.
    pub files: BTreeMap<String, String>,
    /// Large files read since the last upload; included on the next create.
    pub discovered_files: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

async fn hash_file(path: &Path) -> Option<String> {
    tokio::fs::read(path).await.ok().map(|bytes| sha256_hex(&bytes))
}

fn tools_hash(tools: &[ToolSpec]) -> String {
    let value = serde_json::to_value(tools).unwrap_or_default();
    sha256_hex(canonical_json(&value).as_bytes())
}

/// Every decision re-reads the metadata file under `meta` and writes it back
/// whole, so several managers over the same directory stay consistent.
pub struct GeminiCacheManager {
    model: String,
    meta_path: PathBuf,
    min_file_size: u64,
    clear_on_start: bool,
    started: AtomicBool,
    meta: Mutex<CacheMetadata>,
}

impl GeminiCacheManager {
    pub fn new(dir: impl AsRef<Path>, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            meta_path: dir.as_ref().join(META_FILE_NAME),
            min_file_size: DEFAULT_MIN_FILE_SIZE,
            clear_on_start: false,
            started: AtomicBool::new(false),
            meta: Mutex::new(CacheMetadata::default()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut manager = Self::new(config.cache_dir(), config.model());
        manager.min_file_size = config.cache_min_file_size();
        manager.clear_on_start = config.cache_clear_on_start();
        manager
    }

    pub fn with_min_file_size(mut self, bytes: u64) -> Self {
        self.min_file_size = bytes;
        self
    }

    pub fn with_clear_on_start(mut self, clear: bool) -> Self {
        self.clear_on_start = clear;
        self
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    async fn read_meta(&self) -> CacheMetadata {
        let raw = match tokio::fs::read_to_string(&self.meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheMetadata::default(),
            Err(e) => {
                warn!(path = %self.meta_path.display(), error = %e, "Failed to read cache metadata");
                return CacheMetadata::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %self.meta_path.display(), error = %e, "Ignoring unreadable cache metadata");
                CacheMetadata::default()
            }
        }
    }

    async fn try_write_meta(&self, meta: &CacheMetadata) -> std::io::Result<()> {
        if let Some(parent) = self.meta_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(meta)?;
        tokio::fs::write(&self.meta_path, json).await
    }

    async fn write_meta(&self, meta: &CacheMetadata) {
        if let Err(e) = self.try_write_meta(meta).await {
            warn!(path = %self.meta_path.display(), error = %e, "Failed to persist cache metadata");
        }
    }

    /// Lock the state and refresh it from disk.
    async fn lock_fresh(&self) -> MutexGuard<'_, CacheMetadata> {
        let mut guard = self.meta.lock().await;
        *guard = self.read_meta().await;
        guard
    }

    pub async fn metadata(&self) -> CacheMetadata {
        self.lock_fresh().await.clone()
    }

    /// Handle of the live cache, if any.
    pub async fn cache_name(&self) -> Option<String> {
        self.lock_fresh().await.cache_name.clone()
    }

    /// Whether the recorded cache still matches the current inputs.
    pub async fn is_valid(&self, system_instruction: &str, tools: &[ToolSpec]) -> bool {
        let meta = self.metadata().await;
        if meta.cache_name.is_none() {
            return false;
        }
        if meta.model.as_deref() != Some(self.model.as_str()) {
            debug!(cached = ?meta.model, current = %self.model, "Cache model changed");
            return false;
        }
        if meta.system_instruction_hash.as_deref() != Some(sha256_hex(system_instruction.as_bytes()).as_str()) {
            debug!("Cache system instruction changed");
            return false;
        }
        if meta.tools_hash.as_deref() != Some(tools_hash(tools).as_str()) {
            debug!("Cache tool schemas changed");
            return false;
        }
        for (path, hash) in &meta.files {
            if hash_file(Path::new(path)).await.as_deref() != Some(hash.as_str()) {
                debug!(path = %path, "Cached file changed on disk");
                return false;
            }
        }
        true
    }

    /// Upload a new cached content entry and record what went into it.
    ///
    /// Files discovered while the upload is in flight stay queued for the next one.
    pub async fn create(
        &self,
        backend: &dyn CacheBackend,
        system_instruction: &str,
        tools: &[ToolSpec],
    ) -> Result<String, crate::ProviderError> {
        let old = self.metadata().await;
        if let Some(handle) = &old.cache_name {
            if let Err(e) = backend.delete_cache(handle).await {
                debug!(cache = %handle, error = %e, "Old cache delete failed");
            }
        }

        let mut paths: Vec<String> = old.files.keys().cloned().collect();
        for p in &old.discovered_files {
            if !paths.contains(p) {
                paths.push(p.clone());
            }
        }

        let mut files = BTreeMap::new();
        let mut documents = Vec::new();
        for path in paths {
            let Ok(bytes) = tokio::fs::read(&path).await else {
                debug!(path = %path, "Dropping unreadable file from cache");
                continue;
            };
            let text = String::from_utf8_lossy(&bytes);
            documents.push(format!("--- FILE: {path} ---\n{text}"));
            files.insert(path, sha256_hex(&bytes));
        }

        let handle = backend
            .create_cache(&self.model, system_instruction, tools, &documents, CACHE_TTL_SECS)
            .await?;
        info!(cache = %handle, model = %self.model, files = files.len(), "Created context cache");

        let mut guard = self.lock_fresh().await;
        let pending: Vec<String> = guard
            .discovered_files
            .iter()
            .filter(|p| !old.discovered_files.contains(*p) && !files.contains_key(p.as_str()))
            .cloned()
            .collect();
        let meta = CacheMetadata {
            cache_name: Some(handle.clone()),
            model: Some(self.model.clone()),
            system_instruction_hash: Some(sha256_hex(system_instruction.as_bytes())),
            tools_hash: Some(tools_hash(tools)),
            files,
            discovered_files: pending,
            created_at: Some(Utc::now()),
        };
        self.write_meta(&meta).await;
        *guard = meta;
        Ok(handle)
    }

    /// Drop the remote entry (best effort) and reset the metadata.
    pub async fn clear(&self, backend: Option<&dyn CacheBackend>) {
        let handle = {
            let mut guard = self.lock_fresh().await;
            let handle = guard.cache_name.take();
            *guard = CacheMetadata::default();
            self.write_meta(&guard).await;
            handle
        };
        if let (Some(backend), Some(handle)) = (backend, handle) {
            if let Err(e) = backend.delete_cache(&handle).await {
                debug!(cache = %handle, error = %e, "Cache delete failed");
            }
        }
        debug!(path = %self.meta_path.display(), "Cleared context cache metadata");
    }

    /// Handle to send with this turn, or `None` to run uncached.
    pub async fn prepare(
        &self,
        backend: &dyn CacheBackend,
        system_instruction: &str,
        tools: &[ToolSpec],
    ) -> Option<String> {
        if self.clear_on_start && !self.started.swap(true, Ordering::SeqCst) {
            self.clear(Some(backend)).await;
        }
        if self.is_valid(system_instruction, tools).await {
            return self.cache_name().await;
        }
        match self.create(backend, system_instruction, tools).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Context cache unavailable, continuing without it");
                None
            }
        }
    }
}

#[async_trait]
impl FileAccessObserver for GeminiCacheManager {
    async fn record_file_access(&self, path: &Path) {
        let Ok(info) = tokio::fs::metadata(path).await else {
            return;
        };
        if !info.is_file() || info.len() < self.min_file_size {
            return;
        }
        let key = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .into_owned();

        let mut meta = self.lock_fresh().await;
        if meta.files.contains_key(&key) || meta.discovered_files.contains(&key) {
            return;
        }
        debug!(path = %key, size = info.len(), "Discovered large file for context cache");
        meta.discovered_files.push(key);
        self.write_meta(&meta).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::ProviderError;

    #[derive(Default)]
    struct RecordingBackend {
        created: StdMutex<Vec<Vec<String>>>,
        deleted: StdMutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl CacheBackend for RecordingBackend {
        async fn create_cache(
            &self,
            _model: &str,
            _system_instruction: &str,
            _tools: &[ToolSpec],
            documents: &[String],
            ttl_secs: u64,
        ) -> Result<String, ProviderError> {
            assert_eq!(ttl_secs, 3600);
            if self.fail {
                return Err(ProviderError::Connection("offline".into()));
            }
            let mut created = self.created.lock().unwrap();
            created.push(documents.to_vec());
            Ok(format!("cachedContents/{}", created.len()))
        }

        async fn delete_cache(&self, handle: &str) -> Result<(), ProviderError> {
            self.deleted.lock().unwrap().push(handle.to_string());
            Ok(())
        }
    }

    fn tools() -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "read_file".into(),
            description: "Read a file".into(),
            parameters: json!({"type": "object", "properties": {"filename": {"type": "string"}}}),
        }]
    }

    #[tokio::test]
    async fn test_prepare_creates_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::default();
        let manager = GeminiCacheManager::new(dir.path(), "gemini-1.5-flash");

        let first = manager.prepare(&backend, "sys", &tools()).await;
        assert_eq!(first.as_deref(), Some("cachedContents/1"));
        assert!(manager.meta_path().exists());

        let second = manager.prepare(&backend, "sys", &tools()).await;
        assert_eq!(second, first);
        assert_eq!(backend.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prompt_or_tool_change_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::default();
        let manager = GeminiCacheManager::new(dir.path(), "gemini-1.5-flash");
        manager.create(&backend, "sys", &tools()).await.unwrap();

        assert!(manager.is_valid("sys", &tools()).await);
        assert!(!manager.is_valid("other prompt", &tools()).await);
        assert!(!manager.is_valid("sys", &[]).await);

        let other_model = GeminiCacheManager::new(dir.path(), "gemini-2.0-pro");
        assert!(!other_model.is_valid("sys", &tools()).await);
    }

    #[tokio::test]
    async fn test_discovered_files_join_next_cache() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("big.txt");
        let small = dir.path().join("small.txt");
        std::fs::write(&big, "x".repeat(64)).unwrap();
        std::fs::write(&small, "tiny").unwrap();

        let backend = RecordingBackend::default();
        let manager = GeminiCacheManager::new(dir.path(), "m").with_min_file_size(32);
        manager.create(&backend, "sys", &tools()).await.unwrap();

        manager.record_file_access(&big).await;
        manager.record_file_access(&big).await;
        manager.record_file_access(&small).await;
        let meta = manager.metadata().await;
        assert_eq!(meta.discovered_files.len(), 1);
        // The live cache is untouched until the next create.
        assert!(meta.files.is_empty());
        assert!(manager.is_valid("sys", &tools()).await);

        manager.create(&backend, "sys", &tools()).await.unwrap();
        let created = backend.created.lock().unwrap();
        assert!(created[1][0].starts_with("--- FILE: "));
        assert!(created[1][0].ends_with(&"x".repeat(64)));
        drop(created);
        assert_eq!(backend.deleted.lock().unwrap().as_slice(), ["cachedContents/1"]);

        let meta = manager.metadata().await;
        assert_eq!(meta.files.len(), 1);
        assert!(meta.discovered_files.is_empty());

        // Editing a cached file invalidates the cache.
        std::fs::write(&big, "y".repeat(64)).unwrap();
        assert!(!manager.is_valid("sys", &tools()).await);
    }

    #[tokio::test]
    async fn test_metadata_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::default();
        GeminiCacheManager::new(dir.path(), "m")
            .create(&backend, "sys", &tools())
            .await
            .unwrap();

        let reloaded = GeminiCacheManager::new(dir.path(), "m");
        assert_eq!(reloaded.cache_name().await.as_deref(), Some("cachedContents/1"));
        assert!(reloaded.is_valid("sys", &tools()).await);
    }

    #[tokio::test]
    async fn test_clear_on_start_and_failure_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::default();
        GeminiCacheManager::new(dir.path(), "m")
            .create(&backend, "sys", &tools())
            .await
            .unwrap();

        let failing = RecordingBackend {
            fail: true,
            ..Default::default()
        };
        let manager = GeminiCacheManager::new(dir.path(), "m").with_clear_on_start(true);
        assert_eq!(manager.prepare(&failing, "sys", &tools()).await, None);
        assert_eq!(failing.deleted.lock().unwrap().as_slice(), ["cachedContents/1"]);
        assert_eq!(manager.metadata().await, CacheMetadata::default());
    }

    /// Holds `create_cache` open until released.
    #[derive(Default)]
    struct GatedBackend {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl CacheBackend for GatedBackend {
        async fn create_cache(
            &self,
            _model: &str,
            _system_instruction: &str,
            _tools: &[ToolSpec],
            _documents: &[String],
            _ttl_secs: u64,
        ) -> Result<String, ProviderError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok("cachedContents/gated".into())
        }

        async fn delete_cache(&self, _handle: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_file_recorded_during_upload_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let early = dir.path().join("early.txt");
        let late = dir.path().join("late.txt");
        std::fs::write(&early, "e".repeat(64)).unwrap();
        std::fs::write(&late, "l".repeat(64)).unwrap();

        let backend = GatedBackend::default();
        let manager = GeminiCacheManager::new(dir.path(), "m").with_min_file_size(32);
        manager.record_file_access(&early).await;

        let record_late = async {
            backend.entered.notified().await;
            manager.record_file_access(&late).await;
            backend.release.notify_one();
        };
        let tool_defs = tools();
        let (handle, ()) = tokio::join!(manager.create(&backend, "sys", &tool_defs), record_late);
        assert_eq!(handle.unwrap(), "cachedContents/gated");

        let meta = manager.metadata().await;
        let late_key = std::fs::canonicalize(&late).unwrap().to_string_lossy().into_owned();
        let early_key = std::fs::canonicalize(&early).unwrap().to_string_lossy().into_owned();
        assert!(meta.files.contains_key(&early_key));
        assert_eq!(meta.discovered_files, vec![late_key]);
    }

    #[tokio::test]
    async fn test_state_is_reread_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::default();
        let reader = GeminiCacheManager::new(dir.path(), "m");
        let writer = GeminiCacheManager::new(dir.path(), "m");

        assert!(!reader.is_valid("sys", &tools()).await);
        writer.create(&backend, "sys", &tools()).await.unwrap();
        assert!(reader.is_valid("sys", &tools()).await);

        writer.clear(Some(&backend)).await;
        assert_eq!(reader.cache_name().await, None);
    }
}
