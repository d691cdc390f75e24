//! Remote-backed directory with a local read-through cache
//!
//! [`BlobDirectory`] ties a [`RemoteStore`], a [`CacheDir`] and a
//! [`CompressionPolicy`] together. Opening an object serializes on the
//! object's name mutex, checks freshness, repopulates the cache if stale, and
//! returns a [`CachedInput`] over the local copy.

use crate::cache::freshness::{self, encode_last_modified};
use crate::cache::populate::{populate, PopulateContext};
use crate::cache::{CacheDir, CachedInput, Freshness, NameMutexRegistry};
use crate::compression::{deflate, CompressionPolicy, ExtensionPolicy};
use crate::config::{Config, TimestampFormat};
use crate::error::{BlobdirError, BlobdirResult};
use crate::lock::{LeaseLock, LockSettings};
use crate::store::{metadata, CallPolicy, LocalStore, ObjectProperties, RemoteStore};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Default inflate buffer size
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A remote container mirrored into a local cache directory
pub struct BlobDirectory {
    store: Arc<dyn RemoteStore>,
    cache: CacheDir,
    policy: Arc<dyn CompressionPolicy>,
    registry: &'static NameMutexRegistry,
    calls: CallPolicy,
    chunk_size: usize,
    timestamp_format: TimestampFormat,
    lock_settings: LockSettings,
}

impl BlobDirectory {
    /// Directory with default settings and no compression
    pub fn new(store: Arc<dyn RemoteStore>, cache: CacheDir) -> Self {
        Self {
            store,
            cache,
            policy: Arc::new(ExtensionPolicy::disabled()),
            registry: NameMutexRegistry::global(),
            calls: CallPolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            timestamp_format: TimestampFormat::default(),
            lock_settings: LockSettings::default(),
        }
    }

    /// Build the directory described by a configuration: a directory-backed
    /// store and the configured cache location
    pub async fn from_config(config: &Config) -> BlobdirResult<Self> {
        let store = LocalStore::new(&config.store.root, &config.store.container);
        let cache = CacheDir::open(&config.cache.dir).await?;
        let removed = cache.remove_partials().await?;
        if removed > 0 {
            info!(removed, "cleaned up interrupted cache populations");
        }

        Ok(Self::new(Arc::new(store), cache)
            .with_policy(Arc::new(ExtensionPolicy::from_config(&config.cache)))
            .with_calls(CallPolicy::new(config.remote.call_timeout()))
            .with_chunk_size(config.cache.chunk_size)
            .with_timestamp_format(config.cache.timestamp_format)
            .with_lock_settings(LockSettings::from_config(&config.lock)))
    }

    pub fn with_policy(mut self, policy: Arc<dyn CompressionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Use a separate name mutex registry instead of the process-wide one
    pub fn with_registry(mut self, registry: &'static NameMutexRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_calls(mut self, calls: CallPolicy) -> Self {
        self.calls = calls;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_timestamp_format(mut self, format: TimestampFormat) -> Self {
        self.timestamp_format = format;
        self
    }

    pub fn with_lock_settings(mut self, settings: LockSettings) -> Self {
        self.lock_settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn cache(&self) -> &CacheDir {
        &self.cache
    }

    /// Abort in-flight and future remote calls, including lock renewals
    pub fn cancel(&self) {
        self.calls.cancel();
    }

    /// Whether the cached copy of `name` matches the remote object
    ///
    /// Without a cached copy the answer is `false` and the store is not
    /// contacted.
    pub async fn is_fresh(&self, name: &str) -> BlobdirResult<bool> {
        Ok(self.freshness(name).await?.is_fresh())
    }

    /// Freshness of the cached copy of `name`, with the reason when stale
    pub async fn freshness(&self, name: &str) -> BlobdirResult<Freshness> {
        if !self.cache.file_exists(name).await? {
            return Ok(Freshness::Stale(crate::cache::StaleReason::NotCached));
        }
        let remote = self.remote_properties(name).await?;
        freshness::evaluate(&self.cache, name, remote.as_ref(), self.timestamp_format).await
    }

    /// Open `name` for reading, refreshing the cached copy first if needed
    ///
    /// A name with no remote object opens as an empty input.
    pub async fn open_input(&self, name: &str) -> BlobdirResult<CachedInput> {
        crate::cache::validate_name(name)?;
        let mutex = self.registry.grab(name);
        let _guard = mutex.lock().await;

        let remote = if self.cache.file_exists(name).await? {
            let remote = self.remote_properties(name).await?;
            let state =
                freshness::evaluate(&self.cache, name, remote.as_ref(), self.timestamp_format)
                    .await?;
            match state {
                Freshness::Fresh => {
                    debug!(name = %name, "cache hit");
                    None
                }
                Freshness::Stale(reason) => {
                    debug!(name = %name, reason = %reason, "cache entry stale");
                    Some(remote)
                }
            }
        } else {
            debug!(name = %name, "cache miss");
            Some(self.remote_properties(name).await?)
        };

        if let Some(remote) = remote {
            populate(
                self.populate_context(),
                name,
                remote.as_ref(),
                self.policy.should_compress(name),
            )
            .await?;
        }

        CachedInput::open(&self.cache, name, mutex.clone()).await
    }

    /// Write `data` as `name` to the cache and the remote store
    ///
    /// The uploaded object carries the uncompressed length and the cache
    /// file's modification time, so an open elsewhere treats it as fresh.
    pub async fn publish(&self, name: &str, data: Bytes) -> BlobdirResult<()> {
        crate::cache::validate_name(name)?;
        let mutex = self.registry.grab(name);
        let _guard = mutex.lock().await;

        let mut writer = self.cache.create_for_write(name).await?;
        writer
            .file_mut()
            .write_all(&data)
            .await
            .map_err(|e| BlobdirError::io(format!("writing cache entry {}", name), e))?;
        writer.commit(None).await?;
        let modified = self.cache.file_modified(name).await?;

        let mut fields = HashMap::new();
        fields.insert(metadata::CACHED_LENGTH.to_string(), data.len().to_string());
        fields.insert(
            metadata::CACHED_LAST_MODIFIED.to_string(),
            encode_last_modified(modified, self.timestamp_format),
        );

        let compressed = self.policy.should_compress(name);
        let body = if compressed {
            Bytes::from(
                deflate(&data).map_err(|e| BlobdirError::io(format!("compressing {}", name), e))?,
            )
        } else {
            data.clone()
        };
        let stored = body.len();

        self.calls
            .run("ensure_container", self.store.ensure_container_exists())
            .await?;
        self.calls
            .run("upload", self.store.upload_from(name, body, fields))
            .await?;

        info!(
            name = %name,
            bytes = data.len(),
            stored,
            compressed,
            backend = self.store.backend_name(),
            "published object"
        );
        Ok(())
    }

    /// A lease lock on `name` in this directory's store
    pub fn make_lock(&self, name: &str) -> LeaseLock {
        LeaseLock::new(
            name,
            Arc::clone(&self.store),
            self.lock_settings,
            self.calls.child(),
        )
    }

    /// Remote properties of `name`, `None` if the object does not exist
    async fn remote_properties(&self, name: &str) -> BlobdirResult<Option<ObjectProperties>> {
        match self
            .calls
            .run("properties", self.store.properties(name))
            .await
        {
            Ok(props) => Ok(Some(props)),
            Err(BlobdirError::Remote(fault)) if fault.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn populate_context(&self) -> PopulateContext<'_> {
        PopulateContext {
            store: self.store.as_ref(),
            calls: &self.calls,
            cache: &self.cache,
            chunk_size: self.chunk_size,
            timestamp_format: self.timestamp_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::freshness::utc_to_ticks;
    use crate::cache::StaleReason;
    use crate::error::RemoteFault;
    use crate::store::{MemoryStore, StoreOp};
    use chrono::{DateTime, Duration, Utc};
    use tempfile::TempDir;

    fn leaked_registry() -> &'static NameMutexRegistry {
        Box::leak(Box::new(NameMutexRegistry::new()))
    }

    async fn directory(store: &Arc<MemoryStore>) -> (TempDir, BlobDirectory) {
        let temp = TempDir::new().unwrap();
        let cache = CacheDir::open(temp.path()).await.unwrap();
        let dir = BlobDirectory::new(Arc::clone(store) as Arc<dyn RemoteStore>, cache)
            .with_registry(leaked_registry());
        (temp, dir)
    }

    fn whole_seconds_now() -> DateTime<Utc> {
        DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap()
    }

    async fn read_all(input: &mut CachedInput) -> Vec<u8> {
        let mut buf = vec![0u8; input.length() as usize];
        input.read_bytes(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn first_open_downloads_once() {
        let store = Arc::new(MemoryStore::new());
        store.insert("segments.gen", vec![1u8; 20], HashMap::new(), Utc::now());
        let (_temp, dir) = directory(&store).await;

        let input = dir.open_input("segments.gen").await.unwrap();

        assert_eq!(input.length(), 20);
        assert_eq!(store.calls(StoreOp::Download), 1);
    }

    #[tokio::test]
    async fn fresh_entry_is_not_downloaded_again() {
        let store = Arc::new(MemoryStore::new());
        store.insert("segments.gen", vec![1u8; 20], HashMap::new(), whole_seconds_now());
        let (_temp, dir) = directory(&store).await;

        dir.open_input("segments.gen").await.unwrap();
        assert!(dir.is_fresh("segments.gen").await.unwrap());
        dir.open_input("segments.gen").await.unwrap();

        assert_eq!(store.calls(StoreOp::Download), 1);
    }

    #[tokio::test]
    async fn matching_cached_metadata_skips_download() {
        let store = Arc::new(MemoryStore::new());
        let (temp, dir) = directory(&store).await;

        let path = temp.path().join("_0.cfs");
        tokio::fs::write(&path, vec![9u8; 100]).await.unwrap();
        let local_mtime = dir.cache().file_modified("_0.cfs").await.unwrap();

        // Stored bytes differ in length; metadata describes the cached form
        let mut fields = HashMap::new();
        fields.insert(metadata::CACHED_LENGTH.to_string(), "100".to_string());
        fields.insert(
            metadata::CACHED_LAST_MODIFIED.to_string(),
            utc_to_ticks(local_mtime + Duration::milliseconds(400)).to_string(),
        );
        store.insert("_0.cfs", vec![0u8; 37], fields, Utc::now() - Duration::days(3));

        let input = dir.open_input("_0.cfs").await.unwrap();

        assert_eq!(input.length(), 100);
        assert_eq!(store.calls(StoreOp::Download), 0);
    }

    #[tokio::test]
    async fn changed_remote_is_refreshed() {
        let store = Arc::new(MemoryStore::new());
        let stamp = whole_seconds_now();
        store.insert("_1.cfs", b"first".to_vec(), HashMap::new(), stamp);
        let (_temp, dir) = directory(&store).await;

        let mut old = dir.open_input("_1.cfs").await.unwrap();
        store.insert(
            "_1.cfs",
            b"second version".to_vec(),
            HashMap::new(),
            stamp + Duration::seconds(10),
        );

        assert_eq!(
            dir.freshness("_1.cfs").await.unwrap(),
            Freshness::Stale(StaleReason::LengthMismatch {
                cached: 5,
                remote: 14
            })
        );
        let mut new = dir.open_input("_1.cfs").await.unwrap();

        assert_eq!(read_all(&mut new).await, b"second version");
        assert_eq!(read_all(&mut old).await, b"first");
        assert_eq!(store.calls(StoreOp::Download), 2);
    }

    #[tokio::test]
    async fn clone_survives_same_length_repopulation() {
        let store = Arc::new(MemoryStore::new());
        let stamp = whole_seconds_now();
        store.insert("segments.gen", vec![1u8; 20], HashMap::new(), stamp);
        let (_temp, dir) = directory(&store).await;

        let old = dir.open_input("segments.gen").await.unwrap();
        store.insert(
            "segments.gen",
            vec![2u8; 20],
            HashMap::new(),
            stamp + Duration::seconds(10),
        );
        let mut new = dir.open_input("segments.gen").await.unwrap();
        let mut clone = old.try_clone().await.unwrap();

        assert_eq!(store.calls(StoreOp::Download), 2);
        assert_eq!(clone.read_byte().await.unwrap(), 1);
        assert_eq!(new.read_byte().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn uncached_name_is_stale_without_remote_call() {
        let store = Arc::new(MemoryStore::new());
        store.insert("segments.gen", vec![1u8; 20], HashMap::new(), Utc::now());
        let (_temp, dir) = directory(&store).await;

        assert!(!dir.is_fresh("segments.gen").await.unwrap());
        assert_eq!(store.calls(StoreOp::Properties), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_opens_populate_once() {
        let store = Arc::new(MemoryStore::new());
        store.insert("_2.cfs", vec![5u8; 4096], HashMap::new(), whole_seconds_now());
        let (_temp, dir) = directory(&store).await;
        let dir = Arc::new(dir);

        let opens = (0..8).map(|_| {
            let dir = Arc::clone(&dir);
            tokio::spawn(async move { dir.open_input("_2.cfs").await.map(|i| i.length()) })
        });
        let lengths = futures_util::future::join_all(opens).await;

        for length in lengths {
            assert_eq!(length.unwrap().unwrap(), 4096);
        }
        assert_eq!(store.calls(StoreOp::Download), 1);
    }

    #[tokio::test]
    async fn missing_remote_opens_empty() {
        let store = Arc::new(MemoryStore::new());
        let (_temp, dir) = directory(&store).await;

        let mut input = dir.open_input("_7.cfs").await.unwrap();

        assert_eq!(input.length(), 0);
        assert!(matches!(
            input.read_byte().await.unwrap_err(),
            BlobdirError::EndOfInput { .. }
        ));
        assert_eq!(store.calls(StoreOp::Download), 0);
    }

    #[tokio::test]
    async fn transient_fault_propagates_from_open() {
        let store = Arc::new(MemoryStore::new());
        store.insert("_3.cfs", vec![1u8; 8], HashMap::new(), Utc::now());
        store.inject_fault(StoreOp::Properties, RemoteFault::unavailable("throttled"));
        let (_temp, dir) = directory(&store).await;

        let err = dir.open_input("_3.cfs").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!dir.cache().file_exists("_3.cfs").await.unwrap());
    }

    #[tokio::test]
    async fn compressed_objects_roundtrip_at_chunk_boundaries() {
        for len in [0usize, 1, 65535, 65536, 131072] {
            let store = Arc::new(MemoryStore::new());
            let (_publisher_temp, publisher) = directory(&store).await;
            let publisher = publisher.with_policy(Arc::new(ExtensionPolicy::new(
                true,
                vec![".cfs".to_string()],
            )));
            let (_reader_temp, reader) = directory(&store).await;
            let reader = reader.with_policy(Arc::new(ExtensionPolicy::new(
                true,
                vec![".cfs".to_string()],
            )));

            let original: Vec<u8> = (0..len).map(|i| (i % 241) as u8).collect();
            publisher
                .publish("_4.cfs", Bytes::from(original.clone()))
                .await
                .unwrap();

            let mut input = reader.open_input("_4.cfs").await.unwrap();
            assert_eq!(input.length(), len as u64, "length for {len}");
            assert_eq!(read_all(&mut input).await, original, "content for {len}");
        }
    }

    #[tokio::test]
    async fn published_object_is_fresh_for_the_publisher() {
        let store = Arc::new(MemoryStore::new());
        let (_temp, dir) = directory(&store).await;

        dir.publish("segments.gen", Bytes::from_static(b"generation"))
            .await
            .unwrap();

        assert!(dir.is_fresh("segments.gen").await.unwrap());
        let input = dir.open_input("segments.gen").await.unwrap();
        assert_eq!(input.length(), 10);
        assert_eq!(store.calls(StoreOp::Download), 0);
    }

    #[tokio::test]
    async fn cancelled_directory_refuses_remote_calls() {
        let store = Arc::new(MemoryStore::new());
        store.insert("_5.cfs", vec![1u8; 8], HashMap::new(), Utc::now());
        let (_temp, dir) = directory(&store).await;

        dir.cancel();
        let err = dir.open_input("_5.cfs").await.unwrap_err();
        assert!(matches!(err, BlobdirError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn locks_share_the_store() {
        let store = Arc::new(MemoryStore::new());
        let (_temp, dir) = directory(&store).await;

        let a = dir.make_lock("write.lock");
        let b = dir.make_lock("write.lock");
        assert!(a.obtain().await);
        assert!(!b.obtain().await);
        a.release().await.unwrap();
        assert!(b.obtain().await);
    }
}
