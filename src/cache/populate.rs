//! Filling the cache from the remote store

use super::freshness::remote_last_modified;
use super::{CacheDir, CacheWriter};
use crate::compression::inflate_into;
use crate::config::TimestampFormat;
use crate::error::{BlobdirError, BlobdirResult};
use crate::store::{CallPolicy, ObjectProperties, RemoteStore};
use std::time::{Instant, SystemTime};
use tracing::{debug, info, warn};

/// Everything population needs besides the object itself
#[derive(Clone, Copy)]
pub struct PopulateContext<'a> {
    pub store: &'a dyn RemoteStore,
    pub calls: &'a CallPolicy,
    pub cache: &'a CacheDir,
    pub chunk_size: usize,
    pub timestamp_format: TimestampFormat,
}

/// Replace the cached copy of `name` with the remote content
///
/// `remote` is `None` when the remote object does not exist; the cache entry
/// then becomes an empty file. The committed file carries the remote
/// last-modified time so the next freshness check sees it as current.
/// Returns the number of bytes written to the cache.
pub async fn populate(
    ctx: PopulateContext<'_>,
    name: &str,
    remote: Option<&ObjectProperties>,
    compressed: bool,
) -> BlobdirResult<u64> {
    let Some(remote) = remote else {
        warn!(name = %name, "remote object missing, caching an empty file");
        return write_empty(ctx.cache, name).await;
    };

    let started = Instant::now();
    let mut writer = ctx.cache.create_for_write(name).await?;

    let outcome = if compressed {
        download_compressed(ctx, name, &mut writer).await
    } else {
        let file = writer.file_mut();
        ctx.calls
            .run("download", ctx.store.download_to(name, file))
            .await
    };

    let written = match outcome {
        Ok(written) => written,
        Err(BlobdirError::Remote(fault)) if fault.is_not_found() => {
            // Deleted between the properties call and the download
            warn!(name = %name, "remote object vanished during download, caching an empty file");
            drop(writer);
            return write_empty(ctx.cache, name).await;
        }
        Err(e) => return Err(e),
    };

    let stamp: SystemTime = remote_last_modified(remote, ctx.timestamp_format).into();
    writer.commit(Some(stamp)).await?;

    info!(
        name = %name,
        bytes = written,
        compressed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "populated cache entry"
    );
    Ok(written)
}

async fn download_compressed(
    ctx: PopulateContext<'_>,
    name: &str,
    writer: &mut CacheWriter,
) -> BlobdirResult<u64> {
    let mut compressed: Vec<u8> = Vec::new();
    let stored = ctx
        .calls
        .run("download", ctx.store.download_to(name, &mut compressed))
        .await?;

    let inflated = inflate_into(&compressed, writer.file_mut(), ctx.chunk_size)
        .await
        .map_err(|e| BlobdirError::io(format!("inflating {}", name), e))?;

    debug!(name = %name, stored, inflated, "inflated compressed object");
    Ok(inflated)
}

async fn write_empty(cache: &CacheDir, name: &str) -> BlobdirResult<u64> {
    cache.create_for_write(name).await?.commit(None).await?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::deflate;
    use crate::store::{MemoryStore, StoreOp};
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn stamp() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-04-04T04:04:04Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn plain_object_is_copied_and_stamped() {
        let temp = TempDir::new().unwrap();
        let cache = CacheDir::open(temp.path()).await.unwrap();
        let store = MemoryStore::new();
        store.insert("segments.gen", vec![7u8; 20], HashMap::new(), stamp());
        let calls = CallPolicy::default();
        let ctx = PopulateContext {
            store: &store,
            calls: &calls,
            cache: &cache,
            chunk_size: 65536,
            timestamp_format: TimestampFormat::DotnetTicks,
        };

        let props = store.properties("segments.gen").await.unwrap();
        let written = populate(ctx, "segments.gen", Some(&props), false).await.unwrap();

        assert_eq!(written, 20);
        assert_eq!(cache.file_length("segments.gen").await.unwrap(), 20);
        assert_eq!(
            cache.file_modified_millis("segments.gen").await.unwrap(),
            stamp().timestamp_millis()
        );
        assert_eq!(store.calls(StoreOp::Download), 1);
    }

    #[tokio::test]
    async fn compressed_object_is_inflated() {
        let temp = TempDir::new().unwrap();
        let cache = CacheDir::open(temp.path()).await.unwrap();
        let store = MemoryStore::new();
        let original: Vec<u8> = (0..100_000u32).map(|i| (i % 13) as u8).collect();
        store.insert("_0.cfs", deflate(&original).unwrap(), HashMap::new(), stamp());
        let calls = CallPolicy::default();
        let ctx = PopulateContext {
            store: &store,
            calls: &calls,
            cache: &cache,
            chunk_size: 4096,
            timestamp_format: TimestampFormat::DotnetTicks,
        };

        let props = store.properties("_0.cfs").await.unwrap();
        let written = populate(ctx, "_0.cfs", Some(&props), true).await.unwrap();

        assert_eq!(written, original.len() as u64);
        let cached = tokio::fs::read(cache.path_of("_0.cfs").unwrap()).await.unwrap();
        assert_eq!(cached, original);
    }

    #[tokio::test]
    async fn missing_remote_leaves_empty_entry() {
        let temp = TempDir::new().unwrap();
        let cache = CacheDir::open(temp.path()).await.unwrap();
        let store = MemoryStore::new();
        let calls = CallPolicy::default();
        let ctx = PopulateContext {
            store: &store,
            calls: &calls,
            cache: &cache,
            chunk_size: 65536,
            timestamp_format: TimestampFormat::DotnetTicks,
        };

        let written = populate(ctx, "_9.cfs", None, false).await.unwrap();

        assert_eq!(written, 0);
        assert_eq!(cache.file_length("_9.cfs").await.unwrap(), 0);
        assert_eq!(store.calls(StoreOp::Download), 0);
    }

    #[tokio::test]
    async fn failed_download_keeps_previous_entry() {
        let temp = TempDir::new().unwrap();
        let cache = CacheDir::open(temp.path()).await.unwrap();
        tokio::fs::write(cache.path_of("_1.cfs").unwrap(), b"old")
            .await
            .unwrap();

        let store = MemoryStore::new();
        store.insert("_1.cfs", b"newer".to_vec(), HashMap::new(), stamp());
        store.inject_fault(
            StoreOp::Download,
            crate::error::RemoteFault::unavailable("throttled"),
        );
        let calls = CallPolicy::default();
        let ctx = PopulateContext {
            store: &store,
            calls: &calls,
            cache: &cache,
            chunk_size: 65536,
            timestamp_format: TimestampFormat::DotnetTicks,
        };

        let props = store.properties("_1.cfs").await.unwrap();
        assert!(populate(ctx, "_1.cfs", Some(&props), false).await.is_err());

        let cached = tokio::fs::read(cache.path_of("_1.cfs").unwrap()).await.unwrap();
        assert_eq!(cached, b"old");
        assert_eq!(cache.remove_partials().await.unwrap(), 0);
    }
}
