//! Remote object store abstraction
//!
//! The cache and the lease lock only ever talk to the store through
//! [`RemoteStore`], so the same code runs against:
//! - `MemoryStore`: in-process, used by tests and embedding callers
//! - `LocalStore`: a shared directory, usable across processes on one host
//!
//! Failures surface as [`RemoteFault`] carrying an HTTP-style status code.

pub mod call;
pub mod local;
pub mod memory;

pub use call::CallPolicy;
pub use local::LocalStore;
pub use memory::{MemoryStore, StoreOp};

use crate::error::RemoteFault;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWrite;

/// Result of a single remote call
pub type RemoteResult<T> = Result<T, RemoteFault>;

/// Metadata field names stored alongside each object
///
/// These names are shared with objects written by other deployments and must
/// not change.
pub mod metadata {
    /// Decimal byte length of the uncompressed content
    pub const CACHED_LENGTH: &str = "CachedLength";
    /// Decimal last-modified timestamp of the cached content
    pub const CACHED_LAST_MODIFIED: &str = "CachedLastModified";
}

/// Store-native description of one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectProperties {
    /// Stored (possibly compressed) byte length
    pub length: u64,
    /// Store-assigned modification time
    pub last_modified: DateTime<Utc>,
    /// User metadata
    pub metadata: HashMap<String, String>,
}

/// Operations the cache and the lock need from a remote object store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create the backing container if it is missing
    async fn ensure_container_exists(&self) -> RemoteResult<()>;

    /// Whether an object exists
    async fn exists(&self, name: &str) -> RemoteResult<bool>;

    /// Length, modification time and metadata in one call
    async fn properties(&self, name: &str) -> RemoteResult<ObjectProperties>;

    async fn metadata(&self, name: &str) -> RemoteResult<HashMap<String, String>> {
        Ok(self.properties(name).await?.metadata)
    }

    async fn length(&self, name: &str) -> RemoteResult<u64> {
        Ok(self.properties(name).await?.length)
    }

    async fn last_modified_utc(&self, name: &str) -> RemoteResult<DateTime<Utc>> {
        Ok(self.properties(name).await?.last_modified)
    }

    /// Stream the stored bytes into `sink`, returning the byte count
    async fn download_to(
        &self,
        name: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> RemoteResult<u64>;

    /// Replace the object body and metadata
    async fn upload_from(
        &self,
        name: &str,
        body: Bytes,
        metadata: HashMap<String, String>,
    ) -> RemoteResult<()>;

    /// Acquire a time-boxed lease, returning its id
    ///
    /// Passing the id of the lease already held extends it instead of failing.
    async fn acquire_lease(
        &self,
        name: &str,
        duration: Duration,
        proposed_id: Option<&str>,
    ) -> RemoteResult<String>;

    async fn renew_lease(&self, name: &str, lease_id: &str) -> RemoteResult<()>;

    async fn release_lease(&self, name: &str, lease_id: &str) -> RemoteResult<()>;

    /// End any lease on the object regardless of who holds it
    async fn break_lease(&self, name: &str) -> RemoteResult<()>;

    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;
}
