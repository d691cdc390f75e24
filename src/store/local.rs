//! Directory-backed object store
//!
//! Layout under `<root>/<container>/`:
//!
//! | Path | Contents |
//! |------|----------|
//! | `<name>` | object body |
//! | `.meta/<name>.json` | user metadata |
//! | `.leases/<name>.lease` | active lease (JSON) |
//! | `.leases/<name>.guard` | advisory lock file, never removed |
//!
//! Every lease operation reads and replaces the lease file while holding an
//! exclusive OS lock on the name's guard file, so two processes racing for
//! the same lease cannot both win. Expired lease files are taken over.

use super::{ObjectProperties, RemoteResult, RemoteStore};
use crate::error::{status, RemoteFault};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWrite;
use tracing::debug;
use uuid::Uuid;

const META_DIR: &str = ".meta";
const LEASE_DIR: &str = ".leases";

/// Lease file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    id: String,
    duration_secs: u64,
    expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn new(id: String, duration: Duration) -> Self {
        Self {
            id,
            duration_secs: duration.as_secs(),
            expires_at: expiry_after(duration),
        }
    }

    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

fn expiry_after(duration: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::seconds(60))
}

fn io_fault(context: &str, err: std::io::Error) -> RemoteFault {
    if err.kind() == ErrorKind::NotFound {
        RemoteFault::not_found(format!("{}: {}", context, err))
    } else {
        RemoteFault::new(status::INTERNAL, format!("{}: {}", context, err))
    }
}

/// Exclusive hold on a name's lease guard file, released on drop
#[derive(Debug)]
struct LeaseGuard {
    _file: std::fs::File,
}

/// Object store rooted at a local (possibly shared) directory
#[derive(Debug, Clone)]
pub struct LocalStore {
    container_dir: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, container: &str) -> Self {
        Self {
            container_dir: root.into().join(container),
        }
    }

    /// Directory holding this container's objects
    pub fn container_dir(&self) -> &Path {
        &self.container_dir
    }

    fn object_path(&self, name: &str) -> RemoteResult<PathBuf> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(RemoteFault::new(
                400,
                format!("InvalidResourceName: {:?}", name),
            ));
        }
        Ok(self.container_dir.join(name))
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.container_dir
            .join(META_DIR)
            .join(format!("{}.json", name))
    }

    fn lease_path(&self, name: &str) -> PathBuf {
        self.container_dir
            .join(LEASE_DIR)
            .join(format!("{}.lease", name))
    }

    fn guard_path(&self, name: &str) -> PathBuf {
        self.container_dir
            .join(LEASE_DIR)
            .join(format!("{}.guard", name))
    }

    /// Block until this process holds the name's guard lock
    async fn lock_leases(&self, name: &str) -> RemoteResult<LeaseGuard> {
        let path = self.guard_path(name);
        tokio::task::spawn_blocking(move || -> std::io::Result<LeaseGuard> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(LeaseGuard { _file: file })
        })
        .await
        .map_err(|e| RemoteFault::new(status::INTERNAL, format!("lease guard task: {}", e)))?
        .map_err(|e| io_fault("locking lease guard", e))
    }

    async fn require_container(&self) -> RemoteResult<()> {
        match fs::metadata(&self.container_dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(RemoteFault::not_found(format!(
                "ContainerNotFound: {}",
                self.container_dir.display()
            ))),
        }
    }

    async fn require_object(&self, name: &str) -> RemoteResult<PathBuf> {
        self.require_container().await?;
        let path = self.object_path(name)?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            Ok(path)
        } else {
            Err(RemoteFault::not_found(format!("BlobNotFound: {}", name)))
        }
    }

    async fn read_lease(&self, name: &str) -> RemoteResult<Option<LeaseRecord>> {
        match fs::read(self.lease_path(name)).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| RemoteFault::new(status::INTERNAL, format!("corrupt lease: {}", e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_fault("reading lease", e)),
        }
    }

    /// Write the lease file atomically
    async fn write_lease(&self, name: &str, record: &LeaseRecord) -> RemoteResult<()> {
        let path = self.lease_path(name);
        let tmp = path.with_extension(format!("lease.{}", Uuid::new_v4().simple()));
        let body = serde_json::to_vec(record)
            .map_err(|e| RemoteFault::new(status::INTERNAL, e.to_string()))?;
        fs::write(&tmp, body)
            .await
            .map_err(|e| io_fault("writing lease", e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_fault("replacing lease", e))
    }

    async fn live_lease(&self, name: &str) -> RemoteResult<Option<LeaseRecord>> {
        Ok(self.read_lease(name).await?.filter(|l| !l.is_expired()))
    }
}

#[async_trait]
impl RemoteStore for LocalStore {
    async fn ensure_container_exists(&self) -> RemoteResult<()> {
        for dir in [
            self.container_dir.clone(),
            self.container_dir.join(META_DIR),
            self.container_dir.join(LEASE_DIR),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| io_fault("creating container", e))?;
        }
        Ok(())
    }

    async fn exists(&self, name: &str) -> RemoteResult<bool> {
        match self.require_object(name).await {
            Ok(_) => Ok(true),
            Err(fault) if fault.is_not_found() => Ok(false),
            Err(fault) => Err(fault),
        }
    }

    async fn properties(&self, name: &str) -> RemoteResult<ObjectProperties> {
        let path = self.require_object(name).await?;
        let stat = fs::metadata(&path)
            .await
            .map_err(|e| io_fault("reading object metadata", e))?;
        let modified = stat
            .modified()
            .map_err(|e| io_fault("reading modification time", e))?;

        let metadata = match fs::read(self.meta_path(name)).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| RemoteFault::new(status::INTERNAL, format!("corrupt metadata: {}", e)))?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(io_fault("reading metadata", e)),
        };

        Ok(ObjectProperties {
            length: stat.len(),
            last_modified: DateTime::<Utc>::from(modified),
            metadata,
        })
    }

    async fn download_to(
        &self,
        name: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> RemoteResult<u64> {
        let path = self.require_object(name).await?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| io_fault("opening object", e))?;
        let copied = tokio::io::copy(&mut file, sink)
            .await
            .map_err(|e| io_fault("downloading object", e))?;
        debug!(name = %name, bytes = copied, "local store download");
        Ok(copied)
    }

    async fn upload_from(
        &self,
        name: &str,
        body: Bytes,
        metadata: HashMap<String, String>,
    ) -> RemoteResult<()> {
        self.require_container().await?;
        let path = self.object_path(name)?;

        if self.live_lease(name).await?.is_some() {
            return Err(RemoteFault::precondition_failed(format!(
                "LeaseIdMissing: {} is leased",
                name
            )));
        }

        let tmp = self
            .container_dir
            .join(format!(".{}.{}.upload", name, Uuid::new_v4().simple()));
        fs::write(&tmp, &body)
            .await
            .map_err(|e| io_fault("writing object", e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_fault("committing object", e))?;

        let meta_body = serde_json::to_vec(&metadata)
            .map_err(|e| RemoteFault::new(status::INTERNAL, e.to_string()))?;
        fs::write(self.meta_path(name), meta_body)
            .await
            .map_err(|e| io_fault("writing metadata", e))
    }

    async fn acquire_lease(
        &self,
        name: &str,
        duration: Duration,
        proposed_id: Option<&str>,
    ) -> RemoteResult<String> {
        self.require_object(name).await?;
        let id = proposed_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let record = LeaseRecord::new(id.clone(), duration);

        let _guard = self.lock_leases(name).await?;
        match self.read_lease(name).await? {
            Some(existing) if existing.id != id && !existing.is_expired() => Err(
                RemoteFault::conflict(format!("LeaseAlreadyPresent: {}", name)),
            ),
            _ => {
                self.write_lease(name, &record).await?;
                Ok(id)
            }
        }
    }

    async fn renew_lease(&self, name: &str, lease_id: &str) -> RemoteResult<()> {
        self.require_object(name).await?;
        let _guard = self.lock_leases(name).await?;
        match self.read_lease(name).await? {
            Some(existing) if existing.id == lease_id => {
                let duration = Duration::from_secs(existing.duration_secs);
                self.write_lease(name, &LeaseRecord::new(existing.id, duration))
                    .await
            }
            Some(_) => Err(RemoteFault::conflict(format!(
                "LeaseIdMismatchWithLeaseOperation: {}",
                name
            ))),
            None => Err(RemoteFault::conflict(format!("LeaseNotPresent: {}", name))),
        }
    }

    async fn release_lease(&self, name: &str, lease_id: &str) -> RemoteResult<()> {
        self.require_object(name).await?;
        let _guard = self.lock_leases(name).await?;
        match self.read_lease(name).await? {
            Some(existing) if existing.id == lease_id => fs::remove_file(self.lease_path(name))
                .await
                .map_err(|e| io_fault("removing lease", e)),
            Some(_) => Err(RemoteFault::conflict(format!(
                "LeaseIdMismatchWithLeaseOperation: {}",
                name
            ))),
            None => Err(RemoteFault::conflict(format!("LeaseNotPresent: {}", name))),
        }
    }

    async fn break_lease(&self, name: &str) -> RemoteResult<()> {
        self.require_object(name).await?;
        let _guard = self.lock_leases(name).await?;
        match fs::remove_file(self.lease_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_fault("breaking lease", e)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
