//! In-process object store with lease semantics
//!
//! Lease expiry follows the tokio clock so tests can run with paused time.
//! Every call is counted per [`StoreOp`], faults can be queued to make the
//! next call of a given kind fail, and calls of a kind can be slowed down.

use super::{ObjectProperties, RemoteResult, RemoteStore};
use crate::error::RemoteFault;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use uuid::Uuid;

/// Kinds of remote call, used for counting and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    EnsureContainer,
    Exists,
    Properties,
    Download,
    Upload,
    AcquireLease,
    RenewLease,
    ReleaseLease,
    BreakLease,
}

#[derive(Debug, Clone)]
struct ActiveLease {
    id: String,
    duration: Duration,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Bytes,
    metadata: HashMap<String, String>,
    last_modified: DateTime<Utc>,
    lease: Option<ActiveLease>,
}

impl MemoryObject {
    /// The lease if it has not yet expired
    fn live_lease(&self) -> Option<&ActiveLease> {
        self.lease
            .as_ref()
            .filter(|lease| lease.expires_at > Instant::now())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    container_exists: bool,
    objects: HashMap<String, MemoryObject>,
    faults: HashMap<StoreOp, VecDeque<RemoteFault>>,
    calls: HashMap<StoreOp, usize>,
    latency: HashMap<StoreOp, Duration>,
}

impl MemoryState {
    /// Count the call and pop a queued fault for it, if any
    fn enter(&mut self, op: StoreOp) -> RemoteResult<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn container(&self) -> RemoteResult<()> {
        if self.container_exists {
            Ok(())
        } else {
            Err(RemoteFault::not_found("ContainerNotFound"))
        }
    }

    fn object(&self, name: &str) -> RemoteResult<&MemoryObject> {
        self.container()?;
        self.objects
            .get(name)
            .ok_or_else(|| RemoteFault::not_found(format!("BlobNotFound: {}", name)))
    }

    fn object_mut(&mut self, name: &str) -> RemoteResult<&mut MemoryObject> {
        self.container()?;
        self.objects
            .get_mut(name)
            .ok_or_else(|| RemoteFault::not_found(format!("BlobNotFound: {}", name)))
    }
}

/// Object store held entirely in memory
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create a store whose container already exists
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                container_exists: true,
                ..Default::default()
            }),
        }
    }

    /// Create a store with no container; every call fails with 404 until
    /// `ensure_container_exists` runs
    pub fn without_container() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Seed an object directly, bypassing call counting
    pub fn insert(
        &self,
        name: &str,
        data: impl Into<Bytes>,
        metadata: HashMap<String, String>,
        last_modified: DateTime<Utc>,
    ) {
        let mut state = self.state.lock();
        state.container_exists = true;
        state.objects.insert(
            name.to_string(),
            MemoryObject {
                data: data.into(),
                metadata,
                last_modified,
                lease: None,
            },
        );
    }

    /// Stored bytes of an object, if present
    pub fn object_data(&self, name: &str) -> Option<Bytes> {
        self.state.lock().objects.get(name).map(|o| o.data.clone())
    }

    /// Id of the live lease on an object, if any
    pub fn lease_holder(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .objects
            .get(name)
            .and_then(MemoryObject::live_lease)
            .map(|lease| lease.id.clone())
    }

    /// Number of calls made of one kind
    pub fn calls(&self, op: StoreOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Make the next call of `op` fail with `fault`
    pub fn inject_fault(&self, op: StoreOp, fault: RemoteFault) {
        self.state
            .lock()
            .faults
            .entry(op)
            .or_default()
            .push_back(fault);
    }
}

impl MemoryStore {
    /// Delay every later call of `op` by `latency` before it is served
    pub fn set_latency(&self, op: StoreOp, latency: Duration) {
        self.state.lock().latency.insert(op, latency);
    }

    async fn pause(&self, op: StoreOp) {
        let latency = self.state.lock().latency.get(&op).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn ensure_container_exists(&self) -> RemoteResult<()> {
        self.pause(StoreOp::EnsureContainer).await;
        let mut state = self.state.lock();
        state.enter(StoreOp::EnsureContainer)?;
        state.container_exists = true;
        Ok(())
    }

    async fn exists(&self, name: &str) -> RemoteResult<bool> {
        self.pause(StoreOp::Exists).await;
        let mut state = self.state.lock();
        state.enter(StoreOp::Exists)?;
        Ok(state.container_exists && state.objects.contains_key(name))
    }

    async fn properties(&self, name: &str) -> RemoteResult<ObjectProperties> {
        self.pause(StoreOp::Properties).await;
        let mut state = self.state.lock();
        state.enter(StoreOp::Properties)?;
        let object = state.object(name)?;
        Ok(ObjectProperties {
            length: object.data.len() as u64,
            last_modified: object.last_modified,
            metadata: object.metadata.clone(),
        })
    }

    async fn download_to(
        &self,
        name: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> RemoteResult<u64> {
        self.pause(StoreOp::Download).await;
        let data = {
            let mut state = self.state.lock();
            state.enter(StoreOp::Download)?;
            state.object(name)?.data.clone()
        };

        sink.write_all(&data)
            .await
            .map_err(|e| RemoteFault::new(crate::error::status::INTERNAL, e.to_string()))?;
        Ok(data.len() as u64)
    }

    async fn upload_from(
        &self,
        name: &str,
        body: Bytes,
        metadata: HashMap<String, String>,
    ) -> RemoteResult<()> {
        self.pause(StoreOp::Upload).await;
        let mut state = self.state.lock();
        state.enter(StoreOp::Upload)?;
        state.container()?;

        let lease = match state.objects.get(name) {
            Some(existing) if existing.live_lease().is_some() => {
                return Err(RemoteFault::precondition_failed(format!(
                    "LeaseIdMissing: {} is leased",
                    name
                )));
            }
            Some(existing) => existing.lease.clone(),
            None => None,
        };

        state.objects.insert(
            name.to_string(),
            MemoryObject {
                data: body,
                metadata,
                last_modified: Utc::now(),
                lease,
            },
        );
        Ok(())
    }

    async fn acquire_lease(
        &self,
        name: &str,
        duration: Duration,
        proposed_id: Option<&str>,
    ) -> RemoteResult<String> {
        self.pause(StoreOp::AcquireLease).await;
        let mut state = self.state.lock();
        state.enter(StoreOp::AcquireLease)?;
        let object = state.object_mut(name)?;

        let id = match object.live_lease() {
            Some(lease) if Some(lease.id.as_str()) == proposed_id => lease.id.clone(),
            Some(_) => {
                return Err(RemoteFault::conflict(format!(
                    "LeaseAlreadyPresent: {}",
                    name
                )))
            }
            None => proposed_id
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        };

        object.lease = Some(ActiveLease {
            id: id.clone(),
            duration,
            expires_at: Instant::now() + duration,
        });
        Ok(id)
    }

    async fn renew_lease(&self, name: &str, lease_id: &str) -> RemoteResult<()> {
        self.pause(StoreOp::RenewLease).await;
        let mut state = self.state.lock();
        state.enter(StoreOp::RenewLease)?;
        let object = state.object_mut(name)?;

        // An expired lease can still be renewed by its holder until someone
        // else takes it.
        match object.lease.as_mut() {
            Some(lease) if lease.id == lease_id => {
                lease.expires_at = Instant::now() + lease.duration;
                Ok(())
            }
            Some(_) => Err(RemoteFault::conflict(format!(
                "LeaseIdMismatchWithLeaseOperation: {}",
                name
            ))),
            None => Err(RemoteFault::conflict(format!("LeaseNotPresent: {}", name))),
        }
    }

    async fn release_lease(&self, name: &str, lease_id: &str) -> RemoteResult<()> {
        self.pause(StoreOp::ReleaseLease).await;
        let mut state = self.state.lock();
        state.enter(StoreOp::ReleaseLease)?;
        let object = state.object_mut(name)?;

        match object.lease.as_ref() {
            Some(lease) if lease.id == lease_id => {
                object.lease = None;
                Ok(())
            }
            Some(_) => Err(RemoteFault::conflict(format!(
                "LeaseIdMismatchWithLeaseOperation: {}",
                name
            ))),
            None => Err(RemoteFault::conflict(format!("LeaseNotPresent: {}", name))),
        }
    }

    async fn break_lease(&self, name: &str) -> RemoteResult<()> {
        self.pause(StoreOp::BreakLease).await;
        let mut state = self.state.lock();
        state.enter(StoreOp::BreakLease)?;
        state.object_mut(name)?.lease = None;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
