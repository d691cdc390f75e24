//! Distributed lease lock
//!
//! A [`LeaseLock`] holds a time-boxed lease on one remote object. While held,
//! a background task renews the lease every renewal interval. A lease held
//! longer than the hold ceiling is broken by that task, so a holder that
//! never releases cannot block others forever.
//!
//! State machine:
//!
//! ```text
//! Unlocked ──obtain──▶ Acquiring ──▶ Held ◀──▶ Renewing
//!    ▲                     │           │
//!    └──────release────────┴───────────┤
//!                                      ▼
//!                          Broken (hold ceiling or break_lock)
//! ```
//!
//! All lease transitions go through one async mutex, so `release` and a
//! renewal tick never act on the same lease at once.

use crate::config::schema::LockConfig;
use crate::error::{BlobdirError, BlobdirResult};
use crate::store::{CallPolicy, RemoteStore};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often `obtain_timeout` retries
const OBTAIN_POLL: Duration = Duration::from_secs(1);

/// Lease timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// Duration requested for each remote lease
    pub lease_duration: Duration,
    /// Period of the background renewal
    pub renewal_interval: Duration,
    /// Longest continuous hold before the lease is broken
    pub max_hold: Duration,
}

impl LockSettings {
    pub fn from_config(config: &LockConfig) -> Self {
        Self {
            lease_duration: config.lease_duration(),
            renewal_interval: config.renewal_interval(),
            max_hold: config.max_hold(),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self::from_config(&LockConfig::default())
    }
}

/// Observable lock state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Acquiring,
    Held,
    /// Held, with a renewal call in flight
    Renewing,
    /// The lease was broken, by the hold ceiling or explicitly
    Broken,
}

impl LockState {
    /// Whether this instance currently owns the lease
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held | Self::Renewing)
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unlocked => "unlocked",
            Self::Acquiring => "acquiring",
            Self::Held => "held",
            Self::Renewing => "renewing",
            Self::Broken => "broken",
        };
        f.write_str(s)
    }
}

struct RenewalTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RenewalTask {
    /// Cancel and wait for the task to finish
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!(error = %e, "lease renewal task panicked");
            }
        }
    }
}

#[derive(Default)]
struct LeaseState {
    lease_id: Option<String>,
    acquired_at: Option<Instant>,
    renewal: Option<RenewalTask>,
}

impl LeaseState {
    fn clear(&mut self) -> Option<RenewalTask> {
        self.lease_id = None;
        self.acquired_at = None;
        self.renewal.take()
    }
}

struct LockInner {
    name: String,
    store: Arc<dyn RemoteStore>,
    settings: LockSettings,
    calls: CallPolicy,
    lease: tokio::sync::Mutex<LeaseState>,
    phase: parking_lot::Mutex<LockState>,
}

impl LockInner {
    fn set_phase(&self, state: LockState) {
        *self.phase.lock() = state;
    }

    async fn acquire(&self) -> BlobdirResult<String> {
        self.calls
            .run(
                "acquire_lease",
                self.store
                    .acquire_lease(&self.name, self.settings.lease_duration, None),
            )
            .await
    }

    /// Acquire, and on a missing or conflicting lock object create it and
    /// try exactly once more
    async fn acquire_with_recovery(&self) -> BlobdirResult<String> {
        match self.acquire().await {
            Err(BlobdirError::Remote(fault)) if fault.is_recoverable() => {
                debug!(lock = %self.name, fault = %fault, "recovering lock object");
                self.recover().await?;
                self.acquire().await
            }
            other => other,
        }
    }

    async fn recover(&self) -> BlobdirResult<()> {
        self.calls
            .run("ensure_container", self.store.ensure_container_exists())
            .await?;
        let exists = self
            .calls
            .run("exists", self.store.exists(&self.name))
            .await?;
        if !exists {
            self.calls
                .run(
                    "upload",
                    self.store.upload_from(
                        &self.name,
                        Bytes::from(self.name.clone().into_bytes()),
                        HashMap::new(),
                    ),
                )
                .await?;
            info!(lock = %self.name, "created lock object");
        }
        Ok(())
    }

    /// Break the remote lease and drop local state; called with the lease
    /// mutex held
    async fn force_break(&self, lease: &mut LeaseState, held: Duration) {
        let stale = BlobdirError::StaleLease {
            name: self.name.clone(),
        };
        warn!(
            lock = %self.name,
            held_secs = held.as_secs(),
            max_hold_secs = self.settings.max_hold.as_secs(),
            "{}",
            stale
        );
        if let Err(e) = self
            .calls
            .run("break_lease", self.store.break_lease(&self.name))
            .await
        {
            warn!(lock = %self.name, error = %e, "failed to break stale lease");
        }
        // The renewal task calls this itself, so its handle is dropped, not awaited
        drop(lease.clear());
        self.set_phase(LockState::Broken);
    }
}

/// Exclusive lock backed by a remote lease
///
/// Dropping a held lock stops renewal but does not release the remote lease;
/// it expires after the lease duration.
pub struct LeaseLock {
    inner: Arc<LockInner>,
    /// Parent of every renewal token this lock spawns
    shutdown: CancellationToken,
}

impl fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseLock")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl LeaseLock {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn RemoteStore>,
        settings: LockSettings,
        calls: CallPolicy,
    ) -> Self {
        let shutdown = calls.cancel_token().child_token();
        Self {
            shutdown,
            inner: Arc::new(LockInner {
                name: name.into(),
                store,
                settings,
                calls,
                lease: tokio::sync::Mutex::new(LeaseState::default()),
                phase: parking_lot::Mutex::new(LockState::Unlocked),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn settings(&self) -> LockSettings {
        self.inner.settings
    }

    pub fn state(&self) -> LockState {
        *self.inner.phase.lock()
    }

    /// Id of the lease this instance holds
    pub async fn lease_id(&self) -> Option<String> {
        self.inner.lease.lock().await.lease_id.clone()
    }

    /// How long the current lease has been held
    pub async fn held_for(&self) -> Option<Duration> {
        self.inner
            .lease
            .lock()
            .await
            .acquired_at
            .map(|at| at.elapsed())
    }

    /// Try to take the lock once; `false` if it is held elsewhere or the
    /// store fails
    pub async fn obtain(&self) -> bool {
        match self.try_obtain().await {
            Ok(obtained) => obtained,
            Err(e) => {
                warn!(lock = %self.inner.name, error = %e, "failed to obtain lock");
                false
            }
        }
    }

    /// Like [`obtain`](Self::obtain) but reports store failures
    ///
    /// Already holding the lock counts as success.
    pub async fn try_obtain(&self) -> BlobdirResult<bool> {
        let inner = &self.inner;
        let mut lease = inner.lease.lock().await;
        if lease.lease_id.is_some() {
            return Ok(true);
        }

        inner.set_phase(LockState::Acquiring);
        match inner.acquire_with_recovery().await {
            Ok(id) => {
                info!(lock = %inner.name, lease_id = %id, "lock obtained");
                lease.lease_id = Some(id);
                lease.acquired_at = Some(Instant::now());
                lease.renewal = Some(self.spawn_renewal());
                inner.set_phase(LockState::Held);
                Ok(true)
            }
            Err(BlobdirError::Remote(fault)) if fault.is_conflict() => {
                debug!(lock = %inner.name, "lock held elsewhere");
                inner.set_phase(LockState::Unlocked);
                Ok(false)
            }
            Err(e) => {
                inner.set_phase(LockState::Unlocked);
                Err(e)
            }
        }
    }

    /// Keep trying to obtain the lock until `wait` has passed
    pub async fn obtain_timeout(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if self.obtain().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(OBTAIN_POLL.min(deadline - now)).await;
        }
    }

    /// Advisory check whether someone holds the lock
    ///
    /// When this instance holds no lease, probes by acquiring and immediately
    /// releasing one. The answer may be stale as soon as it returns. Store
    /// failures report `false`.
    pub async fn is_locked(&self) -> bool {
        let inner = &self.inner;
        let lease = inner.lease.lock().await;
        if lease.lease_id.is_some() {
            return true;
        }

        match inner.acquire_with_recovery().await {
            Ok(probe_id) => {
                if let Err(e) = inner
                    .calls
                    .run(
                        "release_lease",
                        inner.store.release_lease(&inner.name, &probe_id),
                    )
                    .await
                {
                    warn!(lock = %inner.name, error = %e, "failed to release probe lease");
                }
                false
            }
            Err(BlobdirError::Remote(fault)) if fault.is_conflict() => true,
            Err(e) => {
                warn!(lock = %inner.name, error = %e, "lock probe failed");
                false
            }
        }
    }

    /// Renew the held lease now; `false` if no lease is held
    pub async fn renew(&self) -> BlobdirResult<bool> {
        let inner = &self.inner;
        let lease = inner.lease.lock().await;
        let Some(id) = lease.lease_id.as_deref() else {
            return Ok(false);
        };
        inner
            .calls
            .run("renew_lease", inner.store.renew_lease(&inner.name, id))
            .await?;
        Ok(true)
    }

    /// Release the lease and stop renewal
    ///
    /// Local state is cleared even when the remote release fails.
    pub async fn release(&self) -> BlobdirResult<()> {
        let inner = &self.inner;
        let (renewal, result) = {
            let mut lease = inner.lease.lock().await;
            let id = lease.lease_id.take();
            let renewal = lease.clear();
            if let Some(task) = &renewal {
                task.cancel.cancel();
            }

            let result = match id {
                Some(id) => {
                    let result = inner
                        .calls
                        .run("release_lease", inner.store.release_lease(&inner.name, &id))
                        .await;
                    if result.is_ok() {
                        info!(lock = %inner.name, lease_id = %id, "lock released");
                    }
                    result
                }
                None => Ok(()),
            };
            inner.set_phase(LockState::Unlocked);
            (renewal, result)
        };

        if let Some(task) = renewal {
            task.stop().await;
        }
        result
    }

    /// End any lease on the lock object, whoever holds it
    pub async fn break_lock(&self) -> BlobdirResult<()> {
        let inner = &self.inner;
        let (renewal, result) = {
            let mut lease = inner.lease.lock().await;
            let renewal = lease.clear();
            if let Some(task) = &renewal {
                task.cancel.cancel();
            }
            let result = inner
                .calls
                .run("break_lease", inner.store.break_lease(&inner.name))
                .await;
            match &result {
                Ok(()) => info!(lock = %inner.name, "lock broken"),
                Err(e) => warn!(lock = %inner.name, error = %e, "failed to break lock"),
            }
            inner.set_phase(LockState::Broken);
            (renewal, result)
        };

        if let Some(task) = renewal {
            task.stop().await;
        }
        result
    }

    fn spawn_renewal(&self) -> RenewalTask {
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(renew_until_cancelled(
            Arc::downgrade(&self.inner),
            self.inner.settings,
            cancel.clone(),
        ));
        RenewalTask { cancel, handle }
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn renew_until_cancelled(
    inner: Weak<LockInner>,
    settings: LockSettings,
    cancel: CancellationToken,
) {
    let period = settings.renewal_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            guard = inner.lease.lock() => guard,
        };
        let (Some(id), Some(acquired_at)) = (lease.lease_id.clone(), lease.acquired_at) else {
            return;
        };

        let held = acquired_at.elapsed();
        if held > settings.max_hold {
            inner.force_break(&mut lease, held).await;
            return;
        }

        inner.set_phase(LockState::Renewing);
        let renewed = inner
            .calls
            .run("renew_lease", inner.store.renew_lease(&inner.name, &id))
            .await;
        match renewed {
            Ok(()) => debug!(lock = %inner.name, lease_id = %id, "lease renewed"),
            Err(e) => {
                warn!(lock = %inner.name, lease_id = %id, error = %e, "lease renewal failed");
                let held = acquired_at.elapsed();
                if held > settings.max_hold {
                    inner.force_break(&mut lease, held).await;
                    return;
                }
            }
        }
        inner.set_phase(LockState::Held);
    }
}
