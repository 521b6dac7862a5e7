// src/core/proc/instance.rs

//! Per-cluster runtime state: the child handle, the session token used as
//! a generation stamp for background loops, and the time-boxed lock.

use crate::core::errors::MewldError;
use crate::core::proc::ping::ShardHealth;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// How long a lock lease lasts before it expires on its own. A crashed
/// critical section must not freeze the supervisor; holders that need
/// longer re-stamp the lease with a critical lock.
pub const LOCK_EXPIRY: Duration = Duration::from_secs(60);

/// Granularity of the `acquire_lock` busy-wait.
const LOCK_POLL: Duration = Duration::from_millis(100);

/// Granularity of child-exit polling in `wait_for_exit`. The child handle
/// is shared with the stop/kill paths, so a blocking wait cannot hold it.
const CHILD_POLL: Duration = Duration::from_millis(250);

/// Runtime record for one cluster slot. Created when its cluster is
/// planned and destroyed only on supervisor exit; a reshard may replace
/// its shard set but not its identity slot.
pub struct Instance {
    cluster_id: AtomicU64,
    shards: SyncMutex<Vec<u64>>,
    session_id: SyncMutex<String>,
    child: Mutex<Option<Child>>,
    started_at: SyncMutex<Option<DateTime<Utc>>>,
    last_checked: SyncMutex<Option<Instant>>,
    active: AtomicBool,
    launched_fully: AtomicBool,
    lock_time: SyncMutex<Option<(Instant, String)>>,
    cluster_health: SyncMutex<Option<Vec<ShardHealth>>>,
}

impl Instance {
    pub fn new(cluster_id: u64, shards: Vec<u64>, session_id: String) -> Self {
        Self {
            cluster_id: AtomicU64::new(cluster_id),
            shards: SyncMutex::new(shards),
            session_id: SyncMutex::new(session_id),
            child: Mutex::new(None),
            started_at: SyncMutex::new(None),
            last_checked: SyncMutex::new(None),
            active: AtomicBool::new(false),
            launched_fully: AtomicBool::new(false),
            lock_time: SyncMutex::new(None),
            cluster_health: SyncMutex::new(None),
        }
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id.load(Ordering::Acquire)
    }

    pub fn set_cluster_id(&self, id: u64) {
        self.cluster_id.store(id, Ordering::Release);
    }

    pub fn shards(&self) -> Vec<u64> {
        self.shards.lock().clone()
    }

    pub fn set_shards(&self, shards: Vec<u64>) {
        *self.shards.lock() = shards;
    }

    /// The current session token. Empty means the instance is retired and
    /// any background loop still holding an older token should exit.
    pub fn session_id(&self) -> String {
        self.session_id.lock().clone()
    }

    pub fn set_session_id(&self, session_id: &str) {
        *self.session_id.lock() = session_id.to_string();
    }

    pub fn clear_session(&self) {
        self.session_id.lock().clear();
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn launched_fully(&self) -> bool {
        self.launched_fully.load(Ordering::Acquire)
    }

    pub fn set_launched_fully(&self, launched: bool) {
        self.launched_fully.store(launched, Ordering::Release);
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock()
    }

    pub fn set_started_at(&self, at: DateTime<Utc>) {
        *self.started_at.lock() = Some(at);
    }

    pub fn touch_last_checked(&self) {
        *self.last_checked.lock() = Some(Instant::now());
    }

    /// When the last health probe for this instance got an answer.
    pub fn last_checked(&self) -> Option<Instant> {
        *self.last_checked.lock()
    }

    pub fn health(&self) -> Option<Vec<ShardHealth>> {
        self.cluster_health.lock().clone()
    }

    pub fn set_health(&self, health: Vec<ShardHealth>) {
        *self.cluster_health.lock() = Some(health);
    }

    // --- Lock lease ---

    /// True iff a lease is held and younger than `LOCK_EXPIRY`.
    pub fn locked(&self) -> bool {
        self.locked_at(Instant::now())
    }

    /// The lease predicate evaluated at an explicit instant.
    pub fn locked_at(&self, now: Instant) -> bool {
        matches!(
            &*self.lock_time.lock(),
            Some((at, _)) if now.saturating_duration_since(*at) < LOCK_EXPIRY
        )
    }

    /// Takes the lock lease. A non-critical lock fails if a live lease is
    /// already held; a critical lock always succeeds, re-stamping the
    /// lease time.
    pub fn try_lock(&self, reason: &str, critical: bool) -> Result<(), MewldError> {
        self.try_lock_at(reason, critical, Instant::now())
    }

    /// As [`Instance::try_lock`], evaluated and stamped at an explicit
    /// instant.
    pub fn try_lock_at(
        &self,
        reason: &str,
        critical: bool,
        now: Instant,
    ) -> Result<(), MewldError> {
        let mut guard = self.lock_time.lock();
        if !critical
            && let Some((at, holder)) = &*guard
            && now.saturating_duration_since(*at) < LOCK_EXPIRY
        {
            return Err(MewldError::LockedInstance {
                cluster_id: self.cluster_id(),
                reason: holder.clone(),
            });
        }
        *guard = Some((now, reason.to_string()));
        Ok(())
    }

    /// Clears the lease. A no-op when the instance is already unlocked.
    pub fn unlock(&self) {
        *self.lock_time.lock() = None;
    }

    /// Waits until the instance is unlocked. Does not take the lock; the
    /// caller must.
    pub async fn acquire_lock(&self) {
        while self.locked() {
            sleep(LOCK_POLL).await;
        }
    }

    /// Waits until unlocked, then takes the lease.
    pub async fn acquire_and_lock(&self, reason: &str) {
        loop {
            self.acquire_lock().await;
            if self.try_lock(reason, false).is_ok() {
                return;
            }
        }
    }

    // --- Child process ---

    /// Installs a freshly spawned child, replacing any previous handle.
    pub async fn attach_child(&self, child: Child) {
        *self.child.lock().await = Some(child);
    }

    /// OS pid of the attached child, when it is still running.
    pub async fn child_pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.id())
    }

    /// True iff a child is attached and has not exited.
    pub async fn running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Delivers a kill to the attached child, if any.
    pub async fn kill(&self) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut()
            && let Err(e) = child.start_kill()
        {
            tracing::debug!(
                "Kill for cluster {} found no live child: {e}",
                self.cluster_id()
            );
        }
    }

    /// Reaps the attached child, detaching it. Returns its exit status
    /// when one could be collected.
    pub async fn reap(&self) -> Option<ExitStatus> {
        let child = self.child.lock().await.take();
        match child {
            Some(mut child) => child.wait().await.ok(),
            None => None,
        }
    }

    /// Waits for the attached child to exit, polling so the handle stays
    /// available to concurrent stop/kill paths. Returns `None` if the
    /// child was detached out from under us.
    pub async fn wait_for_exit(&self) -> Option<ExitStatus> {
        loop {
            {
                let mut guard = self.child.lock().await;
                match guard.as_mut() {
                    None => return None,
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => return Some(status),
                        Ok(None) => {}
                        Err(_) => return None,
                    },
                }
            }
            sleep(CHILD_POLL).await;
        }
    }
}
