//! Starting, pacing and stopping every shard a client owns.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, error, info};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::shard::{EventSender, ShardDriver, ShardHandle, ShardSettings};
use crate::error::{ClientError, Result};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the live shards of a client can be looked up.
#[derive(Clone, Default)]
pub struct ShardRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    shards: Vec<ShardHandle>,
    shard_count: u32,
}

impl ShardRegistry {
    pub fn shards(&self) -> Vec<ShardHandle> {
        self.read().shards.clone()
    }

    pub fn get(&self, shard_id: u32) -> Option<ShardHandle> {
        self.read().shards.iter().find(|s| s.id() == shard_id).cloned()
    }

    /// Total shards across every process running this bot.
    pub fn shard_count(&self) -> u32 {
        self.read().shard_count
    }

    pub fn any_connected(&self) -> bool {
        self.read().shards.iter().any(ShardHandle::is_connected)
    }

    fn reset(&self, shard_count: u32) {
        let mut inner = self.write();
        inner.shards.clear();
        inner.shard_count = shard_count;
    }

    fn push(&self, handle: ShardHandle) {
        self.write().shards.push(handle);
    }

    fn clear(&self) {
        self.write().shards.clear();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Fires its callbacks once, when every shard delivered its first READY.
#[derive(Default)]
pub struct ReadyNotifier {
    inner: Mutex<ReadyInner>,
}

#[derive(Default)]
struct ReadyInner {
    armed: bool,
    fired: bool,
    waiting: HashSet<u32>,
    callbacks: Vec<ReadyCallback>,
}

impl ReadyNotifier {
    /// Registers `callback`. If everything is ready already, it runs right away.
    pub fn subscribe(&self, callback: impl FnOnce() + Send + 'static) {
        let mut inner = self.lock();
        if inner.fired {
            drop(inner);
            run_callback(Box::new(callback));
        } else {
            inner.callbacks.push(Box::new(callback));
        }
    }

    pub fn has_fired(&self) -> bool {
        self.lock().fired
    }

    pub(crate) fn arm(&self, shard_ids: &[u32]) {
        let mut inner = self.lock();
        if inner.fired {
            return;
        }
        inner.armed = true;
        inner.waiting = shard_ids.iter().copied().collect();
    }

    /// Returns `true` for the READY that completed the set.
    pub(crate) fn shard_ready(&self, shard_id: u32) -> bool {
        let callbacks = {
            let mut inner = self.lock();
            if inner.fired || !inner.armed {
                return false;
            }
            inner.waiting.remove(&shard_id);
            if !inner.waiting.is_empty() {
                return false;
            }
            inner.fired = true;
            std::mem::take(&mut inner.callbacks)
        };

        info!("all shards ready");
        for callback in callbacks {
            run_callback(callback);
        }
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReadyInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn run_callback(callback: ReadyCallback) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!("ready callback panicked");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// Owns the shards of one client.
///
/// Shards are started one at a time: the next one is only spawned after the
/// previous one sent its identify, and each identify waits on the shared
/// [`IdentifyLimiter`](super::limiter::IdentifyLimiter) first.
pub struct ShardSupervisor {
    shard_ids: Vec<u32>,
    shard_count: u32,
    settings: Arc<ShardSettings>,
    events: Mutex<Option<EventSender>>,
    registry: ShardRegistry,
    ready: Arc<ReadyNotifier>,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShardSupervisor {
    pub(crate) fn new(
        shard_ids: Vec<u32>,
        shard_count: u32,
        settings: Arc<ShardSettings>,
        events: EventSender,
        registry: ShardRegistry,
        ready: Arc<ReadyNotifier>,
    ) -> Self {
        Self {
            shard_ids,
            shard_count,
            settings,
            events: Mutex::new(Some(events)),
            registry,
            ready,
            lifecycle: Mutex::new(Lifecycle::Idle),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts every shard and waits until all of them finished their handshake.
    ///
    /// Dropping the future before it completes stops whatever was started.
    pub async fn connect_all(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            match *lifecycle {
                Lifecycle::Connecting => return Err(ClientError::AlreadyConnecting),
                Lifecycle::Connected => return Err(ClientError::AlreadyConnected),
                Lifecycle::Closed => return Err(ClientError::Cancelled),
                Lifecycle::Idle => *lifecycle = Lifecycle::Connecting,
            }
        }

        let mut guard = StopOnDrop {
            supervisor: self,
            armed: true,
        };
        let result = self.start_shards().await;
        guard.armed = false;

        match result {
            Ok(()) => {
                self.set_lifecycle(Lifecycle::Connected);
                info!(
                    "{} of {} shards connected",
                    self.shard_ids.len(),
                    self.shard_count
                );
                Ok(())
            }
            Err(e) => {
                self.stop();
                Err(e)
            }
        }
    }

    async fn start_shards(&self) -> Result<()> {
        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ClientError::Cancelled)?;

        self.registry.reset(self.shard_count);
        self.ready.arm(&self.shard_ids);

        let mut handles = Vec::with_capacity(self.shard_ids.len());
        for &shard_id in &self.shard_ids {
            let (driver, handle, identified) = ShardDriver::new(
                shard_id,
                self.shard_count,
                self.settings.clone(),
                events.clone(),
                self.cancel.child_token(),
            );
            self.registry.push(handle.clone());
            let task = tokio::spawn(driver.run());
            self.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(task);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
                sent = identified => {
                    if sent.is_err() {
                        return Err(handle.take_failure());
                    }
                }
            }
            debug!("shard {shard_id} identify dispatched");
            handles.push(handle);
        }
        drop(events);

        for handle in &handles {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
                connected = handle.wait_connected() => connected?,
            }
        }
        Ok(())
    }

    /// Cancels every shard without waiting for them. Safe to call repeatedly.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.set_lifecycle(Lifecycle::Closed);
        self.registry.clear();
    }

    /// Stops every shard and waits for their tasks to wind down.
    pub async fn shutdown(&self) {
        self.stop();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                error!("a shard did not stop within {SHUTDOWN_TIMEOUT:?}");
            }
        }
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

struct StopOnDrop<'a> {
    supervisor: &'a ShardSupervisor,
    armed: bool,
}

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("connect abandoned, stopping shards");
            self.supervisor.stop();
        }
    }
}
