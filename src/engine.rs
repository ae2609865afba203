//! PersistEngine - hydration barrier and write-through coordinator
//!
//! The engine tracks a set of storage keys, each with a "hydrated" flag.
//! Fields are hydrated either eagerly (on their own spawned task) or lazily
//! through a task queue drained by [`PersistEngine::rehydrate`]. Once every
//! tracked key has been hydrated, the engine transitions to
//! [`EngineState::Hydrated`] exactly once and fires its completion callbacks.
//!
//! After that transition, changes to watched containers are written back
//! through a single subscription per container and an ordered write queue.
//!
//! # Example
//!
//! ```ignore
//! let engine = PersistEngine::new(Arc::new(MemoryStorage::new()), EngineConfig::deferred());
//!
//! engine.register_keys("app::sidebar::visible");
//! engine.register_task("app::sidebar::visible", true, |visible| {
//!     println!("sidebar visible: {visible}");
//! });
//!
//! engine.rehydrate().await;
//! assert!(engine.is_hydrated());
//! ```

mod watch;
mod writer;

#[cfg(test)]
mod tests;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch as ready;
use tracing::{debug, error, info, trace, warn};

use crate::config::{EngineConfig, RunMode};
use crate::container::{ContainerId, StateContainer};
use crate::error::{PersistError, Result};
use crate::storage::{Envelope, StorageAdapter};

pub use watch::{WatchEntry, WriteFanOut};
pub use writer::WriteStats;

use watch::WatchGroup;
use writer::WriteQueue;

/// Job run with whatever the adapter returned for a key.
pub(crate) type HydrationJob = Box<dyn FnOnce(Option<Envelope>) + Send>;

type CompletionCallback = Box<dyn FnOnce() + Send>;

/// Lifecycle of an engine's hydration barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No key registered yet.
    Uninitialized,
    /// At least one key registered, not all hydrated.
    AwaitingHydration,
    /// Terminal: every key was hydrated at the time of the transition.
    Hydrated,
}

struct PendingTask {
    key: String,
    job: HydrationJob,
}

#[derive(Default)]
struct Barrier {
    is_hydrated: bool,
    hydrated_keys: BTreeMap<String, bool>,
    pending_tasks: Vec<PendingTask>,
    completion_callbacks: Vec<CompletionCallback>,
}

/// Coordinator for one set of persisted fields.
///
/// Construct one per feature (or share one) and pass it explicitly to the
/// containers that bind fields to it.
pub struct PersistEngine {
    id: u64,
    config: EngineConfig,
    adapter: Arc<dyn StorageAdapter>,
    barrier: Mutex<Barrier>,
    ready_tx: ready::Sender<bool>,
    /// Serializes `rehydrate` calls so a second caller waits for the first.
    run_lock: tokio::sync::Mutex<()>,
    watch_groups: Mutex<HashMap<ContainerId, Arc<dyn Any + Send + Sync>>>,
    writer: WriteQueue,
    weak_self: Weak<PersistEngine>,
}

impl PersistEngine {
    /// Create an engine over `adapter`.
    ///
    /// Spawns the write queue task, so this must be called from within a
    /// Tokio runtime.
    pub fn new(adapter: Arc<dyn StorageAdapter>, config: EngineConfig) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (ready_tx, _) = ready::channel(false);
        let writer = WriteQueue::spawn(adapter.clone());

        debug!(
            "Engine {} created (skip_hydration: {}, run_mode: {:?}, fan_out: {:?}, declared keys: {})",
            id,
            config.skip_hydration,
            config.run_mode,
            config.write_fan_out,
            config.storage_keys.len()
        );

        Arc::new_cyclic(|weak_self| Self {
            id,
            config,
            adapter,
            barrier: Mutex::new(Barrier::default()),
            ready_tx,
            run_lock: tokio::sync::Mutex::new(()),
            watch_groups: Mutex::new(HashMap::new()),
            writer,
            weak_self: weak_self.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =========================================================================
    // Barrier bookkeeping
    // =========================================================================

    /// Track `key` as not yet hydrated; no-op if already tracked.
    ///
    /// A key registered after the engine reached [`EngineState::Hydrated`]
    /// is tracked but does not reopen the barrier.
    pub fn register_keys(&self, key: impl Into<String>) {
        let key = key.into();
        let mut barrier = self.barrier.lock();
        if barrier.hydrated_keys.contains_key(&key) {
            return;
        }

        if barrier.is_hydrated {
            warn!(
                "Engine {}: key '{}' registered after hydration completed; engine stays hydrated",
                self.id, key
            );
        } else {
            trace!("Engine {}: tracking '{}'", self.id, key);
        }
        barrier.hydrated_keys.insert(key, false);
    }

    pub fn is_hydrated(&self) -> bool {
        self.barrier.lock().is_hydrated
    }

    pub fn state(&self) -> EngineState {
        let barrier = self.barrier.lock();
        if barrier.is_hydrated {
            EngineState::Hydrated
        } else if barrier.hydrated_keys.is_empty() {
            EngineState::Uninitialized
        } else {
            EngineState::AwaitingHydration
        }
    }

    /// Every tracked key, sorted.
    pub fn tracked_keys(&self) -> Vec<String> {
        self.barrier.lock().hydrated_keys.keys().cloned().collect()
    }

    /// Tracked keys whose hydration has not completed.
    pub fn pending_keys(&self) -> Vec<String> {
        self.barrier
            .lock()
            .hydrated_keys
            .iter()
            .filter(|(_, hydrated)| !**hydrated)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of queued tasks waiting for [`rehydrate`](Self::rehydrate).
    pub fn queued_tasks(&self) -> usize {
        self.barrier.lock().pending_tasks.len()
    }

    fn mark_hydrated(&self, key: &str) {
        let mut barrier = self.barrier.lock();
        match barrier.hydrated_keys.get_mut(key) {
            Some(flag) => *flag = true,
            None => debug!("Engine {}: hydrated untracked key '{}'", self.id, key),
        }
    }

    /// Close the barrier if every tracked and declared key is hydrated.
    fn check_ready(&self) {
        let callbacks = {
            let mut barrier = self.barrier.lock();
            if barrier.is_hydrated
                || barrier.hydrated_keys.is_empty()
                || !barrier.hydrated_keys.values().all(|hydrated| *hydrated)
            {
                return;
            }
            if let Some(missing) = self
                .config
                .storage_keys
                .iter()
                .find(|key| !barrier.hydrated_keys.get(*key).copied().unwrap_or(false))
            {
                trace!("Engine {}: waiting for declared key '{}'", self.id, missing);
                return;
            }
            barrier.is_hydrated = true;
            std::mem::take(&mut barrier.completion_callbacks)
        };

        self.ready_tx.send_replace(true);
        info!(
            "Engine {} hydrated, firing {} completion callback(s)",
            self.id,
            callbacks.len()
        );
        for callback in callbacks {
            callback();
        }
    }

    /// Run `callback` once the barrier closes.
    ///
    /// If the engine is already hydrated the callback runs immediately on
    /// the calling thread.
    pub fn on_hydration_completed<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut barrier = self.barrier.lock();
            if !barrier.is_hydrated {
                barrier.completion_callbacks.push(Box::new(callback));
                return;
            }
        }
        trace!("Engine {}: already hydrated, running callback now", self.id);
        callback();
    }

    /// Resolve once the engine is hydrated.
    pub async fn hydrated(&self) {
        let mut rx = self.ready_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|ready| *ready).await;
    }

    // =========================================================================
    // Hydration
    // =========================================================================

    /// Eagerly load `key`, falling back to `default`.
    ///
    /// The key is marked hydrated whatever the outcome; nothing is retried.
    pub async fn hydrate<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let stored = self.adapter.get(key).await;
        let value = decode_or_default(key, stored, default);
        self.mark_hydrated(key);
        self.check_ready();
        value
    }

    /// Queue a deferred load of `key`, run by [`rehydrate`](Self::rehydrate).
    ///
    /// `callback` receives the stored value, or `default` when nothing
    /// usable is stored.
    pub fn register_task<T, F>(&self, key: impl Into<String>, default: T, callback: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        let key = key.into();
        let job_key = key.clone();
        self.queue_job(
            key,
            Box::new(move |stored: Option<Envelope>| {
                callback(decode_or_default(&job_key, stored, default))
            }),
        );
    }

    pub(crate) fn queue_job(&self, key: String, job: HydrationJob) {
        let mut barrier = self.barrier.lock();
        if barrier.pending_tasks.iter().any(|task| task.key == key) {
            warn!(
                "Engine {}: task for '{}' already queued, later binding will not be hydrated",
                self.id, key
            );
            return;
        }
        barrier.pending_tasks.push(PendingTask { key, job });
    }

    /// Hydrate `key` on its own task without waiting for `rehydrate`.
    pub(crate) fn spawn_job(self: &Arc<Self>, key: String, job: HydrationJob) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_task(PendingTask { key, job }).await;
            engine.check_ready();
        });
    }

    async fn run_task(&self, task: PendingTask) {
        let PendingTask { key, job } = task;
        let stored = self.adapter.get(&key).await;
        trace!(
            "Engine {}: loaded '{}' ({})",
            self.id,
            key,
            if stored.is_some() { "stored" } else { "default" }
        );
        job(stored);
        self.mark_hydrated(&key);
    }

    /// Drain the task queue, then evaluate the barrier.
    ///
    /// Tasks run concurrently on the calling task (or one after another in
    /// [`RunMode::Sequential`]). Calling this again with an empty queue
    /// performs no I/O.
    pub async fn rehydrate(&self) {
        let _running = self.run_lock.lock().await;

        let tasks = std::mem::take(&mut self.barrier.lock().pending_tasks);
        if !tasks.is_empty() {
            debug!(
                "Engine {}: rehydrating {} key(s) ({:?})",
                self.id,
                tasks.len(),
                self.config.run_mode
            );

            match self.config.run_mode {
                RunMode::Concurrent => {
                    join_all(tasks.into_iter().map(|task| self.run_task(task))).await;
                }
                RunMode::Sequential => {
                    for task in tasks {
                        self.run_task(task).await;
                    }
                }
            }
        }

        self.check_ready();
    }

    // =========================================================================
    // Write-through
    // =========================================================================

    /// Write `entry`'s field back to storage whenever `container` changes.
    ///
    /// The first watch on a container subscribes to it; later watches on the
    /// same container share that subscription. Writes are suppressed until
    /// the engine is hydrated so defaults never overwrite stored values.
    pub fn watch<C: StateContainer>(&self, container: &C, entry: WatchEntry<C::State>) {
        let group = {
            let mut groups = self.watch_groups.lock();
            let slot = groups
                .entry(container.id())
                .or_insert_with(|| -> Arc<dyn Any + Send + Sync> {
                    Arc::new(WatchGroup::<C::State>::new())
                })
                .clone();
            match slot.downcast::<WatchGroup<C::State>>() {
                Ok(group) => group,
                Err(_) => {
                    error!(
                        "Engine {}: container {:?} watched with a different state type",
                        self.id,
                        container.id()
                    );
                    return;
                }
            }
        };

        let key = entry.key.clone();
        if !group.insert(entry) {
            debug!("Engine {}: '{}' already watched", self.id, key);
            return;
        }

        group.subscription.get_or_init(|| {
            debug!("Engine {}: subscribing to container {:?}", self.id, container.id());
            let engine = self.weak_self.clone();
            let watched = group.clone();
            container.subscribe(Arc::new(move |state: &C::State| {
                if let Some(engine) = engine.upgrade() {
                    engine.write_through(&watched, state);
                }
            }))
        });
    }

    fn write_through<S>(&self, group: &WatchGroup<S>, state: &S) {
        if !self.is_hydrated() {
            trace!("Engine {}: change before hydration, not persisted", self.id);
            return;
        }

        for (key, version, encoded) in group.collect(state, self.config.write_fan_out) {
            match encoded {
                Ok(data) => {
                    if let Err(e) = self.writer.enqueue(key.clone(), Envelope::new(data, version)) {
                        error!("Engine {}: dropping write for '{}': {}", self.id, key, e);
                    }
                }
                Err(source) => {
                    let e = PersistError::Serialize { key, source };
                    error!("Engine {}: {}", self.id, e);
                }
            }
        }
    }

    /// Number of containers this engine is subscribed to.
    pub fn watched_containers(&self) -> usize {
        self.watch_groups.lock().len()
    }

    /// Wait until every write queued so far has been attempted.
    pub async fn flush(&self) -> Result<()> {
        self.writer.flush().await
    }

    /// Drain pending writes and stop the write queue.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Engine {} shutting down write queue", self.id);
        self.writer.shutdown().await
    }

    /// True once the write queue no longer accepts writes.
    pub fn is_shut_down(&self) -> bool {
        self.writer.is_closed()
    }

    pub fn write_stats(&self) -> WriteStats {
        self.writer.stats()
    }
}

fn decode_or_default<T: DeserializeOwned>(key: &str, stored: Option<Envelope>, default: T) -> T {
    let Some(envelope) = stored else {
        return default;
    };

    match envelope.decode::<T>() {
        Ok(Some(value)) => value,
        Ok(None) => default,
        Err(e) => {
            warn!("Stored value for '{}' is unreadable, using default: {}", key, e);
            default
        }
    }
}
