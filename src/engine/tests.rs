//! Engine behaviour: hydration barrier, task queue, fan-in write-through

use super::*;
use crate::binding::{persist, Field, FieldBinder};
use crate::config::EngineConfig;
use crate::container::Store;
use crate::error::StorageError;
use crate::storage::{MemoryStorage, SledStorage};
use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// Test doubles
// ============================================================================

/// Memory storage that counts calls and can stall or fail per key.
#[derive(Default)]
struct CountingStorage {
    inner: MemoryStorage,
    gets: Mutex<HashMap<String, usize>>,
    sets: Mutex<HashMap<String, usize>>,
    unreadable: Mutex<HashSet<String>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    reject_writes: AtomicBool,
}

impl CountingStorage {
    fn with(entries: &[(&str, serde_json::Value)]) -> Arc<Self> {
        let storage = Self::default();
        for (key, data) in entries {
            storage.inner.insert(*key, Envelope::new(data.clone(), 1));
        }
        Arc::new(storage)
    }

    /// Make `get(key)` wait until the returned notify fires.
    fn gate(&self, key: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates.lock().insert(key.to_string(), notify.clone());
        notify
    }

    fn gets(&self, key: &str) -> usize {
        self.gets.lock().get(key).copied().unwrap_or(0)
    }

    fn sets(&self, key: &str) -> usize {
        self.sets.lock().get(key).copied().unwrap_or(0)
    }

    fn total_sets(&self) -> usize {
        self.sets.lock().values().sum()
    }
}

#[async_trait]
impl StorageAdapter for CountingStorage {
    async fn get(&self, key: &str) -> Option<Envelope> {
        *self.gets.lock().entry(key.to_string()).or_default() += 1;

        let gate = self.gates.lock().get(key).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.unreadable.lock().contains(key) {
            return None;
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, envelope: Envelope) -> Result<(), StorageError> {
        *self.sets.lock().entry(key.to_string()).or_default() += 1;
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("quota exceeded".to_string()));
        }
        self.inner.set(key, envelope).await
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Sidebar {
    visible: bool,
    visible_1: bool,
    width: u32,
}

fn visible() -> Field<Sidebar, bool> {
    Field::new(
        "sidebar::visible",
        |s: &Sidebar| s.visible,
        |s: &mut Sidebar, v| s.visible = v,
    )
}

fn visible_1() -> Field<Sidebar, bool> {
    Field::new(
        "sidebar::visible-1",
        |s: &Sidebar| s.visible_1,
        |s: &mut Sidebar, v| s.visible_1 = v,
    )
}

fn width() -> Field<Sidebar, u32> {
    Field::new(
        "sidebar::width",
        |s: &Sidebar| s.width,
        |s: &mut Sidebar, v| s.width = v,
    )
}

fn sidebar_store(engine: &Arc<PersistEngine>) -> Store<Sidebar> {
    Store::<Sidebar>::persisted(engine, |fields| Sidebar {
        visible: fields.persist(false, visible()),
        visible_1: fields.persist(false, visible_1()),
        width: fields.persist(240, width()),
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ============================================================================
// Hydration barrier
// ============================================================================

#[tokio::test]
async fn test_state_transitions() {
    let storage = CountingStorage::with(&[]);
    let engine = PersistEngine::new(storage, EngineConfig::deferred());
    assert_eq!(engine.state(), EngineState::Uninitialized);

    engine.register_keys("a");
    engine.register_keys("a");
    assert_eq!(engine.tracked_keys(), vec!["a".to_string()]);
    assert_eq!(engine.state(), EngineState::AwaitingHydration);

    engine.register_task("a", 0u32, |_| {});
    engine.rehydrate().await;
    assert_eq!(engine.state(), EngineState::Hydrated);
}

#[tokio::test]
async fn test_rehydrate_without_keys_stays_uninitialized() {
    let engine = PersistEngine::new(CountingStorage::with(&[]), EngineConfig::deferred());
    engine.rehydrate().await;
    assert!(!engine.is_hydrated());
    assert_eq!(engine.state(), EngineState::Uninitialized);
}

#[tokio::test]
async fn test_barrier_waits_for_every_registered_key() {
    let storage = CountingStorage::with(&[("a", json!(1))]);
    let engine = PersistEngine::new(storage, EngineConfig::deferred());

    engine.register_keys("a");
    engine.register_keys("b");
    engine.register_task("a", 0u32, |_| {});
    engine.rehydrate().await;

    // "b" was never presented to a task
    assert!(!engine.is_hydrated());
    assert_eq!(engine.pending_keys(), vec!["b".to_string()]);

    engine.register_task("b", 0u32, |_| {});
    engine.rehydrate().await;
    assert!(engine.is_hydrated());
    assert!(engine.pending_keys().is_empty());
}

#[tokio::test]
async fn test_rehydrate_twice_reads_each_key_once() {
    let storage = CountingStorage::with(&[("a", json!("x"))]);
    let engine = PersistEngine::new(storage.clone(), EngineConfig::deferred());

    for key in ["a", "b"] {
        engine.register_keys(key);
        engine.register_task(key, String::new(), |_| {});
    }
    // Duplicate task for the same key is ignored
    engine.register_task("a", String::new(), |_| {});
    assert_eq!(engine.queued_tasks(), 2);

    engine.rehydrate().await;
    engine.rehydrate().await;

    assert_eq!(storage.gets("a"), 1);
    assert_eq!(storage.gets("b"), 1);
    assert_eq!(engine.queued_tasks(), 0);
}

#[tokio::test]
async fn test_task_callback_receives_stored_or_default() {
    let storage = CountingStorage::with(&[("stored", json!(42))]);
    let engine = PersistEngine::new(storage, EngineConfig::deferred());
    let seen = Arc::new(Mutex::new(HashMap::new()));

    for key in ["stored", "missing"] {
        engine.register_keys(key);
        let seen = seen.clone();
        engine.register_task(key, 7u32, move |value| {
            seen.lock().insert(key, value);
        });
    }
    engine.rehydrate().await;

    let seen = seen.lock();
    assert_eq!(seen.get("stored"), Some(&42));
    assert_eq!(seen.get("missing"), Some(&7));
}

#[tokio::test]
async fn test_completion_callbacks_fire_exactly_once() {
    let engine = PersistEngine::new(CountingStorage::with(&[]), EngineConfig::deferred());
    let fired = Arc::new(AtomicUsize::new(0));

    engine.register_keys("k");
    engine.register_task("k", false, |_| {});
    for _ in 0..3 {
        let fired = fired.clone();
        engine.on_hydration_completed(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }

    engine.rehydrate().await;
    engine.rehydrate().await;
    assert_eq!(fired.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_late_completion_callback_runs_immediately() {
    let engine = PersistEngine::new(CountingStorage::with(&[]), EngineConfig::deferred());
    engine.register_keys("k");
    engine.register_task("k", false, |_| {});
    engine.rehydrate().await;

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    engine.on_hydration_completed(move || flag.store(true, Ordering::SeqCst));
    assert!(fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_late_registration_leaves_engine_hydrated() {
    let engine = PersistEngine::new(CountingStorage::with(&[]), EngineConfig::deferred());
    engine.register_keys("early");
    engine.register_task("early", 0u8, |_| {});
    engine.rehydrate().await;

    engine.register_keys("late");
    assert_eq!(engine.state(), EngineState::Hydrated);
    assert_eq!(engine.pending_keys(), vec!["late".to_string()]);
}

#[tokio::test]
async fn test_eager_hydrate_returns_value_and_closes_barrier() {
    let storage = CountingStorage::with(&[("theme", json!("dark"))]);
    let engine = PersistEngine::new(storage, EngineConfig::eager());
    engine.register_keys("theme");
    engine.register_keys("zoom");

    assert_eq!(engine.hydrate("theme", "light".to_string()).await, "dark");
    assert!(!engine.is_hydrated());

    assert_eq!(engine.hydrate("zoom", 100u32).await, 100);
    assert!(engine.is_hydrated());
    tokio::time::timeout(Duration::from_secs(1), engine.hydrated())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unreadable_value_falls_back_to_default() {
    let storage = SledStorage::temporary().unwrap();
    storage.insert_raw("sidebar::width", "{corrupt").unwrap();
    storage
        .set("sidebar::visible", Envelope::new(json!("not a bool"), 1))
        .await
        .unwrap();

    let engine = PersistEngine::new(Arc::new(storage), EngineConfig::deferred());
    let store = sidebar_store(&engine);

    tokio::time::timeout(Duration::from_secs(5), engine.rehydrate())
        .await
        .unwrap();

    assert!(engine.is_hydrated());
    assert_eq!(store.snapshot(), Sidebar { visible: false, visible_1: false, width: 240 });
}

#[tokio::test]
async fn test_failed_read_does_not_hang() {
    let storage = CountingStorage::with(&[("sidebar::width", json!(300))]);
    storage.unreadable.lock().insert("sidebar::width".to_string());

    let engine = PersistEngine::new(storage, EngineConfig::deferred());
    let store = sidebar_store(&engine);

    tokio::time::timeout(Duration::from_secs(1), engine.rehydrate())
        .await
        .unwrap();
    assert!(engine.is_hydrated());
    assert_eq!(store.read(|s| s.width), 240);
}

#[tokio::test]
async fn test_sidebar_scenario_waits_for_slow_key() {
    let storage = CountingStorage::with(&[("sidebar::visible", json!(true))]);
    let slow = storage.gate("sidebar::visible-1");

    let engine = PersistEngine::new(storage.clone(), EngineConfig::deferred());
    let store = Store::<Sidebar>::persisted(&engine, |fields| Sidebar {
        visible: fields.persist(false, visible()),
        visible_1: fields.persist(false, visible_1()),
        width: 0,
    });

    let completions = Arc::new(AtomicUsize::new(0));
    let counter = completions.clone();
    engine.on_hydration_completed(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let running = tokio::spawn({
        let engine = engine.clone();
        async move { engine.rehydrate().await }
    });

    // The fast key resolves first; the barrier stays open for the slow one
    wait_until(|| engine.pending_keys() == vec!["sidebar::visible-1".to_string()]).await;
    assert!(store.read(|s| s.visible));
    assert!(!engine.is_hydrated());
    assert_eq!(completions.load(Ordering::SeqCst), 0);

    slow.notify_one();
    running.await.unwrap();

    assert!(engine.is_hydrated());
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert!(store.read(|s| s.visible));
    assert!(!store.read(|s| s.visible_1));
}

#[tokio::test]
async fn test_sequential_run_mode() {
    let storage = CountingStorage::with(&[("sidebar::width", json!(320))]);
    let config = EngineConfig::deferred().with_run_mode(RunMode::Sequential);
    let engine = PersistEngine::new(storage.clone(), config);
    let store = sidebar_store(&engine);

    engine.rehydrate().await;
    assert!(engine.is_hydrated());
    assert_eq!(store.read(|s| s.width), 320);
    assert_eq!(storage.gets("sidebar::width"), 1);
}

#[tokio::test]
async fn test_declared_key_without_task_keeps_barrier_open() {
    let config = EngineConfig::deferred().with_storage_keys(["a", "b"]);
    let engine = PersistEngine::new(CountingStorage::with(&[]), config);

    engine.register_keys("a");
    engine.register_task("a", 0u32, |_| {});
    engine.rehydrate().await;

    // "b" is declared but no binding has registered it yet
    assert!(!engine.is_hydrated());
    assert!(engine.pending_keys().is_empty());

    engine.register_keys("b");
    engine.register_task("b", 0u32, |_| {});
    engine.rehydrate().await;
    assert!(engine.is_hydrated());
}

#[derive(Debug, Clone, Default)]
struct Panel {
    width: u32,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_declared_keys_hold_eager_barrier_across_containers() {
    let storage = CountingStorage::with(&[
        ("sidebar::width", json!(300)),
        ("panel::width", json!(7)),
    ]);
    let slow = storage.gate("panel::width");
    let config = EngineConfig::eager().with_storage_keys([
        "sidebar::visible",
        "sidebar::visible-1",
        "sidebar::width",
        "panel::width",
    ]);
    let engine = PersistEngine::new(storage.clone(), config);

    let sidebar = sidebar_store(&engine);
    // Every load of the first container completes before the second is built
    wait_until(|| engine.pending_keys().is_empty() && storage.gets("sidebar::width") == 1).await;
    assert_eq!(engine.state(), EngineState::AwaitingHydration);

    let panel = Store::<Panel>::persisted(&engine, |fields| Panel {
        width: fields.persist(
            1,
            Field::new(
                "panel::width",
                |s: &Panel| s.width,
                |s: &mut Panel, v| s.width = v,
            ),
        ),
    });

    wait_until(|| storage.gets("panel::width") == 1).await;
    assert!(!engine.is_hydrated());
    assert_eq!(engine.pending_keys(), vec!["panel::width".to_string()]);

    slow.notify_one();
    tokio::time::timeout(Duration::from_secs(1), engine.hydrated())
        .await
        .unwrap();

    assert_eq!(sidebar.read(|s| s.width), 300);
    assert_eq!(panel.read(|s| s.width), 7);
}

#[tokio::test]
async fn test_duplicate_key_across_containers_hydrates_first_binding() {
    let storage = CountingStorage::with(&[("sidebar::width", json!(410))]);
    let engine = PersistEngine::new(storage.clone(), EngineConfig::deferred());

    let first = sidebar_store(&engine);
    let second = sidebar_store(&engine);
    assert_eq!(engine.queued_tasks(), 3);

    engine.rehydrate().await;

    assert!(engine.is_hydrated());
    assert_eq!(storage.gets("sidebar::width"), 1);
    assert_eq!(first.read(|s| s.width), 410);
    assert_eq!(second.read(|s| s.width), 240);
}

// ============================================================================
// Field binding
// ============================================================================

#[tokio::test]
async fn test_bind_returns_default_regardless_of_storage() {
    let storage = CountingStorage::with(&[("sidebar::width", json!(999))]);
    let engine = PersistEngine::new(storage, EngineConfig::eager());

    let mut binder = FieldBinder::<Store<Sidebar>>::new(&engine);
    let initial = binder.persist(240, width());
    assert_eq!(initial, 240);
    assert_eq!(binder.len(), 1);

    let store = Store::new(Sidebar { width: initial, ..Sidebar::default() });
    binder.attach(&store);

    engine.hydrated().await;
    assert_eq!(store.read(|s| s.width), 999);
}

#[tokio::test]
async fn test_persist_on_existing_container() {
    let storage = CountingStorage::with(&[("sidebar::visible", json!(true))]);
    let engine = PersistEngine::new(storage, EngineConfig::deferred());
    let store = Store::new(Sidebar::default());

    assert!(!persist(&engine, &store, false, visible()));
    engine.rehydrate().await;
    assert!(store.read(|s| s.visible));
}

#[tokio::test]
async fn test_failed_migration_is_isolated() {
    let storage = CountingStorage::default();
    storage.inner.insert("sidebar::width", Envelope::new(json!("wide"), 1));
    storage.inner.insert("sidebar::visible", Envelope::new(json!(true), 1));
    let storage = Arc::new(storage);

    let engine = PersistEngine::new(storage, EngineConfig::deferred());
    let store = Store::<Sidebar>::persisted(&engine, |fields| Sidebar {
        visible: fields.persist(false, visible()),
        visible_1: false,
        width: fields.persist(
            240,
            width()
                .version(2)
                .migrate(|_, from| Err(anyhow::anyhow!("no migration from v{}", from))),
        ),
    });

    engine.rehydrate().await;

    assert!(engine.is_hydrated());
    assert_eq!(store.read(|s| s.width), 240);
    assert!(store.read(|s| s.visible));
}

#[tokio::test]
async fn test_migration_applies_and_writes_new_version() {
    let storage = CountingStorage::default();
    storage.inner.insert("sidebar::width", Envelope::new(json!({"px": 300}), 1));
    let storage = Arc::new(storage);

    let engine = PersistEngine::new(storage.clone(), EngineConfig::deferred());
    let store = Store::<Sidebar>::persisted(&engine, |fields| Sidebar {
        width: fields.persist(
            240,
            width().version(2).migrate(|data, _| {
                data["px"]
                    .as_u64()
                    .map(|px| px as u32)
                    .ok_or_else(|| anyhow::anyhow!("missing px"))
            }),
        ),
        ..Sidebar::default()
    });

    engine.rehydrate().await;
    assert_eq!(store.read(|s| s.width), 300);

    store.patch(|s| s.width = 310);
    engine.flush().await.unwrap();
    assert_eq!(
        storage.inner.peek("sidebar::width"),
        Some(Envelope::new(json!(310), 2))
    );
}

// ============================================================================
// Write-through
// ============================================================================

#[tokio::test]
async fn test_one_subscription_for_many_fields() {
    let engine = PersistEngine::new(CountingStorage::with(&[]), EngineConfig::deferred());
    let store = sidebar_store(&engine);

    assert_eq!(store.subscriber_count(), 1);
    assert_eq!(engine.watched_containers(), 1);

    // Watching an already-watched key again does not subscribe again
    engine.watch(&store, WatchEntry::new("sidebar::width", 1, |s: &Sidebar| s.width));
    assert_eq!(store.subscriber_count(), 1);
}

#[tokio::test]
async fn test_single_mutation_writes_every_watched_field() {
    let storage = CountingStorage::with(&[]);
    let engine = PersistEngine::new(storage.clone(), EngineConfig::deferred());
    let store = sidebar_store(&engine);
    engine.rehydrate().await;

    store.patch(|s| s.width = 260);
    engine.flush().await.unwrap();

    assert_eq!(storage.sets("sidebar::visible"), 1);
    assert_eq!(storage.sets("sidebar::visible-1"), 1);
    assert_eq!(storage.sets("sidebar::width"), 1);
    assert_eq!(storage.total_sets(), 3);
    assert_eq!(engine.write_stats(), WriteStats { written: 3, failed: 0 });
}

#[tokio::test]
async fn test_changed_fan_out_writes_only_changed_fields() {
    let storage = CountingStorage::with(&[]);
    let config = EngineConfig::deferred().with_fan_out(WriteFanOut::Changed);
    let engine = PersistEngine::new(storage.clone(), config);
    let store = sidebar_store(&engine);
    engine.rehydrate().await;

    store.patch(|s| s.width = 260);
    store.patch(|s| s.visible = true);
    engine.flush().await.unwrap();

    // First notification writes everything once, the second only the change
    assert_eq!(storage.sets("sidebar::width"), 1);
    assert_eq!(storage.sets("sidebar::visible"), 2);
    assert_eq!(storage.sets("sidebar::visible-1"), 1);
}

#[tokio::test]
async fn test_changes_before_hydration_are_not_written() {
    let storage = CountingStorage::with(&[("sidebar::width", json!(500))]);
    let engine = PersistEngine::new(storage.clone(), EngineConfig::deferred());
    let store = sidebar_store(&engine);

    store.patch(|s| s.visible = true);
    engine.flush().await.unwrap();
    assert_eq!(storage.total_sets(), 0);

    engine.rehydrate().await;
    assert_eq!(store.read(|s| s.width), 500);
    assert_eq!(storage.inner.peek("sidebar::width").unwrap().data, json!(500));
}

#[tokio::test]
async fn test_round_trip_through_new_engine() {
    let storage = MemoryStorage::new();

    let engine = PersistEngine::new(Arc::new(storage.clone()), EngineConfig::deferred());
    let store = sidebar_store(&engine);
    engine.rehydrate().await;
    store.patch(|s| {
        s.visible = true;
        s.width = 333;
    });
    engine.flush().await.unwrap();

    let engine = PersistEngine::new(Arc::new(storage), EngineConfig::deferred());
    let store = sidebar_store(&engine);
    assert_eq!(store.read(|s| s.width), 240);
    engine.rehydrate().await;

    assert_eq!(store.snapshot(), Sidebar { visible: true, visible_1: false, width: 333 });
}

#[tokio::test]
async fn test_write_failures_are_counted() {
    let storage = CountingStorage::with(&[]);
    storage.reject_writes.store(true, Ordering::SeqCst);
    let engine = PersistEngine::new(storage.clone(), EngineConfig::deferred());
    let store = sidebar_store(&engine);
    engine.rehydrate().await;

    store.patch(|s| s.visible = true);
    engine.flush().await.unwrap();

    assert_eq!(engine.write_stats(), WriteStats { written: 0, failed: 3 });
    assert!(store.read(|s| s.visible));
    assert!(!engine.is_shut_down());
}

#[tokio::test]
async fn test_shutdown_flushes_pending_writes() {
    let storage = CountingStorage::with(&[]);
    let engine = PersistEngine::new(storage.clone(), EngineConfig::deferred());
    let store = sidebar_store(&engine);
    engine.rehydrate().await;

    store.patch(|s| s.width = 128);
    engine.shutdown().await.unwrap();

    assert!(engine.is_shut_down());
    assert_eq!(storage.inner.peek("sidebar::width").unwrap().data, json!(128));
    assert!(matches!(engine.flush().await, Err(PersistError::WriteQueueClosed)));
}

#[tokio::test]
async fn test_dropped_engine_does_not_break_container() {
    let storage = CountingStorage::with(&[]);
    let engine = PersistEngine::new(storage.clone(), EngineConfig::deferred());
    let store = sidebar_store(&engine);
    engine.rehydrate().await;
    drop(engine);

    store.patch(|s| s.width = 1);
    assert_eq!(store.read(|s| s.width), 1);
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_barrier_closes_iff_every_key_presented(
        stored in proptest::collection::btree_map("[a-z]{1,6}", any::<bool>(), 1..8),
        presented in 0usize..8,
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let storage = MemoryStorage::new();
            for (key, present) in &stored {
                if *present {
                    storage.insert(key.clone(), Envelope::new(json!(key.len()), 1));
                }
            }

            let engine = PersistEngine::new(Arc::new(storage), EngineConfig::deferred());
            let keys: Vec<String> = stored.keys().cloned().collect();
            let received = Arc::new(Mutex::new(HashMap::new()));

            for key in &keys {
                engine.register_keys(key.clone());
            }
            let presented = presented.min(keys.len());
            for key in keys.iter().take(presented) {
                let received = received.clone();
                let name = key.clone();
                engine.register_task(key.clone(), 0usize, move |value| {
                    received.lock().insert(name, value);
                });
            }
            engine.rehydrate().await;

            assert_eq!(engine.is_hydrated(), presented == keys.len());
            let received = received.lock();
            assert_eq!(received.len(), presented);
            for (key, value) in received.iter() {
                let expected = if stored[key] { key.len() } else { 0 };
                assert_eq!(*value, expected);
            }
        });
    }
}
