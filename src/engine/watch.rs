//! Watch table - storage key to field accessor, one subscription per container

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::container::Subscription;

type EncodeFn<S> = Arc<dyn Fn(&S) -> serde_json::Result<serde_json::Value> + Send + Sync>;

/// How many fields a single change notification re-serializes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteFanOut {
    /// Every watched field of the container, whether or not it changed.
    #[default]
    All,
    /// Only fields whose encoded value differs from the last one queued.
    Changed,
}

/// A watched field: where it is stored and how to read it from the state.
pub struct WatchEntry<S> {
    pub(crate) key: String,
    pub(crate) version: u32,
    pub(crate) encode: EncodeFn<S>,
}

impl<S: 'static> WatchEntry<S> {
    pub fn new<T, G>(key: impl Into<String>, version: u32, get: G) -> Self
    where
        T: Serialize,
        G: Fn(&S) -> T + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            version,
            encode: Arc::new(move |state| serde_json::to_value(get(state))),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// All watch entries of one container, sharing a single subscription.
pub(crate) struct WatchGroup<S> {
    entries: Mutex<Vec<WatchEntry<S>>>,
    last_queued: Mutex<HashMap<String, serde_json::Value>>,
    pub(crate) subscription: OnceCell<Subscription>,
}

impl<S> WatchGroup<S> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            last_queued: Mutex::new(HashMap::new()),
            subscription: OnceCell::new(),
        }
    }

    /// Record an entry; returns false if the key is already watched.
    pub(crate) fn insert(&self, entry: WatchEntry<S>) -> bool {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.key == entry.key) {
            return false;
        }
        entries.push(entry);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Encode every entry against `state`.
    ///
    /// Returns `(key, version, encoded)` per entry. In `Changed` mode,
    /// entries equal to the last queued value are skipped.
    pub(crate) fn collect(
        &self,
        state: &S,
        fan_out: WriteFanOut,
    ) -> Vec<(String, u32, serde_json::Result<serde_json::Value>)> {
        let entries = self.entries.lock();
        let mut last_queued = self.last_queued.lock();
        let mut out = Vec::with_capacity(entries.len());

        for entry in entries.iter() {
            let encoded = (entry.encode)(state);
            if fan_out == WriteFanOut::Changed {
                if let Ok(value) = &encoded {
                    if last_queued.get(&entry.key) == Some(value) {
                        continue;
                    }
                    last_queued.insert(entry.key.clone(), value.clone());
                }
            }
            out.push((entry.key.clone(), entry.version, encoded));
        }

        out
    }
}
