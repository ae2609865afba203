//! State containers - the observable targets the engine hydrates and watches
//!
//! The engine never owns a container. It needs three primitives from one:
//! read the current state, patch it, and subscribe to changes. [`Store`]
//! is a ready-made implementation built on a read-write lock and a
//! subscriber list.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::binding::FieldBinder;
use crate::engine::PersistEngine;

/// Process-unique identity of a container instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContainerId(u64);

impl ContainerId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Change listener, called with the state after every patch.
pub type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;

/// Handle returned by [`StateContainer::subscribe`].
///
/// The engine keeps its handle for the lifetime of the container and never
/// unsubscribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub container: ContainerId,
    pub id: usize,
}

/// Observable state target.
///
/// Handles are cheap to clone and refer to the same underlying state.
/// Listeners run synchronously inside `patch` and must not patch the same
/// container.
pub trait StateContainer: Clone + Send + Sync + 'static {
    type State: Send + Sync + 'static;

    fn id(&self) -> ContainerId;

    /// Run `f` against the latest state snapshot.
    fn read<R>(&self, f: impl FnOnce(&Self::State) -> R) -> R;

    /// Mutate the state in place, then notify every listener.
    fn patch(&self, f: impl FnOnce(&mut Self::State));

    fn subscribe(&self, listener: Listener<Self::State>) -> Subscription;
}

struct StoreInner<S> {
    id: ContainerId,
    state: RwLock<S>,
    subscribers: RwLock<Vec<(usize, Listener<S>)>>,
    next_subscriber: AtomicUsize,
}

/// In-memory state container with subscription support.
pub struct Store<S> {
    inner: Arc<StoreInner<S>>,
}

impl<S> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Send + Sync + 'static> Store<S> {
    pub fn new(state: S) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                id: ContainerId::next(),
                state: RwLock::new(state),
                subscribers: RwLock::new(Vec::new()),
                next_subscriber: AtomicUsize::new(0),
            }),
        }
    }

    /// Build a store whose persisted fields are bound to `engine`.
    ///
    /// `build` receives a [`FieldBinder`]; every `persist` call registers its
    /// key and returns the default, so the initial state never waits on I/O.
    /// Hydration and write-through are wired once the store exists.
    pub fn persisted<F>(engine: &Arc<PersistEngine>, build: F) -> Self
    where
        F: FnOnce(&mut FieldBinder<Self>) -> S,
    {
        let mut binder = FieldBinder::new(engine);
        let store = Self::new(build(&mut binder));
        binder.attach(&store);
        store
    }

    /// Clone of the current state.
    pub fn snapshot(&self) -> S
    where
        S: Clone,
    {
        self.inner.state.read().clone()
    }

    /// Remove a listener; returns false if it was not registered.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != subscription.id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl<S: Send + Sync + 'static> StateContainer for Store<S> {
    type State = S;

    fn id(&self) -> ContainerId {
        self.inner.id
    }

    fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let state = self.inner.state.read();
        f(&*state)
    }

    fn patch(&self, f: impl FnOnce(&mut S)) {
        {
            let mut state = self.inner.state.write();
            f(&mut *state);
        }

        let listeners: Vec<Listener<S>> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        trace!("Container {:?} patched, notifying {}", self.inner.id, listeners.len());

        let state = self.inner.state.read();
        for listener in listeners {
            listener(&*state);
        }
    }

    fn subscribe(&self, listener: Listener<S>) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push((id, listener));
        Subscription {
            container: self.inner.id,
            id,
        }
    }
}
