//! Field bindings - connect one persisted field of a container to an engine
//!
//! A binding registers its storage key, hands back the default value
//! synchronously, and once the container exists arranges two things:
//! hydration (eager or queued, depending on the engine config) and
//! write-through via [`PersistEngine::watch`].
//!
//! Fields are addressed through a typed getter/setter pair instead of a
//! string path into the state.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::container::StateContainer;
use crate::engine::{HydrationJob, PersistEngine, WatchEntry};
use crate::error::PersistError;
use crate::storage::{Envelope, DEFAULT_VERSION};

type Getter<S, T> = Arc<dyn Fn(&S) -> T + Send + Sync>;
type Setter<S, T> = Arc<dyn Fn(&mut S, T) + Send + Sync>;

/// Converts data stored under an older version into the current shape.
///
/// Receives the raw stored payload and the version it was written with.
pub type Migrate<T> = Arc<dyn Fn(serde_json::Value, u32) -> anyhow::Result<T> + Send + Sync>;

/// Value types a field can hold.
pub trait FieldValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> FieldValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Description of one persisted field of state `S`.
pub struct Field<S, T> {
    name: String,
    version: u32,
    get: Getter<S, T>,
    set: Setter<S, T>,
    migrate: Option<Migrate<T>>,
}

impl<S: 'static, T: FieldValue> Field<S, T> {
    /// `name` is the storage key, conventionally `<namespace>::<feature>::<field>`.
    pub fn new<G, W>(name: impl Into<String>, get: G, set: W) -> Self
    where
        G: Fn(&S) -> T + Send + Sync + 'static,
        W: Fn(&mut S, T) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            version: DEFAULT_VERSION,
            get: Arc::new(get),
            set: Arc::new(set),
            migrate: None,
        }
    }

    /// Version written alongside the data; defaults to 1.
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Called when the stored version differs from [`version`](Self::version).
    pub fn migrate<M>(mut self, migrate: M) -> Self
    where
        M: Fn(serde_json::Value, u32) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.migrate = Some(Arc::new(migrate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Turn what storage returned into a value to patch in.
    ///
    /// `None` means "keep the default": nothing stored, a null payload, an
    /// undecodable payload, or a failed migration. Failures are logged and
    /// contained to this field.
    pub(crate) fn resolve(&self, stored: Option<Envelope>) -> Option<T> {
        let envelope = stored?;

        if envelope.version != self.version {
            if let Some(migrate) = &self.migrate {
                let from = envelope.version;
                return match migrate(envelope.data, from) {
                    Ok(value) => {
                        debug!("Migrated '{}' from version {} to {}", self.name, from, self.version);
                        Some(value)
                    }
                    Err(e) => {
                        let e = PersistError::Migration {
                            key: self.name.clone(),
                            from,
                            message: format!("{:#}", e),
                        };
                        warn!("{}, keeping default", e);
                        None
                    }
                };
            }
        }

        match envelope.decode::<T>() {
            Ok(value) => value,
            Err(e) => {
                warn!("Stored value for '{}' is unreadable, keeping default: {}", self.name, e);
                None
            }
        }
    }

    fn watch_entry(&self) -> WatchEntry<S> {
        let get = self.get.clone();
        WatchEntry::new(self.name.clone(), self.version, move |state: &S| get(state))
    }
}

type PendingBinding<C> = Box<dyn FnOnce(&C) + Send>;

/// Collects field bindings while a container's initial state is built.
///
/// [`persist`](Self::persist) registers the key and returns the default right
/// away; [`attach`](Self::attach) wires hydration and write-through once the
/// container exists.
pub struct FieldBinder<C: StateContainer> {
    engine: Arc<PersistEngine>,
    pending: Vec<PendingBinding<C>>,
}

impl<C: StateContainer> FieldBinder<C> {
    pub fn new(engine: &Arc<PersistEngine>) -> Self {
        Self {
            engine: engine.clone(),
            pending: Vec::new(),
        }
    }

    /// Bind `field`, returning `default` for the initial state.
    pub fn persist<T: FieldValue>(&mut self, default: T, field: Field<C::State, T>) -> T {
        self.engine.register_keys(field.name.clone());

        let engine = self.engine.clone();
        self.pending
            .push(Box::new(move |container: &C| bind(&engine, container, field)));

        default
    }

    /// Number of fields bound so far.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wire every collected binding to `container`.
    pub fn attach(self, container: &C) {
        debug!(
            "Attaching {} persisted field(s) to engine {}",
            self.pending.len(),
            self.engine.id()
        );
        for binding in self.pending {
            binding(container);
        }
    }
}

/// Bind a single field to an existing container.
///
/// Equivalent to a one-field [`FieldBinder`]; returns `default`.
pub fn persist<C, T>(
    engine: &Arc<PersistEngine>,
    container: &C,
    default: T,
    field: Field<C::State, T>,
) -> T
where
    C: StateContainer,
    T: FieldValue,
{
    engine.register_keys(field.name.clone());
    bind(engine, container, field);
    default
}

fn bind<C, T>(engine: &Arc<PersistEngine>, container: &C, field: Field<C::State, T>)
where
    C: StateContainer,
    T: FieldValue,
{
    let key = field.name.clone();
    let entry = field.watch_entry();
    let target = container.clone();

    let job: HydrationJob = Box::new(move |stored: Option<Envelope>| {
        if let Some(value) = field.resolve(stored) {
            let set = field.set.clone();
            target.patch(move |state| set(state, value));
        }
    });

    if engine.config().skip_hydration {
        engine.queue_job(key, job);
    } else {
        engine.spawn_job(key, job);
    }

    engine.watch(container, entry);
}
