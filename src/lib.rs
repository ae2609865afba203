//! Persistent state hydration and write-through for in-memory state containers
//!
//! A [`PersistEngine`] tracks persisted fields bound from any number of
//! [`StateContainer`]s. Containers are built synchronously from field
//! defaults; stored values arrive later through hydration, and the engine
//! reports when every registered field has been hydrated. From then on,
//! container changes are written back through the [`StorageAdapter`].
//!
//! ```ignore
//! let engine = PersistEngine::new(Arc::new(MemoryStorage::new()), EngineConfig::deferred());
//! let app = AppStore::new(&engine);
//!
//! engine.rehydrate().await;
//! app.toggle_sidebar();
//! engine.flush().await?;
//! ```

pub mod app_state;
pub mod binding;
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod paths;
pub mod storage;

pub use binding::{persist, Field, FieldBinder, FieldValue, Migrate};
pub use config::{EngineConfig, RunMode};
pub use container::{ContainerId, Listener, StateContainer, Store, Subscription};
pub use engine::{EngineState, PersistEngine, WatchEntry, WriteFanOut, WriteStats};
pub use error::{PersistError, StorageError};
pub use storage::{Envelope, MemoryStorage, SledStorage, StorageAdapter};
