//! Storage adapters - the two-method boundary to a persistent medium
//!
//! The engine only ever calls [`StorageAdapter::get`] and
//! [`StorageAdapter::set`]. Implementations must normalise every read
//! failure (missing key, unreadable bytes, corrupt JSON) to `None`.

mod envelope;
mod memory;
mod sled_store;

use async_trait::async_trait;

use crate::error::StorageError;

pub use envelope::{Envelope, DEFAULT_VERSION};
pub use memory::MemoryStorage;
pub use sled_store::SledStorage;

/// Pluggable persistent key-value medium holding versioned envelopes.
///
/// Adapters are shared between engines (`Arc<dyn StorageAdapter>`), so they
/// must be `Send + Sync`. There is no transactionality across calls:
/// concurrent `set`s to one key race and the last to complete wins.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Last envelope written under `key`, or `None` if absent or unreadable.
    async fn get(&self, key: &str) -> Option<Envelope>;

    /// Persist `envelope` under `key`, fully replacing any previous value.
    async fn set(&self, key: &str, envelope: Envelope) -> Result<(), StorageError>;
}
