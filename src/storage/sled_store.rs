//! Sled-backed storage adapter
//!
//! Every key holds the JSON text of its envelope, the same way a browser
//! string store would. Sled calls are synchronous, so they run on the
//! blocking pool to keep the async runtime responsive.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, error, info, trace, warn};

use super::{Envelope, StorageAdapter};
use crate::error::StorageError;

/// Synchronous string-keyed medium with JSON (de)serialization.
#[derive(Clone)]
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the sled database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .with_context(|| format!("Failed to open sled database at: {}", path.display()))?;

        info!("Storage opened at: {}", path.display());
        Ok(Self { db })
    }

    /// Temporary database removed when dropped.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("Failed to open temporary sled database")?;
        Ok(Self { db })
    }

    /// All stored keys, in byte order.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.db.iter().keys() {
            let raw = item.context("Failed to iterate sled keys")?;
            keys.push(String::from_utf8_lossy(&raw).into_owned());
        }
        Ok(keys)
    }

    /// Store raw text under `key` without going through an envelope.
    ///
    /// Only useful for simulating foreign or damaged data.
    pub fn insert_raw(&self, key: &str, text: &str) -> Result<()> {
        self.db
            .insert(key.as_bytes(), text.as_bytes())
            .with_context(|| format!("Failed to insert raw value for: {}", key))?;
        Ok(())
    }

    fn read_blocking(db: &sled::Db, key: &str) -> Option<Envelope> {
        match db.get(key.as_bytes()) {
            Ok(Some(raw)) => match serde_json::from_slice::<Envelope>(&raw) {
                Ok(envelope) => {
                    trace!("Read '{}' (version {})", key, envelope.version);
                    Some(envelope)
                }
                Err(e) => {
                    warn!("Failed to deserialize stored value for '{}': {}", key, e);
                    None
                }
            },
            Ok(None) => {
                debug!("No stored value for '{}'", key);
                None
            }
            Err(e) => {
                error!("Failed to read '{}' from sled: {}", key, e);
                None
            }
        }
    }
}

#[async_trait]
impl StorageAdapter for SledStorage {
    async fn get(&self, key: &str) -> Option<Envelope> {
        let db = self.db.clone();
        let owned_key = key.to_string();

        match tokio::task::spawn_blocking(move || Self::read_blocking(&db, &owned_key)).await {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Blocking read task for '{}' failed: {}", key, e);
                None
            }
        }
    }

    async fn set(&self, key: &str, envelope: Envelope) -> Result<(), StorageError> {
        let text = serde_json::to_string(&envelope)?;
        let db = self.db.clone();
        let owned_key = key.to_string();

        tokio::task::spawn_blocking(move || {
            db.insert(owned_key.as_bytes(), text.as_bytes())?;
            db.flush()?;
            Ok::<_, sled::Error>(())
        })
        .await??;

        trace!("Wrote '{}' (version {})", key, envelope.version);
        Ok(())
    }
}
