//! In-process structured-value storage
//!
//! Envelopes are kept as-is, no serialization step. Useful as the default
//! backend for tests and for short-lived processes.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use super::{Envelope, StorageAdapter};
use crate::error::StorageError;

/// Asynchronous structured-value medium backed by a concurrent map.
///
/// Cloning shares the underlying map, so two engines built on clones of
/// the same `MemoryStorage` see each other's writes.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<DashMap<String, Envelope>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry directly, bypassing the adapter contract.
    pub fn insert(&self, key: impl Into<String>, envelope: Envelope) {
        self.entries.insert(key.into(), envelope);
    }

    /// Current envelope under `key`, if any.
    pub fn peek(&self, key: &str) -> Option<Envelope> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get(&self, key: &str) -> Option<Envelope> {
        self.peek(key)
    }

    async fn set(&self, key: &str, envelope: Envelope) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), envelope);
        Ok(())
    }
}
