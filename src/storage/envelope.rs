//! Versioned envelope stored under a single key

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Version assigned to fields that do not declare one.
pub const DEFAULT_VERSION: u32 = 1;

/// The versioned unit persisted under one storage key.
///
/// Adapters exchange `Envelope<serde_json::Value>`; typed access goes
/// through [`Envelope::decode`] and [`Envelope::encode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = serde_json::Value> {
    pub data: T,
    pub version: u32,
}

impl<T> Envelope<T> {
    pub fn new(data: T, version: u32) -> Self {
        Self { data, version }
    }
}

impl Envelope {
    /// Wrap a typed value for storage.
    pub fn encode<T: Serialize>(value: &T, version: u32) -> serde_json::Result<Self> {
        Ok(Self {
            data: serde_json::to_value(value)?,
            version,
        })
    }

    /// Decode the payload into `T`.
    ///
    /// A JSON `null` payload decodes to `Ok(None)` so callers can fall back
    /// to their default the same way they do for a missing key.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<Option<T>> {
        if self.data.is_null() {
            return Ok(None);
        }
        serde_json::from_value(self.data.clone()).map(Some)
    }
}
