// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Metadata store adapter: an abstract key-value store with compare-and-set,
//! per spec.md §6. Two implementations are provided — an in-memory one used
//! by tests and single-process demos, and an etcd-backed one for production.

pub mod etcd;
pub mod memory;

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{de::DeserializeOwned, Serialize};

/// Outcome of a compare-and-set [`MetadataStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Ok { new_version: u64 },
    Conflict { current_version: u64 },
}

/// A change observed on a watched prefix.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub version: u64,
}

/// Narrow interface contract for the metadata store capability named in
/// spec.md §9 ("Dynamic dispatch is limited to two capabilities"). Only two
/// concrete variants exist in this crate (etcd, in-memory) — a tagged
/// choice rather than open-ended inheritance.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;

    /// Compare-and-set: succeeds only if the stored version equals
    /// `expected_version` (use `0` to mean "key must not exist yet").
    async fn put(&self, key: &str, value: Vec<u8>, expected_version: u64) -> Result<PutOutcome>;

    async fn watch(&self, prefix: &str) -> Result<BoxStream<'static, WatchEvent>>;
}

/// Typed convenience wrapper over a [`MetadataStore`] for JSON-envelope
/// values carrying a top-level `version` field, per spec.md §6.
pub struct TypedStore<'a> {
    pub store: &'a dyn MetadataStore,
}

impl<'a> TypedStore<'a> {
    pub fn new(store: &'a dyn MetadataStore) -> Self {
        Self { store }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, u64)>> {
        match self.store.get(key).await? {
            Some((bytes, version)) => {
                let value: T = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::MetadataStore(format!("decode {key}: {e}")))?;
                Ok(Some((value, version)))
            }
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expected_version: u64,
    ) -> Result<PutOutcome> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| Error::MetadataStore(format!("encode {key}: {e}")))?;
        self.store.put(key, bytes, expected_version).await
    }
}
