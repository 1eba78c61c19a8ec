// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! In-memory metadata store: used by the single-process demo path and the
//! test suite. Not durable across restarts — production deployments use
//! [`super::etcd::EtcdStore`].

use super::{MetadataStore, PutOutcome, WatchEvent};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

struct Entry {
    value: Vec<u8>,
    version: u64,
}

pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    changes: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _rx) = broadcast::channel(1024);
        Self { entries: DashMap::new(), changes }
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        Ok(self.entries.get(key).map(|e| (e.value.clone(), e.version)))
    }

    async fn put(&self, key: &str, value: Vec<u8>, expected_version: u64) -> Result<PutOutcome> {
        let mut slot = self.entries.entry(key.to_string()).or_insert(Entry { value: Vec::new(), version: 0 });

        let current_version = if slot.value.is_empty() && slot.version == 0 {
            0
        } else {
            slot.version
        };

        if current_version != expected_version {
            return Ok(PutOutcome::Conflict { current_version });
        }

        let new_version = current_version + 1;
        slot.value = value.clone();
        slot.version = new_version;

        let _ = self.changes.send(WatchEvent {
            key: key.to_string(),
            value: Some(value),
            version: new_version,
        });

        Ok(PutOutcome::Ok { new_version })
    }

    async fn watch(&self, prefix: &str) -> Result<BoxStream<'static, WatchEvent>> {
        let prefix = prefix.to_string();
        let rx = self.changes.subscribe();
        let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
            .filter_map(move |res| {
                let prefix = prefix.clone();
                async move {
                    match res {
                        Ok(event) if event.key.starts_with(&prefix) => Some(event),
                        _ => None,
                    }
                }
            });
        Ok(Box::pin(stream))
    }
}

use futures::StreamExt;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let store = MemoryStore::new();
        let outcome = store.put("k", b"v1".to_vec(), 0).await.unwrap();
        assert_eq!(outcome, PutOutcome::Ok { new_version: 1 });

        let conflict = store.put("k", b"v2".to_vec(), 0).await.unwrap();
        assert_eq!(conflict, PutOutcome::Conflict { current_version: 1 });

        let ok = store.put("k", b"v2".to_vec(), 1).await.unwrap();
        assert_eq!(ok, PutOutcome::Ok { new_version: 2 });
    }

    #[tokio::test]
    async fn get_reflects_latest_put() {
        let store = MemoryStore::new();
        store.put("k", b"v1".to_vec(), 0).await.unwrap();
        let (value, version) = store.get("k").await.unwrap().unwrap();
        assert_eq!(value, b"v1");
        assert_eq!(version, 1);
    }
}
