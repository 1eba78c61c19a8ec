// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! etcd-backed [`MetadataStore`] — the canonical metadata store named in
//! spec.md §6. Uses etcd's native `mod_revision` as the CAS version and
//! `Txn` to make `put` atomic.

use super::{MetadataStore, PutOutcome, WatchEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, GetOptions, Txn, TxnOp, WatchOptions};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::Mutex;

pub struct EtcdStore {
    client: Mutex<Client>,
    prefix: String,
}

impl EtcdStore {
    pub async fn connect(endpoints: Vec<String>, prefix: impl Into<String>) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| Error::MetadataStore(format!("etcd connect: {e}")))?;
        Ok(Self { client: Mutex::new(client), prefix: prefix.into() })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl MetadataStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let mut client = self.client.lock().await;
        let resp = client
            .get(self.full_key(key), None::<GetOptions>)
            .await
            .map_err(|e| Error::MetadataStore(format!("etcd get: {e}")))?;

        match resp.kvs().first() {
            Some(kv) => Ok(Some((kv.value().to_vec(), kv.mod_revision() as u64))),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, expected_version: u64) -> Result<PutOutcome> {
        let full_key = self.full_key(key);
        let mut client = self.client.lock().await;

        // expected_version == 0 means "key must not exist yet" -> compare
        // on create_revision == 0; otherwise compare on mod_revision.
        let compare = if expected_version == 0 {
            Compare::create_revision(full_key.clone(), CompareOp::Equal, 0)
        } else {
            Compare::mod_revision(full_key.clone(), CompareOp::Equal, expected_version as i64)
        };

        let txn = Txn::new()
            .when(vec![compare])
            .and_then(vec![TxnOp::put(full_key.clone(), value, None)])
            .or_else(vec![TxnOp::get(full_key.clone(), None)]);

        let resp = client
            .txn(txn)
            .await
            .map_err(|e| Error::MetadataStore(format!("etcd txn: {e}")))?;

        if resp.succeeded() {
            // Re-read to learn the new mod_revision (cheap, CAS already won).
            drop(client);
            let (_, new_version) = self
                .get(key)
                .await?
                .ok_or_else(|| Error::MetadataStore("put succeeded but key vanished".into()))?;
            Ok(PutOutcome::Ok { new_version })
        } else {
            let current_version = resp
                .op_responses()
                .into_iter()
                .find_map(|op| op.get())
                .and_then(|g| g.kvs().first().map(|kv| kv.mod_revision() as u64))
                .unwrap_or(0);
            Ok(PutOutcome::Conflict { current_version })
        }
    }

    async fn watch(&self, prefix: &str) -> Result<BoxStream<'static, WatchEvent>> {
        let full_prefix = self.full_key(prefix);
        let mut client = self.client.lock().await;
        let (watcher, stream) = client
            .watch(full_prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| Error::MetadataStore(format!("etcd watch: {e}")))?;

        // The `Watcher` keeps the subscription alive on the server side;
        // dropping it cancels the watch out from under `stream`. Stash it
        // in the mapped stream's closure state so it lives as long as the
        // stream does instead of as long as this function call.
        let mapped = futures::stream::unfold((watcher, stream), |(watcher, mut stream)| async move {
            loop {
                match stream.next().await {
                    Some(Ok(resp)) => {
                        let events: Vec<WatchEvent> = resp
                            .events()
                            .iter()
                            .filter_map(|ev| {
                                ev.kv().map(|kv| WatchEvent {
                                    key: String::from_utf8_lossy(kv.key()).to_string(),
                                    value: Some(kv.value().to_vec()),
                                    version: kv.mod_revision() as u64,
                                })
                            })
                            .collect();
                        if events.is_empty() {
                            continue;
                        }
                        return Some((futures::stream::iter(events), (watcher, stream)));
                    }
                    Some(Err(_)) => continue,
                    None => return None,
                }
            }
        });

        Ok(Box::pin(mapped.flatten()))
    }
}
