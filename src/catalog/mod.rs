// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Shard catalog: the authoritative topology snapshot (spec.md §3/§4.1).
//!
//! [`ShardCatalog`] is an immutable value object; [`CatalogHandle`] holds
//! the current `Arc<ShardCatalog>` plus its derived [`Ring`] behind a
//! `parking_lot::RwLock`, giving lock-free-ish, very-short-critical-section
//! reads and atomic pointer swaps on write, per spec.md §5's "catalog
//! snapshot is read lock-free" requirement.

pub mod ring;

use crate::error::{Error, Result};
use crate::metadata::{MetadataStore, PutOutcome, TypedStore};
use crate::types::{Shard, ShardId, ShardStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
pub use ring::{ring_diff, MovingRange, Ring};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default number of vnodes assigned to a newly created shard.
pub const DEFAULT_VNODE_COUNT: u32 = 256;

/// Key under which the current catalog snapshot is persisted (spec.md §6).
pub const CATALOG_KEY: &str = "catalog/current";

/// Versioned snapshot of all shards and their vnode counts.
///
/// Per-shard vnode *assignments* are derived deterministically from
/// `(shard_id, vnode_count)` by [`ring::Ring::build`], so the catalog only
/// needs to persist the vnode *count* per shard, not every placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardCatalog {
    pub version: u64,
    pub shards: BTreeMap<ShardId, Shard>,
    pub vnode_counts: BTreeMap<ShardId, u32>,
    pub updated_at: DateTime<Utc>,
}

impl ShardCatalog {
    pub fn empty() -> Self {
        Self {
            version: 0,
            shards: BTreeMap::new(),
            vnode_counts: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn build_ring(&self) -> Ring {
        // I1: only active-or-migrating shards carry coverage; readonly
        // shards keep their vnodes (they still own the range, just refuse
        // writes), inactive shards must already have 0 vnodes (I4).
        Ring::build(
            self.version,
            self.vnode_counts
                .iter()
                .filter(|(id, _)| {
                    self.shards
                        .get(*id)
                        .map(|s| !matches!(s.status, ShardStatus::Inactive))
                        .unwrap_or(false)
                })
                .map(|(id, count)| (id.clone(), *count)),
        )
    }

    /// Apply a mutation, returning the next-version catalog. Never mutates
    /// `self` — callers install the result via [`CatalogHandle`].
    pub fn with_next_version(&self, f: impl FnOnce(&mut ShardCatalog)) -> ShardCatalog {
        let mut next = self.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        f(&mut next);
        next
    }
}

/// Read-mostly cached pointer to the current catalog, held by both the
/// Manager (which also writes through it) and every Router.
pub struct CatalogHandle {
    inner: RwLock<Arc<ShardCatalog>>,
    ring: RwLock<Arc<Ring>>,
}

impl CatalogHandle {
    pub fn new(catalog: ShardCatalog) -> Self {
        let ring = catalog.build_ring();
        Self {
            inner: RwLock::new(Arc::new(catalog)),
            ring: RwLock::new(Arc::new(ring)),
        }
    }

    pub fn current(&self) -> Arc<ShardCatalog> {
        self.inner.read().clone()
    }

    pub fn ring(&self) -> Arc<Ring> {
        self.ring.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// `install` — atomic pointer swap of the snapshot (spec.md §4.1).
    /// I3: rejects a catalog whose version doesn't strictly increase over
    /// the currently-installed one; Routers observing an out-of-order
    /// update drop it rather than regress.
    pub fn install(&self, catalog: ShardCatalog) -> bool {
        let mut guard = self.inner.write();
        if catalog.version <= guard.version {
            return false;
        }
        let ring = catalog.build_ring();
        *guard = Arc::new(catalog);
        *self.ring.write() = Arc::new(ring);
        true
    }
}

/// Manager-side writer: persists to the metadata store with CAS before
/// publishing in-process, per spec.md §4.1 `publish`.
pub struct CatalogWriter<'a> {
    pub handle: &'a CatalogHandle,
    pub store: &'a dyn MetadataStore,
}

impl<'a> CatalogWriter<'a> {
    pub fn new(handle: &'a CatalogHandle, store: &'a dyn MetadataStore) -> Self {
        Self { handle, store }
    }

    /// Persist-then-publish. On a metadata-store CAS race the mutation is
    /// rejected; the caller is expected to retry by recomputing `f` against
    /// the (now-current) catalog, per spec.md §4.1 failure semantics.
    pub async fn mutate(
        &self,
        f: impl FnOnce(&mut ShardCatalog),
    ) -> Result<Arc<ShardCatalog>> {
        let current = self.handle.current();
        let next = current.with_next_version(f);

        let typed = TypedStore::new(self.store);
        match typed
            .put_json(CATALOG_KEY, &next, current.version)
            .await?
        {
            PutOutcome::Ok { .. } => {
                self.handle.install(next.clone());
                Ok(Arc::new(next))
            }
            PutOutcome::Conflict { current_version } => Err(Error::Conflict(format!(
                "catalog CAS race: expected version {}, store has {current_version}",
                current.version
            ))),
        }
    }

    /// Retry `mutate` up to `attempts` times on `conflict`, per spec.md §7
    /// ("Manager retries internally up to N=3 then surfaces").
    pub async fn mutate_with_retry(
        &self,
        attempts: u32,
        mut f: impl FnMut(&mut ShardCatalog),
    ) -> Result<Arc<ShardCatalog>> {
        let mut last_err = None;
        for _ in 0..attempts.max(1) {
            match self.mutate(|c| f(c)).await {
                Ok(catalog) => return Ok(catalog),
                Err(e @ Error::Conflict(_)) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::internal("mutate_with_retry exhausted with no error")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::memory::MemoryStore;
    use crate::types::Endpoint;

    fn shard(id: &str) -> Shard {
        Shard::new(id.to_string(), id.to_string(), Endpoint::new(format!("postgres://{id}")))
    }

    #[test]
    fn versions_are_monotonic_and_out_of_order_is_rejected() {
        let handle = CatalogHandle::new(ShardCatalog::empty());
        let v1 = handle.current().with_next_version(|c| {
            c.shards.insert("a".into(), shard("a"));
            c.vnode_counts.insert("a".into(), 256);
        });
        assert!(handle.install(v1.clone()));
        assert_eq!(handle.version(), 1);

        // stale version is dropped
        assert!(!handle.install(v1));
        assert_eq!(handle.version(), 1);
    }

    #[tokio::test]
    async fn writer_persists_before_publishing() {
        let store = MemoryStore::new();
        let handle = CatalogHandle::new(ShardCatalog::empty());
        let writer = CatalogWriter::new(&handle, &store);

        writer
            .mutate(|c| {
                c.shards.insert("a".into(), shard("a"));
                c.vnode_counts.insert("a".into(), 256);
            })
            .await
            .unwrap();

        assert_eq!(handle.version(), 1);
        let (persisted, version): (ShardCatalog, u64) = crate::metadata::TypedStore::new(&store)
            .get_json(CATALOG_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(persisted.version, 1);
    }

    #[tokio::test]
    async fn conflicting_mutation_is_rejected() {
        let store = MemoryStore::new();
        let handle = CatalogHandle::new(ShardCatalog::empty());
        let writer = CatalogWriter::new(&handle, &store);
        writer.mutate(|c| { c.shards.insert("a".into(), shard("a")); }).await.unwrap();

        // Simulate a racing writer with a stale base version by writing
        // directly to the store underneath the handle.
        crate::metadata::TypedStore::new(&store)
            .put_json(CATALOG_KEY, &ShardCatalog::empty().with_next_version(|_| {}), 1)
            .await
            .unwrap();

        let err = writer.mutate(|c| { c.shards.insert("b".into(), shard("b")); }).await;
        assert!(matches!(err, Err(Error::Conflict(_))));
    }
}
