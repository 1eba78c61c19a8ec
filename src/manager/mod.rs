// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Manager orchestration: the single writer owning [`CatalogWriter`], and
//! the background tasks (health, failover, resharding) it supervises.

pub mod api;

use crate::backend::ShardBackend;
use crate::catalog::{CatalogHandle, CatalogWriter};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::failover::{FailoverController, FailoverRegistry};
use crate::health::{HealthController, HealthRegistry};
use crate::metadata::MetadataStore;
use crate::observability::Metrics;
use crate::reshard::{DeltaSource, ReshardEngine, ReshardRegistry, ReshardSettings};
use crate::types::{Endpoint, Shard, ShardId, ShardStatus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything the admin API needs to read or mutate shard-cluster state.
pub struct Manager {
    pub catalog: Arc<CatalogHandle>,
    pub store: Arc<dyn MetadataStore>,
    pub backend: Arc<dyn ShardBackend>,
    pub health: Arc<HealthRegistry>,
    pub failover: Arc<FailoverRegistry>,
    pub reshard: Arc<ReshardEngine>,
    pub metrics: Arc<Metrics>,
    pub settings: Arc<Settings>,
}

impl Manager {
    pub fn new(
        catalog: Arc<CatalogHandle>,
        store: Arc<dyn MetadataStore>,
        backend: Arc<dyn ShardBackend>,
        delta_source: Arc<dyn DeltaSource>,
        metrics: Arc<Metrics>,
        settings: Arc<Settings>,
    ) -> Self {
        let health = Arc::new(HealthRegistry::with_fail_threshold(settings.health_fail_threshold));
        let failover_registry = Arc::new(FailoverRegistry::new());
        let reshard_registry = Arc::new(ReshardRegistry::new());
        let reshard = Arc::new(ReshardEngine::new(
            catalog.clone(),
            store.clone(),
            backend.clone(),
            delta_source,
            reshard_registry,
            ReshardSettings {
                chunk_size: 500,
                deltasync_threshold_rows: settings.deltasync_threshold_rows,
                cutover_drain_timeout: settings.cutover_drain_timeout(),
            },
        ));

        Self { catalog, store, backend, health, failover: failover_registry, reshard, metrics, settings }
    }

    /// Spawn the health loop, failover decision loop, and this manager's
    /// catalog-version metric updater. Returns when `shutdown` fires,
    /// respecting the configured drain window.
    pub async fn run_background_tasks(self: &Arc<Self>, shutdown: CancellationToken) {
        let health_controller = HealthController::new(
            self.catalog.clone(),
            self.backend.clone(),
            self.health.clone(),
            self.settings.health_check_interval(),
        );
        let failover_controller = FailoverController::new(
            self.catalog.clone(),
            self.store.clone(),
            self.backend.clone(),
            self.health.clone(),
            self.failover.clone(),
            self.settings.health_check_interval(),
        );
        if !self.settings.automatic_failover_enabled {
            self.failover.set_enabled(false);
        }

        let health_shutdown = shutdown.clone();
        let failover_shutdown = shutdown.clone();
        tokio::join!(
            health_controller.run(health_shutdown),
            failover_controller.run(failover_shutdown),
        );
    }

    pub async fn create_shard(
        &self,
        name: String,
        primary: Endpoint,
        replicas: Vec<Endpoint>,
        vnode_count: u32,
    ) -> Result<Shard> {
        if self.catalog.current().shards.values().any(|s| s.name == name) {
            return Err(Error::Conflict(format!("shard named {name} already exists")));
        }

        let id: ShardId = uuid::Uuid::new_v4().to_string();
        let mut shard = Shard::new(id.clone(), name, primary);
        shard.replicas = replicas;

        let writer = CatalogWriter::new(&self.catalog, self.store.as_ref());
        let shard_for_closure = shard.clone();
        let id_for_closure = id.clone();
        writer
            .mutate_with_retry(3, move |c| {
                c.shards.insert(id_for_closure.clone(), shard_for_closure.clone());
                c.vnode_counts.insert(id_for_closure.clone(), vnode_count);
            })
            .await?;

        Ok(shard)
    }

    pub fn get_shard(&self, id: &str) -> Option<Shard> {
        self.catalog.current().shards.get(id).cloned()
    }

    pub fn list_shards(&self) -> Vec<Shard> {
        self.catalog.current().shards.values().cloned().collect()
    }

    pub async fn delete_shard(&self, id: &str) -> Result<()> {
        let shard = self.get_shard(id).ok_or_else(|| Error::NotFound(format!("shard {id}")))?;
        if !shard.is_drained() {
            return Err(Error::BadRequest("shard must be inactive (drained) before deletion".to_string()));
        }
        let writer = CatalogWriter::new(&self.catalog, self.store.as_ref());
        let id = id.to_string();
        writer
            .mutate_with_retry(3, move |c| {
                c.shards.remove(&id);
                c.vnode_counts.remove(&id);
            })
            .await?;
        Ok(())
    }

    pub async fn set_shard_status(&self, id: &str, status: ShardStatus) -> Result<Shard> {
        if !self.catalog.current().shards.contains_key(id) {
            return Err(Error::NotFound(format!("shard {id}")));
        }
        let writer = CatalogWriter::new(&self.catalog, self.store.as_ref());
        let id_owned = id.to_string();
        let catalog = writer
            .mutate_with_retry(3, move |c| {
                if let Some(shard) = c.shards.get_mut(&id_owned) {
                    shard.status = status;
                    shard.version += 1;
                }
            })
            .await?;
        catalog.shards.get(id).cloned().ok_or_else(|| Error::NotFound(format!("shard {id}")))
    }

    /// Manual (operator-triggered) failover: promote a named replica,
    /// reusing the same promotion+publish mechanics as the automatic path.
    pub async fn promote_replica(&self, shard_id: &str, replica_dsn: &str) -> Result<Shard> {
        let catalog = self.catalog.current();
        let shard = catalog.shards.get(shard_id).ok_or_else(|| Error::NotFound(format!("shard {shard_id}")))?;
        let replica = shard
            .replicas
            .iter()
            .find(|r| r.dsn == replica_dsn)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("replica {replica_dsn} on shard {shard_id}")))?;

        self.backend.promote(&replica).await?;

        let writer = CatalogWriter::new(&self.catalog, self.store.as_ref());
        let shard_id_owned = shard_id.to_string();
        let old_primary = shard.primary.clone();
        let new_primary = replica.clone();
        let updated = writer
            .mutate_with_retry(3, move |c| {
                if let Some(shard) = c.shards.get_mut(&shard_id_owned) {
                    shard.replicas.retain(|r| r != &new_primary);
                    shard.replicas.push(old_primary.clone());
                    shard.primary = new_primary.clone();
                    shard.version += 1;
                }
            })
            .await?;
        self.health.reset(&shard_id.to_string());
        updated.shards.get(shard_id).cloned().ok_or_else(|| Error::NotFound(format!("shard {shard_id}")))
    }
}
