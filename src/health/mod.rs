// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Health loop: continuous probing of every shard's primary and replicas,
//! and the consecutive-failure counting that feeds the failover
//! controller's `primary_down` decision (spec.md §4.3).

use crate::backend::ShardBackend;
use crate::catalog::CatalogHandle;
use crate::types::{Endpoint, ShardId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    pub check_interval: Duration,
    pub fail_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self { check_interval: Duration::from_secs(10), fail_threshold: 3 }
    }
}

/// Latest known health of one shard, refreshed continuously. Only the
/// latest snapshot is kept — spec.md §4.3 ("latest snapshot is the only
/// durable state").
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub shard_id: ShardId,
    pub primary_up: bool,
    pub replicas_up: Vec<Endpoint>,
    pub replicas_down: Vec<Endpoint>,
    pub replication_lag_seconds: std::collections::HashMap<String, f64>,
    pub last_check: chrono::DateTime<chrono::Utc>,
}

impl HealthSnapshot {
    fn empty(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            primary_up: true,
            replicas_up: Vec::new(),
            replicas_down: Vec::new(),
            replication_lag_seconds: std::collections::HashMap::new(),
            last_check: chrono::Utc::now(),
        }
    }
}

struct ShardHealthState {
    consecutive_primary_failures: AtomicU32,
    snapshot: parking_lot::RwLock<HealthSnapshot>,
}

/// Shared, queryable view of the latest [`HealthSnapshot`] per shard.
/// The dispatcher reads `healthy_replicas` to pick an `eventual` target;
/// the failover controller reads `is_primary_down` to decide whether to act.
pub struct HealthRegistry {
    states: DashMap<ShardId, Arc<ShardHealthState>>,
    fail_threshold: u32,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::with_fail_threshold(3)
    }

    pub fn with_fail_threshold(fail_threshold: u32) -> Self {
        Self { states: DashMap::new(), fail_threshold }
    }

    fn state_for(&self, shard_id: &ShardId) -> Arc<ShardHealthState> {
        self.states
            .entry(shard_id.clone())
            .or_insert_with(|| {
                Arc::new(ShardHealthState {
                    consecutive_primary_failures: AtomicU32::new(0),
                    snapshot: parking_lot::RwLock::new(HealthSnapshot::empty(shard_id.clone())),
                })
            })
            .clone()
    }

    pub fn snapshot(&self, shard_id: &ShardId) -> Option<HealthSnapshot> {
        self.states.get(shard_id).map(|s| s.snapshot.read().clone())
    }

    pub fn healthy_replicas(&self, shard_id: &ShardId) -> Vec<Endpoint> {
        self.states
            .get(shard_id)
            .map(|s| s.snapshot.read().replicas_up.clone())
            .unwrap_or_default()
    }

    /// K consecutive failed primary probes (default K=3, spec.md §4.3).
    pub fn is_primary_down(&self, shard_id: &ShardId) -> bool {
        self.states
            .get(shard_id)
            .map(|s| s.consecutive_primary_failures.load(Ordering::Relaxed) >= self.fail_threshold)
            .unwrap_or(false)
    }

    fn record_primary(&self, shard_id: &ShardId, up: bool) {
        let state = self.state_for(shard_id);
        if up {
            state.consecutive_primary_failures.store(0, Ordering::Relaxed);
        } else {
            state.consecutive_primary_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reset failure counters, e.g. right after a successful failover swaps
    /// in a new primary.
    pub fn reset(&self, shard_id: &ShardId) {
        if let Some(state) = self.states.get(shard_id) {
            state.consecutive_primary_failures.store(0, Ordering::Relaxed);
        }
    }

    fn install_snapshot(&self, snapshot: HealthSnapshot) {
        let state = self.state_for(&snapshot.shard_id);
        *state.snapshot.write() = snapshot;
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives the health loop: every `check_interval`, probes every shard's
/// primary and replicas and measures replication lag.
pub struct HealthController {
    catalog: Arc<CatalogHandle>,
    backend: Arc<dyn ShardBackend>,
    registry: Arc<HealthRegistry>,
    check_interval: Duration,
}

impl HealthController {
    pub fn new(
        catalog: Arc<CatalogHandle>,
        backend: Arc<dyn ShardBackend>,
        registry: Arc<HealthRegistry>,
        check_interval: Duration,
    ) -> Self {
        Self { catalog, backend, registry, check_interval }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("health controller shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
    }

    pub async fn check_once(&self) {
        let catalog = self.catalog.current();
        for shard in catalog.shards.values() {
            let primary_up = self.backend.probe(&shard.primary).await.is_ok();
            self.registry.record_primary(&shard.id, primary_up);

            let mut replicas_up = Vec::new();
            let mut replicas_down = Vec::new();
            let mut lag = std::collections::HashMap::new();
            for replica in &shard.replicas {
                if self.backend.probe(replica).await.is_ok() {
                    let seconds = self.backend.replication_lag_seconds(replica).await.unwrap_or(f64::MAX);
                    lag.insert(replica.dsn.clone(), seconds);
                    replicas_up.push(replica.clone());
                } else {
                    replicas_down.push(replica.clone());
                }
            }

            self.registry.install_snapshot(HealthSnapshot {
                shard_id: shard.id.clone(),
                primary_up,
                replicas_up,
                replicas_down,
                replication_lag_seconds: lag,
                last_check: chrono::Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ShardCatalog;
    use crate::types::Shard;
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct FakeBackend {
        down: HashSet<String>,
    }

    #[async_trait]
    impl ShardBackend for FakeBackend {
        async fn query(
            &self,
            _endpoint: &Endpoint,
            _query: &str,
            _params: &[serde_json::Value],
            _deadline: Duration,
        ) -> crate::error::Result<crate::backend::QueryResult> {
            unimplemented!()
        }

        async fn probe(&self, endpoint: &Endpoint) -> crate::error::Result<()> {
            if self.down.contains(&endpoint.dsn) {
                Err(crate::error::Error::BackendUnavailable(endpoint.dsn.clone()))
            } else {
                Ok(())
            }
        }

        async fn replication_lag_seconds(&self, endpoint: &Endpoint) -> crate::error::Result<f64> {
            Ok(if endpoint.dsn.contains("r2") { 5.0 } else { 0.0 })
        }

        async fn promote(&self, _endpoint: &Endpoint) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn shard_with_replicas() -> ShardCatalog {
        let mut catalog = ShardCatalog::empty();
        let mut shard = Shard::new("a".into(), "a", Endpoint::new("postgres://primary"));
        shard.replicas = vec![Endpoint::new("postgres://r1"), Endpoint::new("postgres://r2")];
        catalog.shards.insert("a".into(), shard);
        catalog.vnode_counts.insert("a".into(), 8);
        catalog
    }

    #[tokio::test]
    async fn primary_down_after_k_consecutive_failures() {
        let catalog = Arc::new(CatalogHandle::new(shard_with_replicas()));
        let backend = Arc::new(FakeBackend { down: ["postgres://primary".to_string()].into() });
        let registry = Arc::new(HealthRegistry::with_fail_threshold(3));
        let controller = HealthController::new(catalog, backend, registry.clone(), Duration::from_secs(10));

        for i in 0..3 {
            controller.check_once().await;
            if i < 2 {
                assert!(!registry.is_primary_down(&"a".to_string()));
            }
        }
        assert!(registry.is_primary_down(&"a".to_string()));
    }

    #[tokio::test]
    async fn replicas_partition_into_up_and_down() {
        let catalog = Arc::new(CatalogHandle::new(shard_with_replicas()));
        let backend = Arc::new(FakeBackend { down: ["postgres://r1".to_string()].into() });
        let registry = Arc::new(HealthRegistry::new());
        let controller = HealthController::new(catalog, backend, registry.clone(), Duration::from_secs(10));

        controller.check_once().await;
        let snapshot = registry.snapshot(&"a".to_string()).unwrap();
        assert_eq!(snapshot.replicas_down.len(), 1);
        assert_eq!(snapshot.replicas_up.len(), 1);
        assert_eq!(snapshot.replicas_up[0].dsn, "postgres://r2");
    }
}
