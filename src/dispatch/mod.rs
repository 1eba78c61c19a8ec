// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Query dispatch: ring lookup, target selection by consistency level,
//! pooled execution, and the retry semantics of spec.md §4.4.

use crate::backend::{QueryResult, ShardBackend};
use crate::catalog::CatalogHandle;
use crate::error::{Error, Result};
use crate::health::HealthRegistry;
use crate::types::{Consistency, Endpoint, ShardId, ShardStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub shard_key: String,
    pub query: String,
    pub params: Vec<serde_json::Value>,
    pub consistency: Consistency,
}

#[derive(Debug, Clone)]
pub struct ExecuteResponse {
    pub shard_id: ShardId,
    pub result: QueryResult,
    pub latency: Duration,
}

pub struct DispatcherSettings {
    pub request_timeout: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(30) }
    }
}

/// A callback the Router supplies to force a catalog refresh when a
/// request observes a `routing_stale` signal (spec.md §4.4).
#[async_trait::async_trait]
pub trait CatalogRefresher: Send + Sync {
    async fn refresh_now(&self) -> Result<()>;
}

pub struct Dispatcher {
    pub catalog: Arc<CatalogHandle>,
    pub backend: Arc<dyn ShardBackend>,
    pub health: Arc<HealthRegistry>,
    pub refresher: Arc<dyn CatalogRefresher>,
    pub settings: DispatcherSettings,
    round_robin: AtomicUsize,
}

impl Dispatcher {
    pub fn new(
        catalog: Arc<CatalogHandle>,
        backend: Arc<dyn ShardBackend>,
        health: Arc<HealthRegistry>,
        refresher: Arc<dyn CatalogRefresher>,
        settings: DispatcherSettings,
    ) -> Self {
        Self { catalog, backend, health, refresher, settings, round_robin: AtomicUsize::new(0) }
    }

    pub async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse> {
        match self.try_execute(&req, true).await {
            Err(Error::RoutingStale(_)) => {
                // Router refreshes its catalog snapshot and retries the
                // lookup once, per spec.md §4.4 and §7.
                self.refresher.refresh_now().await?;
                self.try_execute(&req, false).await
            }
            other => other,
        }
    }

    async fn try_execute(&self, req: &ExecuteRequest, allow_stale_retry: bool) -> Result<ExecuteResponse> {
        let start = std::time::Instant::now();
        let ring = self.catalog.ring();
        let (shard_id, _hash) = ring
            .lookup(&req.shard_key)
            .ok_or_else(|| Error::NotFound("no_shard: empty catalog".to_string()))?;
        let shard_id = shard_id.clone();

        let catalog = self.catalog.current();
        let shard = catalog
            .shards
            .get(&shard_id)
            .ok_or_else(|| Error::NotFound(format!("shard {shard_id} in ring but not in catalog")))?;

        if matches!(shard.status, ShardStatus::Inactive | ShardStatus::Readonly) && req.consistency == Consistency::Strong
        {
            // routing_stale: lookup hit a shard that's inactive/readonly
            // for this operation (a strong write/read needs a live primary).
            if allow_stale_retry {
                return Err(Error::RoutingStale(format!(
                    "shard {shard_id} is {:?}",
                    shard.status
                )));
            }
            return Err(Error::RoutingStale(format!(
                "shard {shard_id} still {:?} after refresh",
                shard.status
            )));
        }

        let target = self.select_target(&shard_id, shard, req.consistency)?;
        let result = self.execute_with_retry(&shard_id, &target, req).await?;

        Ok(ExecuteResponse { shard_id, result, latency: start.elapsed() })
    }

    fn select_target(
        &self,
        shard_id: &ShardId,
        shard: &crate::types::Shard,
        consistency: Consistency,
    ) -> Result<Endpoint> {
        match consistency {
            Consistency::Strong => Ok(shard.primary.clone()),
            Consistency::Eventual => {
                let healthy_replicas = self.health.healthy_replicas(shard_id);
                let mut candidates: Vec<Endpoint> = healthy_replicas;
                // Primary is always included to avoid starvation if no
                // replicas are known healthy (spec.md §4.4).
                candidates.push(shard.primary.clone());

                let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Ok(candidates[idx].clone())
            }
        }
    }

    async fn execute_with_retry(
        &self,
        shard_id: &ShardId,
        target: &Endpoint,
        req: &ExecuteRequest,
    ) -> Result<QueryResult> {
        match self.backend.query(target, &req.query, &req.params, self.settings.request_timeout).await {
            Ok(result) => Ok(result),
            Err(e) if is_connection_level(&e) => {
                // Connection-level failures retry at most once: against
                // the next eligible endpoint for `eventual`, or against the
                // same primary for `strong` (topology may have just changed).
                let retry_target = match req.consistency {
                    Consistency::Strong => target.clone(),
                    Consistency::Eventual => {
                        let catalog = self.catalog.current();
                        let shard = catalog
                            .shards
                            .get(shard_id)
                            .ok_or_else(|| Error::NotFound(format!("shard {shard_id} vanished")))?;
                        self.select_target(shard_id, shard, req.consistency)?
                    }
                };
                self.backend
                    .query(&retry_target, &req.query, &req.params, self.settings.request_timeout)
                    .await
            }
            Err(e) => Err(e),
        }
    }
}

fn is_connection_level(e: &Error) -> bool {
    matches!(e, Error::BackendUnavailable(_) | Error::Postgres(_) | Error::PoolExhausted(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Row;
    use crate::catalog::ShardCatalog;
    use crate::health::HealthRegistry;
    use crate::types::{Endpoint, Shard};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeBackend {
        calls: Mutex<Vec<String>>,
        fail_first: bool,
    }

    #[async_trait]
    impl ShardBackend for FakeBackend {
        async fn query(
            &self,
            endpoint: &Endpoint,
            _query: &str,
            _params: &[serde_json::Value],
            _deadline: Duration,
        ) -> Result<QueryResult> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(endpoint.dsn.clone());
            if self.fail_first && calls.len() == 1 {
                return Err(Error::BackendUnavailable("simulated".into()));
            }
            Ok(QueryResult { rows: vec![Row { columns: vec![] }], rows_affected: 1 })
        }

        async fn probe(&self, _endpoint: &Endpoint) -> Result<()> {
            Ok(())
        }

        async fn replication_lag_seconds(&self, _endpoint: &Endpoint) -> Result<f64> {
            Ok(0.0)
        }

        async fn promote(&self, _endpoint: &Endpoint) -> Result<()> {
            Ok(())
        }
    }

    struct NoopRefresher;
    #[async_trait]
    impl CatalogRefresher for NoopRefresher {
        async fn refresh_now(&self) -> Result<()> {
            Ok(())
        }
    }

    fn one_shard_catalog() -> CatalogHandle {
        let mut catalog = ShardCatalog::empty();
        catalog.version = 1;
        catalog.shards.insert(
            "a".into(),
            Shard::new("a".into(), "a", Endpoint::new("postgres://primary-a")),
        );
        catalog.vnode_counts.insert("a".into(), 8);
        CatalogHandle::new(catalog)
    }

    #[tokio::test]
    async fn strong_always_hits_primary() {
        let catalog = Arc::new(one_shard_catalog());
        let backend = Arc::new(FakeBackend { calls: Mutex::new(vec![]), fail_first: false });
        let dispatcher = Dispatcher::new(
            catalog,
            backend.clone(),
            Arc::new(HealthRegistry::new()),
            Arc::new(NoopRefresher),
            DispatcherSettings::default(),
        );

        let resp = dispatcher
            .execute(ExecuteRequest {
                shard_key: "user-1".into(),
                query: "select 1".into(),
                params: vec![],
                consistency: Consistency::Strong,
            })
            .await
            .unwrap();
        assert_eq!(resp.shard_id, "a");
        assert_eq!(backend.calls.lock().unwrap()[0], "postgres://primary-a");
    }

    #[tokio::test]
    async fn connection_failure_retries_once_then_succeeds() {
        let catalog = Arc::new(one_shard_catalog());
        let backend = Arc::new(FakeBackend { calls: Mutex::new(vec![]), fail_first: true });
        let dispatcher = Dispatcher::new(
            catalog,
            backend.clone(),
            Arc::new(HealthRegistry::new()),
            Arc::new(NoopRefresher),
            DispatcherSettings::default(),
        );

        let resp = dispatcher
            .execute(ExecuteRequest {
                shard_key: "user-1".into(),
                query: "select 1".into(),
                params: vec![],
                consistency: Consistency::Strong,
            })
            .await
            .unwrap();
        assert_eq!(resp.shard_id, "a");
        assert_eq!(backend.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_catalog_returns_not_found() {
        let catalog = Arc::new(CatalogHandle::new(ShardCatalog::empty()));
        let backend = Arc::new(FakeBackend { calls: Mutex::new(vec![]), fail_first: false });
        let dispatcher = Dispatcher::new(
            catalog,
            backend,
            Arc::new(HealthRegistry::new()),
            Arc::new(NoopRefresher),
            DispatcherSettings::default(),
        );

        let err = dispatcher
            .execute(ExecuteRequest {
                shard_key: "user-1".into(),
                query: "select 1".into(),
                params: vec![],
                consistency: Consistency::Strong,
            })
            .await;
        assert!(matches!(err, Err(Error::NotFound(_))));
    }
}
