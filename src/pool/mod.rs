// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Per-endpoint connection pool registry (spec.md §4.4).
//!
//! One `deadpool_postgres::Pool` per endpoint, sized by `(min_idle,
//! max_size)`, created lazily on first use and evicted after an endpoint
//! has been absent from the catalog for longer than `grace_period`.

use crate::error::{Error, Result};
use crate::types::Endpoint;
use dashmap::DashMap;
use deadpool_postgres::{ManagerConfig, Pool, RecyclingMethod};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_postgres::NoTls;

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub min_idle: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub grace_period: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_idle: 2,
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(60),
        }
    }
}

struct Entry {
    pool: Pool,
    last_seen: Instant,
}

/// Registry of pools, one per endpoint. Internally synchronized via
/// `DashMap`; acquisition blocks up to `acquire_timeout` then fails with
/// `pool_exhausted`, per spec.md §5.
pub struct PoolRegistry {
    pools: DashMap<String, Entry>,
    settings: PoolSettings,
}

impl PoolRegistry {
    pub fn new(settings: PoolSettings) -> Self {
        Self { pools: DashMap::new(), settings }
    }

    fn build_pool(&self, endpoint: &Endpoint) -> Result<Pool> {
        let pg_config = tokio_postgres::Config::from_str(&endpoint.dsn)
            .map_err(|e| Error::BadRequest(format!("invalid DSN: {e}")))?;

        let mgr = deadpool_postgres::Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );
        let pool = Pool::builder(mgr)
            .max_size(self.settings.max_size)
            .build()?;
        Ok(pool)
    }

    /// Lazily create (or reuse) the pool for `endpoint`, marking it seen.
    pub fn get_or_create(&self, endpoint: &Endpoint) -> Result<Pool> {
        if let Some(mut entry) = self.pools.get_mut(&endpoint.dsn) {
            entry.last_seen = Instant::now();
            return Ok(entry.pool.clone());
        }

        let pool = self.build_pool(endpoint)?;
        self.pools.insert(
            endpoint.dsn.clone(),
            Entry { pool: pool.clone(), last_seen: Instant::now() },
        );
        self.prewarm(pool.clone());
        Ok(pool)
    }

    /// Best-effort: open `min_idle` connections up front so the first real
    /// request doesn't pay the full connect cost. Failures are logged and
    /// otherwise ignored — the pool still works, just starts cold.
    fn prewarm(&self, pool: Pool) {
        let min_idle = self.settings.min_idle;
        tokio::spawn(async move {
            let mut held = Vec::with_capacity(min_idle);
            for _ in 0..min_idle {
                match pool.get().await {
                    Ok(conn) => held.push(conn),
                    Err(e) => {
                        tracing::debug!(error = %e, "pool prewarm connection failed");
                        break;
                    }
                }
            }
            // Dropping `held` returns the connections to the idle pool.
        });
    }

    /// Acquire a connection with the registry's configured timeout.
    pub async fn acquire(
        &self,
        endpoint: &Endpoint,
    ) -> Result<deadpool_postgres::Object> {
        let pool = self.get_or_create(endpoint)?;
        match tokio::time::timeout(self.settings.acquire_timeout, pool.get()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(Error::PoolExhausted(format!("{endpoint}: {e}"))),
            Err(_) => Err(Error::PoolExhausted(format!(
                "{endpoint}: acquire timed out after {:?}",
                self.settings.acquire_timeout
            ))),
        }
    }

    /// Drop pools for endpoints not present in `live_endpoints` for longer
    /// than `grace_period` — called periodically by the Router's catalog
    /// subscriber task.
    pub fn evict_stale(&self, live_endpoints: &[Endpoint]) {
        let live: std::collections::HashSet<&str> =
            live_endpoints.iter().map(|e| e.dsn.as_str()).collect();
        let grace = self.settings.grace_period;
        self.pools.retain(|dsn, entry| {
            live.contains(dsn.as_str()) || entry.last_seen.elapsed() < grace
        });
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

pub type SharedPoolRegistry = Arc<PoolRegistry>;
