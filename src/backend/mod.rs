// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Shard backend capability: the narrow interface the dispatcher, health
//! controller, and resharding engine use to talk to a PostgreSQL-compatible
//! endpoint, per spec.md §9 ("dynamic dispatch limited to two
//! capabilities"). `PostgresBackend` is the sole production implementation;
//! tests use an in-memory fake.

pub mod postgres;

use crate::error::Result;
use crate::types::Endpoint;
use async_trait::async_trait;
use std::time::Duration;

/// One row returned by [`ShardBackend::query`], column-name keyed.
#[derive(Debug, Clone)]
pub struct Row {
    pub columns: Vec<(String, serde_json::Value)>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

/// Narrow capability contract for a single backend endpoint.
#[async_trait]
pub trait ShardBackend: Send + Sync {
    /// Execute `query` with positional `params` against `endpoint`, bounded
    /// by `deadline`.
    async fn query(
        &self,
        endpoint: &Endpoint,
        query: &str,
        params: &[serde_json::Value],
        deadline: Duration,
    ) -> Result<QueryResult>;

    /// Lightweight liveness probe (`SELECT 1`), used by the health loop.
    async fn probe(&self, endpoint: &Endpoint) -> Result<()>;

    /// Replication lag of `endpoint` (a replica) behind its primary, in
    /// seconds, via the backend's replication-status view.
    async fn replication_lag_seconds(&self, endpoint: &Endpoint) -> Result<f64>;

    /// Promote `endpoint` (a replica) to primary.
    async fn promote(&self, endpoint: &Endpoint) -> Result<()>;
}
