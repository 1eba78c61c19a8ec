// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! `tokio-postgres`-backed [`ShardBackend`]. Connections are borrowed from
//! the caller's [`crate::pool::PoolRegistry`] rather than owned here — this
//! type is stateless and only knows how to talk wire protocol once handed
//! a live client.

use super::{QueryResult, Row, ShardBackend};
use crate::error::{Error, Result};
use crate::pool::PoolRegistry;
use crate::types::Endpoint;
use async_trait::async_trait;
use serde_json::Value as Json;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{ToSql, Type};

pub struct PostgresBackend {
    pools: Arc<PoolRegistry>,
}

impl PostgresBackend {
    pub fn new(pools: Arc<PoolRegistry>) -> Self {
        Self { pools }
    }
}

/// Adapts a loosely-typed JSON parameter to `tokio_postgres`'s `ToSql`.
/// Positional parameters from the wire API arrive as JSON (spec.md §6);
/// this covers the common scalar cases without pulling in a SQL parser.
fn to_sql_param(value: &Json) -> Box<dyn ToSql + Sync + '_> {
    match value {
        Json::Null => Box::new(None::<String>),
        Json::Bool(b) => Box::new(*b),
        Json::Number(n) if n.is_i64() => Box::new(n.as_i64().unwrap()),
        Json::Number(n) if n.is_f64() => Box::new(n.as_f64().unwrap()),
        Json::Number(n) => Box::new(n.to_string()),
        Json::String(s) => Box::new(s.clone()),
        other => Box::new(other.to_string()),
    }
}

fn row_to_json_columns(row: &tokio_postgres::Row) -> Vec<(String, Json)> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let value = match *col.type_() {
                Type::INT4 => row.get::<_, Option<i32>>(i).map(Json::from).unwrap_or(Json::Null),
                Type::INT8 => row.get::<_, Option<i64>>(i).map(Json::from).unwrap_or(Json::Null),
                Type::FLOAT8 => row.get::<_, Option<f64>>(i).map(Json::from).unwrap_or(Json::Null),
                Type::BOOL => row.get::<_, Option<bool>>(i).map(Json::from).unwrap_or(Json::Null),
                _ => row
                    .get::<_, Option<String>>(i)
                    .map(Json::from)
                    .unwrap_or(Json::Null),
            };
            (col.name().to_string(), value)
        })
        .collect()
}

#[async_trait]
impl ShardBackend for PostgresBackend {
    async fn query(
        &self,
        endpoint: &Endpoint,
        query: &str,
        params: &[Json],
        deadline: Duration,
    ) -> Result<QueryResult> {
        let conn = self.pools.acquire(endpoint).await?;
        let boxed: Vec<Box<dyn ToSql + Sync + '_>> = params.iter().map(to_sql_param).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(|b| b.as_ref()).collect();

        let fut = conn.query(query, &refs);
        let rows = tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| Error::Timeout(format!("query on {endpoint} exceeded {deadline:?}")))?
            .map_err(Error::Postgres)?;

        let rows = rows
            .iter()
            .map(|r| Row { columns: row_to_json_columns(r) })
            .collect::<Vec<_>>();
        let rows_affected = rows.len() as u64;

        Ok(QueryResult { rows, rows_affected })
    }

    async fn probe(&self, endpoint: &Endpoint) -> Result<()> {
        let conn = self.pools.acquire(endpoint).await?;
        let fut = conn.query_one("SELECT 1", &[]);
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .map_err(|_| Error::Timeout(format!("probe of {endpoint} timed out")))?
            .map_err(Error::Postgres)?;
        Ok(())
    }

    async fn replication_lag_seconds(&self, endpoint: &Endpoint) -> Result<f64> {
        let conn = self.pools.acquire(endpoint).await?;
        // Standard PostgreSQL replica-side lag query.
        let row = conn
            .query_opt(
                "SELECT EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp()))::float8 AS lag",
                &[],
            )
            .await
            .map_err(Error::Postgres)?;

        match row {
            Some(row) => Ok(row.get::<_, Option<f64>>("lag").unwrap_or(0.0)),
            // No replication in progress (e.g. not a replica) -> no lag.
            None => Ok(0.0),
        }
    }

    async fn promote(&self, endpoint: &Endpoint) -> Result<()> {
        let conn = self.pools.acquire(endpoint).await?;
        conn.execute("SELECT pg_promote()", &[])
            .await
            .map_err(Error::Postgres)?;
        Ok(())
    }
}
