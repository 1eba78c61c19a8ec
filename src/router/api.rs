// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Client-facing Router API: `POST /execute`, `GET /shard-for-key`,
//! `GET /health`, `GET /metrics` (spec.md §6).

use super::RouterNode;
use crate::dispatch::ExecuteRequest;
use crate::error::{Error, Result};
use crate::types::Consistency;
use axum::{
    extract::{Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn router(node: Arc<RouterNode>) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/shard-for-key", get(shard_for_key))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(node)
}

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    shard_key: String,
    query: String,
    #[serde(default)]
    params: Vec<serde_json::Value>,
    #[serde(default)]
    consistency: Consistency,
}

#[derive(Debug, Serialize)]
struct ExecuteResponseBody {
    shard_id: String,
    rows: Vec<serde_json::Value>,
    row_count: u64,
    latency_ms: u128,
}

async fn execute(State(node): State<Arc<RouterNode>>, Json(body): Json<ExecuteBody>) -> Result<Json<ExecuteResponseBody>> {
    let consistency = body.consistency;
    let response = node
        .dispatcher
        .execute(ExecuteRequest {
            shard_key: body.shard_key,
            query: body.query,
            params: body.params,
            consistency,
        })
        .await;

    match &response {
        Ok(_) => node.metrics.requests_total.with_label_values(&[consistency_label(consistency), "ok"]).inc(),
        Err(e) => node.metrics.dispatch_errors_total.with_label_values(&[e.code()]).inc(),
    }

    let resp = response?;
    let rows = resp
        .result
        .rows
        .into_iter()
        .map(|row| serde_json::Value::Object(row.columns.into_iter().collect()))
        .collect();

    Ok(Json(ExecuteResponseBody {
        shard_id: resp.shard_id,
        rows,
        row_count: resp.result.rows_affected,
        latency_ms: resp.latency.as_millis(),
    }))
}

fn consistency_label(c: Consistency) -> &'static str {
    match c {
        Consistency::Strong => "strong",
        Consistency::Eventual => "eventual",
    }
}

#[derive(Debug, Deserialize)]
struct ShardForKeyQuery {
    key: String,
}

#[derive(Debug, Serialize)]
struct ShardForKeyResponse {
    shard_id: Option<String>,
    hash_value: u64,
}

async fn shard_for_key(
    State(node): State<Arc<RouterNode>>,
    Query(q): Query<ShardForKeyQuery>,
) -> Result<Json<ShardForKeyResponse>> {
    let ring = node.catalog.ring();
    match ring.lookup(&q.key) {
        Some((shard_id, hash)) => Ok(Json(ShardForKeyResponse { shard_id: Some(shard_id.clone()), hash_value: hash })),
        None => Err(Error::NotFound("catalog has no shards".to_string())),
    }
}

async fn health(State(node): State<Arc<RouterNode>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "catalog_version": node.catalog.version()}))
}

async fn metrics(State(node): State<Arc<RouterNode>>) -> String {
    node.metrics.render()
}
