// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Manager admin API: shard CRUD, manual promotion, reshard submission and
//! status, and failover controls (spec.md §6).

use super::Manager;
use crate::error::{Error, Result};
use crate::reshard::ReshardPlan;
use crate::types::{Endpoint, ReshardKind, Shard, ShardStatus};
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub fn router(manager: Arc<Manager>) -> Router {
    Router::new()
        .route("/shards", post(create_shard).get(list_shards))
        .route("/shards/:id", get(get_shard).delete(delete_shard))
        .route("/shards/:id/status", put(set_shard_status))
        .route("/shards/:id/promote", post(promote))
        .route("/reshard/split", post(reshard_split))
        .route("/reshard/merge", post(reshard_merge))
        .route("/reshard/jobs/:id", get(reshard_job_status))
        .route("/failover/status", get(failover_status))
        .route("/failover/enable", post(failover_enable))
        .route("/failover/disable", post(failover_disable))
        .route("/failover/history", get(failover_history))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(manager)
}

#[derive(Debug, Deserialize)]
struct CreateShardRequest {
    name: String,
    primary_endpoint: String,
    #[serde(default)]
    replicas: Vec<String>,
    #[serde(default)]
    vnode_count: Option<u32>,
}

async fn create_shard(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<CreateShardRequest>,
) -> Result<Json<Shard>> {
    let vnode_count = req.vnode_count.unwrap_or(manager.settings.vnode_count_default);
    let shard = manager
        .create_shard(
            req.name,
            Endpoint::new(req.primary_endpoint),
            req.replicas.into_iter().map(Endpoint::new).collect(),
            vnode_count,
        )
        .await?;
    info!(shard = %shard.id, "shard created");
    Ok(Json(shard))
}

async fn list_shards(State(manager): State<Arc<Manager>>) -> Json<Vec<Shard>> {
    Json(manager.list_shards())
}

async fn get_shard(State(manager): State<Arc<Manager>>, Path(id): Path<String>) -> Result<Json<Shard>> {
    manager.get_shard(&id).map(Json).ok_or_else(|| Error::NotFound(format!("shard {id}")))
}

async fn delete_shard(State(manager): State<Arc<Manager>>, Path(id): Path<String>) -> Result<Json<serde_json::Value>> {
    manager.delete_shard(&id).await?;
    Ok(Json(serde_json::json!({"deleted": id})))
}

#[derive(Debug, Deserialize)]
struct SetStatusRequest {
    status: ShardStatus,
}

async fn set_shard_status(
    State(manager): State<Arc<Manager>>,
    Path(id): Path<String>,
    Json(req): Json<SetStatusRequest>,
) -> Result<Json<Shard>> {
    Ok(Json(manager.set_shard_status(&id, req.status).await?))
}

#[derive(Debug, Deserialize)]
struct PromoteRequest {
    replica_endpoint: String,
}

async fn promote(
    State(manager): State<Arc<Manager>>,
    Path(id): Path<String>,
    Json(req): Json<PromoteRequest>,
) -> Result<Json<Shard>> {
    Ok(Json(manager.promote_replica(&id, &req.replica_endpoint).await?))
}

#[derive(Debug, Deserialize)]
struct ReshardRequest {
    sources: Vec<String>,
    target: String,
    vnode_delta: u32,
    table: String,
    primary_key_column: String,
    shard_key_column: String,
}

#[derive(Debug, Serialize)]
struct ReshardJobAccepted {
    job_id: uuid::Uuid,
}

async fn reshard_split(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<ReshardRequest>,
) -> Result<Json<ReshardJobAccepted>> {
    submit_reshard(manager, ReshardKind::Split, req).await
}

async fn reshard_merge(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<ReshardRequest>,
) -> Result<Json<ReshardJobAccepted>> {
    submit_reshard(manager, ReshardKind::Merge, req).await
}

async fn submit_reshard(manager: Arc<Manager>, kind: ReshardKind, req: ReshardRequest) -> Result<Json<ReshardJobAccepted>> {
    let job_id = manager.reshard.submit(ReshardPlan {
        kind,
        sources: req.sources,
        target: req.target,
        vnode_delta: req.vnode_delta,
        table: req.table,
        primary_key_column: req.primary_key_column,
        shard_key_column: req.shard_key_column,
    })?;

    let engine = manager.reshard.clone();
    tokio::spawn(async move {
        engine.drive(job_id).await;
    });

    Ok(Json(ReshardJobAccepted { job_id }))
}

async fn reshard_job_status(
    State(manager): State<Arc<Manager>>,
    Path(id): Path<uuid::Uuid>,
) -> Result<Json<crate::reshard::ReshardJob>> {
    manager.reshard.registry.get(id).map(Json).ok_or_else(|| Error::NotFound(format!("job {id}")))
}

#[derive(Debug, Serialize)]
struct FailoverStatusResponse {
    enabled: bool,
}

async fn failover_status(State(manager): State<Arc<Manager>>) -> Json<FailoverStatusResponse> {
    Json(FailoverStatusResponse { enabled: manager.failover.is_enabled() })
}

async fn failover_enable(State(manager): State<Arc<Manager>>) -> Json<FailoverStatusResponse> {
    manager.failover.set_enabled(true);
    Json(FailoverStatusResponse { enabled: true })
}

async fn failover_disable(State(manager): State<Arc<Manager>>) -> Json<FailoverStatusResponse> {
    manager.failover.set_enabled(false);
    Json(FailoverStatusResponse { enabled: false })
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn failover_history(
    State(manager): State<Arc<Manager>>,
    Query(page): Query<PageQuery>,
) -> Json<Vec<crate::failover::FailoverEvent>> {
    Json(manager.failover.history(page.offset, page.limit))
}

async fn health(State(_manager): State<Arc<Manager>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn metrics(State(manager): State<Arc<Manager>>) -> String {
    manager.metrics.render()
}
