// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Failover controller: detects primary unavailability and promotes a
//! healthy replica atomically and reversibly (spec.md §4.3, invariant I6).

use crate::backend::ShardBackend;
use crate::catalog::CatalogHandle;
use crate::error::Result;
use crate::health::HealthRegistry;
use crate::metadata::MetadataStore;
use crate::types::{Endpoint, FailoverId, FailoverStatus, ShardId, ShardStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const STABILIZATION_DELAY: Duration = Duration::from_secs(2);
/// Bounded in-memory history; oldest events are dropped past this length
/// (spec.md §11 — paging over an unbounded log isn't useful operationally).
const MAX_HISTORY: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub id: FailoverId,
    pub shard_id: ShardId,
    pub old_primary: Endpoint,
    pub new_primary: Endpoint,
    pub reason: String,
    pub status: FailoverStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Append-only (bounded) history of failover events, plus the
/// enable/disable switch for automatic failover.
pub struct FailoverRegistry {
    history: RwLock<VecDeque<FailoverEvent>>,
    enabled: std::sync::atomic::AtomicBool,
}

impl FailoverRegistry {
    pub fn new() -> Self {
        Self {
            history: RwLock::new(VecDeque::new()),
            enabled: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    fn append(&self, event: FailoverEvent) {
        let mut history = self.history.write();
        history.push_back(event);
        while history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }

    fn update(&self, id: FailoverId, f: impl FnOnce(&mut FailoverEvent)) {
        let mut history = self.history.write();
        if let Some(event) = history.iter_mut().find(|e| e.id == id) {
            f(event);
        }
    }

    pub fn history(&self, offset: usize, limit: usize) -> Vec<FailoverEvent> {
        self.history.read().iter().skip(offset).take(limit).cloned().collect()
    }

    pub fn for_shard(&self, shard_id: &ShardId) -> Vec<FailoverEvent> {
        self.history.read().iter().filter(|e| &e.shard_id == shard_id).cloned().collect()
    }
}

impl Default for FailoverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FailoverController {
    catalog: Arc<CatalogHandle>,
    store: Arc<dyn MetadataStore>,
    backend: Arc<dyn ShardBackend>,
    health: Arc<HealthRegistry>,
    registry: Arc<FailoverRegistry>,
    poll_interval: Duration,
}

impl FailoverController {
    pub fn new(
        catalog: Arc<CatalogHandle>,
        store: Arc<dyn MetadataStore>,
        backend: Arc<dyn ShardBackend>,
        health: Arc<HealthRegistry>,
        registry: Arc<FailoverRegistry>,
        poll_interval: Duration,
    ) -> Self {
        Self { catalog, store, backend, health, registry, poll_interval }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("failover controller shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.evaluate_once().await {
                        tracing::error!(error = %e, "failover evaluation pass failed");
                    }
                }
            }
        }
    }

    /// Scan every shard for `primary_down`, and drive one failover at a
    /// time to completion when automatic failover is enabled.
    pub async fn evaluate_once(&self) -> Result<()> {
        if !self.registry.is_enabled() {
            return Ok(());
        }

        let catalog = self.catalog.current();
        for shard in catalog.shards.values() {
            if shard.status == ShardStatus::Inactive {
                continue;
            }
            if !self.health.is_primary_down(&shard.id) {
                continue;
            }
            let replicas_up = self.health.healthy_replicas(&shard.id);
            if replicas_up.is_empty() {
                continue;
            }
            self.fail_over(&shard.id, &shard.primary, &replicas_up).await?;
        }
        Ok(())
    }

    async fn fail_over(&self, shard_id: &ShardId, old_primary: &Endpoint, candidates: &[Endpoint]) -> Result<()> {
        let new_primary = select_promotion_target(candidates, |e| {
            // Lag isn't attached to `candidates` itself, so pull it from the
            // registry's last snapshot (spec.md §4.3 step 1: lowest lag,
            // tie-break lexicographic).
            self.health
                .snapshot(shard_id)
                .and_then(|s| s.replication_lag_seconds.get(&e.dsn).copied())
                .unwrap_or(f64::MAX)
        });

        let event_id = Uuid::new_v4();
        let event = FailoverEvent {
            id: event_id,
            shard_id: shard_id.clone(),
            old_primary: old_primary.clone(),
            new_primary: new_primary.clone(),
            reason: "primary_down".to_string(),
            status: FailoverStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        };
        self.registry.append(event);
        tracing::warn!(shard = %shard_id, old = %old_primary, new = %new_primary, "initiating failover");

        if let Err(e) = self.backend.promote(&new_primary).await {
            self.finish(event_id, FailoverStatus::Failed, Some(e.to_string()));
            self.deactivate_shard(shard_id).await;
            return Ok(());
        }

        let writer = crate::catalog::CatalogWriter::new(&self.catalog, self.store.as_ref());
        let old_primary_for_closure = old_primary.clone();
        let new_primary_for_closure = new_primary.clone();
        let shard_id_for_closure = shard_id.clone();
        let publish = writer
            .mutate_with_retry(3, move |c| {
                if let Some(shard) = c.shards.get_mut(&shard_id_for_closure) {
                    shard.replicas.retain(|r| r != &new_primary_for_closure);
                    shard.replicas.push(old_primary_for_closure.clone());
                    shard.primary = new_primary_for_closure.clone();
                    shard.version += 1;
                }
            })
            .await;

        if let Err(e) = publish {
            self.finish(event_id, FailoverStatus::Failed, Some(e.to_string()));
            self.deactivate_shard(shard_id).await;
            return Ok(());
        }

        tokio::time::sleep(STABILIZATION_DELAY).await;
        let verified = self.backend.probe(&new_primary).await.is_ok()
            && self.catalog.current().shards.get(shard_id).map(|s| s.primary == new_primary).unwrap_or(false);

        if verified {
            self.health.reset(shard_id);
            self.finish(event_id, FailoverStatus::Success, None);
            return Ok(());
        }

        // Rollback: promote the old primary back and restore the catalog.
        tracing::warn!(shard = %shard_id, "failover verification failed, rolling back");
        let rollback_promote = self.backend.promote(old_primary).await;
        let old_primary_rb = old_primary.clone();
        let new_primary_rb = new_primary.clone();
        let shard_id_rb = shard_id.clone();
        let rollback_publish = writer
            .mutate_with_retry(3, move |c| {
                if let Some(shard) = c.shards.get_mut(&shard_id_rb) {
                    shard.replicas.retain(|r| r != &old_primary_rb);
                    shard.replicas.push(new_primary_rb.clone());
                    shard.primary = old_primary_rb.clone();
                    shard.version += 1;
                }
            })
            .await;

        match (rollback_promote, rollback_publish) {
            (Ok(()), Ok(_)) => {
                self.finish(event_id, FailoverStatus::RolledBack, None);
            }
            (promote_res, publish_res) => {
                let err = promote_res
                    .err()
                    .map(|e| e.to_string())
                    .or_else(|| publish_res.err().map(|e| e.to_string()))
                    .unwrap_or_else(|| "rollback failed".to_string());
                self.finish(event_id, FailoverStatus::Failed, Some(err));
                self.deactivate_shard(shard_id).await;
            }
        }
        Ok(())
    }

    fn finish(&self, id: FailoverId, status: FailoverStatus, error: Option<String>) {
        self.registry.update(id, |event| {
            event.status = status;
            event.completed_at = Some(Utc::now());
            event.error = error;
        });
    }

    /// Both promotion and rollback failed: the shard stops accepting
    /// traffic until an operator intervenes (spec.md §4.3 fatal path).
    async fn deactivate_shard(&self, shard_id: &ShardId) {
        let writer = crate::catalog::CatalogWriter::new(&self.catalog, self.store.as_ref());
        let shard_id = shard_id.clone();
        let _ = writer
            .mutate_with_retry(3, move |c| {
                if let Some(shard) = c.shards.get_mut(&shard_id) {
                    shard.status = ShardStatus::Inactive;
                    shard.version += 1;
                }
                c.vnode_counts.insert(shard_id.clone(), 0);
            })
            .await;
    }
}

fn select_promotion_target(candidates: &[Endpoint], lag_of: impl Fn(&Endpoint) -> f64) -> Endpoint {
    candidates
        .iter()
        .min_by(|a, b| {
            lag_of(a)
                .partial_cmp(&lag_of(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.dsn.cmp(&b.dsn))
        })
        .cloned()
        .expect("candidates is non-empty")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_picks_lowest_lag_tie_break_lexicographic() {
        let candidates = vec![Endpoint::new("postgres://r2"), Endpoint::new("postgres://r1")];
        let lag = |e: &Endpoint| if e.dsn == "postgres://r1" { 1.0 } else { 1.0 };
        let chosen = select_promotion_target(&candidates, lag);
        assert_eq!(chosen.dsn, "postgres://r1");

        let lag2 = |e: &Endpoint| if e.dsn == "postgres://r2" { 0.1 } else { 5.0 };
        let chosen2 = select_promotion_target(&candidates, lag2);
        assert_eq!(chosen2.dsn, "postgres://r2");
    }

    #[test]
    fn history_is_bounded() {
        let registry = FailoverRegistry::new();
        for i in 0..(MAX_HISTORY + 10) {
            registry.append(FailoverEvent {
                id: Uuid::new_v4(),
                shard_id: format!("shard-{i}"),
                old_primary: Endpoint::new("postgres://old"),
                new_primary: Endpoint::new("postgres://new"),
                reason: "test".into(),
                status: FailoverStatus::Success,
                started_at: Utc::now(),
                completed_at: None,
                error: None,
            });
        }
        assert_eq!(registry.history(0, MAX_HISTORY + 10).len(), MAX_HISTORY);
    }
}
