// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Router: holds a cached [`CatalogHandle`], subscribes to catalog changes,
//! and exposes the client-facing dispatch API (spec.md §4.4, §6).

pub mod api;

use crate::catalog::CatalogHandle;
use crate::dispatch::{CatalogRefresher, Dispatcher};
use crate::error::Result;
use crate::metadata::{MetadataStore, TypedStore};
use crate::observability::Metrics;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Forces an immediate poll of the Manager's published catalog, used both
/// by the periodic refresh task and by the dispatcher's stale-routing
/// retry path.
pub struct CatalogPoller {
    store: Arc<dyn MetadataStore>,
    catalog: Arc<CatalogHandle>,
}

impl CatalogPoller {
    pub fn new(store: Arc<dyn MetadataStore>, catalog: Arc<CatalogHandle>) -> Self {
        Self { store, catalog }
    }

    async fn poll_once(&self) -> Result<()> {
        let typed = TypedStore::new(self.store.as_ref());
        if let Some((catalog, _version)) =
            typed.get_json::<crate::catalog::ShardCatalog>(crate::catalog::CATALOG_KEY).await?
        {
            self.catalog.install(catalog);
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogRefresher for CatalogPoller {
    async fn refresh_now(&self) -> Result<()> {
        self.poll_once().await
    }
}

pub struct RouterNode {
    pub catalog: Arc<CatalogHandle>,
    pub dispatcher: Arc<Dispatcher>,
    pub poller: Arc<CatalogPoller>,
    pub metrics: Arc<Metrics>,
    pub refresh_interval: Duration,
}

impl RouterNode {
    pub fn new(
        catalog: Arc<CatalogHandle>,
        dispatcher: Arc<Dispatcher>,
        poller: Arc<CatalogPoller>,
        metrics: Arc<Metrics>,
        refresh_interval: Duration,
    ) -> Self {
        Self { catalog, dispatcher, poller, metrics, refresh_interval }
    }

    /// Periodic poll (spec.md's `refresh_interval`, default 60s) plus a
    /// long-lived subscription to the metadata store's watch stream for
    /// faster-than-poll convergence when the store supports it.
    pub async fn run_catalog_subscriber(&self, store: Arc<dyn MetadataStore>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        let watch = store.watch(crate::catalog::CATALOG_KEY).await;

        let mut watch_stream = match watch {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::warn!(error = %e, "catalog watch unavailable, falling back to polling only");
                None
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("router catalog subscriber shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poller.poll_once().await {
                        tracing::error!(error = %e, "catalog poll failed");
                    }
                }
                event = async {
                    match &mut watch_stream {
                        Some(stream) => stream.next().await,
                        None => std::future::pending().await,
                    }
                } => {
                    if event.is_some() {
                        if let Err(e) = self.poller.poll_once().await {
                            tracing::error!(error = %e, "catalog refresh after watch event failed");
                        }
                    }
                }
            }
        }
    }
}
