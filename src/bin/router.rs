// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! shardmesh-router: stateless query router. Caches the catalog, dispatches
//! client queries to the right shard at the requested consistency level.

use shardmesh::backend::postgres::PostgresBackend;
use shardmesh::catalog::{CatalogHandle, ShardCatalog};
use shardmesh::config::{MetadataStoreKind, Settings};
use shardmesh::dispatch::{Dispatcher, DispatcherSettings};
use shardmesh::health::HealthRegistry;
use shardmesh::metadata::etcd::EtcdStore;
use shardmesh::metadata::memory::MemoryStore;
use shardmesh::metadata::MetadataStore;
use shardmesh::observability::{init_tracing, Metrics};
use shardmesh::pool::{PoolRegistry, PoolSettings};
use shardmesh::router::{api, CatalogPoller, RouterNode};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    init_tracing();
    tracing::info!("shardmesh-router starting");

    let settings = match Settings::load() {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return ExitCode::from(1);
        }
    };

    let store: Arc<dyn MetadataStore> = match settings.metadata_store {
        MetadataStoreKind::Memory => Arc::new(MemoryStore::new()),
        MetadataStoreKind::Etcd => match EtcdStore::connect(settings.etcd_endpoints.clone(), settings.etcd_prefix.clone()).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!(error = %e, "metadata store unreachable at startup");
                return ExitCode::from(2);
            }
        },
    };

    let initial_catalog = match store.get(shardmesh::catalog::CATALOG_KEY).await {
        Ok(Some((bytes, _))) => serde_json::from_slice::<ShardCatalog>(&bytes).unwrap_or_else(|_| ShardCatalog::empty()),
        _ => ShardCatalog::empty(),
    };
    let catalog = Arc::new(CatalogHandle::new(initial_catalog));

    let pool_settings = PoolSettings {
        min_idle: settings.pool_min_idle,
        max_size: settings.pool_max_size,
        acquire_timeout: settings.pool_acquire_timeout(),
        grace_period: settings.pool_grace_period(),
    };
    let pools = Arc::new(PoolRegistry::new(pool_settings));
    let backend = Arc::new(PostgresBackend::new(pools));
    let health = Arc::new(HealthRegistry::with_fail_threshold(settings.health_fail_threshold));
    let metrics = Arc::new(Metrics::new("shardmesh_router"));
    let poller = Arc::new(CatalogPoller::new(store.clone(), catalog.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        catalog.clone(),
        backend,
        health,
        poller.clone(),
        DispatcherSettings { request_timeout: settings.request_timeout() },
    ));

    let node = Arc::new(RouterNode::new(catalog, dispatcher, poller, metrics, settings.refresh_interval()));

    let shutdown = CancellationToken::new();
    let subscriber_node = node.clone();
    let subscriber_store = store.clone();
    let subscriber_shutdown = shutdown.clone();
    let subscriber = tokio::spawn(async move {
        subscriber_node.run_catalog_subscriber(subscriber_store, subscriber_shutdown).await;
    });

    let app = api::router(node);
    let listener = match tokio::net::TcpListener::bind(&settings.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind {}", settings.bind_addr);
            return ExitCode::from(1);
        }
    };

    tracing::info!(addr = %settings.bind_addr, "shardmesh-router listening");

    let serve_shutdown = shutdown.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        serve_shutdown.cancel();
    });

    if let Err(e) = serve.await {
        tracing::error!(error = %e, "server error");
    }

    let _ = tokio::time::timeout(settings.drain_window(), subscriber).await;
    ExitCode::SUCCESS
}
