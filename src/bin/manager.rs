// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! shardmesh-manager: owns the catalog, drives resharding/health/failover.

use shardmesh::backend::postgres::PostgresBackend;
use shardmesh::catalog::{CatalogHandle, ShardCatalog};
use shardmesh::config::{MetadataStoreKind, Settings};
use shardmesh::manager::{api, Manager};
use shardmesh::metadata::etcd::EtcdStore;
use shardmesh::metadata::memory::MemoryStore;
use shardmesh::metadata::MetadataStore;
use shardmesh::observability::{init_tracing, Metrics};
use shardmesh::pool::{PoolRegistry, PoolSettings};
use shardmesh::reshard::UpdatedAtPoller;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    init_tracing();
    tracing::info!("shardmesh-manager starting");

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

    let catalog = match store.get(shardmesh::catalog::CATALOG_KEY).await {
        Ok(Some((bytes, _))) => serde_json::from_slice::<ShardCatalog>(&bytes).unwrap_or_else(|_| ShardCatalog::empty()),
        _ => ShardCatalog::empty(),
    };
    let catalog = Arc::new(CatalogHandle::new(catalog));

    let pool_settings = PoolSettings {
        min_idle: settings.pool_min_idle,
        max_size: settings.pool_max_size,
        acquire_timeout: settings.pool_acquire_timeout(),
        grace_period: settings.pool_grace_period(),
    };
    let pools = Arc::new(PoolRegistry::new(pool_settings));
    let backend = Arc::new(PostgresBackend::new(pools));
    let delta_source = Arc::new(UpdatedAtPoller::new(backend.clone()));
    let metrics = Arc::new(Metrics::new("shardmesh_manager"));

    let manager = Arc::new(Manager::new(catalog, store, backend, delta_source, metrics, settings.clone()));

    let shutdown = CancellationToken::new();
    let background_manager = manager.clone();
    let background_shutdown = shutdown.clone();
    let background = tokio::spawn(async move {
        background_manager.run_background_tasks(background_shutdown).await;
    });

    let app = api::router(manager);
    let listener = match tokio::net::TcpListener::bind(&settings.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind {}", settings.bind_addr);
            return ExitCode::from(1);
        }
    };

    tracing::info!(addr = %settings.bind_addr, "shardmesh-manager listening");

    let serve_shutdown = shutdown.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        serve_shutdown.cancel();
    });

    if let Err(e) = serve.await {
        tracing::error!(error = %e, "server error");
    }

    let _ = tokio::time::timeout(settings.drain_window(), background).await;
    ExitCode::SUCCESS
}
