// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Ambient observability stack: structured tracing and Prometheus metrics,
//! shared by both the manager and router binaries.

pub mod metrics;
pub mod tracing_init;

pub use metrics::Metrics;
pub use tracing_init::init_tracing;
