// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Distributed tracing setup. Named `tracing_init` rather than `tracing`
//! to avoid shadowing the `tracing` crate within this module.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured JSON tracing. Honors `RUST_LOG`, defaulting to
/// `shardmesh=info` (spec.md's ambient logging requirement).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shardmesh=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
