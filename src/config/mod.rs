// ===========================================
// shardmesh - PostgreSQL sharding platform
// ===========================================

//! Layered configuration: built-in defaults, then an optional file, then
//! `SHARDMESH_*` environment overrides (spec.md §6's configuration
//! surface).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub metadata_store: MetadataStoreKind,
    pub etcd_endpoints: Vec<String>,
    pub etcd_prefix: String,

    pub vnode_count_default: u32,
    pub refresh_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub health_fail_threshold: u32,
    pub pool_max_size: usize,
    pub pool_min_idle: usize,
    pub pool_acquire_timeout_secs: u64,
    pub pool_grace_period_secs: u64,
    pub request_timeout_secs: u64,
    pub cutover_drain_timeout_secs: u64,
    pub deltasync_threshold_rows: u64,
    pub automatic_failover_enabled: bool,
    pub drain_window_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataStoreKind {
    Memory,
    Etcd,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            metadata_store: MetadataStoreKind::Memory,
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            etcd_prefix: "shardmesh/".to_string(),
            vnode_count_default: 256,
            refresh_interval_secs: 60,
            health_check_interval_secs: 10,
            health_fail_threshold: 3,
            pool_max_size: 10,
            pool_min_idle: 2,
            pool_acquire_timeout_secs: 5,
            pool_grace_period_secs: 60,
            request_timeout_secs: 30,
            cutover_drain_timeout_secs: 5,
            deltasync_threshold_rows: 100,
            automatic_failover_enabled: true,
            drain_window_secs: 30,
        }
    }
}

impl Settings {
    /// Load defaults, then `config/shardmesh.toml` / `.yaml` / `.json` if
    /// present, then `SHARDMESH_*` environment variables (e.g.
    /// `SHARDMESH_POOL_MAX_SIZE=20`). Malformed config maps to exit code 1
    /// per SPEC_FULL.md §10.3.
    pub fn load() -> Result<Self> {
        let defaults = Settings::default();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults).map_err(|e| Error::Config(e.to_string()))?)
            .add_source(config::File::with_name("config/shardmesh").required(false))
            .add_source(config::Environment::with_prefix("SHARDMESH").separator("_"));

        let settings = builder.build().map_err(|e| Error::Config(e.to_string()))?;
        settings.try_deserialize().map_err(|e| Error::Config(e.to_string()))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_acquire_timeout_secs)
    }

    pub fn pool_grace_period(&self) -> Duration {
        Duration::from_secs(self.pool_grace_period_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cutover_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.cutover_drain_timeout_secs)
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_secs(self.drain_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let s = Settings::default();
        assert_eq!(s.vnode_count_default, 256);
        assert_eq!(s.refresh_interval_secs, 60);
        assert_eq!(s.health_check_interval_secs, 10);
        assert_eq!(s.health_fail_threshold, 3);
        assert_eq!(s.pool_max_size, 10);
        assert_eq!(s.pool_min_idle, 2);
        assert_eq!(s.request_timeout_secs, 30);
        assert_eq!(s.cutover_drain_timeout_secs, 5);
        assert!(s.automatic_failover_enabled);
    }
}
