//! Pool registration and metrics sampling.
//!
//! Every pool created by [`super::Pools`] is registered in a [`PoolRegistry`]
//! under its monitoring name (`DB Pool <id>`, `ConfigDB Read`, `ConfigDB Write`)
//! and unregistered when it is destroyed. A background task periodically samples
//! all registered pools and records gauges for observability.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::gauge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::db::driver::{ConnectionPool, PoolStats};

/// Configuration for pool metrics sampling
#[derive(Debug, Clone)]
pub struct PoolMetricsConfig {
    /// How often to sample pool metrics
    pub sample_interval: Duration,
}

impl Default for PoolMetricsConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
        }
    }
}

/// The view of a pool the sampler needs
pub trait MonitoredPool: Send + Sync {
    fn stats(&self) -> PoolStats;
    fn max_active(&self) -> u32;
}

impl<P: ConnectionPool> MonitoredPool for P {
    fn stats(&self) -> PoolStats {
        ConnectionPool::stats(self)
    }

    fn max_active(&self) -> u32 {
        ConnectionPool::max_active(self)
    }
}

/// Named pools currently alive. Cheap to clone.
#[derive(Clone, Default)]
pub struct PoolRegistry {
    pools: Arc<DashMap<String, Arc<dyn MonitoredPool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: String, pool: Arc<dyn MonitoredPool>) {
        gauge!("ctxdb_db_pool_connections_max", "pool" => name.clone()).set(pool.max_active() as f64);
        if self.pools.insert(name.clone(), pool).is_some() {
            tracing::warn!(pool = %name, "Pool was registered twice, replacing previous registration");
        }
    }

    pub fn unregister(&self, name: &str) {
        if self.pools.remove(name).is_some() {
            // Gauges cannot be removed, zero them so dashboards do not show stale pools as busy
            gauge!("ctxdb_db_pool_connections_active", "pool" => name.to_string()).set(0.0);
            gauge!("ctxdb_db_pool_connections_idle", "pool" => name.to_string()).set(0.0);
            gauge!("ctxdb_db_pool_connections_max", "pool" => name.to_string()).set(0.0);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Stats of every registered pool, sorted by name
    pub fn snapshot(&self) -> Vec<(String, PoolStats)> {
        let mut stats: Vec<(String, PoolStats)> = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}

/// Start the pool metrics sampler background task.
///
/// This task periodically samples every registered pool and records:
/// - `ctxdb_db_pool_connections_active` - Connections currently checked out
/// - `ctxdb_db_pool_connections_idle` - Idle connections available
/// - `ctxdb_db_pool_connections_max` - Maximum configured connections (set on registration)
///
/// All metrics are labeled with `pool` to distinguish between different pools.
pub async fn run_pool_metrics_sampler(
    registry: PoolRegistry,
    config: PoolMetricsConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("Starting pool metrics sampler with {:?} interval", config.sample_interval);

    let mut interval = tokio::time::interval(config.sample_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Pool metrics sampler shutting down");
                break;
            }
            _ = interval.tick() => {
                for (name, stats) in registry.snapshot() {
                    gauge!("ctxdb_db_pool_connections_active", "pool" => name.clone()).set(stats.active as f64);
                    gauge!("ctxdb_db_pool_connections_idle", "pool" => name.clone()).set(stats.idle as f64);

                    debug!(pool = %name, active = stats.active, idle = stats.idle, "Sampled pool metrics");
                }
            }
        }
    }

    Ok(())
}
