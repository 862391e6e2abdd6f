//! Registry of connection pools keyed by pool id.
//!
//! [`Pools`] owns exactly one [`ConnectionPool`] per live pool id. Pools of
//! context databases are created on first use from the `db_pool` row of the
//! config database and removed again by a periodic cleaner once they hold no
//! connection at all, so only shards that are actually in use keep connections
//! open. The two config database pools ([`CONFIGDB_READ_ID`],
//! [`CONFIGDB_WRITE_ID`]) are created eagerly by [`Pools::start`] and live until
//! [`Pools::stop`].
//!
//! ```text
//!            get_pool(id)
//!                 │
//!        ┌────────┴─────────┐
//!        ↓                  ↓
//!  reserved id         map lock ── absent? ── load db_pool row via ConfigDB Read
//!  (ArcSwap, no lock)      │                  create pool, register, insert
//!                          ↓
//!                    Arc<ConnectionPool>
//! ```

pub mod metrics;

use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{DatabaseConfig, PoolConfig};
use crate::db::driver::{ConfigDbQueries, ConnectionData, ConnectionPool, Driver};
use crate::db::errors::{DbError, Result};
use crate::types::{CONFIGDB_READ_ID, CONFIGDB_WRITE_ID, FetchStrategy, PoolId, pool_name};

pub use metrics::{MonitoredPool, PoolMetricsConfig, PoolRegistry, run_pool_metrics_sampler};

struct ConfigPools<P> {
    read: Arc<P>,
    /// Same object as `read` unless a distinct write URL is configured
    write: Arc<P>,
}

struct Cleaner {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct State<P> {
    defaults: PoolConfig,
    pools: HashMap<PoolId, Arc<P>>,
    cleaner: Cleaner,
}

/// Connection pools of the config database and of all context databases in use.
pub struct Pools<D: Driver> {
    driver: D,
    registry: PoolRegistry,
    config_pools: ArcSwapOption<ConfigPools<D::Pool>>,
    state: Mutex<Option<State<D::Pool>>>,
}

impl<D: Driver> Pools<D> {
    pub fn new(driver: D, registry: PoolRegistry) -> Self {
        Self {
            driver,
            registry,
            config_pools: ArcSwapOption::from(None),
            state: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    /// Create the config database pools and start the cleaner.
    ///
    /// Fails with [`DbError::AlreadyInitialized`] when called twice without
    /// [`Pools::stop`] in between.
    #[instrument(skip_all, fields(cleaner_interval = ?config.cleaner_interval))]
    pub async fn start(self: &Arc<Self>, config: &DatabaseConfig) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(DbError::AlreadyInitialized);
        }

        let defaults = config.pool.clone();

        let read_data = self.config_connection_data(CONFIGDB_READ_ID, &config.config_db.read_url, &defaults);
        let read = Arc::new(self.driver.create_pool(&read_data, &defaults)?);
        self.registry.register(pool_name(CONFIGDB_READ_ID), read.clone());

        let write = match config.config_db.write_url.as_deref() {
            Some(write_url) if config.config_db.has_distinct_write_url() => {
                let write_data = self.config_connection_data(CONFIGDB_WRITE_ID, write_url, &defaults);
                let write = match self.driver.create_pool(&write_data, &defaults) {
                    Ok(pool) => Arc::new(pool),
                    Err(e) => {
                        self.destroy_pool(CONFIGDB_READ_ID, &read).await;
                        return Err(e.into());
                    }
                };
                self.registry.register(pool_name(CONFIGDB_WRITE_ID), write.clone());
                write
            }
            _ => read.clone(),
        };

        self.config_pools.store(Some(Arc::new(ConfigPools { read, write })));

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_cleaner(Arc::downgrade(self), config.cleaner_interval, token.clone()));

        *state = Some(State {
            defaults,
            pools: HashMap::new(),
            cleaner: Cleaner { token, handle },
        });

        info!(
            distinct_write_pool = config.config_db.has_distinct_write_url(),
            "Database pools started"
        );
        Ok(())
    }

    pub async fn is_started(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Get the pool of a pool id, creating it on first use.
    ///
    /// The config database pools are returned without taking the map lock.
    pub async fn get_pool(&self, pool_id: PoolId) -> Result<Arc<D::Pool>> {
        match pool_id {
            CONFIGDB_READ_ID => return Ok(self.config_pools()?.read.clone()),
            CONFIGDB_WRITE_ID => return Ok(self.config_pools()?.write.clone()),
            _ => {}
        }

        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(DbError::NotInitialized)?;

        if let Some(pool) = state.pools.get(&pool_id) {
            return Ok(pool.clone());
        }

        let data = self.load_connection_data(pool_id).await?;
        if !self.driver.accepts(&data.driver) {
            return Err(DbError::NoDriver {
                pool_id,
                driver: data.driver,
            });
        }

        let config = state.defaults.customize(&data);
        let pool = Arc::new(self.driver.create_pool(&data, &config)?);
        self.registry.register(pool_name(pool_id), pool.clone());
        state.pools.insert(pool_id, pool.clone());

        info!(
            pool_id,
            max_active = config.max_active,
            min_idle = config.min_idle,
            exhausted_action = ?config.exhausted_action,
            "Created database pool"
        );
        Ok(pool)
    }

    /// Ids of the context database pools currently alive
    pub async fn pool_ids(&self) -> Vec<PoolId> {
        let guard = self.state.lock().await;
        let mut ids: Vec<PoolId> = guard.as_ref().map(|state| state.pools.keys().copied().collect()).unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Remove and destroy every context database pool without any open
    /// connection. Returns the number of removed pools.
    pub async fn cleanup(&self) -> Result<usize> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(DbError::NotInitialized)?;

        let empty: Vec<PoolId> = state
            .pools
            .iter()
            .filter(|(_, pool)| ConnectionPool::stats(pool.as_ref()).is_empty())
            .map(|(pool_id, _)| *pool_id)
            .collect();

        for pool_id in &empty {
            if let Some(pool) = state.pools.remove(pool_id) {
                self.destroy_pool(*pool_id, &pool).await;
            }
        }

        Ok(empty.len())
    }

    /// Destroy all pools and stop the cleaner. [`Pools::start`] may be called again afterwards.
    pub async fn stop(&self) {
        let state = {
            let mut guard = self.state.lock().await;
            let state = guard.take();
            if let Some(state) = &state {
                state.cleaner.token.cancel();
            }
            state
        };

        let Some(state) = state else {
            debug!("Database pools already stopped");
            return;
        };

        if let Err(e) = state.cleaner.handle.await {
            warn!(error = %e, "Pool cleaner task did not finish cleanly");
        }

        for (pool_id, pool) in state.pools {
            self.destroy_pool(pool_id, &pool).await;
        }

        if let Some(config_pools) = self.config_pools.swap(None) {
            if !Arc::ptr_eq(&config_pools.write, &config_pools.read) {
                self.destroy_pool(CONFIGDB_WRITE_ID, &config_pools.write).await;
            }
            self.destroy_pool(CONFIGDB_READ_ID, &config_pools.read).await;
        }

        info!("Database pools stopped");
    }

    fn config_pools(&self) -> Result<Arc<ConfigPools<D::Pool>>> {
        self.config_pools.load_full().ok_or(DbError::NotInitialized)
    }

    fn config_connection_data(&self, pool_id: PoolId, url: &str, defaults: &PoolConfig) -> ConnectionData {
        ConnectionData {
            pool_id,
            url: url.to_string(),
            driver: self.driver.default_name().to_string(),
            login: None,
            password: None,
            max: defaults.max_active,
            min: defaults.min_idle,
            block: defaults.blocks(),
        }
    }

    async fn load_connection_data(&self, pool_id: PoolId) -> Result<ConnectionData> {
        let config_pools = self.config_pools()?;
        let pool = config_pools.read.as_ref();

        let mut conn = pool
            .get(FetchStrategy::Timeout)
            .await
            .map_err(|e| DbError::no_connection(CONFIGDB_READ_ID, e))?;
        let data = conn.connection_data(pool_id).await;
        back_to_pool(pool, conn, CONFIGDB_READ_ID, FetchStrategy::Timeout).await;

        data?.ok_or(DbError::NoPoolData { pool_id })
    }

    async fn destroy_pool(&self, pool_id: PoolId, pool: &D::Pool) {
        self.registry.unregister(&pool_name(pool_id));
        pool.destroy().await;
        info!(pool_id, "Destroyed database pool");
    }
}

/// Hand a connection back to its pool. Failures are logged, never returned.
pub(crate) async fn back_to_pool<P: ConnectionPool>(pool: &P, conn: P::Connection, pool_id: PoolId, strategy: FetchStrategy) {
    if let Err(e) = pool.back(conn, strategy).await {
        error!(pool_id, error = %e, "Cannot return connection to pool");
    }
}

async fn run_cleaner<D: Driver>(pools: Weak<Pools<D>>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Pool cleaner shutting down");
                break;
            }
            _ = ticker.tick() => {
                let Some(pools) = pools.upgrade() else {
                    break;
                };
                match pools.cleanup().await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "Removed empty database pools"),
                    Err(e) if shutdown.is_cancelled() => debug!(error = %e, "Pool cleaner stopped during run"),
                    Err(e) => warn!(error = %e, "Pool cleaner run failed"),
                }
            }
        }
    }
}
