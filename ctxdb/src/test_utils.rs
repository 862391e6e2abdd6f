//! In-memory driver for unit and scenario tests.
//!
//! [`MockDriver`] serves pools backed by a shared [`MockDatabase`] that plays
//! both roles: the config database (`db_pool`, `server`,
//! `context_server2db_pool`) and every context database, with one
//! `replication_monitor` counter per `(pool id, context)` so that a replica can
//! lag behind its master.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{DatabaseConfig, ExhaustedAction, PoolConfig};
use crate::db::driver::{AssignmentRow, ConfigDbQueries, Connection, ConnectionData, ConnectionPool, Driver, PoolStats};
use crate::types::{ContextId, FetchStrategy, PoolId, ServerId};

pub const MOCK_DRIVER: &str = "mock";
pub const TEST_SERVER: &str = "test-server";
pub const TEST_SERVER_ID: ServerId = 1;

/// Database config pointing at the mock config database, with a short `max_wait`
pub fn test_database_config() -> DatabaseConfig {
    let mut config = DatabaseConfig::default();
    config.server_name = TEST_SERVER.to_string();
    config.config_db.read_url = "mock://configdb".to_string();
    config.pool.max_wait = Duration::from_millis(200);
    config.cleaner_interval = Duration::from_secs(3600);
    config
}

#[derive(Default)]
struct Tables {
    pool_rows: HashMap<PoolId, ConnectionData>,
    servers: HashMap<String, ServerId>,
    assignments: HashMap<(ServerId, ContextId), AssignmentRow>,
    counters: HashMap<(PoolId, ContextId), i64>,
    unavailable: HashSet<PoolId>,
    broken_schema: HashSet<PoolId>,
    fetch_attempts: HashMap<PoolId, usize>,
    pools_created: HashMap<PoolId, usize>,
    catalog_switches: HashMap<PoolId, usize>,
}

/// Shared state behind every mock pool and connection
#[derive(Default)]
pub struct MockDatabase {
    tables: Mutex<Tables>,
}

impl MockDatabase {
    fn with<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut tables = self.tables.lock().unwrap();
        f(&mut tables)
    }

    pub fn add_pool(&self, pool_id: PoolId, max: u32, block: bool) {
        self.with(|t| {
            t.pool_rows.insert(
                pool_id,
                ConnectionData {
                    pool_id,
                    url: format!("mock://db{pool_id}"),
                    driver: MOCK_DRIVER.to_string(),
                    login: Some("ox".to_string()),
                    password: Some("secret".to_string()),
                    max,
                    min: 0,
                    block,
                },
            );
        });
    }

    pub fn add_pool_with_driver(&self, pool_id: PoolId, driver: &str) {
        self.add_pool(pool_id, 10, true);
        self.with(|t| {
            if let Some(row) = t.pool_rows.get_mut(&pool_id) {
                row.driver = driver.to_string();
            }
        });
    }

    pub fn add_server(&self, name: &str, server_id: ServerId) {
        self.with(|t| t.servers.insert(name.to_string(), server_id));
    }

    /// Register a context on [`TEST_SERVER`]
    pub fn assign(&self, context_id: ContextId, read_pool_id: PoolId, write_pool_id: PoolId, schema: &str) {
        self.with(|t| {
            t.assignments.insert(
                (TEST_SERVER_ID, context_id),
                AssignmentRow {
                    read_pool_id,
                    write_pool_id,
                    schema: schema.to_string(),
                },
            );
        });
    }

    pub fn set_counter(&self, pool_id: PoolId, context_id: ContextId, value: i64) {
        self.with(|t| t.counters.insert((pool_id, context_id), value));
    }

    pub fn counter(&self, pool_id: PoolId, context_id: ContextId) -> Option<i64> {
        self.with(|t| t.counters.get(&(pool_id, context_id)).copied())
    }

    /// Copy the counter of a context from one database to another, like replication would
    pub fn replicate(&self, from: PoolId, to: PoolId, context_id: ContextId) {
        self.with(|t| {
            if let Some(value) = t.counters.get(&(from, context_id)).copied() {
                t.counters.insert((to, context_id), value);
            }
        });
    }

    /// Make every fetch from a pool fail
    pub fn set_unavailable(&self, pool_id: PoolId, unavailable: bool) {
        self.with(|t| {
            if unavailable {
                t.unavailable.insert(pool_id);
            } else {
                t.unavailable.remove(&pool_id);
            }
        });
    }

    /// Make switching the schema fail on connections of a pool
    pub fn break_schema(&self, pool_id: PoolId) {
        self.with(|t| t.broken_schema.insert(pool_id));
    }

    pub fn fetch_attempts(&self, pool_id: PoolId) -> usize {
        self.with(|t| t.fetch_attempts.get(&pool_id).copied().unwrap_or(0))
    }

    pub fn pools_created(&self, pool_id: PoolId) -> usize {
        self.with(|t| t.pools_created.get(&pool_id).copied().unwrap_or(0))
    }

    pub fn catalog_switches(&self, pool_id: PoolId) -> usize {
        self.with(|t| t.catalog_switches.get(&pool_id).copied().unwrap_or(0))
    }
}

/// Driver handing out [`MockPool`]s. Clones share the same database.
#[derive(Clone)]
pub struct MockDriver {
    pub db: Arc<MockDatabase>,
}

impl MockDriver {
    /// A driver whose config database knows [`TEST_SERVER`]
    pub fn new() -> Self {
        let db = Arc::new(MockDatabase::default());
        db.add_server(TEST_SERVER, TEST_SERVER_ID);
        Self { db }
    }
}

impl Driver for MockDriver {
    type Pool = MockPool;

    fn accepts(&self, driver: &str) -> bool {
        driver == MOCK_DRIVER
    }

    fn default_name(&self) -> &'static str {
        MOCK_DRIVER
    }

    fn create_pool(&self, data: &ConnectionData, config: &PoolConfig) -> Result<MockPool, sqlx::Error> {
        self.db.with(|t| *t.pools_created.entry(data.pool_id).or_default() += 1);
        Ok(MockPool {
            pool_id: data.pool_id,
            config: config.clone(),
            db: self.db.clone(),
            permits: Arc::new(Semaphore::new(config.max_active as usize)),
            stats: Mutex::new(PoolStats::default()),
            destroyed: AtomicBool::new(false),
        })
    }
}

pub struct MockPool {
    pub pool_id: PoolId,
    pub config: PoolConfig,
    db: Arc<MockDatabase>,
    permits: Arc<Semaphore>,
    stats: Mutex<PoolStats>,
    destroyed: AtomicBool,
}

impl MockPool {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Close all idle connections, like an expired idle timeout would
    pub fn evict_idle(&self) {
        self.stats.lock().unwrap().idle = 0;
    }

    async fn permit(&self, strategy: FetchStrategy) -> Result<Option<OwnedSemaphorePermit>, sqlx::Error> {
        match self.config.exhausted_action {
            ExhaustedAction::Grow => Ok(self.permits.clone().try_acquire_owned().ok()),
            ExhaustedAction::Block => {
                let acquire = self.permits.clone().acquire_owned();
                let permit = match strategy {
                    FetchStrategy::Timeout => tokio::time::timeout(self.config.max_wait, acquire)
                        .await
                        .map_err(|_| sqlx::Error::PoolTimedOut)?,
                    FetchStrategy::NoTimeout => acquire.await,
                };
                permit.map(Some).map_err(|_| sqlx::Error::PoolClosed)
            }
        }
    }
}

#[async_trait]
impl ConnectionPool for MockPool {
    type Connection = MockConnection;

    async fn get(&self, strategy: FetchStrategy) -> Result<MockConnection, sqlx::Error> {
        let unavailable = self.db.with(|t| {
            *t.fetch_attempts.entry(self.pool_id).or_default() += 1;
            t.unavailable.contains(&self.pool_id)
        });
        if self.is_destroyed() {
            return Err(sqlx::Error::PoolClosed);
        }
        if unavailable {
            return Err(sqlx::Error::PoolTimedOut);
        }

        let permit = self.permit(strategy).await?;
        {
            let mut stats = self.stats.lock().unwrap();
            stats.idle = stats.idle.saturating_sub(1);
            stats.active += 1;
        }

        Ok(MockConnection {
            pool_id: self.pool_id,
            catalog: "public".to_string(),
            db: self.db.clone(),
            permit,
        })
    }

    async fn back(&self, conn: MockConnection, _strategy: FetchStrategy) -> Result<(), sqlx::Error> {
        let mut stats = self.stats.lock().unwrap();
        stats.active = stats.active.saturating_sub(1);
        // overflow connections are closed, pooled ones stay idle up to max_idle
        if conn.permit.is_some() && !self.is_destroyed() && stats.idle < self.config.max_idle as usize {
            stats.idle += 1;
        }
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        *self.stats.lock().unwrap()
    }

    fn max_active(&self) -> u32 {
        self.config.max_active
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.permits.close();
        self.stats.lock().unwrap().idle = 0;
    }
}

pub struct MockConnection {
    pub pool_id: PoolId,
    catalog: String,
    db: Arc<MockDatabase>,
    permit: Option<OwnedSemaphorePermit>,
}

impl MockConnection {
    /// Whether this connection was opened beyond the pool limit
    pub fn is_overflow(&self) -> bool {
        self.permit.is_none()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn catalog(&mut self) -> Result<String, sqlx::Error> {
        Ok(self.catalog.clone())
    }

    async fn set_catalog(&mut self, schema: &str) -> Result<(), sqlx::Error> {
        let broken = self.db.with(|t| {
            *t.catalog_switches.entry(self.pool_id).or_default() += 1;
            t.broken_schema.contains(&self.pool_id)
        });
        if broken {
            return Err(sqlx::Error::Protocol(format!("schema \"{schema}\" does not exist")));
        }
        self.catalog = schema.to_string();
        Ok(())
    }

    async fn replication_transaction(&mut self, context_id: ContextId) -> Result<Option<i64>, sqlx::Error> {
        Ok(self.db.counter(self.pool_id, context_id))
    }

    async fn increment_replication_transaction(&mut self, context_id: ContextId) -> Result<Option<i64>, sqlx::Error> {
        Ok(self.db.with(|t| {
            t.counters.get_mut(&(self.pool_id, context_id)).map(|value| {
                *value = value.wrapping_add(1);
                *value
            })
        }))
    }

    async fn init_replication_transaction(&mut self, context_id: ContextId) -> Result<(), sqlx::Error> {
        self.db.with(|t| {
            t.counters.entry((self.pool_id, context_id)).or_insert(0);
        });
        Ok(())
    }
}

#[async_trait]
impl ConfigDbQueries for MockConnection {
    async fn connection_data(&mut self, pool_id: PoolId) -> Result<Option<ConnectionData>, sqlx::Error> {
        Ok(self.db.with(|t| t.pool_rows.get(&pool_id).cloned()))
    }

    async fn server_id(&mut self, server_name: &str) -> Result<Option<ServerId>, sqlx::Error> {
        Ok(self.db.with(|t| t.servers.get(server_name).copied()))
    }

    async fn assignment(&mut self, server_id: ServerId, context_id: ContextId) -> Result<Option<AssignmentRow>, sqlx::Error> {
        Ok(self.db.with(|t| t.assignments.get(&(server_id, context_id)).cloned()))
    }

    async fn contexts_in_schema(
        &mut self,
        server_id: ServerId,
        write_pool_id: PoolId,
        schema: &str,
    ) -> Result<Vec<ContextId>, sqlx::Error> {
        let mut contexts: Vec<ContextId> = self.db.with(|t| {
            t.assignments
                .iter()
                .filter(|((sid, _), row)| *sid == server_id && row.write_pool_id == write_pool_id && row.schema == schema)
                .map(|((_, cid), _)| *cid)
                .collect()
        });
        contexts.sort_unstable();
        Ok(contexts)
    }

    async fn contexts_by_pool(&mut self, pool_id: PoolId) -> Result<Vec<ContextId>, sqlx::Error> {
        let mut contexts: Vec<ContextId> = self.db.with(|t| {
            t.assignments
                .iter()
                .filter(|(_, row)| row.read_pool_id == pool_id || row.write_pool_id == pool_id)
                .map(|((_, cid), _)| *cid)
                .collect()
        });
        contexts.sort_unstable();
        contexts.dedup();
        Ok(contexts)
    }
}
