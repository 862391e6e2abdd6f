//! Driver abstraction between the pooling/routing logic and a concrete database.
//!
//! The routing code in [`crate::db::pools`] and [`crate::db::replication`] never
//! talks to sqlx directly. It goes through four traits:
//!
//! - [`Driver`]: accepts the driver names stored in `db_pool` and builds pools
//! - [`ConnectionPool`]: hands out and takes back physical connections
//! - [`Connection`]: the few statements the layer runs itself (schema switch,
//!   replication counter)
//! - [`ConfigDbQueries`]: lookups against the configuration database
//!
//! [`crate::db::postgres`] implements them on top of sqlx; tests use an
//! in-memory implementation.

use async_trait::async_trait;
use std::fmt;

use crate::config::PoolConfig;
use crate::types::{ContextId, FetchStrategy, PoolId, ServerId};

/// Connection parameters of one pool, as stored in the config database `db_pool` table.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionData {
    pub pool_id: PoolId,
    pub url: String,
    pub driver: String,
    pub login: Option<String>,
    pub password: Option<String>,
    /// Maximum number of active connections
    pub max: u32,
    /// Connections to keep open while idle
    pub min: u32,
    /// `hardlimit`: block callers when exhausted instead of growing
    pub block: bool,
}

impl fmt::Debug for ConnectionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionData")
            .field("pool_id", &self.pool_id)
            .field("url", &self.url)
            .field("driver", &self.driver)
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("max", &self.max)
            .field("min", &self.min)
            .field("block", &self.block)
            .finish()
    }
}

/// Read and write pool plus schema of a context, as stored in `context_server2db_pool`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentRow {
    pub read_pool_id: PoolId,
    pub write_pool_id: PoolId,
    pub schema: String,
}

/// Point-in-time usage of a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently checked out
    pub active: usize,
    /// Open connections waiting in the pool
    pub idle: usize,
}

impl PoolStats {
    /// A pool without any open connection can be dropped by the cleaner
    pub fn is_empty(&self) -> bool {
        self.active == 0 && self.idle == 0
    }
}

/// Statements the routing layer issues on a physical connection.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Schema the connection currently operates on
    async fn catalog(&mut self) -> Result<String, sqlx::Error>;

    /// Switch the connection to another schema
    async fn set_catalog(&mut self, schema: &str) -> Result<(), sqlx::Error>;

    /// Current value of the logical transaction counter of a context, `None`
    /// if the context has no counter row in this database.
    async fn replication_transaction(&mut self, context_id: ContextId) -> Result<Option<i64>, sqlx::Error>;

    /// Advance the logical transaction counter of a context inside a local
    /// transaction and return the new value.
    async fn increment_replication_transaction(&mut self, context_id: ContextId) -> Result<Option<i64>, sqlx::Error>;

    /// Create the counter row of a context if it does not exist yet
    async fn init_replication_transaction(&mut self, context_id: ContextId) -> Result<(), sqlx::Error>;
}

/// Lookups against the configuration database.
#[async_trait]
pub trait ConfigDbQueries: Send + 'static {
    /// `db_pool` row of a pool
    async fn connection_data(&mut self, pool_id: PoolId) -> Result<Option<ConnectionData>, sqlx::Error>;

    /// Id of a registered server
    async fn server_id(&mut self, server_name: &str) -> Result<Option<ServerId>, sqlx::Error>;

    /// Pool and schema assignment of a context on a server
    async fn assignment(&mut self, server_id: ServerId, context_id: ContextId) -> Result<Option<AssignmentRow>, sqlx::Error>;

    /// All contexts of a server living in the same schema on the same write pool
    async fn contexts_in_schema(
        &mut self,
        server_id: ServerId,
        write_pool_id: PoolId,
        schema: &str,
    ) -> Result<Vec<ContextId>, sqlx::Error>;

    /// All contexts using a pool either for reading or writing
    async fn contexts_by_pool(&mut self, pool_id: PoolId) -> Result<Vec<ContextId>, sqlx::Error>;
}

/// A pool of physical connections for one pool id.
#[async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    type Connection: Connection + ConfigDbQueries;

    /// Fetch a connection. `Timeout` waits at most the configured `max_wait`.
    async fn get(&self, strategy: FetchStrategy) -> Result<Self::Connection, sqlx::Error>;

    /// Return a connection fetched with the same strategy
    async fn back(&self, conn: Self::Connection, strategy: FetchStrategy) -> Result<(), sqlx::Error>;

    fn stats(&self) -> PoolStats;

    /// Configured maximum of active connections
    fn max_active(&self) -> u32;

    /// Close all connections and refuse further fetches
    async fn destroy(&self);
}

/// Builds pools for the driver names it supports.
pub trait Driver: Send + Sync + 'static {
    type Pool: ConnectionPool;

    /// Whether a `db_pool.driver` value can be served by this driver
    fn accepts(&self, driver: &str) -> bool;

    /// Driver name used for the config database pools
    fn default_name(&self) -> &'static str;

    /// Create a pool. Connections are opened lazily on first fetch.
    fn create_pool(&self, data: &ConnectionData, config: &PoolConfig) -> Result<Self::Pool, sqlx::Error>;
}
