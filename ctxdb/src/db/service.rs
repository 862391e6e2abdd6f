//! Connections for contexts.
//!
//! [`DatabaseService`] is the entry point callers use: it resolves the
//! assignment of a context, lets the [`ReplicationMonitor`] pick the physical
//! pool and wraps the result in a [`PooledConnection`] that runs the
//! replication bookkeeping when it is released.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::config::DatabaseConfig;
use crate::db::assignment::{Assignment, ContextAssignments};
use crate::db::configdb::ConfigDatabaseService;
use crate::db::connection::{Fetched, PooledConnection};
use crate::db::driver::{Connection, ConnectionPool, Driver};
use crate::db::errors::{DbError, Result};
use crate::db::pools::{PoolRegistry, Pools};
use crate::db::replication::{ReplicationMonitor, ReplicationStats};
use crate::types::{ContextId, FetchStrategy, PoolId, ServerId};

pub struct DatabaseService<D: Driver> {
    pools: Arc<Pools<D>>,
    config_db: ConfigDatabaseService<D>,
    assignments: ContextAssignments,
    monitor: Arc<ReplicationMonitor>,
    server_id: ServerId,
}

impl<D: Driver> Clone for DatabaseService<D> {
    fn clone(&self) -> Self {
        Self {
            pools: self.pools.clone(),
            config_db: self.config_db.clone(),
            assignments: self.assignments.clone(),
            monitor: self.monitor.clone(),
            server_id: self.server_id,
        }
    }
}

impl<D: Driver> DatabaseService<D> {
    /// Start the pools and resolve this server in the config database.
    pub async fn start(driver: D, config: &DatabaseConfig) -> Result<Self> {
        Self::start_with_registry(driver, config, PoolRegistry::new()).await
    }

    pub async fn start_with_registry(driver: D, config: &DatabaseConfig, registry: PoolRegistry) -> Result<Self> {
        let pools = Arc::new(Pools::new(driver, registry));
        pools.start(config).await?;

        let config_db = ConfigDatabaseService::new(pools.clone(), config.config_db.force_write_only);
        let server_id = match config_db.server_id(&config.server_name).await {
            Ok(server_id) => server_id,
            Err(e) => {
                pools.stop().await;
                return Err(e);
            }
        };

        info!(server_name = %config.server_name, server_id, "Database service started");

        Ok(Self {
            pools,
            config_db,
            assignments: ContextAssignments::new(&config.assignment_cache),
            monitor: Arc::new(ReplicationMonitor::new(&config.replication_monitor)),
            server_id,
        })
    }

    /// Destroy all pools. Connections still checked out are closed when released.
    pub async fn stop(&self) {
        self.pools.stop().await;
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn config_db(&self) -> &ConfigDatabaseService<D> {
        &self.config_db
    }

    pub fn pools(&self) -> &Arc<Pools<D>> {
        &self.pools
    }

    pub fn registry(&self) -> &PoolRegistry {
        self.pools.registry()
    }

    pub fn replication_stats(&self) -> ReplicationStats {
        self.monitor.stats()
    }

    /// Connection for reading context data, from the replica when possible
    pub async fn read_only(&self, context_id: ContextId) -> Result<PooledConnection<D::Pool>> {
        self.context_connection(context_id, false, FetchStrategy::Timeout).await
    }

    /// Connection to the master for writing context data
    pub async fn writable(&self, context_id: ContextId) -> Result<PooledConnection<D::Pool>> {
        self.context_connection(context_id, true, FetchStrategy::Timeout).await
    }

    /// Master connection without fetch timeout and use time limit, for schema updates
    pub async fn for_update_task(&self, context_id: ContextId) -> Result<PooledConnection<D::Pool>> {
        self.context_connection(context_id, true, FetchStrategy::NoTimeout).await
    }

    pub async fn no_timeout(&self, context_id: ContextId, write: bool) -> Result<PooledConnection<D::Pool>> {
        self.context_connection(context_id, write, FetchStrategy::NoTimeout).await
    }

    /// Connection to a pool switched to `schema`, without replication routing
    pub async fn read_only_for_pool(&self, pool_id: PoolId, schema: &str) -> Result<PooledConnection<D::Pool>> {
        self.pool_connection(pool_id, schema, FetchStrategy::Timeout).await
    }

    pub async fn writable_for_pool(&self, pool_id: PoolId, schema: &str) -> Result<PooledConnection<D::Pool>> {
        self.pool_connection(pool_id, schema, FetchStrategy::Timeout).await
    }

    pub async fn no_timeout_for_pool(&self, pool_id: PoolId, schema: &str) -> Result<PooledConnection<D::Pool>> {
        self.pool_connection(pool_id, schema, FetchStrategy::NoTimeout).await
    }

    /// Return a connection. Same as [`PooledConnection::release`].
    pub async fn back(&self, conn: PooledConnection<D::Pool>) {
        conn.release().await;
    }

    /// Drop cached assignments, e.g. after a context moved to another schema
    pub async fn invalidate(&self, context_ids: &[ContextId]) {
        self.assignments.invalidate(context_ids).await;
    }

    /// All contexts on this server sharing the schema and write pool of a context
    pub async fn contexts_in_same_schema(&self, context_id: ContextId) -> Result<Vec<ContextId>> {
        let assignment = self.assignment(context_id).await?;
        self.config_db
            .contexts_in_schema(self.server_id, assignment.write_pool_id, &assignment.schema)
            .await
    }

    pub async fn schema_name(&self, context_id: ContextId) -> Result<String> {
        Ok(self.assignment(context_id).await?.schema.clone())
    }

    pub async fn writable_pool_id(&self, context_id: ContextId) -> Result<PoolId> {
        Ok(self.assignment(context_id).await?.write_pool_id)
    }

    /// Create the replication counter row of a context on its master
    #[instrument(skip(self))]
    pub async fn init_replication_counter(&self, context_id: ContextId) -> Result<()> {
        let assignment = self.assignment(context_id).await?;
        let mut conn = self
            .pool_connection(assignment.write_pool_id, &assignment.schema, FetchStrategy::Timeout)
            .await?;
        let result = conn.init_replication_transaction(context_id).await;
        conn.release().await;
        result.map_err(DbError::from)
    }

    pub async fn assignment(&self, context_id: ContextId) -> Result<Arc<Assignment>> {
        let config_db = &self.config_db;
        let server_id = self.server_id;
        self.assignments
            .get_or_load(context_id, config_db.load_assignment(server_id, context_id))
            .await
    }

    async fn context_connection(
        &self,
        context_id: ContextId,
        write: bool,
        strategy: FetchStrategy,
    ) -> Result<PooledConnection<D::Pool>> {
        let assignment = self.assignment(context_id).await?;
        let fetched = self
            .monitor
            .check_actual_and_fallback(&self.pools, &assignment, strategy, write)
            .await?;

        Ok(PooledConnection::replicated(
            fetched,
            strategy,
            self.monitor.clone(),
            assignment,
            write,
        ))
    }

    async fn pool_connection(&self, pool_id: PoolId, schema: &str, strategy: FetchStrategy) -> Result<PooledConnection<D::Pool>> {
        let pool = self.pools.get_pool(pool_id).await?;
        let conn = pool.get(strategy).await.map_err(|e| DbError::no_connection(pool_id, e))?;
        let mut conn = PooledConnection::direct(
            Fetched {
                conn,
                pool,
                pool_id,
                used_as_read: false,
            },
            strategy,
        );

        let current = conn.catalog().await;
        let switched = match current {
            Ok(current) if current == schema => Ok(()),
            Ok(_) => conn.set_catalog(schema).await,
            Err(e) => Err(e),
        };
        if let Err(source) = switched {
            conn.release().await;
            return Err(DbError::SchemaFailed {
                pool_id,
                schema: schema.to_string(),
                source,
            });
        }

        Ok(conn)
    }
}
