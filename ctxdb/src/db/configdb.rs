//! Access to the configuration database.
//!
//! The config database holds the pool definitions (`db_pool`), the servers
//! (`server`) and the assignment of contexts to pools and schemas
//! (`context_server2db_pool`). It is served by the two reserved pools and never
//! goes through replication routing.

use std::sync::Arc;
use tracing::{debug, instrument};

use crate::db::assignment::Assignment;
use crate::db::connection::{Fetched, PooledConnection};
use crate::db::driver::{ConfigDbQueries, ConnectionPool, Driver};
use crate::db::errors::{DbError, Result};
use crate::db::pools::Pools;
use crate::types::{CONFIGDB_READ_ID, CONFIGDB_WRITE_ID, ContextId, FetchStrategy, PoolId, ServerId};

pub struct ConfigDatabaseService<D: Driver> {
    pools: Arc<Pools<D>>,
    force_write_only: bool,
}

impl<D: Driver> Clone for ConfigDatabaseService<D> {
    fn clone(&self) -> Self {
        Self {
            pools: self.pools.clone(),
            force_write_only: self.force_write_only,
        }
    }
}

impl<D: Driver> ConfigDatabaseService<D> {
    pub fn new(pools: Arc<Pools<D>>, force_write_only: bool) -> Self {
        Self { pools, force_write_only }
    }

    /// Connection for reading, from the write pool if `force_write_only` is set
    pub async fn read_only(&self) -> Result<PooledConnection<D::Pool>> {
        let pool_id = if self.force_write_only {
            CONFIGDB_WRITE_ID
        } else {
            CONFIGDB_READ_ID
        };
        self.fetch(pool_id).await
    }

    pub async fn writable(&self) -> Result<PooledConnection<D::Pool>> {
        self.fetch(CONFIGDB_WRITE_ID).await
    }

    async fn fetch(&self, pool_id: PoolId) -> Result<PooledConnection<D::Pool>> {
        let pool = self.pools.get_pool(pool_id).await?;
        let conn = pool
            .get(FetchStrategy::Timeout)
            .await
            .map_err(|e| DbError::no_connection(pool_id, e))?;

        Ok(PooledConnection::direct(
            Fetched {
                conn,
                pool,
                pool_id,
                used_as_read: false,
            },
            FetchStrategy::Timeout,
        ))
    }

    /// Contexts whose read or write pool is `pool_id`
    #[instrument(skip(self))]
    pub async fn list_contexts(&self, pool_id: PoolId) -> Result<Vec<ContextId>> {
        let mut conn = self.read_only().await?;
        let contexts = conn.contexts_by_pool(pool_id).await;
        conn.release().await;
        Ok(contexts?)
    }

    /// Contexts of a server sharing a schema on the same write pool
    #[instrument(skip(self))]
    pub async fn contexts_in_schema(&self, server_id: ServerId, write_pool_id: PoolId, schema: &str) -> Result<Vec<ContextId>> {
        let mut conn = self.read_only().await?;
        let contexts = conn.contexts_in_schema(server_id, write_pool_id, schema).await;
        conn.release().await;
        Ok(contexts?)
    }

    pub async fn server_id(&self, server_name: &str) -> Result<ServerId> {
        let mut conn = self.read_only().await?;
        let server_id = conn.server_id(server_name).await;
        conn.release().await;
        server_id?.ok_or_else(|| DbError::UnknownServer {
            name: server_name.to_string(),
        })
    }

    /// Assignment of a context, without any cached replication counter
    pub async fn load_assignment(&self, server_id: ServerId, context_id: ContextId) -> Result<Assignment> {
        let mut conn = self.read_only().await?;
        let row = conn.assignment(server_id, context_id).await;
        conn.release().await;

        let row = row?.ok_or(DbError::NoAssignment { context_id })?;
        debug!(
            context_id,
            read_pool_id = row.read_pool_id,
            write_pool_id = row.write_pool_id,
            schema = %row.schema,
            "Loaded context assignment"
        );
        Ok(Assignment::new(context_id, server_id, row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pools::PoolRegistry;
    use crate::test_utils::{MockDriver, TEST_SERVER, TEST_SERVER_ID, test_database_config};

    async fn service(force_write_only: bool) -> (MockDriver, Arc<Pools<MockDriver>>, ConfigDatabaseService<MockDriver>) {
        let driver = MockDriver::new();
        let pools = Arc::new(Pools::new(driver.clone(), PoolRegistry::new()));
        let mut config = test_database_config();
        config.config_db.write_url = Some("mock://configdb-master".to_string());
        pools.start(&config).await.unwrap();
        let service = ConfigDatabaseService::new(pools.clone(), force_write_only);
        (driver, pools, service)
    }

    #[tokio::test]
    async fn test_read_and_write_pools() {
        let (driver, pools, service) = service(false).await;

        let read = service.read_only().await.unwrap();
        assert_eq!(read.pool_id(), CONFIGDB_READ_ID);
        read.release().await;

        let write = service.writable().await.unwrap();
        assert_eq!(write.pool_id(), CONFIGDB_WRITE_ID);
        write.release().await;

        assert_eq!(driver.db.fetch_attempts(CONFIGDB_READ_ID), 1);
        assert_eq!(driver.db.fetch_attempts(CONFIGDB_WRITE_ID), 1);
        pools.stop().await;
    }

    #[tokio::test]
    async fn test_force_write_only_reads_from_master() {
        let (driver, pools, service) = service(true).await;

        let read = service.read_only().await.unwrap();
        assert_eq!(read.pool_id(), CONFIGDB_WRITE_ID);
        read.release().await;
        assert_eq!(driver.db.fetch_attempts(CONFIGDB_READ_ID), 0);

        pools.stop().await;
    }

    #[tokio::test]
    async fn test_lookups() {
        let (driver, pools, service) = service(false).await;
        driver.db.assign(42, 2, 1, "ctx_a");
        driver.db.assign(43, 2, 1, "ctx_a");
        driver.db.assign(44, 1, 1, "ctx_b");
        driver.db.assign(45, 3, 3, "ctx_a");

        assert_eq!(service.server_id(TEST_SERVER).await.unwrap(), TEST_SERVER_ID);
        assert!(matches!(
            service.server_id("nope").await,
            Err(DbError::UnknownServer { name }) if name == "nope"
        ));

        assert_eq!(service.list_contexts(1).await.unwrap(), vec![42, 43, 44]);
        assert_eq!(service.list_contexts(2).await.unwrap(), vec![42, 43]);
        assert!(service.list_contexts(9).await.unwrap().is_empty());

        assert_eq!(service.contexts_in_schema(TEST_SERVER_ID, 1, "ctx_a").await.unwrap(), vec![42, 43]);

        let assignment = service.load_assignment(TEST_SERVER_ID, 42).await.unwrap();
        assert_eq!(assignment.read_pool_id, 2);
        assert_eq!(assignment.write_pool_id, 1);
        assert_eq!(assignment.schema, "ctx_a");
        assert_eq!(assignment.transaction(), None);

        assert!(matches!(
            service.load_assignment(TEST_SERVER_ID, 99).await,
            Err(DbError::NoAssignment { context_id: 99 })
        ));

        // every lookup handed its connection back
        let pool = pools.get_pool(CONFIGDB_READ_ID).await.unwrap();
        assert_eq!(ConnectionPool::stats(pool.as_ref()).active, 0);

        pools.stop().await;
    }
}
