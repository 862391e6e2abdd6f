//! PostgreSQL driver on top of sqlx.
//!
//! Each pool id gets its own lazily connecting [`PgPool`]. Exhaustion handling
//! follows the pool's [`ExhaustedAction`]: `Block` pools make callers wait
//! (bounded by `max_wait` for [`FetchStrategy::Timeout`]), `Grow` pools open
//! overflow connections outside the pool that are closed again on return.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection as _, FromRow, PgConnection, PgPool, Postgres};
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{ExhaustedAction, PoolConfig};
use crate::db::driver::{AssignmentRow, ConfigDbQueries, Connection, ConnectionData, ConnectionPool, Driver, PoolStats};
use crate::types::{ContextId, FetchStrategy, PoolId, ServerId};

/// Driver names in `db_pool.driver` served by [`PgDriver`]
const ACCEPTED_DRIVERS: &[&str] = &["postgres", "postgresql", "org.postgresql.Driver"];

const APPLICATION_NAME: &str = "ctxdb";

const INCREMENT_TRANSACTION: &str = "UPDATE replication_monitor \
     SET transaction = CASE WHEN transaction = 9223372036854775807 THEN (-9223372036854775807 - 1) ELSE transaction + 1 END \
     WHERE cid = $1";

const SELECT_TRANSACTION: &str = "SELECT transaction FROM replication_monitor WHERE cid = $1";

#[derive(Debug, Clone, Copy, Default)]
pub struct PgDriver;

impl Driver for PgDriver {
    type Pool = PgConnectionPool;

    fn accepts(&self, driver: &str) -> bool {
        ACCEPTED_DRIVERS.iter().any(|name| name.eq_ignore_ascii_case(driver))
    }

    fn default_name(&self) -> &'static str {
        ACCEPTED_DRIVERS[0]
    }

    fn create_pool(&self, data: &ConnectionData, config: &PoolConfig) -> Result<PgConnectionPool, sqlx::Error> {
        let options = connect_options(data)?;
        debug!(pool_id = data.pool_id, url = %redacted_url(&data.url), "Creating lazy PostgreSQL pool");
        Ok(PgConnectionPool::with_options(data.pool_id, options, config))
    }
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

/// Connect options of a `db_pool` row. JDBC style URLs (`jdbc:postgresql://...`)
/// are accepted, explicit login and password override the URL credentials.
fn connect_options(data: &ConnectionData) -> Result<PgConnectOptions, sqlx::Error> {
    let url = data.url.strip_prefix("jdbc:").unwrap_or(&data.url);
    let mut options = PgConnectOptions::from_str(url)?.application_name(APPLICATION_NAME);
    if let Some(login) = data.login.as_deref().filter(|login| !login.is_empty()) {
        options = options.username(login);
    }
    if let Some(password) = data.password.as_deref().filter(|password| !password.is_empty()) {
        options = options.password(password);
    }
    Ok(options)
}

/// URL with the password masked, for logging
pub fn redacted_url(raw: &str) -> String {
    let stripped = raw.strip_prefix("jdbc:").unwrap_or(raw);
    match url::Url::parse(stripped) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}

/// Quote a schema name for `search_path`
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub struct PgConnectionPool {
    pool_id: PoolId,
    pool: PgPool,
    options: PgConnectOptions,
    config: PoolConfig,
    /// Open connections beyond `max_active` of `Grow` pools
    overflow: AtomicUsize,
}

impl PgConnectionPool {
    /// Lazily connecting pool for already resolved connect options
    pub fn with_options(pool_id: PoolId, options: PgConnectOptions, config: &PoolConfig) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_active)
            .min_connections(config.min_idle)
            .acquire_timeout(config.max_wait)
            .idle_timeout(non_zero(config.max_idle_time))
            .max_lifetime(non_zero(config.max_life_time))
            .connect_lazy_with(options.clone());

        Self {
            pool_id,
            pool,
            options,
            config: config.clone(),
            overflow: AtomicUsize::new(0),
        }
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Pool at its limit with nothing idle
    fn is_exhausted(&self) -> bool {
        self.pool.num_idle() == 0 && self.pool.size() >= self.config.max_active
    }

    async fn acquire_blocking(&self, strategy: FetchStrategy) -> Result<PoolConnection<Postgres>, sqlx::Error> {
        loop {
            match self.pool.acquire().await {
                Ok(conn) => return Ok(conn),
                // connect failures surface as timeouts too, only keep waiting on a full pool
                Err(sqlx::Error::PoolTimedOut) if !strategy.is_timeout() && self.is_exhausted() => {
                    debug!(pool_id = self.pool_id, "Pool exhausted, waiting for a connection");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn acquire_growing(&self) -> Result<PgPooledConnection, sqlx::Error> {
        if let Some(conn) = self.pool.try_acquire() {
            return Ok(PgPooledConnection::new(PgConnectionKind::Pooled(conn)));
        }
        if !self.is_exhausted() {
            let conn = self.pool.acquire().await?;
            return Ok(PgPooledConnection::new(PgConnectionKind::Pooled(conn)));
        }

        let conn = PgConnection::connect_with(&self.options).await?;
        let overflow = self.overflow.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(pool_id = self.pool_id, overflow, "Pool exhausted, opened overflow connection");
        Ok(PgPooledConnection::new(PgConnectionKind::Overflow(conn)))
    }
}

#[async_trait]
impl ConnectionPool for PgConnectionPool {
    type Connection = PgPooledConnection;

    async fn get(&self, strategy: FetchStrategy) -> Result<PgPooledConnection, sqlx::Error> {
        match self.config.exhausted_action {
            ExhaustedAction::Grow => self.acquire_growing().await,
            ExhaustedAction::Block => {
                let conn = self.acquire_blocking(strategy).await?;
                Ok(PgPooledConnection::new(PgConnectionKind::Pooled(conn)))
            }
        }
    }

    async fn back(&self, conn: PgPooledConnection, strategy: FetchStrategy) -> Result<(), sqlx::Error> {
        let held = conn.fetched_at.elapsed();
        match conn.kind {
            PgConnectionKind::Overflow(conn) => {
                self.overflow.fetch_sub(1, Ordering::Relaxed);
                conn.close().await
            }
            PgConnectionKind::Pooled(conn) => {
                if strategy.is_timeout() && !self.config.max_use_time.is_zero() && held > self.config.max_use_time {
                    warn!(
                        pool_id = self.pool_id,
                        held = ?held,
                        max_use_time = ?self.config.max_use_time,
                        "Connection was used longer than allowed, closing it"
                    );
                    return conn.close().await;
                }
                if self.pool.num_idle() >= self.config.max_idle as usize {
                    return conn.close().await;
                }
                drop(conn);
                Ok(())
            }
        }
    }

    fn stats(&self) -> PoolStats {
        let idle = self.pool.num_idle();
        let open = self.pool.size() as usize;
        PoolStats {
            active: open.saturating_sub(idle) + self.overflow.load(Ordering::Relaxed),
            idle,
        }
    }

    fn max_active(&self) -> u32 {
        self.config.max_active
    }

    async fn destroy(&self) {
        self.pool.close().await;
    }
}

enum PgConnectionKind {
    Pooled(PoolConnection<Postgres>),
    Overflow(PgConnection),
}

/// A connection of a [`PgConnectionPool`]. Dereferences to [`PgConnection`].
pub struct PgPooledConnection {
    kind: PgConnectionKind,
    fetched_at: Instant,
}

impl PgPooledConnection {
    fn new(kind: PgConnectionKind) -> Self {
        Self {
            kind,
            fetched_at: Instant::now(),
        }
    }
}

impl Deref for PgPooledConnection {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match &self.kind {
            PgConnectionKind::Pooled(conn) => conn,
            PgConnectionKind::Overflow(conn) => conn,
        }
    }
}

impl DerefMut for PgPooledConnection {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match &mut self.kind {
            PgConnectionKind::Pooled(conn) => conn,
            PgConnectionKind::Overflow(conn) => conn,
        }
    }
}

async fn increment_in(conn: &mut PgConnection, context_id: ContextId) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query(INCREMENT_TRANSACTION).bind(context_id).execute(&mut *conn).await?;
    sqlx::query_scalar::<_, i64>(SELECT_TRANSACTION)
        .bind(context_id)
        .fetch_optional(&mut *conn)
        .await
}

#[async_trait]
impl Connection for PgPooledConnection {
    async fn catalog(&mut self) -> Result<String, sqlx::Error> {
        let schema = sqlx::query_scalar::<_, Option<String>>("SELECT current_schema()")
            .fetch_one(&mut **self)
            .await?;
        Ok(schema.unwrap_or_default())
    }

    async fn set_catalog(&mut self, schema: &str) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT set_config('search_path', $1, false)")
            .bind(quote_identifier(schema))
            .execute(&mut **self)
            .await?;

        // search_path accepts schemas that do not exist, current_schema() is NULL then
        let current = self.catalog().await?;
        if current != schema {
            return Err(sqlx::Error::Protocol(format!(
                "schema '{schema}' is not available, current schema is '{current}'"
            )));
        }
        Ok(())
    }

    async fn replication_transaction(&mut self, context_id: ContextId) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(SELECT_TRANSACTION)
            .bind(context_id)
            .fetch_optional(&mut **self)
            .await
    }

    async fn increment_replication_transaction(&mut self, context_id: ContextId) -> Result<Option<i64>, sqlx::Error> {
        let mut tx = (**self).begin().await?;
        let result = increment_in(&mut tx, context_id).await;
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(context_id, error = %rollback, "Rollback of replication counter update failed");
                }
                Err(e)
            }
        }
    }

    async fn init_replication_transaction(&mut self, context_id: ContextId) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS replication_monitor (\
                 cid INTEGER NOT NULL PRIMARY KEY, \
                 transaction BIGINT NOT NULL DEFAULT 0)",
        )
        .execute(&mut **self)
        .await?;
        sqlx::query("INSERT INTO replication_monitor (cid, transaction) VALUES ($1, 0) ON CONFLICT (cid) DO NOTHING")
            .bind(context_id)
            .execute(&mut **self)
            .await?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct DbPoolRow {
    db_pool_id: i32,
    url: String,
    driver: String,
    login: Option<String>,
    password: Option<String>,
    hardlimit: bool,
    max: i32,
    initial: i32,
}

impl From<DbPoolRow> for ConnectionData {
    fn from(row: DbPoolRow) -> Self {
        let max = u32::try_from(row.max).unwrap_or(0).max(1);
        ConnectionData {
            pool_id: row.db_pool_id,
            url: row.url,
            driver: row.driver,
            login: row.login,
            password: row.password,
            max,
            min: u32::try_from(row.initial).unwrap_or(0),
            block: row.hardlimit,
        }
    }
}

#[derive(Debug, FromRow)]
struct AssignmentDbRow {
    read_db_pool_id: i32,
    write_db_pool_id: i32,
    db_schema: String,
}

#[async_trait]
impl ConfigDbQueries for PgPooledConnection {
    async fn connection_data(&mut self, pool_id: PoolId) -> Result<Option<ConnectionData>, sqlx::Error> {
        let row = sqlx::query_as::<_, DbPoolRow>(
            "SELECT db_pool_id, url, driver, login, password, hardlimit, max, initial FROM db_pool WHERE db_pool_id = $1",
        )
        .bind(pool_id)
        .fetch_optional(&mut **self)
        .await?;
        Ok(row.map(ConnectionData::from))
    }

    async fn server_id(&mut self, server_name: &str) -> Result<Option<ServerId>, sqlx::Error> {
        sqlx::query_scalar::<_, i32>("SELECT server_id FROM server WHERE name = $1")
            .bind(server_name)
            .fetch_optional(&mut **self)
            .await
    }

    async fn assignment(&mut self, server_id: ServerId, context_id: ContextId) -> Result<Option<AssignmentRow>, sqlx::Error> {
        let row = sqlx::query_as::<_, AssignmentDbRow>(
            "SELECT read_db_pool_id, write_db_pool_id, db_schema FROM context_server2db_pool WHERE server_id = $1 AND cid = $2",
        )
        .bind(server_id)
        .bind(context_id)
        .fetch_optional(&mut **self)
        .await?;
        Ok(row.map(|row| AssignmentRow {
            read_pool_id: row.read_db_pool_id,
            write_pool_id: row.write_db_pool_id,
            schema: row.db_schema,
        }))
    }

    async fn contexts_in_schema(
        &mut self,
        server_id: ServerId,
        write_pool_id: PoolId,
        schema: &str,
    ) -> Result<Vec<ContextId>, sqlx::Error> {
        sqlx::query_scalar::<_, i32>(
            "SELECT cid FROM context_server2db_pool \
             WHERE server_id = $1 AND write_db_pool_id = $2 AND db_schema = $3 ORDER BY cid",
        )
        .bind(server_id)
        .bind(write_pool_id)
        .bind(schema)
        .fetch_all(&mut **self)
        .await
    }

    async fn contexts_by_pool(&mut self, pool_id: PoolId) -> Result<Vec<ContextId>, sqlx::Error> {
        sqlx::query_scalar::<_, i32>(
            "SELECT DISTINCT cid FROM context_server2db_pool \
             WHERE read_db_pool_id = $1 OR write_db_pool_id = $1 ORDER BY cid",
        )
        .bind(pool_id)
        .fetch_all(&mut **self)
        .await
    }
}

/// Migrations creating the config database tables
pub fn configdb_migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
