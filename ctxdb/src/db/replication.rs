//! Master/replica routing for context connections.
//!
//! Every context has a write pool (master) and a read pool, which is either the
//! same pool or a replica of it. Writes always go to the master. Reads go to
//! the replica, falling back to the master once when the replica cannot hand
//! out a connection.
//!
//! Replica lag is detected with a per context logical clock: each write to a
//! master with a separate replica advances the `replication_monitor` counter of
//! the context in the master database, and the new value is remembered on the
//! cached [`Assignment`]. A later read compares the counter it finds on the
//! replica with the remembered one and is redirected to the master while the
//! replica is behind. The check is best effort: concurrent writers may advance
//! the counter right after the comparison.

use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, trace, warn};

use crate::config::ReplicationMonitorConfig;
use crate::db::assignment::Assignment;
use crate::db::connection::Fetched;
use crate::db::driver::{Connection, ConnectionPool, Driver};
use crate::db::errors::{DbError, Result, is_missing_table};
use crate::db::pools::{Pools, back_to_pool};
use crate::types::{FetchStrategy, PoolId};

/// Whether a replica counter lags behind the counter remembered after the last
/// write. Uses the signed distance so that a counter wrapping at `i64::MAX`
/// still compares as newer.
pub fn is_behind(server: i64, cached: i64) -> bool {
    server.wrapping_sub(cached) < 0
}

/// Fetch counts since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationStats {
    pub master_fetches: u64,
    pub slave_fetches: u64,
}

/// Rate limit for the "table missing" log line, which would otherwise repeat on every write
struct MissingTableLog {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl MissingTableLog {
    fn should_log(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(at) if at.elapsed() < self.interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

pub struct ReplicationMonitor {
    enabled: bool,
    master_fetches: AtomicU64,
    slave_fetches: AtomicU64,
    missing_table: MissingTableLog,
}

impl ReplicationMonitor {
    pub fn new(config: &ReplicationMonitorConfig) -> Self {
        Self {
            enabled: config.enabled,
            master_fetches: AtomicU64::new(0),
            slave_fetches: AtomicU64::new(0),
            missing_table: MissingTableLog {
                interval: config.missing_table_log_interval,
                last: Mutex::new(None),
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            master_fetches: self.master_fetches.load(Ordering::Relaxed),
            slave_fetches: self.slave_fetches.load(Ordering::Relaxed),
        }
    }

    /// Fetch a connection for a context, switched to the context schema.
    ///
    /// Reads that cannot be served by the replica are retried once on the
    /// master, and reads finding a lagging replica are redirected to the
    /// master. In both cases the result is marked `used_as_read`.
    #[instrument(skip_all, fields(context_id = assignment.context_id, write = write, strategy = %strategy))]
    pub async fn check_actual_and_fallback<D: Driver>(
        &self,
        pools: &Pools<D>,
        assignment: &Assignment,
        strategy: FetchStrategy,
        write: bool,
    ) -> Result<Fetched<D::Pool>> {
        let pool_id = assignment.pool_id(write);

        let fetched = match self.fetch(pools, assignment, pool_id, strategy, false).await {
            Ok(fetched) => fetched,
            Err(e) if e.is_no_connection() && !write && assignment.has_replica() => {
                warn!(
                    read_pool_id = assignment.read_pool_id,
                    write_pool_id = assignment.write_pool_id,
                    error = %e,
                    "Cannot get connection to replica, falling back to master"
                );
                self.fetch(pools, assignment, assignment.write_pool_id, strategy, true).await?
            }
            Err(e) => return Err(e),
        };

        if write || fetched.used_as_read || !assignment.has_replica() || !self.enabled {
            return Ok(fetched);
        }
        let Some(cached) = assignment.transaction() else {
            return Ok(fetched);
        };

        self.ensure_current(pools, assignment, fetched, cached, strategy).await
    }

    /// Hand a context connection back to its pool. Genuine writes to a master
    /// with a separate replica advance the replication counter first.
    pub async fn back_and_increment_transaction<P: ConnectionPool>(
        &self,
        fetched: Fetched<P>,
        assignment: &Assignment,
        strategy: FetchStrategy,
        write: bool,
    ) {
        let Fetched {
            mut conn,
            pool,
            pool_id,
            used_as_read,
        } = fetched;

        if self.enabled && write && assignment.has_replica() && !used_as_read {
            match conn.increment_replication_transaction(assignment.context_id).await {
                Ok(Some(value)) => {
                    assignment.update_transaction(value);
                    trace!(context_id = assignment.context_id, transaction = value, "Advanced replication counter");
                }
                Ok(None) => debug!(
                    context_id = assignment.context_id,
                    pool_id, "No replication counter row for context, nothing to advance"
                ),
                Err(e) => self.log_counter_error(assignment, pool_id, &e),
            }
        }

        back_to_pool(pool.as_ref(), conn, pool_id, strategy).await;
    }

    async fn fetch<D: Driver>(
        &self,
        pools: &Pools<D>,
        assignment: &Assignment,
        pool_id: PoolId,
        strategy: FetchStrategy,
        used_as_read: bool,
    ) -> Result<Fetched<D::Pool>> {
        let pool = pools.get_pool(pool_id).await?;
        let mut conn = pool.get(strategy).await.map_err(|e| DbError::no_connection(pool_id, e))?;

        if let Err(source) = switch_catalog(&mut conn, &assignment.schema).await {
            back_to_pool(pool.as_ref(), conn, pool_id, strategy).await;
            return Err(DbError::SchemaFailed {
                pool_id,
                schema: assignment.schema.clone(),
                source,
            });
        }

        self.record_fetch(pool_id == assignment.write_pool_id);
        Ok(Fetched {
            conn,
            pool,
            pool_id,
            used_as_read,
        })
    }

    async fn ensure_current<D: Driver>(
        &self,
        pools: &Pools<D>,
        assignment: &Assignment,
        mut fetched: Fetched<D::Pool>,
        cached: i64,
        strategy: FetchStrategy,
    ) -> Result<Fetched<D::Pool>> {
        let server = match fetched.conn.replication_transaction(assignment.context_id).await {
            Ok(Some(server)) => server,
            Ok(None) => return Ok(fetched),
            Err(e) => {
                self.log_counter_error(assignment, fetched.pool_id, &e);
                return Ok(fetched);
            }
        };

        if !is_behind(server, cached) {
            return Ok(fetched);
        }

        debug!(
            context_id = assignment.context_id,
            replica = server,
            expected = cached,
            "Replica is behind, reading from master"
        );

        match self.fetch(pools, assignment, assignment.write_pool_id, strategy, true).await {
            Ok(master) => {
                let Fetched { conn, pool, pool_id, .. } = fetched;
                back_to_pool(pool.as_ref(), conn, pool_id, strategy).await;
                Ok(master)
            }
            Err(e) => {
                warn!(
                    context_id = assignment.context_id,
                    write_pool_id = assignment.write_pool_id,
                    error = %e,
                    "Cannot get connection to master, reading from lagging replica"
                );
                Ok(fetched)
            }
        }
    }

    fn record_fetch(&self, master: bool) {
        let (fetches, role) = if master {
            (&self.master_fetches, "master")
        } else {
            (&self.slave_fetches, "slave")
        };
        fetches.fetch_add(1, Ordering::Relaxed);
        counter!("ctxdb_replication_fetches_total", "role" => role).increment(1);
    }

    fn log_counter_error(&self, assignment: &Assignment, pool_id: PoolId, err: &sqlx::Error) {
        if is_missing_table(err) {
            if self.missing_table.should_log() {
                warn!(
                    context_id = assignment.context_id,
                    pool_id,
                    schema = %assignment.schema,
                    "Table replication_monitor is missing, replica lag cannot be detected"
                );
            }
        } else {
            error!(
                context_id = assignment.context_id,
                pool_id,
                error = %err,
                "Replication counter query failed"
            );
        }
    }
}

async fn switch_catalog<C: Connection>(conn: &mut C, schema: &str) -> std::result::Result<(), sqlx::Error> {
    if conn.catalog().await? != schema {
        conn.set_catalog(schema).await?;
    }
    Ok(())
}
