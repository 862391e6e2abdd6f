//! Checked out connections.
//!
//! A [`PooledConnection`] owns a physical connection together with everything
//! needed to hand it back: the originating pool, the fetch strategy and, for
//! context connections, the replication bookkeeping that runs on release.
//! Release it with [`PooledConnection::release`]. A guard dropped without
//! release still returns its connection on a spawned task, but logs a warning,
//! since the replication counter update then happens after the caller moved on.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{error, warn};

use crate::db::assignment::Assignment;
use crate::db::driver::ConnectionPool;
use crate::db::pools::back_to_pool;
use crate::db::replication::ReplicationMonitor;
use crate::types::{FetchStrategy, PoolId};

const RELEASED: &str = "(bug) connection already released";

/// A connection fetched by the replication monitor, before it is wrapped
pub struct Fetched<P: ConnectionPool> {
    pub conn: P::Connection,
    pub pool: Arc<P>,
    pub pool_id: PoolId,
    /// Fetched from the master to serve a read
    pub used_as_read: bool,
}

enum Release {
    /// Hand the connection straight back to its pool
    Direct,
    /// Advance the context's replication counter first when this was a master write
    Replicated {
        monitor: Arc<ReplicationMonitor>,
        assignment: Arc<Assignment>,
        write: bool,
    },
}

struct Checkout<P: ConnectionPool> {
    fetched: Fetched<P>,
    strategy: FetchStrategy,
    release: Release,
}

impl<P: ConnectionPool> Checkout<P> {
    async fn release(self) {
        match self.release {
            Release::Direct => {
                let Fetched { conn, pool, pool_id, .. } = self.fetched;
                back_to_pool(pool.as_ref(), conn, pool_id, self.strategy).await;
            }
            Release::Replicated {
                monitor,
                assignment,
                write,
            } => {
                monitor
                    .back_and_increment_transaction(self.fetched, &assignment, self.strategy, write)
                    .await;
            }
        }
    }
}

/// A connection checked out of a pool. Dereferences to the driver connection.
pub struct PooledConnection<P: ConnectionPool> {
    checkout: Option<Checkout<P>>,
}

impl<P: ConnectionPool> PooledConnection<P> {
    pub(crate) fn direct(fetched: Fetched<P>, strategy: FetchStrategy) -> Self {
        Self {
            checkout: Some(Checkout {
                fetched,
                strategy,
                release: Release::Direct,
            }),
        }
    }

    pub(crate) fn replicated(
        fetched: Fetched<P>,
        strategy: FetchStrategy,
        monitor: Arc<ReplicationMonitor>,
        assignment: Arc<Assignment>,
        write: bool,
    ) -> Self {
        Self {
            checkout: Some(Checkout {
                fetched,
                strategy,
                release: Release::Replicated {
                    monitor,
                    assignment,
                    write,
                },
            }),
        }
    }

    fn checkout(&self) -> &Checkout<P> {
        self.checkout.as_ref().expect(RELEASED)
    }

    /// Pool the connection was taken from
    pub fn pool_id(&self) -> PoolId {
        self.checkout().fetched.pool_id
    }

    /// Whether a read was served by the master
    pub fn used_as_read(&self) -> bool {
        self.checkout().fetched.used_as_read
    }

    pub fn strategy(&self) -> FetchStrategy {
        self.checkout().strategy
    }

    /// Return the connection to its pool, advancing the replication counter
    /// after writes to a master with a separate replica.
    pub async fn release(mut self) {
        if let Some(checkout) = self.checkout.take() {
            checkout.release().await;
        }
    }
}

impl<P: ConnectionPool> Deref for PooledConnection<P> {
    type Target = P::Connection;

    fn deref(&self) -> &Self::Target {
        &self.checkout().fetched.conn
    }
}

impl<P: ConnectionPool> DerefMut for PooledConnection<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.checkout.as_mut().expect(RELEASED).fetched.conn
    }
}

impl<P: ConnectionPool> Drop for PooledConnection<P> {
    fn drop(&mut self) {
        let Some(checkout) = self.checkout.take() else {
            return;
        };

        let pool_id = checkout.fetched.pool_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(pool_id, "Connection dropped without release, returning it in the background");
                handle.spawn(checkout.release());
            }
            Err(_) => {
                error!(pool_id, "Connection dropped outside of a runtime, it is closed without being returned");
            }
        }
    }
}
