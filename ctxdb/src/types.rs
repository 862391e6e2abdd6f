//! Common identifier types.
//!
//! - [`ContextId`]: a tenant ("context"); every context lives in one schema
//! - [`PoolId`]: one physical database pool/shard as configured in `db_pool`
//! - [`ServerId`]: the application server a context is registered with
//!
//! Two pool ids are reserved for the configuration database, see
//! [`CONFIGDB_READ_ID`] and [`CONFIGDB_WRITE_ID`].

use serde::{Deserialize, Serialize};
use std::fmt;

// Type aliases for IDs
pub type ContextId = i32;
pub type PoolId = i32;
pub type ServerId = i32;

/// Reserved pool id of the configuration database read pool.
pub const CONFIGDB_READ_ID: PoolId = -1;

/// Reserved pool id of the configuration database write pool.
pub const CONFIGDB_WRITE_ID: PoolId = -2;

/// How a connection is fetched from and returned to its pool.
///
/// `Timeout` fetches wait at most the pool's `max_wait` and the connection is
/// subject to the `max_use_time` check when it is returned. `NoTimeout`
/// fetches wait until a connection becomes available and are never reported
/// for long use, which is what long running schema updates need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    Timeout,
    NoTimeout,
}

impl FetchStrategy {
    pub fn is_timeout(self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchStrategy::Timeout => write!(f, "timeout"),
            FetchStrategy::NoTimeout => write!(f, "no-timeout"),
        }
    }
}

/// Monitoring name of a pool, as shown in metrics labels and logs
pub fn pool_name(pool_id: PoolId) -> String {
    match pool_id {
        CONFIGDB_READ_ID => "ConfigDB Read".to_string(),
        CONFIGDB_WRITE_ID => "ConfigDB Write".to_string(),
        id => format!("DB Pool {id}"),
    }
}
