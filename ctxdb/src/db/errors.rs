use crate::types::{CONFIGDB_READ_ID, ContextId, PoolId};
use std::sync::Arc;
use thiserror::Error;

/// PostgreSQL `undefined_table`
const UNDEFINED_TABLE: &str = "42P01";

/// Errors surfaced by pool management, routing and the config database lookups
#[derive(Error, Debug)]
pub enum DbError {
    /// A pool was requested before `Pools::start`
    #[error("Database pools are not initialized")]
    NotInitialized,

    /// `Pools::start` was called twice. This is a wiring bug.
    #[error("Database pools are already initialized")]
    AlreadyInitialized,

    /// The driver named in `db_pool` is not supported by the configured driver
    #[error("No driver '{driver}' available for database pool {pool_id}")]
    NoDriver { pool_id: PoolId, driver: String },

    /// The config database has no `db_pool` row for this id
    #[error("No connection data found for database pool {pool_id}")]
    NoPoolData { pool_id: PoolId },

    /// Switching a freshly fetched connection to the context schema failed.
    /// The connection has already been returned to its pool.
    #[error("Cannot switch connection of pool {pool_id} to schema '{schema}'")]
    SchemaFailed {
        pool_id: PoolId,
        schema: String,
        #[source]
        source: sqlx::Error,
    },

    /// No connection could be fetched from a context database pool
    #[error("Cannot get connection to database pool {pool_id}")]
    NoConnection {
        pool_id: PoolId,
        #[source]
        source: sqlx::Error,
    },

    /// No connection could be fetched from the config database
    #[error("Cannot get connection to config database")]
    NoConfigDb {
        #[source]
        source: sqlx::Error,
    },

    /// The context is not registered with this server
    #[error("Cannot find database assignment for context {context_id}")]
    NoAssignment { context_id: ContextId },

    /// The configured server name is unknown to the config database
    #[error("Server '{name}' is not registered in the config database")]
    UnknownServer { name: String },

    /// Resolving an assignment failed for another reason. Shared between
    /// concurrent lookups of the same context.
    #[error("Cannot resolve database assignment for context {context_id}")]
    AssignmentLookup {
        context_id: ContextId,
        #[source]
        source: Arc<DbError>,
    },

    /// Plain SQL failure while loading metadata or maintaining counters
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

impl DbError {
    /// Classify a failed fetch. The config database read pool reports
    /// [`DbError::NoConfigDb`], every other pool [`DbError::NoConnection`].
    pub fn no_connection(pool_id: PoolId, source: sqlx::Error) -> Self {
        if pool_id == CONFIGDB_READ_ID {
            DbError::NoConfigDb { source }
        } else {
            DbError::NoConnection { pool_id, source }
        }
    }

    /// Whether this error is a failed fetch, the only failure the replication
    /// monitor recovers from by falling back to the master.
    pub fn is_no_connection(&self) -> bool {
        matches!(self, DbError::NoConnection { .. } | DbError::NoConfigDb { .. })
    }
}

/// Whether a SQL error means the queried table does not exist
pub fn is_missing_table(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db_err| db_err.code())
        .is_some_and(|code| code == UNDEFINED_TABLE)
}

/// Type alias for database operation results
pub type Result<T> = std::result::Result<T, DbError>;
