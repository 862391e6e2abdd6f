//! Database access layer.
//!
//! ```text
//! ┌──────────────────┐        ┌─────────────────────────┐
//! │ DatabaseService  │───────→│ ConfigDatabaseService   │ (assignments, servers)
//! └────────┬─────────┘        └────────────┬────────────┘
//!          │                               │
//!          ↓                               │
//! ┌──────────────────┐                     │
//! │ReplicationMonitor│ master/replica      │
//! └────────┬─────────┘ routing             │
//!          │                               │
//!          ↓                               ↓
//! ┌──────────────────────────────────────────────────────┐
//! │ Pools  (ConfigDB Read / ConfigDB Write / DB Pool <n>) │
//! └────────┬─────────────────────────────────────────────┘
//!          │ Driver / ConnectionPool / Connection
//!          ↓
//!     PostgreSQL (sqlx)
//! ```
//!
//! # Modules
//!
//! - [`service`]: connections per context, the entry point for callers
//! - [`configdb`]: config database lookups
//! - [`replication`]: replica fallback and lag detection
//! - [`pools`]: lazily created pools per pool id, cleaner and monitoring registry
//! - [`assignment`]: cached context assignments
//! - [`connection`]: checked out connection guard
//! - [`driver`]: traits between routing and a concrete database
//! - [`postgres`]: the sqlx PostgreSQL driver
//! - [`errors`]: database error type

pub mod assignment;
pub mod configdb;
pub mod connection;
pub mod driver;
pub mod errors;
pub mod pools;
pub mod postgres;
pub mod replication;
pub mod service;

pub use configdb::ConfigDatabaseService;
pub use connection::PooledConnection;
pub use postgres::PgDriver;
pub use service::DatabaseService;
