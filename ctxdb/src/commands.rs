//! Operator commands of the `ctxdb` binary.
//!
//! Each command returns a serializable report; the binary prints it as JSON.

use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::db::DatabaseService;
use crate::db::driver::Driver;
use crate::db::errors::Result;
use crate::db::replication::ReplicationStats;
use crate::types::{ContextId, PoolId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextList {
    pub pool_id: PoolId,
    pub contexts: Vec<ContextId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaContexts {
    pub context_id: ContextId,
    pub schema: String,
    pub contexts: Vec<ContextId>,
}

/// Where the connections of a context were actually taken from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub context_id: ContextId,
    pub schema: String,
    pub read_pool_id: PoolId,
    pub write_pool_id: PoolId,
    /// Pool that served the read connection
    pub read_served_by: PoolId,
    /// The read was served by the master (replica down or lagging)
    pub read_used_master: bool,
    pub write_served_by: PoolId,
    pub replication: ReplicationStats,
}

/// Run the config database migrations against the write URL, or the read URL
/// if no separate write URL is configured.
pub async fn migrate(config: &Config) -> anyhow::Result<()> {
    let config_db = &config.database.config_db;
    let url = config_db
        .write_url
        .as_deref()
        .filter(|url| !url.is_empty())
        .unwrap_or(&config_db.read_url);

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(url)
        .await?;
    crate::migrator().run(&pool).await?;
    pool.close().await;

    info!("Config database migrations applied");
    Ok(())
}

pub async fn list_contexts<D: Driver>(service: &DatabaseService<D>, pool_id: PoolId) -> Result<ContextList> {
    let contexts = service.config_db().list_contexts(pool_id).await?;
    Ok(ContextList { pool_id, contexts })
}

pub async fn schema_contexts<D: Driver>(service: &DatabaseService<D>, context_id: ContextId) -> Result<SchemaContexts> {
    let schema = service.schema_name(context_id).await?;
    let contexts = service.contexts_in_same_schema(context_id).await?;
    Ok(SchemaContexts {
        context_id,
        schema,
        contexts,
    })
}

/// Fetch and release one read and one write connection of a context
pub async fn check<D: Driver>(service: &DatabaseService<D>, context_id: ContextId) -> Result<CheckReport> {
    let assignment = service.assignment(context_id).await?;

    let read = service.read_only(context_id).await?;
    let read_served_by = read.pool_id();
    let read_used_master = read.used_as_read();
    read.release().await;

    let write = service.writable(context_id).await?;
    let write_served_by = write.pool_id();
    write.release().await;

    Ok(CheckReport {
        context_id,
        schema: assignment.schema.clone(),
        read_pool_id: assignment.read_pool_id,
        write_pool_id: assignment.write_pool_id,
        read_served_by,
        read_used_master,
        write_served_by,
        replication: service.replication_stats(),
    })
}

pub async fn init_counter<D: Driver>(service: &DatabaseService<D>, context_id: ContextId) -> Result<()> {
    service.init_replication_counter(context_id).await?;
    info!(context_id, "Replication counter initialized");
    Ok(())
}
