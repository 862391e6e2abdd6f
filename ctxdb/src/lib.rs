//! # ctxdb: context database access layer
//!
//! `ctxdb` hands out database connections for *contexts* (tenants). Every
//! context lives in one schema of one database; which one is recorded in a
//! central configuration database. Many contexts share a database, and a
//! database may have a read replica.
//!
//! ## Overview
//!
//! A caller asks for a read or write connection for a context id. The
//! [`DatabaseService`](db::DatabaseService) looks up the context's assignment
//! (read pool, write pool, schema) in the config database and caches it. The
//! replication monitor then picks the physical pool: writes go to the master,
//! reads go to the replica unless the replica is unreachable or lags behind the
//! last write made through this process. The connection is switched to the
//! context schema and handed out as a [`PooledConnection`](db::PooledConnection).
//! Releasing it after a write advances the context's logical transaction
//! counter, which is what makes lag detection possible.
//!
//! Pools are created on first use from the `db_pool` table and removed again
//! by a periodic cleaner once they hold no connections.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use ctxdb::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = ctxdb::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     ctxdb::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!
//!     let service = app.service().clone();
//!     let conn = service.read_only(42).await?;
//!     // ... run queries against `&mut *conn` ...
//!     conn.release().await;
//!
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Config database
//!
//! The tables `server`, `db_pool` and `context_server2db_pool` are created by
//! the bundled migrations, see [`migrator`] and `ctxdb migrate`. Context
//! schemas carry a `replication_monitor` table with one counter row per context
//! (`ctxdb init-counter`).

pub mod commands;
pub mod config;
pub mod db;
pub mod errors;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod test;
#[cfg(test)]
pub mod test_utils;

use anyhow::Context as _;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use config::Config;

use db::driver::Driver;
use db::pools::{PoolMetricsConfig, run_pool_metrics_sampler};
use db::{DatabaseService, PgDriver};

/// Get the config database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    db::postgres::configdb_migrator()
}

fn install_prometheus_exporter(listen: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(%listen, "Prometheus exporter listening");
    Ok(())
}

/// The running service: database pools plus the background tasks around them.
pub struct Application<D: Driver = PgDriver> {
    config: Config,
    service: DatabaseService<D>,
}

impl Application<PgDriver> {
    /// Start the database service against PostgreSQL
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        Self::with_driver(PgDriver, config).await
    }
}

impl<D: Driver> Application<D> {
    pub async fn with_driver(driver: D, config: Config) -> anyhow::Result<Self> {
        debug!("Starting ctxdb with configuration: {:#?}", config);

        let service = DatabaseService::start(driver, &config.database)
            .await
            .context("Failed to start database service")?;

        Ok(Self { config, service })
    }

    pub fn service(&self) -> &DatabaseService<D> {
        &self.service
    }

    /// Run the metrics sampler (and exporter, if enabled) until `shutdown`
    /// completes, then stop all pools.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.config.metrics.enabled {
            install_prometheus_exporter(self.config.metrics.listen)?;
        }

        let shutdown_token = CancellationToken::new();
        let sampler = tokio::spawn(run_pool_metrics_sampler(
            self.service.registry().clone(),
            PoolMetricsConfig {
                sample_interval: self.config.metrics.sample_interval,
            },
            shutdown_token.clone(),
        ));

        info!(
            server_name = %self.config.database.server_name,
            server_id = self.service.server_id(),
            "ctxdb running"
        );
        shutdown.await;

        shutdown_token.cancel();
        match sampler.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Pool metrics sampler failed"),
            Err(e) => warn!(error = %e, "Pool metrics sampler panicked"),
        }

        info!("Closing database pools...");
        self.service.stop().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
