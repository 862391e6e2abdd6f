//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `CTXDB_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `CTXDB_` override YAML values
//! 3. **DATABASE_URL** - Special case: overrides `database.config_db.read_url` if set
//!
//! For nested values use double underscores, e.g. `CTXDB_DATABASE__POOL__MAX_ACTIVE=50`.
//!
//! ## Example
//!
//! ```yaml
//! database:
//!   server_name: app01
//!   config_db:
//!     read_url: postgres://configdb-replica/configdb
//!     write_url: postgres://configdb/configdb
//!   pool:
//!     max_active: 100
//!     max_wait: 10s
//!     exhausted_action: block
//!   cleaner_interval: 10s
//! metrics:
//!   enabled: true
//!   listen: 0.0.0.0:9464
//! ```

use clap::{Parser, Subcommand};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

use crate::db::driver::ConnectionData;
use crate::errors::Error;
use crate::types::{ContextId, PoolId};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "CTXDB_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the service.
    #[arg(long)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start pools, the cleaner and the metrics sampler and run until shutdown (default)
    Serve,
    /// Run the config database migrations
    Migrate,
    /// List all contexts using a pool for reading or writing
    ListContexts {
        #[arg(long)]
        pool_id: PoolId,
    },
    /// List all contexts sharing the schema of a context
    SchemaContexts {
        #[arg(long)]
        context: ContextId,
    },
    /// Fetch a read and a write connection for a context and report the routing
    Check {
        #[arg(long)]
        context: ContextId,
    },
    /// Create the replication counter row of a context in its database
    InitCounter {
        #[arg(long)]
        context: ContextId,
    },
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Set from the `DATABASE_URL` environment variable; replaces `database.config_db.read_url`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    /// Pools, config database and replication settings
    pub database: DatabaseConfig,
    /// Pool metrics sampling and Prometheus export
    pub metrics: MetricsConfig,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            database: DatabaseConfig::default(),
            metrics: MetricsConfig::default(),
            enable_otel_export: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Name of this server in the config database `server` table
    pub server_name: String,
    pub config_db: ConfigDbConfig,
    /// Default tuning of every pool; `db_pool` rows override max, min and block
    pub pool: PoolConfig,
    /// How often empty pools are removed
    #[serde(with = "humantime_serde")]
    pub cleaner_interval: Duration,
    pub replication_monitor: ReplicationMonitorConfig,
    pub assignment_cache: AssignmentCacheConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            server_name: "local".to_string(),
            config_db: ConfigDbConfig::default(),
            pool: PoolConfig::default(),
            cleaner_interval: Duration::from_secs(10),
            replication_monitor: ReplicationMonitorConfig::default(),
            assignment_cache: AssignmentCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigDbConfig {
    /// Connection URL of the config database (replica if `write_url` is set)
    pub read_url: String,
    /// Connection URL of the config database master. When absent the read
    /// pool serves writes as well.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_url: Option<String>,
    /// Serve config database reads from the write pool
    pub force_write_only: bool,
}

impl ConfigDbConfig {
    pub fn has_distinct_write_url(&self) -> bool {
        self.write_url.as_deref().is_some_and(|url| !url.is_empty() && url != self.read_url)
    }
}

/// What a pool does when all connections are in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    /// Wait for a connection to be returned
    Block,
    /// Open additional connections beyond `max_active`
    Grow,
}

/// Pool tuning parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Connections kept open while idle
    pub min_idle: u32,
    /// Returned connections beyond this number of idle ones are closed
    pub max_idle: u32,
    /// Maximum number of active connections
    pub max_active: u32,
    /// How long a `Timeout` fetch waits for a connection
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
    pub exhausted_action: ExhaustedAction,
    /// Connections older than this are closed (zero disables)
    #[serde(with = "humantime_serde")]
    pub max_life_time: Duration,
    /// Idle connections older than this are closed (zero disables)
    #[serde(with = "humantime_serde")]
    pub max_idle_time: Duration,
    /// `Timeout` connections held longer than this are reported and closed on return
    #[serde(with = "humantime_serde")]
    pub max_use_time: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_idle: 10,
            max_active: 100,
            max_wait: Duration::from_secs(10),
            exhausted_action: ExhaustedAction::Block,
            max_life_time: Duration::from_secs(600),
            max_idle_time: Duration::from_secs(60),
            max_use_time: Duration::from_secs(100),
        }
    }
}

impl PoolConfig {
    /// Clone this config and apply the per pool overrides of a `db_pool` row
    pub fn customize(&self, data: &ConnectionData) -> PoolConfig {
        let mut config = self.clone();
        config.max_active = data.max;
        config.min_idle = data.min.min(data.max);
        config.exhausted_action = if data.block {
            ExhaustedAction::Block
        } else {
            ExhaustedAction::Grow
        };
        config
    }

    pub fn blocks(&self) -> bool {
        self.exhausted_action == ExhaustedAction::Block
    }

    fn validate(&self, section: &str) -> Result<(), Error> {
        if self.max_active == 0 {
            return Err(Error::InvalidConfig {
                message: format!("{section}.max_active must be at least 1"),
            });
        }
        if self.min_idle > self.max_active {
            return Err(Error::InvalidConfig {
                message: format!(
                    "{section}.min_idle ({}) cannot be greater than max_active ({})",
                    self.min_idle, self.max_active
                ),
            });
        }
        if self.max_wait.is_zero() {
            return Err(Error::InvalidConfig {
                message: format!("{section}.max_wait must be greater than zero"),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationMonitorConfig {
    /// Check replica lag on reads and advance counters on master writes
    pub enabled: bool,
    /// Minimum time between two log lines about a missing `replication_monitor` table
    #[serde(with = "humantime_serde")]
    pub missing_table_log_interval: Duration,
}

impl Default for ReplicationMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            missing_table_log_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssignmentCacheConfig {
    /// Maximum number of cached context assignments
    pub max_capacity: u64,
    /// Assignments not used for this long are dropped
    #[serde(with = "humantime_serde")]
    pub time_to_idle: Duration,
}

impl Default for AssignmentCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 100_000,
            time_to_idle: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Install the Prometheus exporter
    pub enabled: bool,
    /// Address the Prometheus exporter listens on
    pub listen: SocketAddr,
    /// How often pool gauges are sampled
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: SocketAddr::from(([0, 0, 0, 0], 9464)),
            sample_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        if let Some(url) = config.database_url.take() {
            config.database.config_db.read_url = url;
        }

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let database = &self.database;

        if database.config_db.read_url.is_empty() {
            return Err(Error::InvalidConfig {
                message: "database.config_db.read_url is required (or set DATABASE_URL)".to_string(),
            });
        }

        if database.server_name.is_empty() {
            return Err(Error::InvalidConfig {
                message: "database.server_name cannot be empty".to_string(),
            });
        }

        database.pool.validate("database.pool")?;

        if database.cleaner_interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "database.cleaner_interval must be greater than zero".to_string(),
            });
        }

        if database.assignment_cache.max_capacity == 0 {
            return Err(Error::InvalidConfig {
                message: "database.assignment_cache.max_capacity must be at least 1".to_string(),
            });
        }

        if self.metrics.sample_interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "metrics.sample_interval must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values; CTXDB_CONFIG names the file itself
            .merge(Env::prefixed("CTXDB_").ignore(&["CONFIG"]).split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn args(path: &str) -> Args {
        Args {
            config: path.to_string(),
            validate: false,
            command: None,
        }
    }

    #[test]
    fn test_load_pool_settings() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
database:
  server_name: app01
  config_db:
    read_url: postgres://configdb-replica/configdb
    write_url: postgres://configdb/configdb
  pool:
    max_active: 25
    max_wait: 3s
    exhausted_action: grow
  cleaner_interval: 30s
"#,
            )?;

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.database.server_name, "app01");
            assert!(config.database.config_db.has_distinct_write_url());
            assert_eq!(config.database.pool.max_active, 25);
            assert_eq!(config.database.pool.max_wait, Duration::from_secs(3));
            assert_eq!(config.database.pool.exhausted_action, ExhaustedAction::Grow);
            // defaults survive partial sections
            assert_eq!(config.database.pool.max_use_time, Duration::from_secs(100));
            assert_eq!(config.database.cleaner_interval, Duration::from_secs(30));
            assert!(config.database.replication_monitor.enabled);

            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
database:
  config_db:
    read_url: postgres://configdb/configdb
"#,
            )?;

            jail.set_env("CTXDB_DATABASE__POOL__MAX_ACTIVE", "7");
            jail.set_env("CTXDB_DATABASE__SERVER_NAME", "app02");

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.database.pool.max_active, 7);
            assert_eq!(config.database.server_name, "app02");
            assert_eq!(config.database.config_db.read_url, "postgres://configdb/configdb");

            Ok(())
        });
    }

    #[test]
    fn test_config_file_variable_is_not_a_setting() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "ctxdb.yaml",
                r#"
database:
  server_name: app03
  config_db:
    read_url: postgres://configdb/configdb
"#,
            )?;
            jail.set_env("CTXDB_CONFIG", "ctxdb.yaml");

            let config = Config::load(&args("ctxdb.yaml"))?;
            assert_eq!(config.database.server_name, "app03");

            Ok(())
        });
    }

    #[test]
    fn test_database_url_overrides_read_url() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
database:
  config_db:
    read_url: postgres://configdb/configdb
"#,
            )?;
            jail.set_env("DATABASE_URL", "postgres://override/configdb");

            let config = Config::load(&args("test.yaml"))?;
            assert_eq!(config.database.config_db.read_url, "postgres://override/configdb");
            assert!(config.database_url.is_none());
            assert!(!config.database.config_db.has_distinct_write_url());

            Ok(())
        });
    }

    #[test]
    fn test_missing_read_url_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "enable_otel_export: false\n")?;
            let result = Config::load(&args("test.yaml"));
            assert!(result.is_err());
            Ok(())
        });
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
database:
  config_db:
    read_url: postgres://configdb/configdb
  pool:
    max_connections: 5
"#,
            )?;
            assert!(Config::load(&args("test.yaml")).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_validate_pool_limits() {
        let mut config = Config::default();
        config.database.config_db.read_url = "postgres://configdb/configdb".to_string();
        assert!(config.validate().is_ok());

        config.database.pool.min_idle = 200;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_idle"));

        config.database.pool.min_idle = 0;
        config.database.pool.max_active = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_customize_applies_pool_row() {
        let defaults = PoolConfig::default();
        let data = ConnectionData {
            pool_id: 7,
            url: "postgres://db7/ox".to_string(),
            driver: "postgres".to_string(),
            login: None,
            password: None,
            max: 5,
            min: 2,
            block: true,
        };

        let config = defaults.customize(&data);
        assert_eq!(config.max_active, 5);
        assert_eq!(config.min_idle, 2);
        assert_eq!(config.exhausted_action, ExhaustedAction::Block);
        assert_eq!(config.max_wait, defaults.max_wait);

        let grow = defaults.customize(&ConnectionData { block: false, min: 9, ..data });
        assert_eq!(grow.exhausted_action, ExhaustedAction::Grow);
        // min idle never exceeds the pool size
        assert_eq!(grow.min_idle, 5);
        // the defaults themselves are untouched
        assert_eq!(defaults.max_active, 100);
    }
}
