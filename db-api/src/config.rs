use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;

use crate::backoff::{ProbeConfig, ProbeConfigError};
use crate::server::ServeConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "PORT", default = "3000")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub database: DatabaseConfig,

    #[envconfig(nested = true)]
    pub probe: ProbePolicyConfig,

    #[envconfig(default = "30000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub pool_monitor_interval: EnvMsDuration,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "false")]
    pub debug: bool,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn serve_config(&self) -> ServeConfig {
        ServeConfig {
            bind: self.bind(),
            drain_timeout: self.shutdown_timeout.0,
        }
    }
}

/// Connection settings, read from the same variables libpq uses.
#[derive(Envconfig, Clone)]
pub struct DatabaseConfig {
    #[envconfig(from = "PGHOST", default = "db")]
    pub host: String,

    #[envconfig(from = "PGUSER", default = "user")]
    pub user: String,

    #[envconfig(from = "PGPASSWORD", default = "pass")]
    pub password: String,

    #[envconfig(from = "PGDATABASE", default = "appdb")]
    pub database: String,

    #[envconfig(from = "PGPORT", default = "5432")]
    pub port: u16,

    #[envconfig(from = "MAX_PG_CONNECTIONS", default = "10")]
    pub max_connections: u32,

    #[envconfig(from = "PG_ACQUIRE_TIMEOUT", default = "5000")]
    pub acquire_timeout: EnvMsDuration,
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

#[derive(Envconfig, Clone)]
pub struct ProbePolicyConfig {
    #[envconfig(from = "PROBE_MAX_ATTEMPTS", default = "20")]
    pub max_attempts: u32,

    #[envconfig(from = "PROBE_INITIAL_DELAY", default = "2000")]
    pub initial_delay: EnvMsDuration,

    #[envconfig(from = "PROBE_MAX_DELAY", default = "10000")]
    pub max_delay: EnvMsDuration,

    #[envconfig(from = "PROBE_BACKOFF_FACTOR", default = "1.5")]
    pub backoff_factor: f64,
}

impl ProbePolicyConfig {
    pub fn to_probe_config(&self) -> Result<ProbeConfig, ProbeConfigError> {
        ProbeConfig::new(
            self.max_attempts,
            self.initial_delay.0,
            self.max_delay.0,
            self.backoff_factor,
        )
    }
}

/// Every timeout and delay in the environment is a whole number of milliseconds,
/// e.g. `SHUTDOWN_TIMEOUT=30000` or `PROBE_INITIAL_DELAY=2000`.
#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("expected milliseconds as an integer, got {input:?}")]
pub struct ParseEnvMsDurationError {
    input: String,
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(|ms| EnvMsDuration(time::Duration::from_millis(ms)))
            .map_err(|_| ParseEnvMsDurationError {
                input: s.to_owned(),
            })
    }
}
