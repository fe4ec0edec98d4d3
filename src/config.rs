//! Command-line flags and runtime tunables.
//!
//! Flags select what to proxy and how strictly (`Cli`). Resource limits and
//! timeouts come from `SPECGATE_*` environment variables (`RuntimeConfig`),
//! falling back to defaults with a warning when a value does not parse.

use std::time::Duration;

use clap::Parser;
use tracing::warn;

use crate::guard::DEFAULT_MAX_BODY_BYTES;

/// Validating reverse proxy that checks API responses against an OpenAPI contract.
#[derive(Debug, Clone, Parser)]
#[command(name = "specgate", version, about)]
pub struct Cli {
    /// Path or http(s) URL of the OpenAPI document
    #[arg(long, env = "SPECGATE_SPEC", default_value = "openapi.yaml")]
    pub spec: String,

    /// Upstream API base URL
    #[arg(long, env = "SPECGATE_UPSTREAM", default_value = "http://localhost:3000")]
    pub upstream: String,

    /// Port to listen on
    #[arg(long, env = "SPECGATE_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "SPECGATE_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Mode: strict|warn|report
    #[arg(long, env = "SPECGATE_MODE", default_value = "warn")]
    pub mode: String,

    /// Minimum log level: debug|info|warn|error
    #[arg(long, env = "SPECGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Start even if a remote spec is served from another origin than the upstream
    #[arg(long, env = "SPECGATE_ALLOW_ORIGIN_MISMATCH")]
    pub allow_origin_mismatch: bool,
}

/// Resource limits and timeouts for the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Byte ceiling for buffered response bodies.
    pub max_body_bytes: usize,
    /// Longest gap between two body frames while buffering.
    pub body_idle_timeout: Duration,
    /// Longest time to buffer one body.
    pub body_total_timeout: Duration,
    /// Deadline for a single schema validation.
    pub validation_timeout: Duration,
    /// Deadline for upstream response headers.
    pub upstream_timeout: Duration,
    pub max_connections: usize,
    pub tcp_nodelay: bool,
    pub tcp_keepalive_secs: u64,
    /// Time allowed for connections to drain on shutdown.
    pub shutdown_timeout: Duration,
    pub metrics_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            body_idle_timeout: Duration::from_secs(30),
            body_total_timeout: Duration::from_secs(60),
            validation_timeout: Duration::from_secs(10),
            upstream_timeout: Duration::from_secs(30),
            max_connections: 10_000,
            tcp_nodelay: true,
            tcp_keepalive_secs: 60,
            shutdown_timeout: Duration::from_secs(30),
            metrics_port: 9090,
        }
    }
}

impl RuntimeConfig {
    /// Read overrides from the environment.
    ///
    /// # Environment Variables
    /// - `SPECGATE_MAX_BODY_BYTES`
    /// - `SPECGATE_BODY_IDLE_TIMEOUT_SECS`
    /// - `SPECGATE_BODY_TOTAL_TIMEOUT_SECS`
    /// - `SPECGATE_VALIDATION_TIMEOUT_SECS`
    /// - `SPECGATE_UPSTREAM_TIMEOUT_SECS`
    /// - `SPECGATE_MAX_CONNECTIONS`
    /// - `SPECGATE_TCP_NODELAY`
    /// - `SPECGATE_TCP_KEEPALIVE_SECS`
    /// - `SPECGATE_SHUTDOWN_TIMEOUT_SECS`
    /// - `SPECGATE_METRICS_PORT`
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_body_bytes: parse_env_warn("SPECGATE_MAX_BODY_BYTES", default.max_body_bytes),
            body_idle_timeout: Duration::from_secs(parse_env_warn(
                "SPECGATE_BODY_IDLE_TIMEOUT_SECS",
                default.body_idle_timeout.as_secs(),
            )),
            body_total_timeout: Duration::from_secs(parse_env_warn(
                "SPECGATE_BODY_TOTAL_TIMEOUT_SECS",
                default.body_total_timeout.as_secs(),
            )),
            validation_timeout: Duration::from_secs(parse_env_warn(
                "SPECGATE_VALIDATION_TIMEOUT_SECS",
                default.validation_timeout.as_secs(),
            )),
            upstream_timeout: Duration::from_secs(parse_env_warn(
                "SPECGATE_UPSTREAM_TIMEOUT_SECS",
                default.upstream_timeout.as_secs(),
            )),
            max_connections: parse_env_warn("SPECGATE_MAX_CONNECTIONS", default.max_connections),
            tcp_nodelay: parse_env_warn("SPECGATE_TCP_NODELAY", default.tcp_nodelay),
            tcp_keepalive_secs: parse_env_warn(
                "SPECGATE_TCP_KEEPALIVE_SECS",
                default.tcp_keepalive_secs,
            ),
            shutdown_timeout: Duration::from_secs(parse_env_warn(
                "SPECGATE_SHUTDOWN_TIMEOUT_SECS",
                default.shutdown_timeout.as_secs(),
            )),
            metrics_port: parse_env_warn("SPECGATE_METRICS_PORT", default.metrics_port),
        }
    }

    /// Check that limits are usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_body_bytes == 0 {
            return Err("max_body_bytes must be greater than zero".to_string());
        }
        if self.max_connections == 0 {
            return Err("max_connections must be greater than zero".to_string());
        }
        if self.body_idle_timeout > self.body_total_timeout {
            return Err(format!(
                "body_idle_timeout ({:?}) must not exceed body_total_timeout ({:?})",
                self.body_idle_timeout, self.body_total_timeout
            ));
        }
        Ok(())
    }
}

/// Parse an environment variable, warning and falling back on invalid values.
fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
