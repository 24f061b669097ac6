//! Configuration management.
//!
//! Everything is read from environment variables with sensible defaults:
//!
//! - `BROKER_BIND_ADDR` - listen address (default `127.0.0.1:3300`)
//! - `BROKER_ENV` - `development` or `production`; production hides `/api/debug/state`
//! - `BROKER_ENABLE_INTROSPECTION` - force the debug endpoint on or off
//! - `BROKER_WORKSPACES_ROOT` - directory holding workspaces (default `./workspaces`)
//! - `BROKER_ENGINE` - `cli` (default) or `scripted`
//! - `BROKER_POOL_ENABLED`, `BROKER_POOL_MAX_WORKERS`, `BROKER_POOL_IDLE_TIMEOUT_SECS`,
//!   `BROKER_POOL_EVICTION_INTERVAL_SECS`, `BROKER_POOL_READY_TIMEOUT_SECS`
//! - `BROKER_STOP_TIMEOUT_MS` - graceful stop budget on cancel (default 3000)
//! - `BROKER_AGENT_CLI`, `BROKER_AGENT_ARGS`, `BROKER_WORKER_ARGS` - agent command line
//! - `BROKER_DEFAULT_MODEL` - model used when a request names none

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::backend::CliConfig;
use crate::bridge::BridgeConfig;
use crate::pool::PoolConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Agent CLI processes.
    Cli,
    /// In-process canned responses.
    Scripted,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub environment: String,
    /// Whether `/api/debug/state` is mounted.
    pub introspection: bool,
    pub workspaces_root: PathBuf,
    pub engine: EngineKind,
    pub cli: CliConfig,
    pub pool: PoolConfig,
    pub bridge: BridgeConfig,
    pub default_model: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3300)),
            environment: "development".to_string(),
            introspection: true,
            workspaces_root: PathBuf::from("./workspaces"),
            engine: EngineKind::Cli,
            cli: CliConfig::default(),
            pool: PoolConfig::default(),
            bridge: BridgeConfig::default(),
            default_model: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        if let Some(addr) = var("BROKER_BIND_ADDR") {
            config.bind_addr = parse("BROKER_BIND_ADDR", &addr)?;
        }
        if let Some(environment) = var("BROKER_ENV") {
            config.environment = environment.to_lowercase();
        }
        config.introspection = match var("BROKER_ENABLE_INTROSPECTION") {
            Some(value) => parse_bool("BROKER_ENABLE_INTROSPECTION", &value)?,
            None => !config.is_production(),
        };
        if let Some(root) = var("BROKER_WORKSPACES_ROOT") {
            config.workspaces_root = PathBuf::from(root);
        }
        if let Some(engine) = var("BROKER_ENGINE") {
            config.engine = match engine.to_lowercase().as_str() {
                "cli" => EngineKind::Cli,
                "scripted" => EngineKind::Scripted,
                _ => return Err(invalid("BROKER_ENGINE", &engine, "expected `cli` or `scripted`")),
            };
        }

        if let Some(value) = var("BROKER_POOL_ENABLED") {
            config.pool.enabled = parse_bool("BROKER_POOL_ENABLED", &value)?;
        }
        if let Some(value) = var("BROKER_POOL_MAX_WORKERS") {
            config.pool.max_workers = parse("BROKER_POOL_MAX_WORKERS", &value)?;
            if config.pool.max_workers == 0 {
                return Err(invalid("BROKER_POOL_MAX_WORKERS", &value, "must be at least 1"));
            }
        }
        if let Some(value) = var("BROKER_POOL_IDLE_TIMEOUT_SECS") {
            config.pool.idle_timeout = Duration::from_secs(parse("BROKER_POOL_IDLE_TIMEOUT_SECS", &value)?);
        }
        if let Some(value) = var("BROKER_POOL_EVICTION_INTERVAL_SECS") {
            let secs: u64 = parse("BROKER_POOL_EVICTION_INTERVAL_SECS", &value)?;
            if secs == 0 {
                return Err(invalid("BROKER_POOL_EVICTION_INTERVAL_SECS", &value, "must be at least 1"));
            }
            config.pool.eviction_interval = Duration::from_secs(secs);
        }
        if let Some(value) = var("BROKER_POOL_READY_TIMEOUT_SECS") {
            config.pool.ready_timeout = Duration::from_secs(parse("BROKER_POOL_READY_TIMEOUT_SECS", &value)?);
        }

        if let Some(value) = var("BROKER_STOP_TIMEOUT_MS") {
            config.bridge.stop_timeout = Duration::from_millis(parse("BROKER_STOP_TIMEOUT_MS", &value)?);
        }
        // Cancel callers wait for the stop budget plus time for cleanup itself.
        config.bridge.cancel_wait = config.bridge.stop_timeout + Duration::from_secs(2);

        if let Some(program) = var("BROKER_AGENT_CLI") {
            config.cli.program = PathBuf::from(program);
        }
        if let Some(args) = var("BROKER_AGENT_ARGS") {
            config.cli.args = split_args(&args);
        }
        if let Some(args) = var("BROKER_WORKER_ARGS") {
            config.cli.worker_args = split_args(&args);
        }
        config.default_model = var("BROKER_DEFAULT_MODEL");

        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

fn invalid(name: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| invalid(name, value, e.to_string()))
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value, "expected a boolean")),
    }
}

fn split_args(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr.port(), 3300);
        assert!(config.introspection);
        assert!(config.pool.enabled);
        assert_eq!(config.pool.max_workers, 4);
        assert_eq!(config.engine, EngineKind::Cli);
        assert_eq!(config.cli.worker_args, vec!["--worker".to_string()]);
        assert_eq!(config.bridge.cancel_wait, Duration::from_secs(5));
    }

    #[test]
    fn production_hides_introspection_unless_forced() {
        let config = config_from(&[("BROKER_ENV", "production")]).unwrap();
        assert!(!config.introspection);

        let config = config_from(&[
            ("BROKER_ENV", "Production"),
            ("BROKER_ENABLE_INTROSPECTION", "yes"),
        ])
        .unwrap();
        assert!(config.is_production());
        assert!(config.introspection);
    }

    #[test]
    fn parses_pool_and_agent_settings() {
        let config = config_from(&[
            ("BROKER_POOL_ENABLED", "off"),
            ("BROKER_POOL_MAX_WORKERS", "8"),
            ("BROKER_POOL_IDLE_TIMEOUT_SECS", "90"),
            ("BROKER_STOP_TIMEOUT_MS", "500"),
            ("BROKER_AGENT_CLI", "/usr/local/bin/agent"),
            ("BROKER_AGENT_ARGS", "--json  --quiet"),
            ("BROKER_ENGINE", "scripted"),
            ("BROKER_DEFAULT_MODEL", "fast-model"),
        ])
        .unwrap();
        assert!(!config.pool.enabled);
        assert_eq!(config.pool.max_workers, 8);
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.bridge.stop_timeout, Duration::from_millis(500));
        assert_eq!(config.cli.args, vec!["--json".to_string(), "--quiet".to_string()]);
        assert_eq!(config.engine, EngineKind::Scripted);
        assert_eq!(config.default_model.as_deref(), Some("fast-model"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(config_from(&[("BROKER_POOL_ENABLED", "maybe")]).is_err());
        assert!(config_from(&[("BROKER_POOL_MAX_WORKERS", "0")]).is_err());
        assert!(config_from(&[("BROKER_BIND_ADDR", "not an address")]).is_err());
        let err = config_from(&[("BROKER_ENGINE", "gpt")]).unwrap_err();
        assert!(err.to_string().contains("BROKER_ENGINE"));
    }
}
