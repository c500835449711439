//! Gateway configuration: an optional JSON file, overridden by CLI flags.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mysqlgate_core::{Error, Result};
use mysqlgate_pool::PoolConfig;
use mysqlgate_server::{Account, ServerConfig};

pub const DEFAULT_ADDR: &str = "0.0.0.0:3316";
pub const DEFAULT_DB: &str = "root:root@tcp(127.0.0.1:3306)/mysql?charset=utf8&parseTime=True";
pub const DEFAULT_LOG_LEVEL: &str = "info";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_lifetime_ms: u64,
    pub test_on_checkout: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            min_connections: pool.min_connections,
            max_connections: pool.max_connections,
            acquire_timeout_ms: pool.acquire_timeout_ms,
            idle_timeout_ms: pool.idle_timeout_ms,
            max_lifetime_ms: pool.max_lifetime_ms,
            test_on_checkout: pool.test_on_checkout,
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        PoolConfig::new(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout_ms)
            .idle_timeout(settings.idle_timeout_ms)
            .max_lifetime(settings.max_lifetime_ms)
            .test_on_checkout(settings.test_on_checkout)
    }
}

/// Everything the binary needs to start a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    /// Listen address
    pub addr: String,
    /// Backend DSN, Go style or `mysql://` URL
    pub db: String,
    pub log_level: String,
    pub accounts: Vec<AccountConfig>,
    pub server_version: Option<String>,
    /// Reject unparsable SQL before it reaches the backend
    pub enable_parser: bool,
    pub max_allowed_packet: Option<usize>,
    /// Idle poll interval in milliseconds
    pub idle_poll_ms: Option<u64>,
    pub pool: PoolSettings,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            db: DEFAULT_DB.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            accounts: vec![AccountConfig {
                user: "root".to_string(),
                password: "root".to_string(),
            }],
            server_version: None,
            enable_parser: false,
            max_allowed_packet: None,
            idle_poll_ms: None,
            pool: PoolSettings::default(),
        }
    }
}

impl GateConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid config: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&content)
    }

    /// Apply a `--user`/`--password` override. Either flag replaces the
    /// account list with one account; the missing half defaults to `root`.
    pub fn override_account(&mut self, user: Option<String>, password: Option<String>) {
        if user.is_none() && password.is_none() {
            return;
        }
        self.accounts = vec![AccountConfig {
            user: user.unwrap_or_else(|| "root".to_string()),
            password: password.unwrap_or_else(|| "root".to_string()),
        }];
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.addr.trim().is_empty() {
            return Err(Error::config("listen address cannot be empty"));
        }
        if self.db.trim().is_empty() {
            return Err(Error::config("backend DSN cannot be empty"));
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(Error::config(format!(
                "unknown log level {:?}, expected one of {}",
                self.log_level,
                LOG_LEVELS.join("|")
            )));
        }
        if self.accounts.is_empty() {
            return Err(Error::config("at least one account is required"));
        }
        if self.pool.max_connections == 0 {
            return Err(Error::config("pool.max_connections must be at least 1"));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(Error::config(
                "pool.min_connections cannot exceed pool.max_connections",
            ));
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new()
            .addr(self.addr.clone())
            .enable_parser(self.enable_parser)
            .pool(PoolConfig::from(&self.pool));
        config.accounts = self
            .accounts
            .iter()
            .map(|a| Account::new(a.user.clone(), a.password.clone()))
            .collect();
        if let Some(version) = &self.server_version {
            config = config.server_version(version.clone());
        }
        if let Some(size) = self.max_allowed_packet {
            config = config.max_allowed_packet(size);
        }
        if let Some(ms) = self.idle_poll_ms {
            config = config.idle_poll_interval(Duration::from_millis(ms));
        }
        config
    }
}
