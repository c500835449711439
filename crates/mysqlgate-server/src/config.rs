//! Server-role configuration.

use std::time::Duration;

use mysqlgate_mysql::protocol::{
    DEFAULT_MAX_ALLOWED_PACKET, capabilities, charset, server_status,
};
use mysqlgate_pool::PoolConfig;

/// A user allowed to log in to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub user: String,
    /// Plain-text password; empty means the client must send an empty auth response
    pub password: String,
}

impl Account {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address, `host:port`
    pub addr: String,
    /// Version string sent in the initial handshake
    pub server_version: String,
    /// Capability flags advertised to clients
    pub capabilities: u32,
    pub charset: u8,
    /// Status flags reported in OK/EOF packets the gateway writes itself
    pub status_flags: u16,
    pub accounts: Vec<Account>,
    pub max_allowed_packet: usize,
    /// How often an idle connection wakes up to check for shutdown
    pub idle_poll_interval: Duration,
    /// Install the SQL parser stage in front of execution. Off by default:
    /// the parser rejects some statements MySQL itself accepts.
    pub enable_parser: bool,
    /// Sizing of the backend connection pool
    pub pool: PoolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:3316".to_string(),
            server_version: "5.6.51".to_string(),
            capabilities: capabilities::DEFAULT_SERVER_FLAGS,
            charset: charset::DEFAULT_CHARSET,
            status_flags: server_status::SERVER_STATUS_AUTOCOMMIT,
            accounts: vec![Account::new("root", "root")],
            max_allowed_packet: DEFAULT_MAX_ALLOWED_PACKET,
            idle_poll_interval: Duration::from_millis(200),
            enable_parser: false,
            pool: PoolConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn server_version(mut self, version: impl Into<String>) -> Self {
        self.server_version = version.into();
        self
    }

    pub fn capabilities(mut self, flags: u32) -> Self {
        self.capabilities = flags;
        self
    }

    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    /// Replace the account list with a single account.
    pub fn account(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.accounts = vec![Account::new(user, password)];
        self
    }

    /// Add an account, keeping the existing ones.
    pub fn add_account(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.accounts.push(Account::new(user, password));
        self
    }

    pub fn max_allowed_packet(mut self, size: usize) -> Self {
        self.max_allowed_packet = size;
        self
    }

    pub fn idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    pub fn enable_parser(mut self, enabled: bool) -> Self {
        self.enable_parser = enabled;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn find_account(&self, user: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.user == user)
    }

    /// Auth plugin named in the initial handshake, if the plugin capability is advertised.
    pub fn auth_plugin(&self) -> Option<&'static str> {
        (self.capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0)
            .then_some(mysqlgate_mysql::auth::plugins::MYSQL_NATIVE_PASSWORD)
    }
}
