//! MysqlGate server binary.
//!
//! ```bash
//! # listen on 0.0.0.0:3316, forward to a local MySQL
//! mysqlgate --db 'root:root@tcp(127.0.0.1:3306)/mysql'
//!
//! # settings from a JSON file, listen address from the command line
//! mysqlgate --config /etc/mysqlgate.json --addr 127.0.0.1:4000
//! ```

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mysqlgate_core::Result;
use mysqlgate_mysql::MySqlConfig;
use mysqlgate_server::{MySqlBackend, MySqlParser, QueryPlan, Server, SqlParser};

use crate::config::GateConfig;

#[derive(Parser, Debug)]
#[command(name = "mysqlgate", version, about = "MySQL wire-protocol gateway")]
struct Args {
    /// Proxy listen address [default: 0.0.0.0:3316]
    #[arg(long, env = "MYSQLGATE_ADDR")]
    addr: Option<String>,

    /// Backend connection string, `user:pass@tcp(host:port)/db` or `mysql://` URL
    #[arg(long, env = "MYSQLGATE_DB")]
    db: Option<String>,

    /// Log level: debug|info|warn|error|fatal [default: info]
    #[arg(long, env = "MYSQLGATE_LOG")]
    log: Option<String>,

    /// User clients log in as [default: root]
    #[arg(long)]
    user: Option<String>,

    /// Password for --user [default: root]
    #[arg(long)]
    password: Option<String>,

    /// JSON configuration file; command-line flags take precedence
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the merged configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let print_config = args.print_config;

    let config = match load_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mysqlgate: {e}");
            return ExitCode::FAILURE;
        }
    };

    if print_config {
        return match config.to_json() {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("mysqlgate: {e}");
                ExitCode::FAILURE
            }
        };
    }

    init_logging(&config.log_level);

    if let Err(e) = run(&config) {
        tracing::error!(error = %e, "init server failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// `RUST_LOG` wins over the configured level when set.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .init();
}

fn load_config(args: Args) -> Result<GateConfig> {
    let mut config = match &args.config {
        Some(path) => GateConfig::from_file(path)?,
        None => GateConfig::default(),
    };
    if let Some(addr) = args.addr {
        config.addr = addr;
    }
    if let Some(db) = args.db {
        config.db = db;
    }
    if let Some(level) = args.log {
        config.log_level = match level.to_ascii_lowercase().as_str() {
            // accepted for compatibility; nothing logs above error
            "fatal" => "error".to_string(),
            other => other.to_string(),
        };
    }
    config.override_account(args.user, args.password);
    config.validate()?;
    Ok(config)
}

fn run(config: &GateConfig) -> Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting mysqlgate");

    let backend_config = MySqlConfig::from_dsn(&config.db)?;
    let server_config = config.server_config();
    let backend = MySqlBackend::new(backend_config, server_config.pool.clone())?;
    let parser = server_config
        .enable_parser
        .then(|| Arc::new(MySqlParser) as Arc<dyn SqlParser>);
    let plan = QueryPlan::standard(Arc::new(backend), parser);

    let handle = Server::new(server_config, plan).bind()?;
    tracing::info!(addr = %handle.local_addr(), "mysqlgate is ready to serve");
    handle.wait();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("mysqlgate").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn no_flags_gives_defaults() {
        let config = load_config(parse(&[])).unwrap();
        assert_eq!(config, GateConfig::default());
    }

    #[test]
    fn flags_override_defaults() {
        let config = load_config(parse(&[
            "--addr",
            "127.0.0.1:4000",
            "--db",
            "mysql://app:pw@db:3306/shop",
            "--log",
            "DEBUG",
            "--user",
            "app",
            "--password",
            "pw",
        ]))
        .unwrap();
        assert_eq!(config.addr, "127.0.0.1:4000");
        assert_eq!(config.db, "mysql://app:pw@db:3306/shop");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.accounts.len(), 1);
        assert_eq!(config.accounts[0].user, "app");
        assert_eq!(config.accounts[0].password, "pw");
    }

    #[test]
    fn flags_override_file() {
        let path = std::env::temp_dir().join(format!("mysqlgate-cli-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"addr": "10.0.0.1:3316", "log_level": "warn"}"#).unwrap();
        let config = load_config(parse(&[
            "--config",
            path.to_str().unwrap(),
            "--addr",
            "127.0.0.1:5000",
        ]));
        std::fs::remove_file(&path).unwrap();
        let config = config.unwrap();
        assert_eq!(config.addr, "127.0.0.1:5000");
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn bad_log_level_is_rejected() {
        assert!(load_config(parse(&["--log", "loud"])).is_err());
        assert_eq!(load_config(parse(&["--log", "fatal"])).unwrap().log_level, "error");
    }
}
