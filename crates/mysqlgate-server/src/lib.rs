//! The client-facing half of MysqlGate.
//!
//! A [`Server`] accepts TCP connections and runs one [`ClientConnection`] per
//! socket on its own thread. Each connection authenticates the client, then
//! reads commands and hands `COM_QUERY`/`COM_INIT_DB` to a shared
//! [`QueryPlan`]: an ordered list of [`Stage`]s that may inspect, rewrite,
//! abort or execute the query.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mysqlgate_mysql::MySqlConfig;
//! use mysqlgate_server::{MySqlBackend, MySqlParser, QueryPlan, Server, ServerConfig};
//!
//! # fn main() -> mysqlgate_core::Result<()> {
//! let config = ServerConfig::new().addr("127.0.0.1:3316");
//! let backend = MySqlBackend::new(
//!     MySqlConfig::from_dsn("root:root@tcp(127.0.0.1:3306)/mysql")?,
//!     config.pool.clone(),
//! )?;
//! let plan = QueryPlan::standard(Arc::new(backend), Some(Arc::new(MySqlParser)));
//! let handle = Server::new(config, plan).bind()?;
//! handle.wait();
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod listener;
pub mod parser;
pub mod plan;

pub use backend::{Backend, Cursor, MySqlBackend, MySqlManager, Session};
pub use config::{Account, ServerConfig};
pub use connection::ClientConnection;
pub use handshake::{HandshakeResponse, HandshakeState, parse_handshake_response};
pub use listener::{ConnectionIdAllocator, Server, ServerHandle};
pub use parser::{MySqlParser, SqlParser};
pub use plan::{ExecuteStage, ParserStage, QueryContext, QueryPlan, Stage};
