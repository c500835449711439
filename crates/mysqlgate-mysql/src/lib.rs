//! MySQL wire protocol for MysqlGate.
//!
//! - [`protocol`]: payload reader/writer, packet framing with sequence
//!   checking and splitting, OK/ERR/EOF/result-set encoders
//! - [`auth`]: password scrambles and handshake salt generation
//! - [`MySqlConnection`]: the client role, used to talk to backends
//! - [`MySqlConfig`]: backend settings, parsed from a DSN

pub mod auth;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod types;

pub use config::MySqlConfig;
pub use connection::{MySqlConnection, QueryResult, ServerHandshake, TextRow, parse_handshake};
pub use protocol::{Command, PacketIo, PacketReader, PacketWriter};
pub use types::{ColumnDef, FieldType};
