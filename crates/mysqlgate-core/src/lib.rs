//! Core types shared by every MysqlGate crate.
//!
//! - [`Error`] and its category payloads, classified as fatal or recoverable
//! - [`MySqlError`], the `(code, state, message)` triple carried by ERR packets
//! - [`codes`], the static table of known server error codes
//! - [`CancelToken`], the cooperative cancellation flag bound to a connection

pub mod cancel;
pub mod codes;
pub mod error;

pub use cancel::CancelToken;
pub use error::{
    AuthError, AuthErrorKind, CommandError, CommandErrorKind, ConfigError, ConnectionError,
    ConnectionErrorKind, Error, MySqlError, PoolError, PoolErrorKind, ProtocolError,
    ProtocolErrorKind, Result,
};
