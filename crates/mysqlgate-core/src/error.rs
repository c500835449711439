//! Error types for MysqlGate.
//!
//! Errors fall into the categories the gateway reacts to differently:
//!
//! - [`ProtocolError`]: desynced sequence, malformed or oversized packets. Fatal.
//! - [`AuthError`]: bad credentials or an unsupported auth mode. The handshake
//!   ends with an ERR packet and the connection is closed.
//! - [`CommandError`]: a single command failed (unsupported, syntax, backend
//!   ERR). The client gets one ERR packet and the connection keeps going.
//! - [`ConnectionError`]: a socket (client or backend) is unusable. Fatal.

use std::fmt;

use crate::codes;

/// The primary error type for all gateway operations.
#[derive(Debug)]
pub enum Error {
    /// Wire-level errors
    Protocol(ProtocolError),
    /// Handshake authentication errors
    Auth(AuthError),
    /// Per-command errors
    Command(CommandError),
    /// Connection-related errors (connect, disconnect, partial writes)
    Connection(ConnectionError),
    /// Backend pool errors
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation was cancelled through a [`crate::CancelToken`]
    Cancelled,
}

/// A MySQL `(code, state, message)` triple, as carried by ERR packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MySqlError {
    pub code: u16,
    pub state: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Packet sequence number did not match the expected counter
    Desync,
    /// A field or packet could not be decoded
    Malformed,
    /// Payload exceeds the configured maximum
    TooLarge,
}

#[derive(Debug)]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub error: MySqlError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// Unknown user or wrong password
    AccessDenied,
    /// Auth response length matches no supported scramble
    UnsupportedAuthMode,
}

#[derive(Debug)]
pub struct CommandError {
    pub kind: CommandErrorKind,
    pub error: MySqlError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandErrorKind {
    /// Command recognised but deliberately not handled
    Unsupported,
    /// SQL failed to parse
    Syntax,
    /// Backend answered with an ERR packet
    Backend,
    /// A pipeline stage rejected the query
    Rejected,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection refused
    Refused,
    /// Authentication against the backend failed
    Authentication,
    /// Peer went away during an operation
    Disconnected,
    /// A write failed before any byte reached the socket
    NotSent,
    /// A packet was only partially written
    Broken,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool exhausted (no available connections)
    Exhausted,
    /// Connection checkout timeout
    Timeout,
    /// Pool is closed
    Closed,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl MySqlError {
    /// Build an error for a known code, formatting its message template.
    pub fn new(code: u16, args: &[&dyn fmt::Display]) -> Self {
        Self {
            code,
            state: codes::sql_state(code).to_string(),
            message: codes::format_message(code, args),
        }
    }

    /// Build an error for a code with a caller-supplied message.
    pub fn custom(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            state: codes::sql_state(code).to_string(),
            message: message.into(),
        }
    }

    /// Build an error from fields received off the wire.
    pub fn from_parts(code: u16, state: impl Into<String>, message: impl Into<String>) -> Self {
        let state = state.into();
        let state = if state.len() == 5 {
            state
        } else {
            codes::sql_state(code).to_string()
        };
        Self {
            code,
            state,
            message: message.into(),
        }
    }

    /// Wrap an arbitrary message as `ER_UNKNOWN_ERROR`.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::custom(codes::ER_UNKNOWN_ERROR, message)
    }
}

impl Error {
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::protocol(ProtocolErrorKind::Malformed, message)
    }

    pub fn auth(kind: AuthErrorKind, error: MySqlError) -> Self {
        Error::Auth(AuthError { kind, error })
    }

    pub fn command(kind: CommandErrorKind, error: MySqlError) -> Self {
        Error::Command(CommandError { kind, error })
    }

    /// A recognised command the gateway refuses to handle.
    pub fn unsupported(what: impl fmt::Display) -> Self {
        Self::command(
            CommandErrorKind::Unsupported,
            MySqlError::new(codes::ER_NOT_SUPPORTED_YET, &[&what]),
        )
    }

    /// A parse failure reported by the parser stage.
    pub fn syntax(message: impl Into<String>) -> Self {
        Self::command(
            CommandErrorKind::Syntax,
            MySqlError::custom(codes::ER_PARSE_ERROR, message),
        )
    }

    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Peer disconnected; keeps the underlying I/O error as the source.
    pub fn disconnected(message: impl Into<String>, source: std::io::Error) -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: message.into(),
            source: Some(Box::new(source)),
        })
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Does this error leave the client connection unusable?
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Protocol(_)
            | Error::Auth(_)
            | Error::Connection(_)
            | Error::Io(_)
            | Error::Cancelled => true,
            Error::Command(_) | Error::Pool(_) | Error::Config(_) => false,
        }
    }

    /// Was the failed write rejected before any byte was sent?
    pub fn is_retry_safe(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::NotSent,
                ..
            })
        )
    }

    /// The triple to serialize into an ERR packet for this error.
    ///
    /// Errors without a natural MySQL code become `ER_UNKNOWN_ERROR`.
    pub fn to_mysql_error(&self) -> MySqlError {
        match self {
            Error::Auth(e) => e.error.clone(),
            Error::Command(e) => e.error.clone(),
            Error::Protocol(e) => match e.kind {
                ProtocolErrorKind::Desync => MySqlError::new(codes::ER_NET_PACKETS_OUT_OF_ORDER, &[]),
                ProtocolErrorKind::TooLarge => MySqlError::new(codes::ER_NET_PACKET_TOO_LARGE, &[]),
                ProtocolErrorKind::Malformed => MySqlError::unknown(e.message.clone()),
            },
            Error::Cancelled => MySqlError::new(codes::ER_QUERY_INTERRUPTED, &[]),
            other => MySqlError::unknown(other.to_string()),
        }
    }
}

impl fmt::Display for MySqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR {} ({}): {}", self.code, self.state, self.message)
    }
}

impl std::error::Error for MySqlError {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Auth(e) => write!(f, "Authentication error: {}", e.error),
            Error::Command(e) => write!(f, "{}", e.error),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Auth(e) => Some(&e.error),
            Error::Command(e) => Some(&e.error),
            Error::Io(e) => Some(e),
            Error::Cancelled => None,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;
