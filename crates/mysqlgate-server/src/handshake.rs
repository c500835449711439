//! Server-role handshake and authentication.
//!
//! ```text
//! Init --initial handshake--> SentHandshake --> AwaitingResponse
//!      --verified--> Authenticated (OK sent, sequence reset)
//!      --rejected--> Rejected (ERR sent, connection closed by caller)
//! ```
//!
//! Credentials are checked by recomputing the scramble for the configured
//! account and comparing it with the client's auth response. The response
//! length selects the scheme: 20 bytes for mysql_native_password, 32 bytes for
//! caching_sha2_password. An empty response only matches an empty password.

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};

use mysqlgate_core::codes::{
    ER_ACCESS_DENIED_ERROR, ER_HANDSHAKE_ERROR, ER_NOT_SUPPORTED_AUTH_MODE,
};
use mysqlgate_core::{AuthErrorKind, Error, MySqlError, ProtocolErrorKind, Result};
use mysqlgate_mysql::auth::{
    NATIVE_SCRAMBLE_LENGTH, SCRAMBLE_LENGTH, SHA2_SCRAMBLE_LENGTH, caching_sha2_scramble,
    generate_scramble, native_password_scramble, scramble_eq,
};
use mysqlgate_mysql::protocol::{
    OkPacket, PacketIo, PacketReader, PacketWriter, capabilities, write_err_packet,
    write_ok_packet,
};

use crate::config::ServerConfig;

const PROTOCOL_VERSION: u8 = 10;
/// Value of the auth-plugin-data-length byte: 20 salt bytes plus the trailing NUL.
const AUTH_DATA_LEN: u8 = 0x15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    SentHandshake,
    AwaitingResponse,
    Authenticated,
    Rejected,
}

/// A decoded `HandshakeResponse41`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin: Option<String>,
}

/// Decode the client's handshake response.
///
/// The auth response is length-encoded, 1-byte-length-prefixed or
/// NUL-terminated depending on the client's capability flags, in that order
/// of precedence. A database is read only when `CLIENT_CONNECT_WITH_DB` is set
/// and bytes remain; if present it must be NUL-terminated.
pub fn parse_handshake_response(payload: &[u8]) -> Result<HandshakeResponse> {
    let mut r = PacketReader::new(payload);
    let caps = r.read_u32_le()?;
    if caps & capabilities::CLIENT_PROTOCOL_41 == 0 {
        return Err(Error::malformed(
            "client does not support the 4.1 protocol",
        ));
    }
    let max_packet_size = r.read_u32_le()?;
    let charset = r.read_u8()?;
    r.skip(23)?;
    let username = r.read_null_string()?;

    let auth_response = if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        r.read_lenenc_bytes()?
    } else if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        let len = r.read_u8()? as usize;
        r.read_bytes(len)?
    } else {
        r.read_null_bytes()?
    }
    .to_vec();

    let database = if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 && !r.is_empty() {
        Some(r.read_null_string()?).filter(|db| !db.is_empty())
    } else {
        None
    };

    let auth_plugin = if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
        let rest = r.read_rest();
        let name = rest.split(|&b| b == 0).next().unwrap_or_default();
        Some(String::from_utf8_lossy(name).into_owned())
    } else {
        None
    };

    Ok(HandshakeResponse {
        capabilities: caps,
        max_packet_size,
        charset,
        username,
        auth_response,
        database,
        auth_plugin,
    })
}

/// One server-side handshake with one client.
#[derive(Debug)]
pub struct Handshake<'a> {
    config: &'a ServerConfig,
    connection_id: u32,
    salt: [u8; SCRAMBLE_LENGTH],
    state: HandshakeState,
}

impl<'a> Handshake<'a> {
    pub fn new(config: &'a ServerConfig, connection_id: u32) -> Self {
        Self {
            config,
            connection_id,
            salt: generate_scramble(),
            state: HandshakeState::Init,
        }
    }

    /// Use a fixed salt instead of a random one.
    pub fn with_salt(mut self, salt: [u8; SCRAMBLE_LENGTH]) -> Self {
        self.salt = salt;
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn salt(&self) -> &[u8; SCRAMBLE_LENGTH] {
        &self.salt
    }

    /// The `HandshakeV10` payload.
    pub fn initial_packet(&self) -> Vec<u8> {
        let config = self.config;
        let mut w = PacketWriter::with_capacity(64 + config.server_version.len());
        w.write_u8(PROTOCOL_VERSION);
        w.write_null_string(&config.server_version);
        w.write_u32_le(self.connection_id);
        w.write_bytes(&self.salt[..8]);
        w.write_u8(0);
        w.write_u16_le(config.capabilities as u16);
        w.write_u8(config.charset);
        w.write_u16_le(config.status_flags);
        w.write_u16_le((config.capabilities >> 16) as u16);
        w.write_u8(AUTH_DATA_LEN);
        w.write_zeros(10);
        w.write_bytes(&self.salt[8..]);
        w.write_u8(0);
        if let Some(plugin) = config.auth_plugin() {
            w.write_null_string(plugin);
        }
        w.into_bytes()
    }

    /// Drive the whole exchange over `io`.
    ///
    /// On success the OK packet has been written and the sequence reset. On
    /// failure an ERR has been written where possible and the caller should
    /// close the connection.
    #[tracing::instrument(name = "handshake", skip_all, fields(connection_id = self.connection_id))]
    pub fn run<S: Read + Write>(
        &mut self,
        io: &mut PacketIo<S>,
        host: &str,
    ) -> Result<HandshakeResponse> {
        self.send_initial(io)?;
        self.read_response(io, host)
    }

    pub fn send_initial<S: Read + Write>(&mut self, io: &mut PacketIo<S>) -> Result<()> {
        io.reset_sequence();
        io.write_packet(&self.initial_packet())?;
        self.state = HandshakeState::SentHandshake;
        Ok(())
    }

    /// Read, decode and verify the client's response, answering OK or ERR.
    pub fn read_response<S: Read + Write>(
        &mut self,
        io: &mut PacketIo<S>,
        host: &str,
    ) -> Result<HandshakeResponse> {
        self.state = HandshakeState::AwaitingResponse;
        let payload = io.read_packet().inspect_err(|_| {
            self.state = HandshakeState::Rejected;
        })?;
        let response = match parse_handshake_response(&payload) {
            Ok(response) => response,
            Err(e) => {
                self.state = HandshakeState::Rejected;
                tracing::debug!(error = %e, "malformed handshake response");
                let err = MySqlError::new(ER_HANDSHAKE_ERROR, &[]);
                let _ = write_err_packet(io, self.config.capabilities, &err);
                return Err(e);
            }
        };

        if let Err(e) = self.verify(&response, host) {
            self.state = HandshakeState::Rejected;
            tracing::info!(user = %response.username, error = %e, "authentication failed");
            let _ = write_err_packet(io, self.config.capabilities, &e.to_mysql_error());
            return Err(e);
        }

        let ok = OkPacket {
            status_flags: self.config.status_flags,
            ..OkPacket::default()
        };
        write_ok_packet(io, self.config.capabilities & response.capabilities, &ok)?;
        io.reset_sequence();
        self.state = HandshakeState::Authenticated;
        tracing::debug!(user = %response.username, "client authenticated");
        Ok(response)
    }

    /// Check the response's credentials against the configured accounts.
    pub fn verify(&self, response: &HandshakeResponse, host: &str) -> Result<()> {
        let client = response.auth_response.as_slice();
        let denied = || {
            let using_password = if client.is_empty() { "NO" } else { "YES" };
            Error::auth(
                AuthErrorKind::AccessDenied,
                MySqlError::new(
                    ER_ACCESS_DENIED_ERROR,
                    &[&response.username, &host, &using_password],
                ),
            )
        };

        let account = self
            .config
            .find_account(&response.username)
            .ok_or_else(denied)?;
        let password = account.password.as_bytes();

        let unsupported = || {
            Error::auth(
                AuthErrorKind::UnsupportedAuthMode,
                MySqlError::new(ER_NOT_SUPPORTED_AUTH_MODE, &[]),
            )
        };

        let matched = match client.len() {
            // only passwordless accounts accept an empty response
            0 if password.is_empty() => true,
            NATIVE_SCRAMBLE_LENGTH => {
                !password.is_empty()
                    && scramble_eq(client, &native_password_scramble(password, &self.salt))
            }
            SHA2_SCRAMBLE_LENGTH => {
                !password.is_empty()
                    && scramble_eq(client, &caching_sha2_scramble(password, &self.salt))
            }
            _ => return Err(unsupported()),
        };
        if matched { Ok(()) } else { Err(denied()) }
    }
}

/// `Desync`/`Malformed` reading the response, as opposed to a credential failure.
pub(crate) fn is_protocol_failure(e: &Error) -> bool {
    matches!(
        e,
        Error::Protocol(p) if matches!(p.kind, ProtocolErrorKind::Desync | ProtocolErrorKind::Malformed)
    )
}
