//! Backend connection (client role).
//!
//! [`MySqlConnection`] speaks the client side of the protocol to a real
//! MySQL-compatible server: it reads the server's initial handshake, answers
//! it (including auth switches and the caching_sha2_password fast and full
//! paths), and then runs text-protocol commands. Result sets are streamed
//! through a [`QueryResult`] cursor rather than buffered.
//!
//! A connection that hits an I/O or protocol error is marked broken and must
//! not be reused; ERR packets from the server leave it usable.

#![allow(clippy::cast_possible_truncation)]

use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use mysqlgate_core::{CommandErrorKind, ConnectionError, ConnectionErrorKind, Error, Result};

use crate::auth::{self, caching_sha2, plugins};
use crate::config::MySqlConfig;
use crate::protocol::{
    Command, EofPacket, ErrPacket, OkPacket, PacketIo, PacketReader, PacketType, PacketWriter,
    capabilities,
};
use crate::types::ColumnDef;

/// Fields of the server's initial handshake (protocol v10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    /// Scramble, without any trailing NUL
    pub auth_data: Vec<u8>,
    pub auth_plugin: String,
}

/// Decode an initial handshake packet.
///
/// The auth-data-length byte is always present on the wire (zero when the
/// server lacks `CLIENT_PLUGIN_AUTH`) and is always consumed.
pub fn parse_handshake(payload: &[u8]) -> Result<ServerHandshake> {
    let mut reader = PacketReader::new(payload);

    let protocol_version = reader.read_u8()?;
    if protocol_version != 10 {
        return Err(Error::malformed(format!(
            "unsupported handshake protocol version {protocol_version}"
        )));
    }
    let server_version = reader.read_null_string()?;
    let connection_id = reader.read_u32_le()?;
    let mut auth_data = reader.read_bytes(8)?.to_vec();
    reader.skip(1)?;
    let caps_lower = reader.read_u16_le()?;

    // Pre-4.1 servers may stop here.
    if reader.is_empty() {
        return Ok(ServerHandshake {
            protocol_version,
            server_version,
            connection_id,
            capabilities: u32::from(caps_lower),
            charset: 0,
            status_flags: 0,
            auth_data,
            auth_plugin: plugins::MYSQL_NATIVE_PASSWORD.to_string(),
        });
    }

    let charset = reader.read_u8()?;
    let status_flags = reader.read_u16_le()?;
    let caps_upper = reader.read_u16_le()?;
    let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);
    let auth_data_len = usize::from(reader.read_u8()?);
    reader.skip(10)?;

    if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        let len2 = auth_data_len.saturating_sub(8).max(13).min(reader.remaining());
        let part2 = reader.read_bytes(len2)?;
        auth_data.extend_from_slice(part2.strip_suffix(&[0]).unwrap_or(part2));
    }

    let auth_plugin = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 && !reader.is_empty()
    {
        let rest = reader.read_rest();
        let name = rest.strip_suffix(&[0]).unwrap_or(rest);
        String::from_utf8_lossy(name).into_owned()
    } else {
        plugins::MYSQL_NATIVE_PASSWORD.to_string()
    };

    Ok(ServerHandshake {
        protocol_version,
        server_version,
        connection_id,
        capabilities,
        charset,
        status_flags,
        auth_data,
        auth_plugin,
    })
}

pub struct MySqlConnection {
    io: PacketIo<TcpStream>,
    config: MySqlConfig,
    server: ServerHandshake,
    /// Negotiated capabilities (ours intersected with the server's)
    capabilities: u32,
    status_flags: u16,
    database: Option<String>,
    broken: bool,
}

impl std::fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("connection_id", &self.server.connection_id)
            .field("addr", &self.config.socket_addr())
            .field("database", &self.database)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection {
    /// Open a TCP connection and authenticate.
    #[tracing::instrument(level = "debug", skip(config), fields(addr = %config.socket_addr()))]
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        let addr = config.socket_addr();
        let addrs = addr.to_socket_addrs().map_err(|e| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("failed to resolve {addr}: {e}"),
                source: Some(Box::new(e)),
            })
        })?;

        let mut last_err = None;
        let mut stream = None;
        for sock in addrs {
            match TcpStream::connect_timeout(&sock, config.connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = match (stream, last_err) {
            (Some(s), _) => s,
            (None, Some(e)) => {
                let kind = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    ConnectionErrorKind::Refused
                } else {
                    ConnectionErrorKind::Connect
                };
                return Err(Error::Connection(ConnectionError {
                    kind,
                    message: format!("failed to connect to {addr}: {e}"),
                    source: Some(Box::new(e)),
                }));
            }
            (None, None) => {
                return Err(Error::connection(
                    ConnectionErrorKind::Connect,
                    format!("{addr} resolved to no addresses"),
                ));
            }
        };

        let _ = stream.set_nodelay(true);
        stream.set_read_timeout(Some(config.connect_timeout))?;
        stream.set_write_timeout(Some(config.connect_timeout))?;

        let conn = Self::handshake(stream, config)?;
        conn.io.get_ref().set_read_timeout(conn.config.io_timeout)?;
        conn.io.get_ref().set_write_timeout(conn.config.io_timeout)?;
        Ok(conn)
    }

    /// Authenticate over an already-connected stream.
    pub fn handshake(stream: TcpStream, config: MySqlConfig) -> Result<Self> {
        let mut io = PacketIo::new(stream).with_max_allowed_packet(config.max_packet_size as usize);
        let payload = io.read_packet()?;
        if payload.first() == Some(&0xFF) {
            let err = PacketReader::new(&payload).parse_err_packet()?;
            return Err(Error::connection(
                ConnectionErrorKind::Connect,
                format!("backend refused connection: {}", err.into_mysql_error()),
            ));
        }
        let server = parse_handshake(&payload)?;
        if server.capabilities & capabilities::CLIENT_PROTOCOL_41 == 0 {
            return Err(Error::connection(
                ConnectionErrorKind::Connect,
                format!("backend {} does not speak protocol 4.1", server.server_version),
            ));
        }
        tracing::debug!(
            server_version = %server.server_version,
            connection_id = server.connection_id,
            plugin = %server.auth_plugin,
            "backend handshake received"
        );

        let capabilities = config.capability_flags() & server.capabilities;
        let database = config.database.clone();
        let mut conn = Self {
            io,
            config,
            status_flags: server.status_flags,
            server,
            capabilities,
            database,
            broken: false,
        };
        conn.send_handshake_response()?;
        conn.authenticate()?;
        Ok(conn)
    }

    pub fn connection_id(&self) -> u32 {
        self.server.connection_id
    }

    pub fn server_version(&self) -> &str {
        &self.server.server_version
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    /// Currently selected database, as far as this connection knows.
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn send_handshake_response(&mut self) -> Result<()> {
        let plugin = self.server.auth_plugin.clone();
        let auth_response = self.auth_response(&plugin, &self.server.auth_data.clone());
        let caps = self.capabilities;

        let mut w = PacketWriter::new();
        w.write_u32_le(caps);
        w.write_u32_le(self.config.max_packet_size);
        w.write_u8(self.config.charset);
        w.write_zeros(23);
        w.write_null_string(&self.config.user);
        if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            w.write_lenenc_bytes(&auth_response);
        } else if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            w.write_u8(auth_response.len() as u8);
            w.write_bytes(&auth_response);
        } else {
            w.write_null_bytes(&auth_response);
        }
        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            w.write_null_string(self.config.database.as_deref().unwrap_or(""));
        }
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            w.write_null_string(&plugin);
        }
        self.write(w.as_bytes())
    }

    fn auth_response(&self, plugin: &str, auth_data: &[u8]) -> Vec<u8> {
        let password = self.config.password.as_deref().unwrap_or("");
        match plugin {
            plugins::CACHING_SHA2_PASSWORD => auth::caching_sha2_password(password, auth_data),
            // Ask for the public key; the password goes out RSA-encrypted.
            plugins::SHA256_PASSWORD if !password.is_empty() => vec![1],
            plugins::SHA256_PASSWORD => vec![0],
            _ => auth::mysql_native_password(password, auth_data),
        }
    }

    /// Drive the exchange after the handshake response until OK or ERR.
    fn authenticate(&mut self) -> Result<()> {
        let mut plugin = self.server.auth_plugin.clone();
        let mut auth_data = self.server.auth_data.clone();

        loop {
            let payload = self.read()?;
            match payload.first().copied() {
                Some(0x00) => {
                    let ok = PacketReader::new(&payload).parse_ok_packet(self.capabilities)?;
                    self.status_flags = ok.status_flags;
                    tracing::debug!(plugin = %plugin, "backend authentication succeeded");
                    return Ok(());
                }
                Some(0xFF) => {
                    let err = PacketReader::new(&payload).parse_err_packet()?;
                    self.broken = true;
                    return Err(Error::connection(
                        ConnectionErrorKind::Authentication,
                        format!("backend rejected credentials: {}", err.into_mysql_error()),
                    ));
                }
                Some(0xFE) => {
                    let mut reader = PacketReader::new(&payload[1..]);
                    plugin = reader.read_null_string()?;
                    let rest = reader.read_rest();
                    auth_data = rest.strip_suffix(&[0]).unwrap_or(rest).to_vec();
                    tracing::debug!(plugin = %plugin, "backend requested auth switch");
                    let response = self.auth_response(&plugin, &auth_data);
                    self.write(&response)?;
                }
                Some(0x01) => self.auth_more_data(&plugin, &auth_data, &payload[1..])?,
                _ => {
                    self.broken = true;
                    return Err(Error::malformed(format!(
                        "unexpected packet during authentication: {:02X?}",
                        payload.first()
                    )));
                }
            }
        }
    }

    fn auth_more_data(&mut self, plugin: &str, auth_data: &[u8], data: &[u8]) -> Result<()> {
        match data {
            [caching_sha2::FAST_AUTH_SUCCESS] => Ok(()),
            [caching_sha2::PERFORM_FULL_AUTH] => {
                tracing::debug!("backend requires full authentication, requesting public key");
                self.write(&[caching_sha2::REQUEST_PUBLIC_KEY])
            }
            pem if pem.starts_with(b"-----BEGIN") => {
                let password = self.config.password.as_deref().unwrap_or("");
                let encrypted = auth::sha256_password_rsa(password, auth_data, pem, true)?;
                self.write(&encrypted)
            }
            other => {
                self.broken = true;
                Err(Error::malformed(format!(
                    "unexpected auth data for plugin {plugin}: {} bytes",
                    other.len()
                )))
            }
        }
    }

    /// Run a text-protocol query and return a cursor over its result.
    ///
    /// A backend ERR is returned as a `Backend` command error and leaves the
    /// connection usable. `sql` is sent as-is; it does not have to be UTF-8.
    pub fn query(&mut self, sql: impl AsRef<[u8]>) -> Result<QueryResult<'_>> {
        let first = self.command(Command::Query, sql.as_ref())?;
        match PacketType::from_first_byte(first[0], first.len()) {
            PacketType::Ok => {
                let ok = self.parse_ok(&first)?;
                Ok(QueryResult {
                    conn: self,
                    columns: Vec::new(),
                    ok,
                    finished: true,
                })
            }
            PacketType::Error => Err(self.backend_error(&first)),
            PacketType::LocalInfile => Err(self.fail(Error::malformed(
                "backend requested LOCAL INFILE, which was not negotiated",
            ))),
            PacketType::Eof => Err(self.fail(Error::malformed(
                "unexpected EOF packet in place of a column count",
            ))),
            PacketType::Data => {
                let count = self.guard(PacketReader::new(&first).read_lenenc_int())? as usize;
                let mut columns = Vec::with_capacity(count);
                for _ in 0..count {
                    let payload = self.read()?;
                    columns.push(self.guard(ColumnDef::from_payload(payload))?);
                }
                let payload = self.read()?;
                let first_byte = payload.first().copied().unwrap_or(0);
                if PacketType::from_first_byte(first_byte, payload.len()) != PacketType::Eof {
                    return Err(self.fail(Error::malformed(
                        "expected EOF after column definitions",
                    )));
                }
                let eof = self.guard(PacketReader::new(&payload).parse_eof_packet())?;
                self.status_flags = eof.status_flags;
                Ok(QueryResult {
                    conn: self,
                    columns,
                    ok: OkPacket {
                        status_flags: eof.status_flags,
                        warnings: eof.warnings,
                        ..OkPacket::default()
                    },
                    finished: false,
                })
            }
        }
    }

    /// Select `database`. Empty names and the current database are no-ops.
    pub fn use_database(&mut self, database: &str) -> Result<()> {
        if database.is_empty() || self.database.as_deref() == Some(database) {
            return Ok(());
        }
        let reply = self.command(Command::InitDb, database.as_bytes())?;
        match reply[0] {
            0x00 => {
                let ok = self.parse_ok(&reply)?;
                self.status_flags = ok.status_flags;
                self.database = Some(database.to_string());
                Ok(())
            }
            0xFF => Err(self.backend_error(&reply)),
            other => Err(self.fail(Error::malformed(format!(
                "unexpected reply to COM_INIT_DB: {other:#04X}"
            )))),
        }
    }

    pub fn ping(&mut self) -> Result<()> {
        let reply = self.command(Command::Ping, &[])?;
        match reply[0] {
            0x00 => Ok(()),
            0xFF => Err(self.backend_error(&reply)),
            other => Err(self.fail(Error::malformed(format!(
                "unexpected reply to COM_PING: {other:#04X}"
            )))),
        }
    }

    /// Send `COM_QUIT` (best effort) and shut the socket down.
    pub fn close(mut self) {
        if !self.broken {
            self.io.reset_sequence();
            let _ = self.io.write_packet(&[Command::Quit as u8]);
            let _ = self.io.get_mut().flush();
        }
        let _ = self.io.get_ref().shutdown(Shutdown::Both);
    }

    /// Send a command in a fresh sequence and read the first reply packet.
    fn command(&mut self, command: Command, arg: &[u8]) -> Result<Vec<u8>> {
        if self.broken {
            return Err(Error::connection(
                ConnectionErrorKind::Broken,
                "backend connection is broken",
            ));
        }
        self.io.reset_sequence();
        let mut w = PacketWriter::with_capacity(1 + arg.len());
        w.write_u8(command as u8);
        w.write_bytes(arg);
        self.write(w.as_bytes())?;
        let reply = self.read()?;
        if reply.is_empty() {
            return Err(self.fail(Error::malformed(format!("empty reply to {command}"))));
        }
        Ok(reply)
    }

    fn parse_ok(&mut self, payload: &[u8]) -> Result<OkPacket> {
        let ok = self.guard(PacketReader::new(payload).parse_ok_packet(self.capabilities))?;
        self.status_flags = ok.status_flags;
        Ok(ok)
    }

    fn backend_error(&mut self, payload: &[u8]) -> Error {
        match PacketReader::new(payload).parse_err_packet() {
            Ok(err) => backend_error(err),
            Err(e) => self.fail(e),
        }
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        let r = self.io.read_packet();
        self.guard(r)
    }

    fn write(&mut self, payload: &[u8]) -> Result<()> {
        let r = self.io.write_packet(payload);
        self.guard(r)
    }

    fn guard<T>(&mut self, r: Result<T>) -> Result<T> {
        r.map_err(|e| self.fail(e))
    }

    fn fail(&mut self, e: Error) -> Error {
        if e.is_fatal() {
            self.broken = true;
        }
        e
    }
}

fn backend_error(err: ErrPacket) -> Error {
    Error::command(CommandErrorKind::Backend, err.into_mysql_error())
}

/// Streaming result of [`MySqlConnection::query`].
///
/// Dropping an unfinished result drains the remaining rows so the connection
/// can be reused; if that fails the connection is marked broken.
pub struct QueryResult<'a> {
    conn: &'a mut MySqlConnection,
    columns: Vec<ColumnDef>,
    ok: OkPacket,
    finished: bool,
}

impl std::fmt::Debug for QueryResult<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult")
            .field("columns", &self.columns.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// One text-protocol row; `None` is SQL NULL.
pub type TextRow = Vec<Option<Vec<u8>>>;

impl QueryResult<'_> {
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn affected_rows(&self) -> u64 {
        self.ok.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.ok.last_insert_id
    }

    /// Status flags from the OK packet, or from the trailing EOF once all
    /// rows have been read.
    pub fn status_flags(&self) -> u16 {
        self.ok.status_flags
    }

    pub fn warnings(&self) -> u16 {
        self.ok.warnings
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn next_row(&mut self) -> Result<Option<TextRow>> {
        if self.finished {
            return Ok(None);
        }
        let payload = match self.conn.read() {
            Ok(p) => p,
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };
        match payload.first().copied() {
            Some(0xFE) if payload.len() < 9 => {
                self.finished = true;
                let eof: EofPacket = self.conn.guard(PacketReader::new(&payload).parse_eof_packet())?;
                self.ok.status_flags = eof.status_flags;
                self.ok.warnings = eof.warnings;
                self.conn.status_flags = eof.status_flags;
                Ok(None)
            }
            Some(0xFF) => {
                self.finished = true;
                Err(self.conn.backend_error(&payload))
            }
            _ => {
                let mut reader = PacketReader::new(&payload);
                let mut row = Vec::with_capacity(self.columns.len());
                for _ in 0..self.columns.len() {
                    match reader.read_lenenc_bytes_or_null() {
                        Ok(cell) => row.push(cell.map(<[u8]>::to_vec)),
                        Err(e) => {
                            self.finished = true;
                            return Err(self.conn.fail(e));
                        }
                    }
                }
                Ok(Some(row))
            }
        }
    }

    /// Read and discard the remaining rows.
    pub fn drain(&mut self) -> Result<()> {
        while self.next_row()?.is_some() {}
        Ok(())
    }

    /// Stop reading without draining; the connection is marked broken.
    pub fn abandon(mut self) {
        self.finished = true;
        self.conn.broken = true;
    }
}

impl Drop for QueryResult<'_> {
    fn drop(&mut self) {
        if !self.finished && self.drain().is_err() {
            self.conn.broken = true;
        }
    }
}
