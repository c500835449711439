//! One client connection: handshake, then the command loop.
//!
//! ```text
//! Ready --read command--> Dispatching --response sent--> Ready
//! Ready --COM_QUIT / EOF / cancel / fatal error--> Closed
//! ```
//!
//! The sequence counter is reset before each command is read, so every
//! command/response cycle starts at 0. Commands are handled one at a time;
//! while idle the socket is polled with a short timeout so a cancelled
//! connection notices between commands.

#![allow(clippy::cast_possible_truncation)]

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use mysqlgate_core::codes::ER_UNKNOWN_COM_ERROR;
use mysqlgate_core::{
    CancelToken, CommandErrorKind, ConnectionError, ConnectionErrorKind, Error, MySqlError, Result,
};
use mysqlgate_mysql::Command;
use mysqlgate_mysql::protocol::{
    OkPacket, PacketIo, write_column_count, write_eof_packet, write_err_packet, write_ok_packet,
    write_text_row,
};

use crate::backend::Cursor;
use crate::config::ServerConfig;
use crate::handshake::{Handshake, is_protocol_failure};
use crate::plan::{QueryContext, QueryPlan};

/// Bound on how long a client may take to answer the initial handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ClientConnection {
    io: PacketIo<TcpStream>,
    connection_id: u32,
    peer: Option<SocketAddr>,
    capabilities: u32,
    status_flags: u16,
    user: String,
    database: Option<String>,
    config: Arc<ServerConfig>,
    plan: Arc<QueryPlan>,
    cancel: CancelToken,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("connection_id", &self.connection_id)
            .field("peer", &self.peer)
            .field("user", &self.user)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl ClientConnection {
    /// Authenticate a freshly accepted socket.
    ///
    /// On failure the client has already been sent an ERR where possible and
    /// the socket is dropped.
    pub fn accept(
        stream: TcpStream,
        connection_id: u32,
        config: Arc<ServerConfig>,
        plan: Arc<QueryPlan>,
        cancel: CancelToken,
    ) -> Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let peer = stream.peer_addr().ok();
        let host = peer.map_or_else(|| "unknown".to_string(), |p| p.ip().to_string());
        let mut io = PacketIo::new(stream).with_max_allowed_packet(config.max_allowed_packet);

        let response = match Handshake::new(&config, connection_id).run(&mut io, &host) {
            Ok(response) => response,
            Err(e) => {
                if is_protocol_failure(&e) {
                    tracing::warn!(connection_id, peer = %host, error = %e, "bad handshake");
                }
                let _ = io.get_ref().shutdown(Shutdown::Both);
                return Err(e);
            }
        };
        io.get_ref().set_read_timeout(None)?;

        let mut conn = Self::established(io, connection_id, config, plan, cancel);
        conn.peer = peer;
        conn.capabilities &= response.capabilities;
        conn.user = response.username;
        conn.database = response.database;
        tracing::info!(
            connection_id,
            peer = %host,
            user = %conn.user,
            database = conn.database.as_deref().unwrap_or(""),
            "client connected"
        );
        Ok(conn)
    }

    /// Wrap a socket whose handshake has completed.
    pub(crate) fn established(
        io: PacketIo<TcpStream>,
        connection_id: u32,
        config: Arc<ServerConfig>,
        plan: Arc<QueryPlan>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            io,
            connection_id,
            peer: None,
            capabilities: config.capabilities,
            status_flags: config.status_flags,
            user: String::new(),
            database: None,
            config,
            plan,
            cancel,
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub(crate) fn set_database(&mut self, name: String) {
        self.database = Some(name);
    }

    /// Negotiated capabilities: what the gateway advertised intersected with
    /// what the client asked for.
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    /// Serve commands until the client quits, disconnects, the token is
    /// cancelled, or a fatal error occurs.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                tracing::debug!(connection_id = self.connection_id, "connection cancelled");
                return Ok(());
            }
            match self.wait_for_command() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) if is_disconnect(&e) => {
                    tracing::debug!(connection_id = self.connection_id, "client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            self.io.reset_sequence();
            let payload = match self.io.read_packet() {
                Ok(payload) => payload,
                Err(e) if is_disconnect(&e) => {
                    tracing::debug!(connection_id = self.connection_id, "client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(self.abort_with(e)),
            };
            if !self.dispatch(&payload)? {
                return Ok(());
            }
        }
    }

    /// Close the socket. Pending output is discarded.
    pub fn close(self) {
        let _ = self.io.get_ref().shutdown(Shutdown::Both);
        tracing::debug!(connection_id = self.connection_id, "connection closed");
    }

    /// Wait for the next command, waking every poll interval.
    ///
    /// Returns `false` when the interval passed with nothing to read.
    fn wait_for_command(&mut self) -> Result<bool> {
        let stream = self.io.get_ref();
        stream.set_read_timeout(Some(self.config.idle_poll_interval))?;
        let mut peeked = [0u8; 1];
        let ready = match stream.peek(&mut peeked) {
            Ok(0) => {
                return Err(Error::connection(
                    ConnectionErrorKind::Disconnected,
                    "client closed the connection",
                ));
            }
            Ok(_) => true,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                false
            }
            Err(e) => return Err(Error::disconnected("failed waiting for a command", e)),
        };
        if ready {
            stream.set_read_timeout(None)?;
        }
        Ok(ready)
    }

    /// Handle one command packet. Returns `false` when the loop should stop.
    fn dispatch(&mut self, payload: &[u8]) -> Result<bool> {
        let Some((&code, arg)) = payload.split_first() else {
            return Err(self.abort_with(Error::malformed("empty command packet")));
        };
        let command = Command::from_byte(code);
        let span = tracing::debug_span!(
            "command",
            connection_id = self.connection_id,
            command = command.map_or("COM_UNKNOWN", Command::name),
        );
        let _enter = span.enter();

        let result = match command {
            Some(Command::Quit) => {
                tracing::debug!("client quit");
                return Ok(false);
            }
            Some(command @ (Command::Query | Command::InitDb)) => self.run_plan(command, arg),
            Some(Command::Ping) => {
                let ok = self.ok_packet();
                self.write_ok(&ok)
            }
            Some(Command::SetOption) => self.write_eof(self.status_flags),
            Some(other) => Err(Error::unsupported(other.name())),
            None => Err(Error::command(
                CommandErrorKind::Unsupported,
                MySqlError::new(ER_UNKNOWN_COM_ERROR, &[]),
            )),
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => Err(self.abort_with(e)),
            Err(e) => {
                tracing::debug!(error = %e, "command failed");
                self.write_err(&e.to_mysql_error())?;
                Ok(true)
            }
        }
    }

    fn run_plan(&mut self, command: Command, arg: &[u8]) -> Result<()> {
        let plan = Arc::clone(&self.plan);
        let cancel = self.cancel.child();
        tracing::trace!(data = %String::from_utf8_lossy(arg), "running query plan");

        let mut ctx = QueryContext::new(self, command, arg.to_vec(), cancel);
        let result = if command == Command::InitDb {
            plan.init_db(&mut ctx)
        } else {
            plan.query(&mut ctx)
        };
        let responded = ctx.has_responded();

        match result {
            Ok(()) if !responded => {
                let ok = self.ok_packet();
                self.write_ok(&ok)
            }
            Ok(()) => Ok(()),
            // Part of a response is already on the wire; the client cannot
            // be answered with a clean ERR any more.
            Err(e) if responded => Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Broken,
                message: format!("{command} failed after its response started: {e}"),
                source: Some(Box::new(e)),
            })),
            Err(e) => Err(e),
        }
    }

    /// Best-effort ERR for a fatal error, which is handed back.
    fn abort_with(&mut self, e: Error) -> Error {
        tracing::warn!(connection_id = self.connection_id, error = %e, "closing connection");
        if let Err(write_err) = self.write_err(&e.to_mysql_error()) {
            tracing::debug!(error = %write_err, "could not send final error");
        }
        e
    }

    pub(crate) fn ok_packet(&self) -> OkPacket {
        OkPacket {
            status_flags: self.status_flags,
            ..OkPacket::default()
        }
    }

    pub(crate) fn write_ok(&mut self, ok: &OkPacket) -> Result<()> {
        write_ok_packet(&mut self.io, self.capabilities, ok)
    }

    pub(crate) fn write_err(&mut self, err: &MySqlError) -> Result<()> {
        write_err_packet(&mut self.io, self.capabilities, err)
    }

    pub(crate) fn write_eof(&mut self, status_flags: u16) -> Result<()> {
        write_eof_packet(&mut self.io, self.capabilities, status_flags)
    }

    pub(crate) fn write_result_set(
        &mut self,
        cursor: &mut dyn Cursor,
        cancel: &CancelToken,
    ) -> Result<()> {
        if cursor.columns().is_empty() {
            let ok = OkPacket {
                affected_rows: cursor.affected_rows(),
                last_insert_id: cursor.last_insert_id(),
                status_flags: cursor.status_flags(),
                ..OkPacket::default()
            };
            return self.write_ok(&ok);
        }

        write_column_count(&mut self.io, cursor.columns().len() as u64)?;
        for column in cursor.columns() {
            self.io.write_packet(column.as_bytes())?;
        }
        write_eof_packet(&mut self.io, self.capabilities, cursor.status_flags())?;

        let mut rows = 0u64;
        loop {
            cancel.check()?;
            let Some(row) = cursor.next_row()? else {
                break;
            };
            write_text_row(&mut self.io, row)?;
            rows += 1;
        }
        tracing::debug!(rows, "result set sent");
        write_eof_packet(&mut self.io, self.capabilities, cursor.status_flags())
    }
}

/// The client went away; nothing more can be sent.
fn is_disconnect(e: &Error) -> bool {
    matches!(
        e,
        Error::Connection(c) if c.kind == ConnectionErrorKind::Disconnected
    )
}
