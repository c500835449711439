//! Accept loop: one thread per client connection.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use mysqlgate_core::{CancelToken, Error, Result};

use crate::config::ServerConfig;
use crate::connection::ClientConnection;
use crate::plan::QueryPlan;

/// First id handed out by a default allocator.
pub const FIRST_CONNECTION_ID: u32 = 10_000;

/// Process-wide connection id counter, owned by the listener.
#[derive(Debug)]
pub struct ConnectionIdAllocator {
    next: AtomicU32,
}

impl Default for ConnectionIdAllocator {
    fn default() -> Self {
        Self::starting_at(FIRST_CONNECTION_ID)
    }
}

impl ConnectionIdAllocator {
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Next id; wraps around but never returns 0.
    pub fn allocate(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

struct Shared {
    config: Arc<ServerConfig>,
    plan: Arc<QueryPlan>,
    ids: ConnectionIdAllocator,
    cancel: CancelToken,
    active: AtomicUsize,
}

pub struct Server {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.shared.config.addr)
            .field("plan", &self.shared.plan)
            .finish()
    }
}

impl Server {
    pub fn new(config: ServerConfig, plan: QueryPlan) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                plan: Arc::new(plan),
                ids: ConnectionIdAllocator::default(),
                cancel: CancelToken::new(),
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Bind the configured address and accept on a background thread.
    pub fn bind(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&self.shared.config.addr).map_err(|e| {
            Error::config(format!("cannot listen on {}: {e}", self.shared.config.addr))
        })?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, stages = ?self.shared.plan, "listening for MySQL clients");

        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name("mysqlgate-accept".to_string())
            .spawn(move || accept_loop(&listener, &shared))?;

        Ok(ServerHandle {
            addr,
            shared: self.shared,
            thread: Some(thread),
        })
    }
}

fn accept_loop(listener: &TcpListener, shared: &Arc<Shared>) {
    for stream in listener.incoming() {
        if shared.cancel.is_cancelled() {
            break;
        }
        match stream {
            Ok(stream) => spawn_connection(stream, shared),
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
    tracing::info!("accept loop stopped");
}

fn spawn_connection(stream: TcpStream, shared: &Arc<Shared>) {
    let connection_id = shared.ids.allocate();
    let shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("mysqlgate-conn-{connection_id}"))
        .spawn(move || {
            shared.active.fetch_add(1, Ordering::Relaxed);
            serve_connection(stream, connection_id, &shared);
            shared.active.fetch_sub(1, Ordering::Relaxed);
        });
    if let Err(e) = spawned {
        tracing::error!(connection_id, error = %e, "could not spawn connection thread");
    }
}

fn serve_connection(stream: TcpStream, connection_id: u32, shared: &Shared) {
    let conn = ClientConnection::accept(
        stream,
        connection_id,
        Arc::clone(&shared.config),
        Arc::clone(&shared.plan),
        shared.cancel.child(),
    );
    let mut conn = match conn {
        Ok(conn) => conn,
        Err(e) => {
            tracing::debug!(connection_id, error = %e, "handshake failed");
            return;
        }
    };
    if let Err(e) = conn.run() {
        tracing::warn!(connection_id, error = %e, "connection ended with error");
    }
    conn.close();
}

/// A running server.
pub struct ServerHandle {
    addr: SocketAddr,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("addr", &self.addr)
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn active_connections(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Stop accepting and cancel every connection.
    ///
    /// Idle connections notice within one poll interval; a connection in the
    /// middle of a command stops at the next cancellation check.
    pub fn shutdown(mut self) {
        self.shared.cancel.cancel();
        // wake the blocking accept()
        let mut wake = self.addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(match wake {
                SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
            });
        }
        let _ = TcpStream::connect(wake);
        self.join();
        tracing::info!("server stopped");
    }

    /// Block until the accept loop ends.
    pub fn wait(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("accept thread panicked");
            }
        }
    }
}
