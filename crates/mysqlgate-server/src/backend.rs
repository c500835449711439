//! Backend collaborator.
//!
//! The execution stage only needs three things from a backend: a session to
//! run a statement on, a way to select a database on that session, and a
//! cursor over the result. [`MySqlBackend`] provides them on top of a
//! [`Pool`] of [`MySqlConnection`]s.

use std::fmt;

use mysqlgate_core::{CancelToken, Error, Result};
use mysqlgate_mysql::{ColumnDef, MySqlConfig, MySqlConnection, QueryResult, TextRow};
use mysqlgate_pool::{ManageConnection, Pool, PoolConfig, PooledConnection};

/// Source of backend sessions. Shared by every client connection.
pub trait Backend: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn Session>>;
}

/// One backend session, held for the duration of a command.
pub trait Session {
    /// Run `sql` and return a cursor over its result. The bytes are sent
    /// unchanged; they need not be UTF-8.
    fn query(&mut self, cancel: &CancelToken, sql: &[u8]) -> Result<Box<dyn Cursor + '_>>;

    /// Select `name` as the session's default database.
    fn use_database(&mut self, cancel: &CancelToken, name: &str) -> Result<()>;
}

/// A statement result: either rows, or a write acknowledgement when
/// [`Cursor::columns`] is empty.
pub trait Cursor {
    fn columns(&self) -> &[ColumnDef];

    /// The next text row, or `None` once the result is exhausted.
    fn next_row(&mut self) -> Result<Option<TextRow>>;

    fn status_flags(&self) -> u16;

    fn affected_rows(&self) -> u64;

    fn last_insert_id(&self) -> u64;
}

/// Opens backend connections for the pool.
#[derive(Debug, Clone)]
pub struct MySqlManager {
    config: MySqlConfig,
}

impl MySqlManager {
    pub fn new(config: MySqlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }
}

impl ManageConnection for MySqlManager {
    type Connection = MySqlConnection;

    fn connect(&self) -> Result<MySqlConnection> {
        MySqlConnection::connect(self.config.clone())
    }

    fn is_valid(&self, conn: &mut MySqlConnection) -> Result<()> {
        conn.ping()
    }

    fn has_broken(&self, conn: &MySqlConnection) -> bool {
        conn.is_broken()
    }
}

/// [`Backend`] that forwards to a real MySQL server through a pool.
pub struct MySqlBackend {
    pool: Pool<MySqlManager>,
}

impl fmt::Debug for MySqlBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlBackend")
            .field("addr", &self.pool.manager().config().socket_addr())
            .field("pool", &self.pool)
            .finish()
    }
}

impl MySqlBackend {
    pub fn new(config: MySqlConfig, pool: PoolConfig) -> Result<Self> {
        tracing::info!(
            backend = %config.socket_addr(),
            user = %config.user,
            max_connections = pool.max_connections,
            "configuring backend"
        );
        Ok(Self {
            pool: Pool::build(MySqlManager::new(config), pool)?,
        })
    }

    pub fn pool(&self) -> &Pool<MySqlManager> {
        &self.pool
    }
}

impl Backend for MySqlBackend {
    fn acquire(&self) -> Result<Box<dyn Session>> {
        Ok(Box::new(MySqlSession {
            conn: self.pool.get()?,
        }))
    }
}

struct MySqlSession {
    conn: PooledConnection<MySqlManager>,
}

impl Session for MySqlSession {
    fn query(&mut self, cancel: &CancelToken, sql: &[u8]) -> Result<Box<dyn Cursor + '_>> {
        cancel.check()?;
        let result = self.conn.query(sql)?;
        Ok(Box::new(MySqlCursor {
            result: Some(result),
            cancel: cancel.clone(),
        }))
    }

    fn use_database(&mut self, cancel: &CancelToken, name: &str) -> Result<()> {
        cancel.check()?;
        self.conn.use_database(name)
    }
}

struct MySqlCursor<'a> {
    /// `None` once abandoned after cancellation
    result: Option<QueryResult<'a>>,
    cancel: CancelToken,
}

impl Cursor for MySqlCursor<'_> {
    fn columns(&self) -> &[ColumnDef] {
        self.result.as_ref().map(|r| r.columns()).unwrap_or_default()
    }

    fn next_row(&mut self) -> Result<Option<TextRow>> {
        if self.cancel.is_cancelled() {
            // abandoning marks the connection broken so the pool discards it
            if let Some(result) = self.result.take() {
                result.abandon();
            }
            return Err(Error::Cancelled);
        }
        match self.result.as_mut() {
            Some(result) => result.next_row(),
            None => Err(Error::Cancelled),
        }
    }

    fn status_flags(&self) -> u16 {
        self.result.as_ref().map_or(0, |r| r.status_flags())
    }

    fn affected_rows(&self) -> u64 {
        self.result.as_ref().map_or(0, |r| r.affected_rows())
    }

    fn last_insert_id(&self) -> u64 {
        self.result.as_ref().map_or(0, |r| r.last_insert_id())
    }
}
