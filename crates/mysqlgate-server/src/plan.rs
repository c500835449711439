//! Query plan pipeline.
//!
//! A [`QueryPlan`] is a fixed, ordered list of [`Stage`]s built once at
//! startup and shared by every connection. For each `COM_QUERY` or
//! `COM_INIT_DB` the connection builds a [`QueryContext`] and the plan runs
//! the stages in order:
//!
//! - before each stage, an aborted context ends the run successfully
//! - a stage error ends the run and is returned to the dispatcher
//!
//! Stages that only inspect or rewrite the query leave the response to a
//! later stage. The standard plan ends with [`ExecuteStage`], which forwards
//! the query to the backend and writes the result.

use std::fmt;
use std::sync::Arc;

use sqlparser::ast::Statement;

use mysqlgate_core::codes::{ER_BAD_DB_ERROR, ER_NO_DB_ERROR};
use mysqlgate_core::{CancelToken, CommandErrorKind, Error, MySqlError, Result};
use mysqlgate_mysql::Command;
use mysqlgate_mysql::protocol::OkPacket;

use crate::backend::{Backend, Cursor};
use crate::connection::ClientConnection;
use crate::parser::SqlParser;

/// Per-command state handed from stage to stage.
pub struct QueryContext<'a> {
    conn: &'a mut ClientConnection,
    command: Command,
    data: Vec<u8>,
    statements: Option<Vec<Statement>>,
    aborted: bool,
    responded: bool,
    cancel: CancelToken,
}

impl fmt::Debug for QueryContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("connection_id", &self.conn.connection_id())
            .field("command", &self.command)
            .field("data", &String::from_utf8_lossy(&self.data))
            .field("parsed", &self.statements.is_some())
            .field("aborted", &self.aborted)
            .field("responded", &self.responded)
            .finish()
    }
}

impl<'a> QueryContext<'a> {
    pub(crate) fn new(
        conn: &'a mut ClientConnection,
        command: Command,
        data: Vec<u8>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            conn,
            command,
            data,
            statements: None,
            aborted: false,
            responded: false,
            cancel,
        }
    }

    pub fn command(&self) -> Command {
        self.command
    }

    /// Command argument exactly as the client sent it: query text for
    /// `COM_QUERY`, database name for `COM_INIT_DB`. Not necessarily UTF-8.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replace the bytes seen by later stages.
    pub fn set_data(&mut self, data: impl Into<Vec<u8>>) {
        self.data = data.into();
    }

    /// Statements stored by the parser stage, if it ran.
    pub fn statements(&self) -> Option<&[Statement]> {
        self.statements.as_deref()
    }

    pub fn set_statements(&mut self, statements: Vec<Statement>) {
        self.statements = Some(statements);
    }

    /// Skip every remaining stage. The command still completes successfully.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn connection_id(&self) -> u32 {
        self.conn.connection_id()
    }

    pub fn user(&self) -> &str {
        self.conn.user()
    }

    /// The connection's current database.
    pub fn database(&self) -> Option<&str> {
        self.conn.database()
    }

    pub fn set_database(&mut self, name: impl Into<String>) {
        self.conn.set_database(name.into());
    }

    /// Has a stage written any part of the response yet?
    pub fn has_responded(&self) -> bool {
        self.responded
    }

    pub fn write_ok(&mut self, ok: &OkPacket) -> Result<()> {
        self.responded = true;
        self.conn.write_ok(ok)
    }

    /// Answer with an ERR packet. Stages rejecting a query usually follow
    /// this with [`QueryContext::abort`].
    pub fn write_error(&mut self, err: &MySqlError) -> Result<()> {
        self.responded = true;
        self.conn.write_err(err)
    }

    /// Relay a backend result: an OK packet when it has no columns,
    /// otherwise the full text result set.
    pub fn write_result_set(&mut self, cursor: &mut dyn Cursor) -> Result<()> {
        self.responded = true;
        self.conn.write_result_set(cursor, &self.cancel)
    }

    /// OK packet carrying the connection's status flags.
    pub fn ok_packet(&self) -> OkPacket {
        self.conn.ok_packet()
    }
}

/// One step of a [`QueryPlan`].
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn query(&self, ctx: &mut QueryContext<'_>) -> Result<()>;

    fn init_db(&self, _ctx: &mut QueryContext<'_>) -> Result<()> {
        Ok(())
    }
}

pub struct QueryPlan {
    stages: Vec<Box<dyn Stage>>,
}

impl fmt::Debug for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| s.name()))
            .finish()
    }
}

impl QueryPlan {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Optional parser stage followed by backend execution.
    pub fn standard(backend: Arc<dyn Backend>, parser: Option<Arc<dyn SqlParser>>) -> Self {
        let mut stages: Vec<Box<dyn Stage>> = Vec::with_capacity(2);
        if let Some(parser) = parser {
            stages.push(Box::new(ParserStage::new(parser)));
        }
        stages.push(Box::new(ExecuteStage::new(backend)));
        Self::new(stages)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(connection_id = ctx.connection_id()))]
    pub fn query(&self, ctx: &mut QueryContext<'_>) -> Result<()> {
        self.run(ctx, |stage, ctx| stage.query(ctx))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(connection_id = ctx.connection_id()))]
    pub fn init_db(&self, ctx: &mut QueryContext<'_>) -> Result<()> {
        self.run(ctx, |stage, ctx| stage.init_db(ctx))
    }

    fn run<F>(&self, ctx: &mut QueryContext<'_>, step: F) -> Result<()>
    where
        F: Fn(&dyn Stage, &mut QueryContext<'_>) -> Result<()>,
    {
        for stage in &self.stages {
            if ctx.is_aborted() {
                tracing::debug!(stage = stage.name(), "query aborted, skipping remaining stages");
                return Ok(());
            }
            ctx.cancel_token().check()?;
            if let Err(e) = step(stage.as_ref(), ctx) {
                tracing::debug!(stage = stage.name(), error = %e, "stage failed");
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Parses the query and stores the statements on the context.
///
/// A syntax error stops the plan before the query reaches the backend.
pub struct ParserStage {
    parser: Arc<dyn SqlParser>,
}

impl ParserStage {
    pub fn new(parser: Arc<dyn SqlParser>) -> Self {
        Self { parser }
    }
}

impl Stage for ParserStage {
    fn name(&self) -> &'static str {
        "parser"
    }

    fn query(&self, ctx: &mut QueryContext<'_>) -> Result<()> {
        // decoded for parsing only; later stages still see the raw bytes
        let statements = self.parser.parse(&String::from_utf8_lossy(ctx.data()))?;
        tracing::trace!(count = statements.len(), "parsed statements");
        ctx.set_statements(statements);
        Ok(())
    }
}

/// Runs the query on a backend session and relays the result.
pub struct ExecuteStage {
    backend: Arc<dyn Backend>,
}

impl ExecuteStage {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

impl Stage for ExecuteStage {
    fn name(&self) -> &'static str {
        "execute"
    }

    fn query(&self, ctx: &mut QueryContext<'_>) -> Result<()> {
        let cancel = ctx.cancel_token().clone();
        let mut session = self.backend.acquire()?;
        if let Some(db) = ctx.database() {
            session.use_database(&cancel, db)?;
        }
        let mut cursor = session.query(&cancel, ctx.data())?;
        ctx.write_result_set(cursor.as_mut())
    }

    fn init_db(&self, ctx: &mut QueryContext<'_>) -> Result<()> {
        let raw = ctx.data();
        let raw = &raw[..raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1)];
        if raw.is_empty() {
            return Err(Error::command(
                CommandErrorKind::Rejected,
                MySqlError::new(ER_NO_DB_ERROR, &[]),
            ));
        }
        // identifiers are utf8 on the server; anything else cannot name a database
        let name = std::str::from_utf8(raw)
            .map_err(|_| {
                Error::command(
                    CommandErrorKind::Rejected,
                    MySqlError::new(ER_BAD_DB_ERROR, &[&String::from_utf8_lossy(raw)]),
                )
            })?
            .to_string();
        let cancel = ctx.cancel_token().clone();
        let mut session = self.backend.acquire()?;
        session.use_database(&cancel, &name)?;
        ctx.set_database(name);
        let ok = ctx.ok_packet();
        ctx.write_ok(&ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Session;
    use crate::config::ServerConfig;
    use mysqlgate_mysql::protocol::PacketIo;
    use mysqlgate_mysql::{ColumnDef, FieldType, TextRow};
    use std::collections::VecDeque;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct FakeCursor {
        columns: Vec<ColumnDef>,
        rows: VecDeque<TextRow>,
        affected_rows: u64,
    }

    impl Cursor for FakeCursor {
        fn columns(&self) -> &[ColumnDef] {
            &self.columns
        }

        fn next_row(&mut self) -> Result<Option<TextRow>> {
            Ok(self.rows.pop_front())
        }

        fn status_flags(&self) -> u16 {
            0
        }

        fn affected_rows(&self) -> u64 {
            self.affected_rows
        }

        fn last_insert_id(&self) -> u64 {
            0
        }
    }

    struct FakeSession(Log);

    impl Session for FakeSession {
        fn query(&mut self, _cancel: &CancelToken, sql: &[u8]) -> Result<Box<dyn Cursor + '_>> {
            let sql = String::from_utf8_lossy(sql);
            self.0.lock().unwrap().push(sql.to_string());
            let cursor = if sql.starts_with("UPDATE") {
                FakeCursor {
                    columns: Vec::new(),
                    rows: VecDeque::new(),
                    affected_rows: 3,
                }
            } else {
                FakeCursor {
                    columns: vec![ColumnDef::new("1", FieldType::LongLong)],
                    rows: VecDeque::from([vec![Some(b"1".to_vec())]]),
                    affected_rows: 0,
                }
            };
            Ok(Box::new(cursor))
        }

        fn use_database(&mut self, _cancel: &CancelToken, name: &str) -> Result<()> {
            self.0.lock().unwrap().push(format!("USE {name}"));
            if name == "missing" {
                return Err(Error::command(
                    CommandErrorKind::Backend,
                    MySqlError::new(ER_BAD_DB_ERROR, &[&name]),
                ));
            }
            Ok(())
        }
    }

    struct FakeBackend(Log);

    impl Backend for FakeBackend {
        fn acquire(&self) -> Result<Box<dyn Session>> {
            Ok(Box::new(FakeSession(Arc::clone(&self.0))))
        }
    }

    /// Records the exact bytes each query reaches the backend with.
    struct RawBackend(Arc<Mutex<Vec<Vec<u8>>>>);

    struct RawSession(Arc<Mutex<Vec<Vec<u8>>>>);

    impl Backend for RawBackend {
        fn acquire(&self) -> Result<Box<dyn Session>> {
            Ok(Box::new(RawSession(Arc::clone(&self.0))))
        }
    }

    impl Session for RawSession {
        fn query(&mut self, _cancel: &CancelToken, sql: &[u8]) -> Result<Box<dyn Cursor + '_>> {
            self.0.lock().unwrap().push(sql.to_vec());
            Ok(Box::new(FakeCursor {
                columns: Vec::new(),
                rows: VecDeque::new(),
                affected_rows: 0,
            }))
        }

        fn use_database(&mut self, _cancel: &CancelToken, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Record(&'static str, Log);

    impl Stage for Record {
        fn name(&self) -> &'static str {
            self.0
        }

        fn query(&self, _ctx: &mut QueryContext<'_>) -> Result<()> {
            self.1.lock().unwrap().push(self.0.to_string());
            Ok(())
        }
    }

    struct Abort;

    impl Stage for Abort {
        fn name(&self) -> &'static str {
            "abort"
        }

        fn query(&self, ctx: &mut QueryContext<'_>) -> Result<()> {
            ctx.abort();
            Ok(())
        }
    }

    struct Fail;

    impl Stage for Fail {
        fn name(&self) -> &'static str {
            "fail"
        }

        fn query(&self, _ctx: &mut QueryContext<'_>) -> Result<()> {
            Err(Error::command(
                CommandErrorKind::Rejected,
                MySqlError::unknown("blocked"),
            ))
        }
    }

    /// A server-side connection plus the client end of its socket.
    fn connection(plan: QueryPlan) -> (ClientConnection, PacketIo<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let conn = ClientConnection::established(
            PacketIo::new(server),
            1,
            Arc::new(ServerConfig::default()),
            Arc::new(plan),
            CancelToken::new(),
        );
        (conn, PacketIo::new(client))
    }

    fn run_query(conn: &mut ClientConnection, plan: &QueryPlan, sql: &str) -> (Result<()>, bool) {
        let mut ctx = QueryContext::new(conn, Command::Query, sql.into(), CancelToken::new());
        let result = plan.query(&mut ctx);
        (result, ctx.has_responded())
    }

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn aborted_context_skips_later_stages() {
        let log = log();
        let plan = QueryPlan::new(vec![
            Box::new(Record("first", Arc::clone(&log))),
            Box::new(Abort),
            Box::new(Record("second", Arc::clone(&log))),
            Box::new(ExecuteStage::new(Arc::new(FakeBackend(Arc::clone(&log))))),
        ]);
        let (mut conn, _client) = connection(QueryPlan::new(Vec::new()));
        let (result, responded) = run_query(&mut conn, &plan, "SELECT 1");
        assert!(result.is_ok());
        assert!(!responded);
        assert_eq!(*log.lock().unwrap(), ["first"]);
    }

    #[test]
    fn stage_error_stops_the_plan() {
        let log = log();
        let plan = QueryPlan::new(vec![
            Box::new(Fail),
            Box::new(Record("after", Arc::clone(&log))),
        ]);
        let (mut conn, _client) = connection(QueryPlan::new(Vec::new()));
        let (result, _) = run_query(&mut conn, &plan, "SELECT 1");
        assert!(matches!(result, Err(Error::Command(ref e)) if e.kind == CommandErrorKind::Rejected));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn syntax_error_never_reaches_the_backend() {
        let log = log();
        let plan = QueryPlan::standard(
            Arc::new(FakeBackend(Arc::clone(&log))),
            Some(Arc::new(crate::parser::MySqlParser)),
        );
        assert_eq!(plan.stage_names(), ["parser", "execute"]);
        let (mut conn, _client) = connection(QueryPlan::new(Vec::new()));
        let (result, responded) = run_query(&mut conn, &plan, "SELEC 1");
        assert!(matches!(result, Err(Error::Command(ref e)) if e.kind == CommandErrorKind::Syntax));
        assert!(!responded);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn select_relays_a_result_set() {
        let log = log();
        let plan = QueryPlan::standard(Arc::new(FakeBackend(Arc::clone(&log))), None);
        let (mut conn, mut client) = connection(QueryPlan::new(Vec::new()));
        let (result, responded) = run_query(&mut conn, &plan, "SELECT 1");
        result.unwrap();
        assert!(responded);

        assert_eq!(client.read_packet().unwrap(), [1]);
        let def = client.read_packet().unwrap();
        assert_eq!(def, ColumnDef::new("1", FieldType::LongLong).as_bytes());
        assert_eq!(client.read_packet().unwrap(), [0xFE, 0, 0, 0, 0]);
        assert_eq!(client.read_packet().unwrap(), [1, b'1']);
        assert_eq!(client.read_packet().unwrap(), [0xFE, 0, 0, 0, 0]);
    }

    #[test]
    fn write_result_becomes_ok_packet() {
        let log = log();
        let plan = QueryPlan::standard(Arc::new(FakeBackend(Arc::clone(&log))), None);
        let (mut conn, mut client) = connection(QueryPlan::new(Vec::new()));
        run_query(&mut conn, &plan, "UPDATE t SET x=1").0.unwrap();
        assert_eq!(client.read_packet().unwrap(), [0x00, 3, 0, 0, 0, 0, 0]);
        assert_eq!(*log.lock().unwrap(), ["UPDATE t SET x=1"]);
    }

    #[test]
    fn init_db_selects_and_remembers_database() {
        let log = log();
        let plan = QueryPlan::standard(Arc::new(FakeBackend(Arc::clone(&log))), None);
        let (mut conn, mut client) = connection(QueryPlan::new(Vec::new()));

        let mut ctx = QueryContext::new(&mut conn, Command::InitDb, "shop".into(), CancelToken::new());
        plan.init_db(&mut ctx).unwrap();
        assert!(ctx.has_responded());
        assert_eq!(ctx.database(), Some("shop"));
        assert_eq!(client.read_packet().unwrap()[0], 0x00);
        client.reset_sequence();

        // the database is reapplied on the next query's session
        run_query(&mut conn, &plan, "SELECT 1").0.unwrap();
        assert_eq!(*log.lock().unwrap(), ["USE shop", "USE shop", "SELECT 1"]);

        let mut ctx = QueryContext::new(&mut conn, Command::InitDb, "missing".into(), CancelToken::new());
        let err = plan.init_db(&mut ctx).unwrap_err();
        assert_eq!(err.to_mysql_error().code, ER_BAD_DB_ERROR);
        assert_eq!(conn.database(), Some("shop"));
    }

    #[test]
    fn non_utf8_query_reaches_backend_unchanged() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let plan = QueryPlan::standard(
            Arc::new(RawBackend(Arc::clone(&seen))),
            Some(Arc::new(crate::parser::MySqlParser)),
        );
        let (mut conn, mut client) = connection(plan);

        // latin1 'é' inside a string literal
        let sql = b"SELECT '\xe9'";
        let mut packet = vec![Command::Query as u8];
        packet.extend_from_slice(sql);
        client.write_packet(&packet).unwrap();
        client.reset_sequence();
        client.write_packet(&[Command::Quit as u8]).unwrap();

        conn.run().unwrap();
        assert_eq!(client.read_packet().unwrap()[0], 0x00);
        assert_eq!(*seen.lock().unwrap(), [sql.to_vec()]);
    }

    #[test]
    fn init_db_rejects_non_utf8_names() {
        let log = log();
        let plan = QueryPlan::standard(Arc::new(FakeBackend(Arc::clone(&log))), None);
        let (mut conn, _client) = connection(QueryPlan::new(Vec::new()));

        let mut ctx =
            QueryContext::new(&mut conn, Command::InitDb, b"sh\xffop\0".to_vec(), CancelToken::new());
        let err = plan.init_db(&mut ctx).unwrap_err();
        assert_eq!(err.to_mysql_error().code, ER_BAD_DB_ERROR);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(conn.database(), None);
    }

    #[test]
    fn cancelled_token_stops_before_any_stage() {
        let log = log();
        let plan = QueryPlan::new(vec![Box::new(Record("first", Arc::clone(&log)))]);
        let (mut conn, _client) = connection(QueryPlan::new(Vec::new()));
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut ctx = QueryContext::new(&mut conn, Command::Query, "SELECT 1".into(), cancel);
        assert!(matches!(plan.query(&mut ctx), Err(Error::Cancelled)));
        assert!(log.lock().unwrap().is_empty());
    }
}
