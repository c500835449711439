//! SQL parser collaborator.

use sqlparser::ast::Statement;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use mysqlgate_core::{Error, Result};

/// Turns query text into statements, or fails with a syntax error.
pub trait SqlParser: Send + Sync {
    fn parse(&self, sql: &str) -> Result<Vec<Statement>>;
}

/// [`SqlParser`] backed by `sqlparser`'s MySQL dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlParser;

impl SqlParser for MySqlParser {
    fn parse(&self, sql: &str) -> Result<Vec<Statement>> {
        tracing::trace!(sql = sql.trim(), "parsing query");
        Parser::parse_sql(&MySqlDialect {}, sql).map_err(|e| {
            Error::syntax(format!(
                "You have an error in your SQL syntax; {e}"
            ))
        })
    }
}
