//! Static table of MySQL server error codes.
//!
//! Each known code maps to its five-character SQL state and a message
//! template. Templates use `{}` placeholders which are filled positionally by
//! [`format_message`]. The table is a `match`, so it is immutable and needs no
//! initialisation at runtime.

use std::fmt::Display;

/// SQL state used for codes missing from the table.
pub const DEFAULT_SQL_STATE: &str = "HY000";

pub const ER_CON_COUNT_ERROR: u16 = 1040;
pub const ER_HANDSHAKE_ERROR: u16 = 1043;
pub const ER_DBACCESS_DENIED_ERROR: u16 = 1044;
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
pub const ER_NO_DB_ERROR: u16 = 1046;
pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
pub const ER_BAD_DB_ERROR: u16 = 1049;
pub const ER_SERVER_SHUTDOWN: u16 = 1053;
pub const ER_PARSE_ERROR: u16 = 1064;
pub const ER_UNKNOWN_ERROR: u16 = 1105;
pub const ER_SYNTAX_ERROR: u16 = 1149;
pub const ER_NET_PACKET_TOO_LARGE: u16 = 1153;
pub const ER_NET_PACKETS_OUT_OF_ORDER: u16 = 1156;
pub const ER_NET_READ_ERROR: u16 = 1158;
pub const ER_NET_ERROR_ON_WRITE: u16 = 1160;
pub const ER_NOT_SUPPORTED_YET: u16 = 1235;
pub const ER_NOT_SUPPORTED_AUTH_MODE: u16 = 1251;
pub const ER_QUERY_INTERRUPTED: u16 = 1317;

/// Look up the SQL state and message template for a code.
pub fn lookup(code: u16) -> Option<(&'static str, &'static str)> {
    let entry = match code {
        ER_CON_COUNT_ERROR => ("08004", "Too many connections"),
        ER_HANDSHAKE_ERROR => ("08S01", "Bad handshake"),
        ER_DBACCESS_DENIED_ERROR => (
            "42000",
            "Access denied for user '{}'@'{}' to database '{}'",
        ),
        ER_ACCESS_DENIED_ERROR => (
            "28000",
            "Access denied for user '{}'@'{}' (using password: {})",
        ),
        ER_NO_DB_ERROR => ("3D000", "No database selected"),
        ER_UNKNOWN_COM_ERROR => ("08S01", "Unknown command"),
        ER_BAD_DB_ERROR => ("42000", "Unknown database '{}'"),
        ER_SERVER_SHUTDOWN => ("08S01", "Server shutdown in progress"),
        ER_PARSE_ERROR => ("42000", "{} near '{}' at line {}"),
        ER_UNKNOWN_ERROR => ("HY000", "Unknown error"),
        ER_SYNTAX_ERROR => (
            "42000",
            "You have an error in your SQL syntax; check the manual that corresponds to your MySQL server version for the right syntax to use",
        ),
        ER_NET_PACKET_TOO_LARGE => (
            "08S01",
            "Got a packet bigger than 'max_allowed_packet' bytes",
        ),
        ER_NET_PACKETS_OUT_OF_ORDER => ("08S01", "Got packets out of order"),
        ER_NET_READ_ERROR => ("08S01", "Got an error reading communication packets"),
        ER_NET_ERROR_ON_WRITE => ("08S01", "Got an error writing communication packets"),
        ER_NOT_SUPPORTED_YET => ("42000", "This version of MySQL doesn't yet support '{}'"),
        ER_NOT_SUPPORTED_AUTH_MODE => (
            "08004",
            "Client does not support authentication protocol requested by server; consider upgrading MySQL client",
        ),
        ER_QUERY_INTERRUPTED => ("70100", "Query execution was interrupted"),
        _ => return None,
    };
    Some(entry)
}

/// SQL state for a code, falling back to [`DEFAULT_SQL_STATE`].
pub fn sql_state(code: u16) -> &'static str {
    lookup(code).map_or(DEFAULT_SQL_STATE, |(state, _)| state)
}

/// Render the message for `code` with positional arguments.
///
/// Unknown codes join the arguments with single spaces.
pub fn format_message(code: u16, args: &[&dyn Display]) -> String {
    let Some((_, template)) = lookup(code) else {
        return args
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(" ");
    };

    let mut out = String::with_capacity(template.len() + 16 * args.len());
    let mut args = args.iter();
    let mut pieces = template.split("{}").peekable();
    while let Some(piece) = pieces.next() {
        out.push_str(piece);
        if pieces.peek().is_some() {
            if let Some(arg) = args.next() {
                out.push_str(&arg.to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_have_states() {
        assert_eq!(sql_state(ER_ACCESS_DENIED_ERROR), "28000");
        assert_eq!(sql_state(ER_PARSE_ERROR), "42000");
        assert_eq!(sql_state(ER_UNKNOWN_ERROR), "HY000");
        assert_eq!(sql_state(9999), DEFAULT_SQL_STATE);
    }

    #[test]
    fn template_arguments_fill_in_order() {
        let msg = format_message(ER_ACCESS_DENIED_ERROR, &[&"root", &"127.0.0.1", &"YES"]);
        assert_eq!(
            msg,
            "Access denied for user 'root'@'127.0.0.1' (using password: YES)"
        );
    }

    #[test]
    fn missing_arguments_leave_blanks() {
        let msg = format_message(ER_BAD_DB_ERROR, &[]);
        assert_eq!(msg, "Unknown database ''");
    }

    #[test]
    fn unknown_code_joins_arguments() {
        let msg = format_message(4242, &[&"custom", &7]);
        assert_eq!(msg, "custom 7");
    }

    #[test]
    fn templates_without_placeholders_ignore_arguments() {
        assert_eq!(
            format_message(ER_NO_DB_ERROR, &[&"ignored"]),
            "No database selected"
        );
    }
}
