//! SQL script tokenizer.
//!
//! Plugin scripts hold many statements separated by `;`. A naive split breaks
//! on semicolons inside string literals (seed rows, default values), so the
//! script is walked character by character, tracking quote and comment state.
//!
//! Recognised inside literals: doubled quotes (`'it''s'`) and backslash
//! escapes (`'it\'s'`). Comments outside literals are dropped.

use std::sync::LazyLock;

use regex::Regex;

/// Placeholder substituted with the deployment's table prefix.
pub const PREFIX_PLACEHOLDER: &str = "{prefix}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Split a script into individual statements.
///
/// Statements are trimmed and empty ones discarded. A final statement
/// without a terminating `;` is kept.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = State::Normal;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                ';' => flush(&mut current, &mut statements),
                '\'' | '"' | '`' => {
                    current.push(c);
                    state = State::Quoted(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                }
                _ => current.push(c),
            },
            State::Quoted(quote) => {
                current.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                } else if c == quote {
                    if chars.peek() == Some(&quote) {
                        // Doubled quote: literal quote character, still inside.
                        if let Some(next) = chars.next() {
                            current.push(next);
                        }
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::LineComment => {
                if c == '\n' {
                    current.push('\n');
                    state = State::Normal;
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    current.push(' ');
                    state = State::Normal;
                }
            }
        }
    }

    flush(&mut current, &mut statements);
    statements
}

fn flush(current: &mut String, statements: &mut Vec<String>) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}

/// Replace every prefix placeholder in a script.
pub fn substitute_prefix(sql: &str, prefix: &str) -> String {
    sql.replace(PREFIX_PLACEHOLDER, prefix)
}

// Pattern is a compile-time constant.
#[allow(clippy::expect_used)]
static CREATE_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)^\s*CREATE\s+(?P<temp>TEMP\s+|TEMPORARY\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:(?P<schema>"(?:[^"]|"")+"|`(?:[^`]|``)+`|\[[^\]]+\]|\w+)\s*\.\s*)?(?:"(?P<dq>(?:[^"]|"")+)"|`(?P<bq>(?:[^`]|``)+)`|\[(?P<br>[^\]]+)\]|(?P<bare>\w+))"#,
    )
    .expect("create table pattern is valid")
});

/// Name of the persistent table created by a statement, if it is a
/// `CREATE TABLE`.
///
/// Quoted names are returned unquoted. Temporary tables live only as long
/// as their connection and yield `None`.
pub fn created_table(statement: &str) -> Option<String> {
    let caps = CREATE_TABLE.captures(statement)?;

    let schema = caps
        .name("schema")
        .map(|m| m.as_str().trim_matches(|c| matches!(c, '"' | '`' | '[' | ']')));
    if caps.name("temp").is_some() || schema.is_some_and(|s| s.eq_ignore_ascii_case("temp")) {
        return None;
    }

    if let Some(m) = caps.name("dq") {
        Some(m.as_str().replace("\"\"", "\""))
    } else if let Some(m) = caps.name("bq") {
        Some(m.as_str().replace("``", "`"))
    } else {
        caps.name("br")
            .or_else(|| caps.name("bare"))
            .map(|m| m.as_str().to_string())
    }
}
