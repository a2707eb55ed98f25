//! Parameter binding utilities for database queries.
//!
//! Statements reach a backend with positional placeholders only. Named
//! parameters (`:name`) are rewritten here to `?` (SQLite, MySQL) or `$n`
//! (PostgreSQL), and the values are reordered to match. The `bind_*` functions
//! then attach `QueryParam` values to backend-specific query objects.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Params, QueryParam};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgTypeInfo};
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{Encode, MySql, Postgres, Sqlite, Type};
use std::borrow::Cow;

/// A statement ready to send: positional SQL plus values in placeholder order.
#[derive(Debug)]
pub(crate) struct Bound<'a> {
    pub sql: Cow<'a, str>,
    pub values: Cow<'a, [QueryParam]>,
}

impl Bound<'_> {
    /// Whether the statement carries no values and can be sent unprepared.
    pub fn is_raw(&self) -> bool {
        self.values.is_empty()
    }
}

/// Resolve `params` against `sql` for the given backend.
///
/// Positional values pass through untouched. Named values must cover every
/// `:name` placeholder in the statement; extra names are ignored.
pub(crate) fn prepare<'a>(
    sql: &'a str,
    params: &'a Params,
    db_type: DatabaseType,
) -> DbResult<Bound<'a>> {
    match params {
        Params::None => Ok(Bound {
            sql: Cow::Borrowed(sql),
            values: Cow::Borrowed(&[]),
        }),
        Params::Positional(values) => Ok(Bound {
            sql: Cow::Borrowed(sql),
            values: Cow::Borrowed(values.as_slice()),
        }),
        Params::Named(named) => {
            let mut names: Vec<&str> = Vec::new();
            let mut values: Vec<QueryParam> = Vec::new();

            let rewritten = rewrite_named(sql, db_type, |name| {
                let value = named.get(name).ok_or_else(|| {
                    DbError::invalid_input(format!("Missing value for named parameter :{name}"))
                })?;

                if db_type == DatabaseType::PostgreSQL {
                    // $n placeholders can be referenced more than once
                    if let Some(pos) = names.iter().position(|n| *n == name) {
                        return Ok(format!("${}", pos + 1));
                    }
                    names.push(name);
                    values.push(value.clone());
                    Ok(format!("${}", values.len()))
                } else {
                    values.push(value.clone());
                    Ok("?".to_string())
                }
            })?;

            Ok(Bound {
                sql: Cow::Owned(rewritten),
                values: Cow::Owned(values),
            })
        }
    }
}

/// Walk `sql`, replacing each `:name` outside literals and comments with the
/// text returned by `placeholder`.
fn rewrite_named<'s, F>(sql: &'s str, db_type: DatabaseType, mut placeholder: F) -> DbResult<String>
where
    F: FnMut(&'s str) -> DbResult<String>,
{
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                let backslash_escapes = match db_type {
                    DatabaseType::MySQL => true,
                    DatabaseType::PostgreSQL => is_escape_string_prefix(bytes, i),
                    DatabaseType::SQLite => false,
                };
                i = skip_quoted(bytes, i, b'\'', backslash_escapes);
            }
            b'"' => i = skip_quoted(bytes, i, b'"', db_type == DatabaseType::MySQL),
            b'`' => i = skip_quoted(bytes, i, b'`', false),
            // SQLite also quotes identifiers as [name]
            b'[' if db_type == DatabaseType::SQLite => {
                i = bytes[i..]
                    .iter()
                    .position(|b| *b == b']')
                    .map_or(bytes.len(), |p| i + p + 1);
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = bytes[i..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .map_or(bytes.len(), |p| i + p + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = sql[i + 2..].find("*/").map_or(bytes.len(), |p| i + 2 + p + 2);
            }
            b'$' if db_type == DatabaseType::PostgreSQL => i = skip_dollar_quoted(sql, i),
            b':' => match bytes.get(i + 1) {
                // `::type` casts and `:=` assignments
                Some(b':') | Some(b'=') => i += 2,
                Some(c) if c.is_ascii_alphabetic() || *c == b'_' => {
                    let start = i + 1;
                    let end = bytes[start..]
                        .iter()
                        .position(|b| !(b.is_ascii_alphanumeric() || *b == b'_'))
                        .map_or(bytes.len(), |p| start + p);
                    out.push_str(&sql[copied..i]);
                    out.push_str(&placeholder(&sql[start..end])?);
                    copied = end;
                    i = end;
                }
                _ => i += 1,
            },
            _ => i += 1,
        }
    }

    out.push_str(&sql[copied..]);
    Ok(out)
}

/// Whether the quote at `quote` opens a PostgreSQL `E'...'` escape string.
fn is_escape_string_prefix(bytes: &[u8], quote: usize) -> bool {
    let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    match quote.checked_sub(1).map(|p| bytes[p]) {
        Some(b'E' | b'e') => quote < 2 || !is_ident(bytes[quote - 2]),
        _ => false,
    }
}

/// Return the index just past the closing quote. A doubled quote is an escape;
/// with `backslash_escapes`, so is a backslash.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        let b = bytes[i];
        if backslash_escapes && b == b'\\' {
            i += 2;
        } else if b == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
            } else {
                return i + 1;
            }
        } else {
            i += 1;
        }
    }
    bytes.len()
}

/// Skip a PostgreSQL dollar-quoted body (`$$...$$` or `$tag$...$tag$`, where a
/// tag is an identifier). Anything else starting with `$` (such as `$1`) is
/// stepped over by one byte.
fn skip_dollar_quoted(sql: &str, start: usize) -> usize {
    let rest = sql[start + 1..].as_bytes();
    let tag_len = match rest.first() {
        Some(b) if b.is_ascii_alphabetic() || *b == b'_' => rest
            .iter()
            .position(|b| !(b.is_ascii_alphanumeric() || *b == b'_'))
            .unwrap_or(rest.len()),
        _ => 0,
    };
    if rest.get(tag_len) != Some(&b'$') {
        return start + 1;
    }

    let delimiter = &sql[start..start + tag_len + 2];
    let body_start = start + delimiter.len();
    sql[body_start..]
        .find(delimiter)
        .map_or(sql.len(), |p| body_start + p + delimiter.len())
}

/// A PostgreSQL NULL declared with no type (OID 0), so the server infers the
/// parameter type from where it is used instead of rejecting `text` in a typed
/// position.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

/// Bind a parameter to a PostgreSQL query.
///
/// Strings are sent as `text`: sqlx transmits every value in binary format, so
/// an untyped string would be read with the binary decoder of whatever type
/// the server picks. Cast in SQL (`:day::date`) to target other types.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(UntypedNull),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        // SQLite doesn't have native JSON type, store as string
        QueryParam::Json(v) => query.bind(v.to_string()),
    }
}
