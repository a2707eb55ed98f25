//! Statement execution engine.
//!
//! Runs one statement on a borrowed connection (a plain lease or an open
//! transaction), under the per-statement timeout, and normalizes the result.
//!
//! # Architecture
//!
//! The executor uses database-specific implementations organized in submodules:
//! - `mysql`: MySQL-specific fetch and execute operations
//! - `postgres`: PostgreSQL-specific fetch and execute operations
//! - `sqlite`: SQLite-specific fetch and execute operations
//!
//! Each submodule provides identical functionality adapted to the database's
//! result types. Statements without parameters are sent unprepared so that
//! multi-statement scripts and DDL work; everything else is prepared and bound.

use crate::db::params::{
    Bound, bind_mysql_param, bind_postgres_param, bind_sqlite_param, prepare,
};
use crate::db::pool::ConnRef;
use crate::db::types::{RowToJson, sqlite_row_to_json};
use crate::error::{DbError, DbResult};
use crate::models::{ExecuteResult, Params, Row};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Runs single statements with a fixed timeout.
#[derive(Debug, Clone, Copy)]
pub struct StatementExecutor {
    statement_timeout: Duration,
}

impl StatementExecutor {
    pub fn new(statement_timeout: Duration) -> Self {
        Self { statement_timeout }
    }

    pub fn statement_timeout(&self) -> Duration {
        self.statement_timeout
    }

    /// Run a row-returning statement and decode every row.
    pub(crate) async fn fetch_all(
        &self,
        conn: ConnRef<'_>,
        sql: &str,
        params: &Params,
    ) -> DbResult<Vec<Row>> {
        let bound = prepare(sql, params, conn.db_type())?;
        let work = async {
            match conn {
                ConnRef::MySql(c) => decode_rows(mysql::fetch_all(c, &bound).await?),
                ConnRef::Postgres(c) => decode_rows(postgres::fetch_all(c, &bound).await?),
                ConnRef::SQLite(c) => {
                    let rows = sqlite::fetch_all(c, &bound).await?;
                    let declared = sqlite::declared_columns_for(c, &bound, rows.first()).await?;
                    rows.iter()
                        .map(|row| sqlite_row_to_json(row, &declared))
                        .collect()
                }
            }
        };
        self.timed("query", sql, params.len(), work).await
    }

    /// Run a row-returning statement and decode the first row, if any.
    pub(crate) async fn fetch_optional(
        &self,
        conn: ConnRef<'_>,
        sql: &str,
        params: &Params,
    ) -> DbResult<Option<Row>> {
        let bound = prepare(sql, params, conn.db_type())?;
        let work = async {
            match conn {
                ConnRef::MySql(c) => mysql::fetch_optional(c, &bound)
                    .await?
                    .map(|r| r.to_row())
                    .transpose(),
                ConnRef::Postgres(c) => postgres::fetch_optional(c, &bound)
                    .await?
                    .map(|r| r.to_row())
                    .transpose(),
                ConnRef::SQLite(c) => {
                    let row = sqlite::fetch_optional(c, &bound).await?;
                    let declared = sqlite::declared_columns_for(c, &bound, row.as_ref()).await?;
                    row.map(|r| sqlite_row_to_json(&r, &declared)).transpose()
                }
            }
        };
        self.timed("query_one", sql, params.len(), work).await
    }

    /// Run a mutating statement. On PostgreSQL any `RETURNING` rows are
    /// decoded into the result.
    pub(crate) async fn execute(
        &self,
        conn: ConnRef<'_>,
        sql: &str,
        params: &Params,
    ) -> DbResult<ExecuteResult> {
        let bound = prepare(sql, params, conn.db_type())?;
        let work = async {
            let result = match conn {
                ConnRef::MySql(c) => mysql::execute(c, &bound).await?,
                ConnRef::Postgres(c) => {
                    let (row_count, rows) = postgres::execute(c, &bound).await?;
                    ExecuteResult::new(row_count, None).with_rows(decode_rows(rows)?)
                }
                ConnRef::SQLite(c) => sqlite::execute(c, &bound).await?,
            };
            Ok::<_, DbError>(result)
        };
        self.timed("execute", sql, params.len(), work).await
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        sql: &str,
        param_count: usize,
        work: impl Future<Output = DbResult<T>>,
    ) -> DbResult<T> {
        let start = Instant::now();
        let result = match timeout(self.statement_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(DbError::timeout(
                operation,
                self.statement_timeout.as_millis() as u64,
            )),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => debug!(
                operation,
                sql = %sql,
                params = param_count,
                elapsed_ms,
                "Statement executed"
            ),
            Err(e) => warn!(
                operation,
                sql = %sql,
                params = param_count,
                elapsed_ms,
                error = %e,
                "Statement failed"
            ),
        }
        result
    }
}

fn decode_rows<R: RowToJson>(rows: Vec<R>) -> DbResult<Vec<Row>> {
    rows.iter().map(RowToJson::to_row).collect()
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// The code structure is intentionally parallel to make differences obvious.

mod mysql {
    use super::*;
    use sqlx::MySqlConnection;
    use sqlx::mysql::MySqlRow;

    pub async fn fetch_all(
        conn: &mut MySqlConnection,
        bound: &Bound<'_>,
    ) -> Result<Vec<MySqlRow>, sqlx::Error> {
        if bound.is_raw() {
            return sqlx::Executor::fetch_all(conn, &*bound.sql).await;
        }
        let mut query = sqlx::query(&*bound.sql);
        for param in bound.values.iter() {
            query = bind_mysql_param(query, param);
        }
        query.fetch_all(conn).await
    }

    pub async fn fetch_optional(
        conn: &mut MySqlConnection,
        bound: &Bound<'_>,
    ) -> Result<Option<MySqlRow>, sqlx::Error> {
        if bound.is_raw() {
            return sqlx::Executor::fetch_optional(conn, &*bound.sql).await;
        }
        let mut query = sqlx::query(&*bound.sql);
        for param in bound.values.iter() {
            query = bind_mysql_param(query, param);
        }
        query.fetch_optional(conn).await
    }

    pub async fn execute(
        conn: &mut MySqlConnection,
        bound: &Bound<'_>,
    ) -> Result<ExecuteResult, sqlx::Error> {
        let result = if bound.is_raw() {
            sqlx::Executor::execute(conn, &*bound.sql).await?
        } else {
            let mut query = sqlx::query(&*bound.sql);
            for param in bound.values.iter() {
                query = bind_mysql_param(query, param);
            }
            query.execute(conn).await?
        };
        Ok(ExecuteResult::new(
            result.rows_affected(),
            i64::try_from(result.last_insert_id()).ok(),
        ))
    }
}

mod postgres {
    use super::*;
    use crate::models::QueryParam;
    use futures_util::TryStreamExt;
    use sqlx::postgres::{PgArguments, PgRow};
    use sqlx::query::Query;
    use sqlx::{Either, PgConnection, Postgres};

    /// Bind every value. A statement carrying a NULL is not cached: its
    /// parameter types were inferred for this call only.
    fn build<'q>(bound: &'q Bound<'_>) -> Query<'q, Postgres, PgArguments> {
        let mut query = sqlx::query(&*bound.sql);
        for param in bound.values.iter() {
            query = bind_postgres_param(query, param);
        }
        query.persistent(!bound.values.iter().any(QueryParam::is_null))
    }

    pub async fn fetch_all(
        conn: &mut PgConnection,
        bound: &Bound<'_>,
    ) -> Result<Vec<PgRow>, sqlx::Error> {
        if bound.is_raw() {
            return sqlx::Executor::fetch_all(conn, &*bound.sql).await;
        }
        build(bound).fetch_all(conn).await
    }

    pub async fn fetch_optional(
        conn: &mut PgConnection,
        bound: &Bound<'_>,
    ) -> Result<Option<PgRow>, sqlx::Error> {
        if bound.is_raw() {
            return sqlx::Executor::fetch_optional(conn, &*bound.sql).await;
        }
        build(bound).fetch_optional(conn).await
    }

    /// PostgreSQL has no implicit insert id; generated keys come back as
    /// `RETURNING` rows next to the affected-row count.
    pub async fn execute(
        conn: &mut PgConnection,
        bound: &Bound<'_>,
    ) -> Result<(u64, Vec<PgRow>), sqlx::Error> {
        let mut stream = if bound.is_raw() {
            sqlx::Executor::fetch_many(conn, &*bound.sql)
        } else {
            sqlx::Executor::fetch_many(conn, build(bound))
        };

        let mut row_count = 0;
        let mut rows = Vec::new();
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => row_count += done.rows_affected(),
                Either::Right(row) => rows.push(row),
            }
        }
        Ok((row_count, rows))
    }
}

mod sqlite {
    use super::*;
    use libsqlite3_sys as ffi;
    use sqlx::sqlite::SqliteRow;
    use sqlx::{Column, Row as _, SqliteConnection};
    use std::ffi::{CStr, CString};
    use std::ptr;

    /// Declared types of the columns in `row`, looked up only when there is a
    /// row to decode.
    pub async fn declared_columns_for(
        conn: &mut SqliteConnection,
        bound: &Bound<'_>,
        row: Option<&SqliteRow>,
    ) -> Result<Vec<Option<String>>, sqlx::Error> {
        let Some(row) = row else {
            return Ok(Vec::new());
        };
        let described = declared_types(conn, &bound.sql).await?;
        let names_match = described.len() == row.columns().len()
            && described
                .iter()
                .zip(row.columns())
                .all(|((name, _), col)| name == col.name());
        if !names_match {
            // A script whose rows come from a later statement
            return Ok(Vec::new());
        }
        Ok(described.into_iter().map(|(_, decl)| decl).collect())
    }

    /// Column names and declared types of the first statement in `sql`.
    ///
    /// sqlx only reports declarations it has a Rust type for, so a column
    /// declared `JSON` would otherwise be indistinguishable from `TEXT`.
    async fn declared_types(
        conn: &mut SqliteConnection,
        sql: &str,
    ) -> Result<Vec<(String, Option<String>)>, sqlx::Error> {
        let Ok(sql) = CString::new(sql) else {
            return Ok(Vec::new());
        };
        let mut handle = conn.lock_handle().await?;
        let db = handle.as_raw_handle().as_ptr();
        let mut stmt = ptr::null_mut();

        // SAFETY: `handle` gives exclusive use of `db` until it is dropped,
        // and `stmt` is finalized before leaving the block.
        unsafe {
            let rc = ffi::sqlite3_prepare_v2(db, sql.as_ptr(), -1, &mut stmt, ptr::null_mut());
            if rc != ffi::SQLITE_OK || stmt.is_null() {
                ffi::sqlite3_finalize(stmt);
                return Ok(Vec::new());
            }
            let columns = (0..ffi::sqlite3_column_count(stmt))
                .map(|i| {
                    let text = |p: *const std::os::raw::c_char| {
                        (!p.is_null()).then(|| CStr::from_ptr(p).to_string_lossy().into_owned())
                    };
                    (
                        text(ffi::sqlite3_column_name(stmt, i)).unwrap_or_default(),
                        text(ffi::sqlite3_column_decltype(stmt, i)),
                    )
                })
                .collect();
            ffi::sqlite3_finalize(stmt);
            Ok(columns)
        }
    }

    pub async fn fetch_all(
        conn: &mut SqliteConnection,
        bound: &Bound<'_>,
    ) -> Result<Vec<SqliteRow>, sqlx::Error> {
        if bound.is_raw() {
            return sqlx::Executor::fetch_all(conn, &*bound.sql).await;
        }
        let mut query = sqlx::query(&*bound.sql);
        for param in bound.values.iter() {
            query = bind_sqlite_param(query, param);
        }
        query.fetch_all(conn).await
    }

    pub async fn fetch_optional(
        conn: &mut SqliteConnection,
        bound: &Bound<'_>,
    ) -> Result<Option<SqliteRow>, sqlx::Error> {
        if bound.is_raw() {
            return sqlx::Executor::fetch_optional(conn, &*bound.sql).await;
        }
        let mut query = sqlx::query(&*bound.sql);
        for param in bound.values.iter() {
            query = bind_sqlite_param(query, param);
        }
        query.fetch_optional(conn).await
    }

    /// The reported id is the connection's last inserted rowid.
    pub async fn execute(
        conn: &mut SqliteConnection,
        bound: &Bound<'_>,
    ) -> Result<ExecuteResult, sqlx::Error> {
        let result = if bound.is_raw() {
            sqlx::Executor::execute(conn, &*bound.sql).await?
        } else {
            let mut query = sqlx::query(&*bound.sql);
            for param in bound.values.iter() {
                query = bind_sqlite_param(query, param);
            }
            query.execute(conn).await?
        };
        Ok(ExecuteResult::new(
            result.rows_affected(),
            Some(result.last_insert_rowid()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, SqliteConfig};
    use crate::db::pool::PoolManager;
    use crate::models::QueryParam;
    use serde_json::json;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir) -> PoolManager {
        let config = SqliteConfig::new(dir.path().join("exec.db"));
        PoolManager::connect(&BackendConfig::Sqlite(config))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_unprepared_script_then_insert() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let executor = StatementExecutor::new(Duration::from_secs(5));
        let mut lease = manager.acquire().await.unwrap();

        executor
            .execute(
                lease.conn(),
                "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT); CREATE INDEX t_name ON t (name);",
                &Params::None,
            )
            .await
            .unwrap();

        let result = executor
            .execute(
                lease.conn(),
                "INSERT INTO t (name) VALUES (?)",
                &Params::from(["Ada"]),
            )
            .await
            .unwrap();
        assert_eq!(result, ExecuteResult::new(1, Some(1)));

        let rows = executor
            .fetch_all(lease.conn(), "SELECT id, name FROM t", &Params::None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("Ada"));
    }

    #[tokio::test]
    async fn test_fetch_optional_empty() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let executor = StatementExecutor::new(Duration::from_secs(5));
        let mut lease = manager.acquire().await.unwrap();

        let row = executor
            .fetch_optional(
                lease.conn(),
                "SELECT 1 AS one WHERE 1 = ?",
                &Params::from([0]),
            )
            .await
            .unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn test_row_normalization() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let executor = StatementExecutor::new(Duration::from_secs(5));
        let mut lease = manager.acquire().await.unwrap();

        executor
            .execute(
                lease.conn(),
                "CREATE TABLE v (i INTEGER, r REAL, s TEXT, b BLOB, flag BOOLEAN, doc JSON, n TEXT)",
                &Params::None,
            )
            .await
            .unwrap();
        executor
            .execute(
                lease.conn(),
                "INSERT INTO v VALUES (?, ?, ?, ?, ?, ?, ?)",
                &Params::positional([
                    QueryParam::Int(7),
                    QueryParam::Float(1.5),
                    QueryParam::String("x".into()),
                    QueryParam::Bytes(b"hi".to_vec()),
                    QueryParam::Bool(true),
                    QueryParam::Json(json!({"k": [1, 2]})),
                    QueryParam::Null,
                ]),
            )
            .await
            .unwrap();

        let row = executor
            .fetch_optional(lease.conn(), "SELECT * FROM v", &Params::None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            serde_json::Value::Object(row),
            json!({
                "i": 7,
                "r": 1.5,
                "s": "x",
                "b": "aGk=",
                "flag": true,
                "doc": {"k": [1, 2]},
                "n": null
            })
        );
    }

    #[tokio::test]
    async fn test_sqlite_json_follows_declared_type() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let executor = StatementExecutor::new(Duration::from_secs(5));
        let mut lease = manager.acquire().await.unwrap();

        executor
            .execute(
                lease.conn(),
                "CREATE TABLE docs (id INTEGER PRIMARY KEY, body JSON, note TEXT);
                 INSERT INTO docs (body, note) VALUES ('[1, 2]', '{\"not\": \"json\"}');",
                &Params::None,
            )
            .await
            .unwrap();

        let rows = executor
            .fetch_all(
                lease.conn(),
                "SELECT body, body AS copy, note, json_array(id) AS expr FROM docs WHERE id = ?",
                &Params::from([1]),
            )
            .await
            .unwrap();
        assert_eq!(
            serde_json::Value::Object(rows[0].clone()),
            json!({
                "body": [1, 2],
                "copy": [1, 2],
                "note": "{\"not\": \"json\"}",
                "expr": "[1]"
            })
        );
    }

    #[tokio::test]
    async fn test_statement_error_is_classified() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let executor = StatementExecutor::new(Duration::from_secs(5));
        let mut lease = manager.acquire().await.unwrap();

        let err = executor
            .fetch_all(lease.conn(), "SELECT * FROM missing_table", &Params::None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Statement { .. }));

        let err = executor
            .fetch_all(
                lease.conn(),
                "SELECT :missing",
                &Params::named([("other", 1)]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_statement_timeout() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let executor = StatementExecutor::new(Duration::from_millis(1));
        let mut lease = manager.acquire().await.unwrap();

        let result = executor
            .fetch_all(
                lease.conn(),
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 5000000) SELECT count(*) FROM c",
                &Params::None,
            )
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, DbError::Timeout { .. }));
        assert!(err.is_retryable());
    }
}
