//! Scoped transactions.
//!
//! A [`TransactionScope`] is an open transaction on a leased connection. It
//! borrows the lease, so it cannot outlive the call that opened it, and the
//! lease is released when that call returns no matter how the unit of work
//! ended.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --begin--> Began --Ok--> Committed --+
//!                   |                       +--> Released (lease dropped)
//!                   +---Err--> RolledBack --+
//! ```
//!
//! Dropping a scope without finishing it (panic, cancellation) leaves the
//! rollback to the driver, which issues it before the connection is reused.

use crate::db::executor::StatementExecutor;
use crate::db::pool::{ConnRef, Lease, LeasedConn, mark_if_timed_out};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, ExecuteResult, Params, Row};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use sqlx::{MySql, Postgres, Sqlite, Transaction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Driver transaction for each backend.
pub(crate) enum ScopeTx<'c> {
    MySql(Transaction<'c, MySql>),
    Postgres(Transaction<'c, Postgres>),
    SQLite(Transaction<'c, Sqlite>),
}

impl<'c> ScopeTx<'c> {
    async fn begin(conn: &'c mut LeasedConn) -> Result<Self, sqlx::Error> {
        Ok(match conn {
            LeasedConn::MySql(c) => ScopeTx::MySql(sqlx::Connection::begin(&mut **c).await?),
            LeasedConn::Postgres(c) => {
                ScopeTx::Postgres(sqlx::Connection::begin(&mut **c).await?)
            }
            // Take the database write lock up front instead of on the first write
            LeasedConn::SQLite(c) => ScopeTx::SQLite(
                sqlx::Connection::begin_with(&mut **c, "BEGIN IMMEDIATE").await?,
            ),
        })
    }

    fn conn(&mut self) -> ConnRef<'_> {
        match self {
            ScopeTx::MySql(tx) => ConnRef::MySql(&mut **tx),
            ScopeTx::Postgres(tx) => ConnRef::Postgres(&mut **tx),
            ScopeTx::SQLite(tx) => ConnRef::SQLite(&mut **tx),
        }
    }

    async fn commit(self) -> Result<(), sqlx::Error> {
        db_dispatch!(ScopeTx, self, |tx| tx.commit().await)
    }

    async fn rollback(self) -> Result<(), sqlx::Error> {
        db_dispatch!(ScopeTx, self, |tx| tx.rollback().await)
    }
}

/// An open transaction handed to a unit of work.
///
/// Statements run strictly in call order. Statement errors come back as
/// [`DbError::TransactionFailure`]; returning any error from the unit of work
/// rolls the transaction back.
pub struct TransactionScope<'c> {
    tx: ScopeTx<'c>,
    executor: StatementExecutor,
    db_type: DatabaseType,
    /// Shared with the lease: a timed-out statement leaves the connection unusable.
    discard: &'c AtomicBool,
    started: Instant,
    statements: usize,
}

impl std::fmt::Debug for TransactionScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("db_type", &self.db_type)
            .field("statements", &self.statements)
            .finish_non_exhaustive()
    }
}

impl TransactionScope<'_> {
    pub fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Run a row-returning statement inside the transaction.
    pub async fn query(&mut self, sql: &str, params: impl Into<Params>) -> DbResult<Vec<Row>> {
        let params = params.into();
        self.statements += 1;
        let result = self
            .executor
            .fetch_all(self.tx.conn(), sql, &params)
            .await;
        self.check(result)
    }

    /// Like [`query`](Self::query), deserializing each row into `T`.
    pub async fn query_as<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        params: impl Into<Params>,
    ) -> DbResult<Vec<T>> {
        let rows = self.query(sql, params).await?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(serde_json::Value::Object(row))
                    .map_err(|e| DbError::from(e).in_transaction())
            })
            .collect()
    }

    /// Run a statement and return its first row, or `None` for an empty result.
    pub async fn query_one(
        &mut self,
        sql: &str,
        params: impl Into<Params>,
    ) -> DbResult<Option<Row>> {
        let params = params.into();
        self.statements += 1;
        let result = self
            .executor
            .fetch_optional(self.tx.conn(), sql, &params)
            .await;
        self.check(result)
    }

    /// Like [`query_one`](Self::query_one), deserializing the row into `T`.
    pub async fn query_one_as<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        params: impl Into<Params>,
    ) -> DbResult<Option<T>> {
        match self.query_one(sql, params).await? {
            Some(row) => serde_json::from_value(serde_json::Value::Object(row))
                .map(Some)
                .map_err(|e| DbError::from(e).in_transaction()),
            None => Ok(None),
        }
    }

    /// Run a mutating statement inside the transaction.
    pub async fn execute(
        &mut self,
        sql: &str,
        params: impl Into<Params>,
    ) -> DbResult<ExecuteResult> {
        let params = params.into();
        self.execute_params(sql, &params).await
    }

    pub(crate) async fn execute_params(
        &mut self,
        sql: &str,
        params: &Params,
    ) -> DbResult<ExecuteResult> {
        self.statements += 1;
        let result = self.executor.execute(self.tx.conn(), sql, params).await;
        self.check(result)
    }

    fn check<T>(&self, result: DbResult<T>) -> DbResult<T> {
        result.map_err(|e| {
            mark_if_timed_out(self.discard, &e);
            e.in_transaction()
        })
    }
}

/// Open a transaction on `lease`.
pub(crate) async fn begin<'c>(
    lease: &'c mut Lease,
    executor: StatementExecutor,
) -> DbResult<TransactionScope<'c>> {
    let (conn, discard) = lease.split();
    let db_type = match &*conn {
        LeasedConn::MySql(_) => DatabaseType::MySQL,
        LeasedConn::Postgres(_) => DatabaseType::PostgreSQL,
        LeasedConn::SQLite(_) => DatabaseType::SQLite,
    };

    let tx = match tokio::time::timeout(executor.statement_timeout(), ScopeTx::begin(conn)).await {
        Ok(result) => result?,
        Err(_) => {
            discard.store(true, Ordering::Release);
            return Err(DbError::timeout(
                "begin",
                executor.statement_timeout().as_millis() as u64,
            ));
        }
    };
    debug!(db_type = %db_type, "Transaction began");

    Ok(TransactionScope {
        tx,
        executor,
        db_type,
        discard,
        started: Instant::now(),
        statements: 0,
    })
}

/// Commit or roll back `scope` according to `outcome`.
///
/// On `Ok` the transaction is committed; a failing commit is returned as
/// [`DbError::TransactionFailure`]. On `Err` the transaction is rolled back
/// and the original error is returned unchanged; rollback failures are only
/// logged.
pub(crate) async fn finish<T, E>(scope: TransactionScope<'_>, outcome: Result<T, E>) -> Result<T, E>
where
    E: From<DbError>,
{
    let TransactionScope {
        tx,
        executor,
        db_type,
        discard,
        started,
        statements,
    } = scope;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let limit = executor.statement_timeout();

    if discard.load(Ordering::Acquire) {
        // The connection is closed with the lease; the server discards the transaction.
        drop(tx);
        warn!(db_type = %db_type, statements, "Transaction abandoned after statement timeout");
        return match outcome {
            Ok(_) => Err(E::from(DbError::TransactionFailure {
                source: Box::new(DbError::timeout("transaction", elapsed_ms)),
            })),
            Err(e) => Err(e),
        };
    }

    match outcome {
        Ok(value) => match tokio::time::timeout(limit, tx.commit()).await {
            Ok(Ok(())) => {
                debug!(db_type = %db_type, statements, elapsed_ms, "Transaction committed");
                Ok(value)
            }
            Ok(Err(e)) => {
                warn!(db_type = %db_type, error = %e, "Commit failed");
                Err(E::from(DbError::TransactionFailure {
                    source: Box::new(DbError::from(e)),
                }))
            }
            Err(_) => {
                discard.store(true, Ordering::Release);
                warn!(db_type = %db_type, "Commit timed out");
                Err(E::from(DbError::TransactionFailure {
                    source: Box::new(DbError::timeout("commit", limit.as_millis() as u64)),
                }))
            }
        },
        Err(e) => {
            match tokio::time::timeout(limit, tx.rollback()).await {
                Ok(Ok(())) => {
                    debug!(db_type = %db_type, statements, elapsed_ms, "Transaction rolled back")
                }
                Ok(Err(rollback_err)) => {
                    warn!(db_type = %db_type, error = %rollback_err, "Rollback failed")
                }
                Err(_) => {
                    discard.store(true, Ordering::Release);
                    warn!(db_type = %db_type, "Rollback timed out")
                }
            }
            Err(e)
        }
    }
}

/// Run `work` inside a transaction on `lease`: begin, run, then commit or roll
/// back.
pub(crate) async fn run<T, E, F>(
    lease: &mut Lease,
    executor: StatementExecutor,
    work: F,
) -> Result<T, E>
where
    F: for<'s> FnOnce(&'s mut TransactionScope<'_>) -> BoxFuture<'s, Result<T, E>>,
    E: From<DbError>,
{
    let mut scope = begin(lease, executor).await.map_err(E::from)?;
    let outcome = work(&mut scope).await;
    finish(scope, outcome).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, PoolOptions, SqliteConfig};
    use crate::db::pool::PoolManager;
    use serde::Deserialize;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> PoolManager {
        let config = SqliteConfig::new(dir.path().join("tx.db")).with_pool_options(PoolOptions {
            acquire_timeout_secs: Some(1),
            ..PoolOptions::default()
        });
        let manager = PoolManager::connect(&BackendConfig::Sqlite(config))
            .await
            .unwrap();
        let mut lease = manager.acquire().await.unwrap();
        executor()
            .execute(
                lease.conn(),
                "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT NOT NULL UNIQUE)",
                &Params::None,
            )
            .await
            .unwrap();
        drop(lease);
        manager
    }

    fn executor() -> StatementExecutor {
        StatementExecutor::new(Duration::from_secs(5))
    }

    async fn count(manager: &PoolManager) -> i64 {
        let mut lease = manager.acquire().await.unwrap();
        let row = executor()
            .fetch_optional(lease.conn(), "SELECT COUNT(*) AS n FROM items", &Params::None)
            .await
            .unwrap()
            .unwrap();
        row["n"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_commit_on_ok() {
        let dir = TempDir::new().unwrap();
        let manager = setup(&dir).await;
        let mut lease = manager.acquire().await.unwrap();

        let result: DbResult<u64> = run(&mut lease, executor(), |tx| {
            Box::pin(async move {
                let a = tx.execute("INSERT INTO items (label) VALUES (?)", ["a"]).await?;
                let b = tx.execute("INSERT INTO items (label) VALUES (?)", ["b"]).await?;
                Ok(a.row_count + b.row_count)
            })
        })
        .await;
        drop(lease);

        assert_eq!(result.unwrap(), 2);
        assert_eq!(count(&manager).await, 2);
    }

    #[tokio::test]
    async fn test_rollback_returns_original_error() {
        let dir = TempDir::new().unwrap();
        let manager = setup(&dir).await;
        let mut lease = manager.acquire().await.unwrap();

        let result: DbResult<()> = run(&mut lease, executor(), |tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO items (label) VALUES (?)", ["a"]).await?;
                Err(DbError::aborted("changed my mind"))
            })
        })
        .await;
        drop(lease);

        assert!(matches!(result, Err(DbError::Aborted { .. })));
        assert_eq!(count(&manager).await, 0);
        assert_eq!(manager.status().in_use, 0);
    }

    #[tokio::test]
    async fn test_statement_error_wrapped_and_rolled_back() {
        let dir = TempDir::new().unwrap();
        let manager = setup(&dir).await;
        let mut lease = manager.acquire().await.unwrap();

        let result: DbResult<()> = run(&mut lease, executor(), |tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO items (label) VALUES (?)", ["dup"]).await?;
                tx.execute("INSERT INTO items (label) VALUES (?)", ["dup"]).await?;
                Ok(())
            })
        })
        .await;
        drop(lease);

        let err = result.unwrap_err();
        assert!(matches!(err, DbError::TransactionFailure { .. }));
        assert!(err.is_constraint_violation());
        assert_eq!(count(&manager).await, 0);
    }

    #[tokio::test]
    async fn test_typed_reads_inside_transaction() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Item {
            id: i64,
            label: String,
        }

        let dir = TempDir::new().unwrap();
        let manager = setup(&dir).await;
        let mut lease = manager.acquire().await.unwrap();

        let result: DbResult<(Vec<Item>, Option<Item>)> = run(&mut lease, executor(), |tx| {
            Box::pin(async move {
                assert_eq!(tx.database_type(), DatabaseType::SQLite);
                tx.execute("INSERT INTO items (label) VALUES (?)", ["x"]).await?;
                let all = tx.query_as::<Item>("SELECT id, label FROM items", ()).await?;
                let none = tx
                    .query_one_as::<Item>("SELECT id, label FROM items WHERE id = ?", [99])
                    .await?;
                Ok((all, none))
            })
        })
        .await;

        let (all, none) = result.unwrap();
        assert_eq!(
            all,
            vec![Item {
                id: 1,
                label: "x".into()
            }]
        );
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_decode_error_is_transaction_failure() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Wrong {
            id: String,
        }

        let dir = TempDir::new().unwrap();
        let manager = setup(&dir).await;
        let mut lease = manager.acquire().await.unwrap();

        let result: DbResult<Vec<Wrong>> = run(&mut lease, executor(), |tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO items (label) VALUES (?)", ["x"]).await?;
                tx.query_as::<Wrong>("SELECT id FROM items", ()).await
            })
        })
        .await;
        drop(lease);

        let err = result.unwrap_err();
        assert!(matches!(err.root(), DbError::Decode { .. }));
        assert_eq!(count(&manager).await, 0);
    }
}
