//! Client facade.
//!
//! [`DbClient`] is the entry point for application code: one client per
//! backend, each owning a [`PoolManager`]. Every operation leases a connection
//! for exactly its own duration. [`ClientRegistry`] keeps at most one client
//! per backend for the composition root.

use crate::config::BackendConfig;
use crate::db::pool::PoolManager;
use crate::db::transaction::{self, TransactionScope};
use crate::db::{StatementExecutor, batch};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionInfo, DatabaseType, ExecuteResult, Params, PoolStatus, Row};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Handle to one backend. Cloning is cheap; clones share the pool.
#[derive(Debug, Clone)]
pub struct DbClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    manager: PoolManager,
    executor: StatementExecutor,
}

impl DbClient {
    /// Validate `config` and open the backend's pool.
    pub async fn connect(config: &BackendConfig) -> DbResult<Self> {
        let manager = PoolManager::connect(config).await?;
        let executor = StatementExecutor::new(manager.statement_timeout());
        Ok(Self {
            inner: Arc::new(ClientInner { manager, executor }),
        })
    }

    pub fn database_type(&self) -> DatabaseType {
        self.inner.manager.db_type()
    }

    /// Backend type, server version and target, as probed at connect time.
    pub fn info(&self) -> &ConnectionInfo {
        self.inner.manager.info()
    }

    /// Snapshot of pool usage.
    pub fn status(&self) -> PoolStatus {
        self.inner.manager.status()
    }

    /// Run a row-returning statement.
    ///
    /// Every statement on a writable SQLite pool holds the writer lock, so an
    /// `UPDATE ... RETURNING` sent here queues behind open transactions.
    pub async fn query(&self, sql: &str, params: impl Into<Params>) -> DbResult<Vec<Row>> {
        let params = params.into();
        let mut lease = self.inner.manager.acquire().await?;
        let result = self
            .inner
            .executor
            .fetch_all(lease.conn(), sql, &params)
            .await;
        lease.settle(&result);
        result
    }

    /// Like [`query`](Self::query), deserializing each row into `T`.
    pub async fn query_as<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: impl Into<Params>,
    ) -> DbResult<Vec<T>> {
        self.query(sql, params)
            .await?
            .into_iter()
            .map(from_row)
            .collect()
    }

    /// Run a statement and return its first row. An empty result is `None`.
    pub async fn query_one(&self, sql: &str, params: impl Into<Params>) -> DbResult<Option<Row>> {
        let params = params.into();
        let mut lease = self.inner.manager.acquire().await?;
        let result = self
            .inner
            .executor
            .fetch_optional(lease.conn(), sql, &params)
            .await;
        lease.settle(&result);
        result
    }

    /// Like [`query_one`](Self::query_one), deserializing the row into `T`.
    pub async fn query_one_as<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: impl Into<Params>,
    ) -> DbResult<Option<T>> {
        self.query_one(sql, params).await?.map(from_row).transpose()
    }

    /// Run a mutating statement.
    ///
    /// On PostgreSQL rows from a `RETURNING` clause come back in
    /// [`ExecuteResult::rows`].
    pub async fn execute(&self, sql: &str, params: impl Into<Params>) -> DbResult<ExecuteResult> {
        let params = params.into();
        let mut lease = self.inner.manager.acquire().await?;
        let result = self
            .inner
            .executor
            .execute(lease.conn(), sql, &params)
            .await;
        lease.settle(&result);
        result
    }

    /// Execute `sql` once per parameter set inside a single transaction.
    ///
    /// Row counts are summed, returned rows are concatenated in set order and
    /// the last non-zero insert id is reported. If
    /// any set fails nothing is applied and the error comes back as
    /// [`DbError::TransactionFailure`]. An empty batch does not touch the pool.
    pub async fn batch<I, P>(&self, sql: &str, parameter_sets: I) -> DbResult<ExecuteResult>
    where
        I: IntoIterator<Item = P>,
        P: Into<Params>,
    {
        let sets: Vec<Params> = parameter_sets.into_iter().map(Into::into).collect();
        if sets.is_empty() {
            debug!("Empty batch, nothing to execute");
            return Ok(ExecuteResult::default());
        }

        let mut lease = self.inner.manager.acquire().await?;
        batch::run(&mut lease, self.inner.executor, sql, &sets).await
    }

    /// Run `work` inside one transaction.
    ///
    /// The transaction commits when `work` returns `Ok` and rolls back when it
    /// returns `Err`; the error is passed through unchanged. On SQLite the
    /// writer lock is held from before `BEGIN` until the lease is released.
    ///
    /// ```ignore
    /// let id = client
    ///     .run_in_transaction(|tx| {
    ///         Box::pin(async move {
    ///             let result = tx.execute("INSERT INTO user (name) VALUES (?)", ["Ada"]).await?;
    ///             Ok::<_, DbError>(result.insert_id)
    ///         })
    ///     })
    ///     .await?;
    /// ```
    ///
    /// Statements issued through the client itself (rather than `tx`) inside
    /// `work` need a second connection; on SQLite that waits for the writer
    /// lock `work` already holds and ends in [`DbError::PoolExhausted`].
    pub async fn run_in_transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut TransactionScope<'_>) -> BoxFuture<'s, Result<T, E>> + Send,
        T: Send,
        E: From<DbError> + Send,
    {
        let mut lease = self
            .inner
            .manager
            .acquire()
            .await
            .map_err(E::from)?;
        transaction::run(&mut lease, self.inner.executor, work).await
    }

    /// Invoke a stored procedure and return the rows it produces.
    ///
    /// Only networked backends have stored procedures. `name` must be a plain
    /// or schema-qualified identifier; parameters are positional.
    pub async fn call_procedure(
        &self,
        name: &str,
        params: impl Into<Params>,
    ) -> DbResult<Vec<Row>> {
        let db_type = self.database_type();
        if db_type.is_embedded() {
            return Err(DbError::invalid_input(format!(
                "{} does not support stored procedures",
                db_type
            )));
        }
        validate_procedure_name(name)?;

        let params = params.into();
        if matches!(params, Params::Named(_)) {
            return Err(DbError::invalid_input(
                "Stored procedure parameters must be positional",
            ));
        }

        let sql = procedure_call_sql(name, params.len(), db_type);
        let started = Instant::now();
        let mut lease = self.inner.manager.acquire().await?;
        let result = self
            .inner
            .executor
            .fetch_all(lease.conn(), &sql, &params)
            .await;
        lease.settle(&result);

        if result.is_ok() {
            debug!(
                procedure = name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Procedure executed"
            );
        }
        result
    }

    /// Round-trip a trivial statement and report how long it took.
    pub async fn ping(&self) -> DbResult<Duration> {
        let started = Instant::now();
        self.query_one("SELECT 1", Params::None).await?;
        Ok(started.elapsed())
    }

    /// Drain and close the pool. Later calls are no-ops; later operations fail
    /// with [`DbError::ConnectionLost`].
    pub async fn close(&self) {
        self.inner.manager.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.manager.is_closed()
    }

    /// Whether both clients share one pool.
    pub fn same_handle(&self, other: &DbClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn from_row<T: DeserializeOwned>(row: Row) -> DbResult<T> {
    serde_json::from_value(serde_json::Value::Object(row)).map_err(DbError::from)
}

fn validate_procedure_name(name: &str) -> DbResult<()> {
    let mut parts = 0;
    for part in name.split('.') {
        parts += 1;
        let mut chars = part.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
            return Err(DbError::invalid_input(format!(
                "Invalid procedure name: '{}'",
                name
            )));
        }
    }
    if parts > 2 {
        return Err(DbError::invalid_input(format!(
            "Invalid procedure name: '{}' (at most schema.name)",
            name
        )));
    }
    Ok(())
}

fn procedure_call_sql(name: &str, param_count: usize, db_type: DatabaseType) -> String {
    let placeholders: Vec<String> = (1..=param_count)
        .map(|i| match db_type {
            DatabaseType::PostgreSQL => format!("${}", i),
            DatabaseType::MySQL | DatabaseType::SQLite => "?".to_string(),
        })
        .collect();
    format!("CALL {}({})", name, placeholders.join(", "))
}

/// At most one client per backend.
///
/// Owned by the composition root; there is no global instance. Concurrent
/// first calls for a backend connect exactly once.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    sqlite: OnceCell<(BackendConfig, DbClient)>,
    postgres: OnceCell<(BackendConfig, DbClient)>,
    mysql: OnceCell<(BackendConfig, DbClient)>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, db_type: DatabaseType) -> &OnceCell<(BackendConfig, DbClient)> {
        match db_type {
            DatabaseType::SQLite => &self.sqlite,
            DatabaseType::PostgreSQL => &self.postgres,
            DatabaseType::MySQL => &self.mysql,
        }
    }

    /// Return the client for `config`'s backend, connecting on first use.
    ///
    /// Asking again with an equal configuration returns the same handle. A
    /// different configuration for an initialized backend is a
    /// [`DbError::Configuration`].
    pub async fn get_or_connect(&self, config: &BackendConfig) -> DbResult<DbClient> {
        let db_type = config.db_type();
        let (existing, client) = self
            .cell(db_type)
            .get_or_try_init(|| async {
                let client = DbClient::connect(config).await?;
                Ok::<_, DbError>((config.clone(), client))
            })
            .await?;

        if existing != config {
            return Err(DbError::configuration(format!(
                "{} is already connected to {} with a different configuration",
                db_type,
                existing.target()
            )));
        }
        Ok(client.clone())
    }

    /// The client for `db_type`, if one has been connected.
    pub fn get(&self, db_type: DatabaseType) -> Option<DbClient> {
        self.cell(db_type).get().map(|(_, client)| client.clone())
    }

    /// Every connected client.
    pub fn clients(&self) -> Vec<DbClient> {
        [&self.sqlite, &self.postgres, &self.mysql]
            .into_iter()
            .filter_map(|cell| cell.get().map(|(_, client)| client.clone()))
            .collect()
    }

    /// Close every connected client.
    pub async fn close_all(&self) {
        let clients = self.clients();
        info!(count = clients.len(), "Closing all database clients");
        for client in clients {
            client.close().await;
        }
    }
}
