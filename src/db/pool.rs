//! Connection pool management.
//!
//! Each backend gets one [`PoolManager`], which owns a database-specific pool
//! (MySqlPool, PgPool, SqlitePool) and hands out [`Lease`]s. A lease is the
//! only way to reach a connection; dropping it returns the connection to the
//! pool and updates the in-use counter synchronously.
//!
//! SQLite has a single writer per file. On a writable SQLite pool every lease
//! first takes the manager's writer lock, then a connection: whether a
//! statement writes (`UPDATE ... RETURNING` issued as a query) is only known
//! once it runs, and a lease holding a connection while queued for the lock
//! could starve the lock holder of connections.

use crate::config::{BackendConfig, PoolOptions, ServerConfig, SqliteConfig};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionInfo, DatabaseType, PoolStatus};
use sqlx::pool::PoolConnection;
use sqlx::{
    MySql, MySqlConnection, MySqlPool, PgConnection, PgPool, Postgres, Sqlite, SqliteConnection,
    SqlitePool, mysql::MySqlConnectOptions, mysql::MySqlPoolOptions, postgres::PgConnectOptions,
    postgres::PgPoolOptions, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Close the connection pool. Waits for leased connections to come back.
    pub async fn close(&self) {
        db_dispatch!(DbPool, self, |pool| pool.close().await)
    }

    pub fn is_closed(&self) -> bool {
        db_dispatch!(DbPool, self, |pool| pool.is_closed())
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Open connections, idle or leased.
    pub fn size(&self) -> u32 {
        db_dispatch!(DbPool, self, |pool| pool.size())
    }

    pub fn num_idle(&self) -> usize {
        db_dispatch!(DbPool, self, |pool| pool.num_idle())
    }

    async fn acquire(&self) -> Result<LeasedConn, sqlx::Error> {
        match self {
            DbPool::MySql(pool) => pool.acquire().await.map(LeasedConn::MySql),
            DbPool::Postgres(pool) => pool.acquire().await.map(LeasedConn::Postgres),
            DbPool::SQLite(pool) => pool.acquire().await.map(LeasedConn::SQLite),
        }
    }
}

/// A pooled connection checked out by a [`Lease`].
#[derive(Debug)]
pub(crate) enum LeasedConn {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

/// Borrowed access to a live connection, either directly from a lease or
/// through an open transaction.
#[derive(Debug)]
pub(crate) enum ConnRef<'a> {
    MySql(&'a mut MySqlConnection),
    Postgres(&'a mut PgConnection),
    SQLite(&'a mut SqliteConnection),
}

impl ConnRef<'_> {
    pub(crate) fn db_type(&self) -> DatabaseType {
        match self {
            ConnRef::MySql(_) => DatabaseType::MySQL,
            ConnRef::Postgres(_) => DatabaseType::PostgreSQL,
            ConnRef::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

/// Counts a caller in a shared gauge for as long as the guard lives.
#[derive(Debug)]
struct CounterGuard {
    counter: Arc<AtomicUsize>,
    name: &'static str,
}

impl CounterGuard {
    fn enter(counter: &Arc<AtomicUsize>, name: &'static str) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter: Arc::clone(counter),
            name,
        }
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        // Saturate at 0 instead of wrapping
        let result = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });

        if let Ok(0) = result {
            warn!(counter = self.name, "Counter underflow detected - release without acquire");
        }
    }
}

/// Exclusive use of one pooled connection.
///
/// Dropping the lease releases everything it holds: the connection goes back
/// to the pool (or is closed when the lease was marked for discard), then the
/// writer lock is released, then the in-use counter is decremented.
#[derive(Debug)]
pub struct Lease {
    conn: LeasedConn,
    writer: Option<OwnedMutexGuard<()>>,
    /// Set when a statement was abandoned mid-flight; the connection may still
    /// be busy and must not go back to the pool.
    discard: AtomicBool,
    _in_use: CounterGuard,
}

impl Lease {
    /// Borrow the connection for a single statement.
    pub(crate) fn conn(&mut self) -> ConnRef<'_> {
        match &mut self.conn {
            LeasedConn::MySql(c) => ConnRef::MySql(&mut **c),
            LeasedConn::Postgres(c) => ConnRef::Postgres(&mut **c),
            LeasedConn::SQLite(c) => ConnRef::SQLite(&mut **c),
        }
    }

    /// Split the lease into the raw connection and its discard flag, for
    /// opening a transaction that must still be able to mark the lease.
    pub(crate) fn split(&mut self) -> (&mut LeasedConn, &AtomicBool) {
        (&mut self.conn, &self.discard)
    }

    /// Mark the lease for discard if `result` shows a statement timed out.
    pub(crate) fn settle<T>(&self, result: &DbResult<T>) {
        if let Err(e) = result {
            mark_if_timed_out(&self.discard, e);
        }
    }

    pub fn holds_writer_lock(&self) -> bool {
        self.writer.is_some()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if *self.discard.get_mut() {
            debug!("Closing connection abandoned by a timed-out statement");
            db_dispatch!(LeasedConn, &mut self.conn, |c| c.close_on_drop())
        }
    }
}

/// Set `flag` when `err` is (or wraps) a statement timeout.
pub(crate) fn mark_if_timed_out(flag: &AtomicBool, err: &DbError) {
    if matches!(err.root(), DbError::Timeout { .. }) {
        flag.store(true, Ordering::Release);
    }
}

/// Owns one backend's pool plus the bookkeeping around it.
#[derive(Debug)]
pub struct PoolManager {
    pool: DbPool,
    info: ConnectionInfo,
    acquire_timeout: Duration,
    statement_timeout: Duration,
    max_connections: u32,
    /// Writable SQLite only: serializes every lease.
    writer: Option<Arc<Mutex<()>>>,
    in_use: Arc<AtomicUsize>,
    waiting: Arc<AtomicUsize>,
}

impl PoolManager {
    /// Validate `config`, open the pool with one live connection and probe the
    /// server version.
    pub async fn connect(config: &BackendConfig) -> DbResult<Self> {
        config.validate()?;
        let db_type = config.db_type();
        let target = config.target();

        info!(db_type = %db_type, target = %target, "Connecting to database");

        let pool = match config {
            BackendConfig::Sqlite(c) => connect_sqlite(c).await?,
            BackendConfig::Postgres(c) => connect_postgres(c).await?,
            BackendConfig::MySql(c) => connect_mysql(c).await?,
        };

        let server_version = get_server_version(&pool).await;
        let pool_opts = config.pool_options();

        let writer = match config {
            BackendConfig::Sqlite(c) if !c.read_only => Some(Arc::new(Mutex::new(()))),
            _ => None,
        };

        info!(
            db_type = %db_type,
            server_version = ?server_version,
            "Connected successfully"
        );

        Ok(Self {
            pool,
            info: ConnectionInfo {
                database_type: db_type,
                server_version,
                target,
            },
            acquire_timeout: pool_opts.acquire_timeout_or_default(db_type),
            statement_timeout: pool_opts.statement_timeout_or_default(),
            max_connections: pool_opts.max_connections_or_default(db_type),
            writer,
            in_use: Arc::new(AtomicUsize::new(0)),
            waiting: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn db_type(&self) -> DatabaseType {
        self.pool.db_type()
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn statement_timeout(&self) -> Duration {
        self.statement_timeout
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Lease a connection. On a writable SQLite pool this also takes the
    /// writer lock, which the lease holds until it is dropped.
    pub async fn acquire(&self) -> DbResult<Lease> {
        let started = Instant::now();
        let waiting = CounterGuard::enter(&self.waiting, "waiting");

        let writer = match &self.writer {
            Some(lock) => Some(
                tokio::time::timeout(self.acquire_timeout, Arc::clone(lock).lock_owned())
                    .await
                    .map_err(|_| self.exhausted(started, "writer lock"))?,
            ),
            None => None,
        };

        let remaining = self.acquire_timeout.saturating_sub(started.elapsed());
        let conn = match tokio::time::timeout(remaining, self.pool.acquire()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(sqlx::Error::PoolTimedOut)) | Err(_) => {
                return Err(self.connection_timed_out(started));
            }
            Ok(Err(e)) => return Err(e.into()),
        };
        drop(waiting);

        debug!(
            db_type = %self.db_type(),
            writer = writer.is_some(),
            wait_ms = started.elapsed().as_millis() as u64,
            "Connection leased"
        );

        Ok(Lease {
            conn,
            writer,
            discard: AtomicBool::new(false),
            _in_use: CounterGuard::enter(&self.in_use, "in_use"),
        })
    }

    /// No connection arrived in time. With nothing open at all the server is
    /// unreachable rather than busy.
    fn connection_timed_out(&self, started: Instant) -> DbError {
        let open = self.pool.size();
        if open == 0 && !self.db_type().is_embedded() {
            let waited_ms = started.elapsed().as_millis() as u64;
            warn!(db_type = %self.db_type(), waited_ms, "No connection could be opened");
            return unreachable_error(self.db_type(), waited_ms);
        }
        self.exhausted(started, "connection")
    }

    fn exhausted(&self, started: Instant, resource: &'static str) -> DbError {
        let waited_ms = started.elapsed().as_millis() as u64;
        warn!(
            db_type = %self.db_type(),
            resource,
            waited_ms,
            "Acquire timed out"
        );
        DbError::pool_exhausted(self.db_type(), waited_ms)
    }

    /// Snapshot of pool usage.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            in_use: self.in_use.load(Ordering::Acquire),
            idle: self.pool.num_idle(),
            waiting: self.waiting.load(Ordering::Acquire),
            size: self.pool.size(),
            max_connections: self.max_connections,
        }
    }

    /// Close the pool. Safe to call more than once.
    pub async fn close(&self) {
        if self.pool.is_closed() {
            debug!(db_type = %self.db_type(), "Pool already closed");
            return;
        }
        info!(db_type = %self.db_type(), "Closing connection pool");
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

async fn connect_sqlite(config: &SqliteConfig) -> DbResult<DbPool> {
    let options = SqliteConnectOptions::new()
        .filename(&config.path)
        .create_if_missing(!config.file_must_exist && !config.read_only)
        .read_only(config.read_only)
        .foreign_keys(true)
        .busy_timeout(config.busy_timeout);

    let pool: SqlitePoolOptions = pool_options::<Sqlite>(&config.pool, DatabaseType::SQLite);
    let pool = pool
        .connect_with(options)
        .await
        .map_err(|e| connect_error(DatabaseType::SQLite, e))?;
    Ok(DbPool::SQLite(pool))
}

async fn connect_postgres(config: &ServerConfig) -> DbResult<DbPool> {
    let db_type = DatabaseType::PostgreSQL;
    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port_or_default(db_type))
        .username(&config.user)
        .database(&config.database);
    if !config.password.is_empty() {
        options = options.password(&config.password);
    }

    let pool: PgPoolOptions = pool_options::<Postgres>(&config.pool, db_type);
    let pool = pool
        .connect_with(options)
        .await
        .map_err(|e| connect_error(db_type, e))?;
    Ok(DbPool::Postgres(pool))
}

async fn connect_mysql(config: &ServerConfig) -> DbResult<DbPool> {
    let db_type = DatabaseType::MySQL;
    let timezone = config
        .timezone
        .clone()
        .unwrap_or_else(|| crate::config::DEFAULT_MYSQL_TIMEZONE.to_string());
    let mut options = MySqlConnectOptions::new()
        .host(&config.host)
        .port(config.port_or_default(db_type))
        .username(&config.user)
        .database(&config.database)
        .charset("utf8mb4")
        .timezone(Some(timezone));
    if !config.password.is_empty() {
        options = options.password(&config.password);
    }

    let pool: MySqlPoolOptions = pool_options::<MySql>(&config.pool, db_type);
    let pool = pool
        .connect_with(options)
        .await
        .map_err(|e| connect_error(db_type, e))?;
    Ok(DbPool::MySql(pool))
}

fn pool_options<DB: sqlx::Database>(
    opts: &PoolOptions,
    db_type: DatabaseType,
) -> sqlx::pool::PoolOptions<DB> {
    sqlx::pool::PoolOptions::<DB>::new()
        .min_connections(opts.min_connections_or_default(db_type))
        .max_connections(opts.max_connections_or_default(db_type))
        .acquire_timeout(opts.acquire_timeout_or_default(db_type))
        .idle_timeout(Some(opts.idle_timeout_or_default(db_type)))
        .test_before_acquire(opts.test_before_acquire_or_default())
}

fn unreachable_error(db_type: DatabaseType, waited_ms: u64) -> DbError {
    DbError::connection_lost(
        format!(
            "No connection to {} could be opened within {}ms",
            db_type, waited_ms
        ),
        connection_suggestion(db_type, &sqlx::Error::PoolTimedOut),
    )
}

fn connect_error(db_type: DatabaseType, e: sqlx::Error) -> DbError {
    match e {
        sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
        e => DbError::connection_lost(
            format!("Failed to connect to {}: {}", db_type, e),
            connection_suggestion(db_type, &e),
        ),
    }
}

/// Get the server version from the connected database.
async fn get_server_version(pool: &DbPool) -> Option<String> {
    let result = match pool {
        DbPool::MySql(pool) => {
            sqlx::query_scalar::<_, String>("SELECT version()")
                .fetch_one(pool)
                .await
        }
        DbPool::Postgres(pool) => {
            sqlx::query_scalar::<_, String>("SELECT version()")
                .fetch_one(pool)
                .await
        }
        DbPool::SQLite(pool) => {
            sqlx::query_scalar::<_, String>("SELECT sqlite_version()")
                .fetch_one(pool)
                .await
        }
    };

    match result {
        Ok(version) => {
            debug!(version = %version, "Got server version");
            Some(version)
        }
        Err(e) => {
            warn!(error = %e, "Failed to get server version");
            None
        }
    }
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(db_type: DatabaseType, error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return format!(
            "Check that the {} server is running and accessible",
            db_type
        );
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the username and password".to_string();
    }

    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return "Check that the database name exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }

    if matches!(error, sqlx::Error::PoolTimedOut) {
        return format!(
            "The {} server did not accept a connection in time; check host and port",
            db_type
        );
    }

    match db_type {
        DatabaseType::PostgreSQL => "Verify PG_HOST, PG_PORT and PG_DB_NAME".to_string(),
        DatabaseType::MySQL => "Verify MYSQL_HOST, MYSQL_PORT and MYSQL_DB_NAME".to_string(),
        DatabaseType::SQLite => {
            "Verify the file path exists and its directory is writable".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn sqlite_manager(dir: &TempDir, pool: PoolOptions) -> PoolManager {
        let config = SqliteConfig::new(dir.path().join("pool.db")).with_pool_options(pool);
        PoolManager::connect(&BackendConfig::Sqlite(config))
            .await
            .unwrap()
    }

    #[test]
    fn test_counter_guard_enter_and_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = CounterGuard::enter(&counter, "test");
        let b = CounterGuard::enter(&counter, "test");
        assert_eq!(counter.load(Ordering::Acquire), 2);
        drop(a);
        assert_eq!(counter.load(Ordering::Acquire), 1);
        drop(b);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_counter_guard_saturates() {
        let counter = Arc::new(AtomicUsize::new(0));
        let guard = CounterGuard::enter(&counter, "test");
        counter.store(0, Ordering::Release);
        drop(guard);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_sqlite_connect_probes_version() {
        let dir = TempDir::new().unwrap();
        let manager = sqlite_manager(&dir, PoolOptions::default()).await;

        assert_eq!(manager.db_type(), DatabaseType::SQLite);
        assert!(manager.info().server_version.is_some());
        assert!(dir.path().join("pool.db").exists());

        let status = manager.status();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.max_connections, 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_lease_updates_in_use() {
        let dir = TempDir::new().unwrap();
        let manager = sqlite_manager(&dir, PoolOptions::default()).await;

        let lease = manager.acquire().await.unwrap();
        assert_eq!(manager.status().in_use, 1);
        assert!(lease.holds_writer_lock());
        drop(lease);
        assert_eq!(manager.status().in_use, 0);
    }

    #[tokio::test]
    async fn test_read_only_leases_skip_writer_lock() {
        let dir = TempDir::new().unwrap();
        sqlite_manager(&dir, PoolOptions::default()).await.close().await;

        let mut config = SqliteConfig::new(dir.path().join("pool.db")).with_pool_options(
            PoolOptions {
                max_connections: Some(2),
                ..PoolOptions::default()
            },
        );
        config.read_only = true;
        let manager = PoolManager::connect(&BackendConfig::Sqlite(config))
            .await
            .unwrap();

        let a = manager.acquire().await.unwrap();
        let b = manager.acquire().await.unwrap();
        assert!(!a.holds_writer_lock());
        assert!(!b.holds_writer_lock());
        assert_eq!(manager.status().in_use, 2);
    }

    #[tokio::test]
    async fn test_acquire_times_out_with_pool_exhausted() {
        let dir = TempDir::new().unwrap();
        let manager = sqlite_manager(
            &dir,
            PoolOptions {
                acquire_timeout_secs: Some(1),
                ..PoolOptions::default()
            },
        )
        .await;

        let held = manager.acquire().await.unwrap();
        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            DbError::PoolExhausted {
                backend: DatabaseType::SQLite,
                ..
            }
        ));
        assert_eq!(manager.status().waiting, 0);

        drop(held);
        assert!(manager.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_writer_lock_wait_is_bounded() {
        let dir = TempDir::new().unwrap();
        let manager = sqlite_manager(
            &dir,
            PoolOptions {
                max_connections: Some(2),
                acquire_timeout_secs: Some(1),
                ..PoolOptions::default()
            },
        )
        .await;

        // A second connection is idle, but the writer lock is not
        let held = manager.acquire().await.unwrap();
        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::PoolExhausted { .. }));
        assert_eq!(manager.status().waiting, 0);

        drop(held);
        assert!(manager.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = sqlite_manager(&dir, PoolOptions::default()).await;
        manager.close().await;
        manager.close().await;
        assert!(manager.is_closed());

        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::ConnectionLost { .. }));
    }

    #[tokio::test]
    async fn test_file_must_exist() {
        let dir = TempDir::new().unwrap();
        let mut config = SqliteConfig::new(dir.path().join("missing.db"));
        config.file_must_exist = true;
        let err = PoolManager::connect(&BackendConfig::Sqlite(config))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ConnectionLost { .. }));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_io() {
        let config = BackendConfig::Postgres(ServerConfig::new("", "app", "pw", "app"));
        let err = PoolManager::connect(&config).await.unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
    }

    #[test]
    fn test_unreachable_error_is_connection_lost() {
        let err = unreachable_error(DatabaseType::PostgreSQL, 30_000);
        assert!(matches!(err, DbError::ConnectionLost { .. }));
        assert!(err.to_string().contains("30000ms"));
        assert!(err.suggestion().unwrap().contains("host and port"));
    }

    #[test]
    fn test_connection_suggestion() {
        let err = sqlx::Error::Protocol("connection refused".into());
        assert!(connection_suggestion(DatabaseType::MySQL, &err).contains("MySQL server"));
        let err = sqlx::Error::Protocol("password authentication failed".into());
        assert!(connection_suggestion(DatabaseType::PostgreSQL, &err).contains("password"));
    }
}
