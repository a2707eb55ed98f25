//! unidb library
//!
//! A unified async data-access layer over SQLite, PostgreSQL and MySQL:
//! pooled connections, parameterized statements, scoped transactions and
//! batches, all returning the same normalized rows and errors.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use client::{ClientRegistry, DbClient};
pub use config::{BackendConfig, Config, PoolOptions, ServerConfig, SqliteConfig};
pub use db::TransactionScope;
pub use error::{DbError, DbResult};
pub use models::{DatabaseType, ExecuteResult, Params, PoolStatus, QueryParam, Row};
