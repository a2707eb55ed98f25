//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection pool management and leases
//! - Statement execution with per-statement timeouts
//! - Named parameter rewriting and binding
//! - Scoped transactions and batches
//! - Type mappings from driver rows to JSON rows
//! - Database dispatch macros for reducing code duplication

pub(crate) mod batch;
pub mod executor;
#[macro_use]
pub(crate) mod macros;
pub(crate) mod params;
pub mod pool;
pub mod transaction;
pub mod types;

pub use executor::StatementExecutor;
pub use pool::{DbPool, Lease, PoolManager};
pub use transaction::TransactionScope;
