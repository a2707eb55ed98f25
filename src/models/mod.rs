//! Data models for the data-access layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{ConnectionInfo, DatabaseType, PoolStatus};
pub use query::{ExecuteResult, Params, QueryParam, Row};
