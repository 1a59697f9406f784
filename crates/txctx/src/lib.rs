//! # txctx: context-propagated database sessions
//!
//! Business code often needs to run either inside an ambient transaction or
//! directly on a shared connection, without every caller above it deciding
//! which. txctx carries the active transaction through an explicit
//! [`Context`] chain:
//!
//! - a root [`Session`] wraps the shared [`Connection`];
//! - [`Session::transaction`] begins a transaction, binds it into a derived
//!   context, runs the unit of work and commits or rolls back;
//! - [`Session::query_executor`] returns the transaction bound in whatever
//!   context it is given, or the shared connection when there is none.
//!
//! Drivers plug in through the [`Connection`], [`Transaction`] and
//! [`QueryExecutor`] traits. A PostgreSQL driver built on sqlx ships behind
//! the default `postgres` feature.

pub mod backends;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod health;
pub mod session;
pub mod transaction;

// Re-export core traits and types
pub use backends::{
    Connection, DatabaseValue, ExecResult, QueryExecutor, Row, Statement, Transaction,
};
#[cfg(feature = "postgres")]
pub use backends::{PostgresConnection, PostgresStatement, PostgresTransaction};
pub use config::{ConfigError, SessionConfig};
pub use context::{CancelHandle, Context};
pub use error::{Error, Result};
pub use executor::Executor;
pub use health::{HealthReport, HealthStatus};
pub use session::Session;
pub use transaction::{IsolationLevel, TxOptions};
