//! Executor selection
//!
//! [`Session::query_executor`](crate::Session::query_executor) hands business
//! code an [`Executor`]: the transaction bound in the caller's context when
//! there is one, the shared connection otherwise. Both variants answer to the
//! same [`QueryExecutor`] interface.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::backends::{Connection, DatabaseValue, ExecResult, QueryExecutor, Row, Statement, Transaction};
use crate::context::Context;
use crate::error::Result;

/// Query executor chosen for a context
#[derive(Clone)]
pub enum Executor {
    /// Transaction bound in the context
    Transaction(Arc<dyn Transaction>),
    /// Shared connection of the root session
    Connection(Arc<dyn Connection>),
}

impl Executor {
    pub fn is_transaction(&self) -> bool {
        matches!(self, Executor::Transaction(_))
    }

    pub fn as_transaction(&self) -> Option<&Arc<dyn Transaction>> {
        match self {
            Executor::Transaction(tx) => Some(tx),
            Executor::Connection(_) => None,
        }
    }

    pub fn as_connection(&self) -> Option<&Arc<dyn Connection>> {
        match self {
            Executor::Connection(conn) => Some(conn),
            Executor::Transaction(_) => None,
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Executor::Transaction(_) => f.write_str("Executor::Transaction"),
            Executor::Connection(_) => f.write_str("Executor::Connection"),
        }
    }
}

#[async_trait]
impl QueryExecutor for Executor {
    async fn execute(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult> {
        match self {
            Executor::Transaction(tx) => tx.execute(ctx, sql, params).await,
            Executor::Connection(conn) => conn.execute(ctx, sql, params).await,
        }
    }

    async fn query(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<Vec<Row>> {
        match self {
            Executor::Transaction(tx) => tx.query(ctx, sql, params).await,
            Executor::Connection(conn) => conn.query(ctx, sql, params).await,
        }
    }

    async fn query_row(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<Row> {
        match self {
            Executor::Transaction(tx) => tx.query_row(ctx, sql, params).await,
            Executor::Connection(conn) => conn.query_row(ctx, sql, params).await,
        }
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<Box<dyn Statement>> {
        match self {
            Executor::Transaction(tx) => tx.prepare(ctx, sql).await,
            Executor::Connection(conn) => conn.prepare(ctx, sql).await,
        }
    }
}
