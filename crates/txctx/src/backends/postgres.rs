//! PostgreSQL Driver
//!
//! Implements the capability traits over sqlx. The root session's connection
//! is a [`PostgresConnection`] wrapping a `PgPool`; each transaction owns one
//! pooled connection for its whole life, so statements issued through a
//! [`PostgresTransaction`] run in call order on that connection.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::encode::IsNull;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgPool, PgRow, PgStatement, PgTypeInfo, Postgres};
use sqlx::{Column, Connection as _, Executor as _, Row as _, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::debug;

use super::core::*;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::transaction::TxOptions;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;
type SharedTx = Arc<Mutex<Option<sqlx::Transaction<'static, Postgres>>>>;

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Error::NoRows,
            sqlx::Error::Database(db) => Error::Database {
                code: db.code().map(|code| code.into_owned()),
                message: db.message().to_string(),
            },
            sqlx::Error::ColumnNotFound(name) => Error::ColumnNotFound(name.clone()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Error::Connection(err.to_string()),
            _ => Error::Query(err.to_string()),
        }
    }
}

/// Shared PostgreSQL connection backed by a sqlx pool
#[derive(Debug, Clone)]
pub struct PostgresConnection {
    pool: PgPool,
}

impl PostgresConnection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with sqlx's default pool settings
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueryExecutor for PostgresConnection {
    async fn execute(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult> {
        debug!("Executing statement: {}", sql);
        ctx.run(async {
            let result = bind_all(sqlx::query(sql), params).execute(&self.pool).await?;
            Ok(ExecResult::affected(result.rows_affected()))
        })
        .await
    }

    async fn query(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<Vec<Row>> {
        debug!("Executing query: {}", sql);
        ctx.run(async {
            let rows = bind_all(sqlx::query(sql), params).fetch_all(&self.pool).await?;
            rows.iter().map(convert_row).collect()
        })
        .await
    }

    async fn query_row(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<Row> {
        debug!("Executing single-row query: {}", sql);
        ctx.run(async {
            let row = bind_all(sqlx::query(sql), params).fetch_optional(&self.pool).await?;
            row.as_ref().map(convert_row).unwrap_or(Err(Error::NoRows))
        })
        .await
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<Box<dyn Statement>> {
        debug!("Preparing statement: {}", sql);
        let statement = ctx.run(async { Ok((&self.pool).prepare(sql).await?) }).await?;
        Ok(Box::new(PostgresStatement {
            sql: sql.to_string(),
            statement: sqlx::Statement::to_owned(&statement),
            target: Target::Pool(self.pool.clone()),
        }))
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn begin(&self, ctx: &Context, options: Option<&TxOptions>) -> Result<Arc<dyn Transaction>> {
        let tx = ctx
            .run(async {
                let mut tx = self.pool.begin().await?;
                if let Some(sql) = options.and_then(TxOptions::set_transaction_sql) {
                    debug!("Applying transaction options: {}", sql);
                    sqlx::query(&sql).execute(&mut *tx).await?;
                }
                Ok(tx)
            })
            .await?;
        Ok(Arc::new(PostgresTransaction::new(tx)))
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        ctx.run(async {
            let mut conn = self.pool.acquire().await?;
            conn.ping().await?;
            Ok(())
        })
        .await
    }
}

/// PostgreSQL transaction handle
pub struct PostgresTransaction {
    tx: SharedTx,
}

impl PostgresTransaction {
    pub fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Check if the transaction is still active (not committed or rolled back)
    pub async fn is_active(&self) -> bool {
        self.tx.lock().await.is_some()
    }
}

#[async_trait]
impl QueryExecutor for PostgresTransaction {
    async fn execute(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult> {
        debug!("Executing statement in transaction: {}", sql);
        ctx.run(async {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or(Error::TxDone)?;
            let result = bind_all(sqlx::query(sql), params).execute(&mut **tx).await?;
            Ok(ExecResult::affected(result.rows_affected()))
        })
        .await
    }

    async fn query(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<Vec<Row>> {
        debug!("Executing query in transaction: {}", sql);
        ctx.run(async {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or(Error::TxDone)?;
            let rows = bind_all(sqlx::query(sql), params).fetch_all(&mut **tx).await?;
            rows.iter().map(convert_row).collect()
        })
        .await
    }

    async fn query_row(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<Row> {
        debug!("Executing single-row query in transaction: {}", sql);
        ctx.run(async {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or(Error::TxDone)?;
            let row = bind_all(sqlx::query(sql), params).fetch_optional(&mut **tx).await?;
            row.as_ref().map(convert_row).unwrap_or(Err(Error::NoRows))
        })
        .await
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<Box<dyn Statement>> {
        debug!("Preparing statement in transaction: {}", sql);
        let statement = ctx
            .run(async {
                let mut guard = self.tx.lock().await;
                let tx = guard.as_mut().ok_or(Error::TxDone)?;
                let statement = (&mut **tx).prepare(sql).await?;
                Ok(sqlx::Statement::to_owned(&statement))
            })
            .await?;
        Ok(Box::new(PostgresStatement {
            sql: sql.to_string(),
            statement,
            target: Target::Transaction(Arc::clone(&self.tx)),
        }))
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn commit(&self) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or(Error::TxDone)?;
        tx.commit().await?;
        debug!("Transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or(Error::TxDone)?;
        tx.rollback().await?;
        debug!("Transaction rolled back");
        Ok(())
    }
}

enum Target {
    Pool(PgPool),
    Transaction(SharedTx),
}

/// Prepared statement bound to the pool or to the transaction that prepared it
pub struct PostgresStatement {
    sql: String,
    statement: PgStatement<'static>,
    target: Target,
}

#[async_trait]
impl Statement for PostgresStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    async fn execute(&self, ctx: &Context, params: &[DatabaseValue]) -> Result<ExecResult> {
        ctx.run(async {
            let query = bind_all(sqlx::Statement::query(&self.statement), params);
            let result = match &self.target {
                Target::Pool(pool) => query.execute(pool).await?,
                Target::Transaction(tx) => {
                    let mut guard = tx.lock().await;
                    let tx = guard.as_mut().ok_or(Error::TxDone)?;
                    query.execute(&mut **tx).await?
                }
            };
            Ok(ExecResult::affected(result.rows_affected()))
        })
        .await
    }

    async fn query(&self, ctx: &Context, params: &[DatabaseValue]) -> Result<Vec<Row>> {
        ctx.run(async {
            let query = bind_all(sqlx::Statement::query(&self.statement), params);
            let rows = match &self.target {
                Target::Pool(pool) => query.fetch_all(pool).await?,
                Target::Transaction(tx) => {
                    let mut guard = tx.lock().await;
                    let tx = guard.as_mut().ok_or(Error::TxDone)?;
                    query.fetch_all(&mut **tx).await?
                }
            };
            rows.iter().map(convert_row).collect()
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        // sqlx keeps prepared statements in a per-connection cache
        Ok(())
    }
}

fn bind_all<'q>(query: PgQuery<'q>, params: &[DatabaseValue]) -> PgQuery<'q> {
    params.iter().fold(query, bind_database_value)
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'q>(query: PgQuery<'q>, value: &DatabaseValue) -> PgQuery<'q> {
    match value {
        DatabaseValue::Null => query.bind(UntypedNull),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float32(f) => query.bind(*f),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::Bytes(b) => query.bind(b.clone()),
        DatabaseValue::Uuid(u) => query.bind(*u),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
        DatabaseValue::Date(d) => query.bind(*d),
        DatabaseValue::Time(t) => query.bind(*t),
        DatabaseValue::Json(j) => query.bind(j.clone()),
    }
}

/// NULL parameter declared with the unspecified type OID, so the server
/// infers its type from the statement instead of assuming TEXT
struct UntypedNull;

impl sqlx::Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl<'q> sqlx::Encode<'q, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> IsNull {
        IsNull::Yes
    }
}

fn convert_row(row: &PgRow) -> Result<Row> {
    let columns = row
        .columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect();
    let values = (0..row.len())
        .map(|index| postgres_value_to_database_value(row, index))
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(columns, values))
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(row: &PgRow, index: usize) -> Result<DatabaseValue> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let type_name = row.columns()[index].type_info().name();
    let value = match type_name {
        "BOOL" => DatabaseValue::Bool(row.try_get(index)?),
        "INT2" => DatabaseValue::Int32(i32::from(row.try_get::<i16, _>(index)?)),
        "INT4" => DatabaseValue::Int32(row.try_get(index)?),
        "INT8" => DatabaseValue::Int64(row.try_get(index)?),
        "FLOAT4" => DatabaseValue::Float32(row.try_get(index)?),
        "FLOAT8" => DatabaseValue::Float64(row.try_get(index)?),
        "BYTEA" => DatabaseValue::Bytes(row.try_get(index)?),
        "UUID" => DatabaseValue::Uuid(row.try_get(index)?),
        "TIMESTAMPTZ" => DatabaseValue::DateTime(row.try_get(index)?),
        "TIMESTAMP" => {
            let naive: chrono::NaiveDateTime = row.try_get(index)?;
            DatabaseValue::DateTime(naive.and_utc())
        }
        "DATE" => DatabaseValue::Date(row.try_get(index)?),
        "TIME" => DatabaseValue::Time(row.try_get(index)?),
        "JSON" | "JSONB" => DatabaseValue::Json(row.try_get::<JsonValue, _>(index)?),
        _ => DatabaseValue::String(row.try_get(index).map_err(|e| {
            Error::Query(format!(
                "Failed to get value as string for unknown type '{}': {}",
                type_name, e
            ))
        })?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlx_error_mapping() {
        assert_eq!(Error::from(sqlx::Error::RowNotFound), Error::NoRows);
        assert!(matches!(Error::from(sqlx::Error::PoolTimedOut), Error::Connection(_)));
        assert!(matches!(Error::from(sqlx::Error::PoolClosed), Error::Connection(_)));
        assert_eq!(
            Error::from(sqlx::Error::ColumnNotFound("email".to_string())),
            Error::ColumnNotFound("email".to_string())
        );
        assert!(matches!(
            Error::from(sqlx::Error::Protocol("unexpected message".to_string())),
            Error::Query(_)
        ));
    }

    #[test]
    fn test_null_parameter_has_no_declared_type() {
        let declared = <UntypedNull as sqlx::Type<Postgres>>::type_info();
        assert_eq!(declared, PgTypeInfo::with_oid(Oid(0)));
        assert_ne!(declared, <String as sqlx::Type<Postgres>>::type_info());
    }

    #[test]
    fn test_bind_all_accepts_every_value_kind() {
        let params = vec![
            DatabaseValue::Null,
            DatabaseValue::Bool(true),
            DatabaseValue::Int32(1),
            DatabaseValue::Int64(2),
            DatabaseValue::Float32(1.5),
            DatabaseValue::Float64(2.5),
            DatabaseValue::from("text"),
            DatabaseValue::Bytes(vec![0, 1]),
            DatabaseValue::Uuid(uuid::Uuid::nil()),
            DatabaseValue::DateTime(chrono::Utc::now()),
            DatabaseValue::Json(serde_json::json!({ "k": "v" })),
        ];
        let _query = bind_all(sqlx::query("SELECT 1"), &params);
    }
}
