//! Core Driver Capability Traits
//!
//! These traits are the only surface a [`Session`](crate::Session) needs from a
//! database driver. Business code talks to [`QueryExecutor`] and never learns
//! whether it is holding a transaction or the shared connection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::transaction::TxOptions;

/// Anything able to run parameterized statements
///
/// Every operation takes the caller's [`Context`] and must give up with the
/// context's error once it is canceled or past its deadline.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Execute a statement that returns no rows
    async fn execute(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult>;

    /// Execute a statement and return all result rows
    async fn query(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<Vec<Row>>;

    /// Execute a statement expected to return exactly one row
    ///
    /// Fails with [`Error::NoRows`] when the result is empty. Extra rows are
    /// ignored.
    async fn query_row(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<Row> {
        self.query(ctx, sql, params)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NoRows)
    }

    /// Prepare a statement for repeated execution
    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<Box<dyn Statement>>;
}

/// A prepared statement bound to the executor that prepared it
#[async_trait]
pub trait Statement: Send + Sync {
    /// SQL text the statement was prepared from
    fn sql(&self) -> &str;

    async fn execute(&self, ctx: &Context, params: &[DatabaseValue]) -> Result<ExecResult>;

    async fn query(&self, ctx: &Context, params: &[DatabaseValue]) -> Result<Vec<Row>>;

    async fn query_row(&self, ctx: &Context, params: &[DatabaseValue]) -> Result<Row> {
        self.query(ctx, params)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NoRows)
    }

    /// Release the statement
    async fn close(&self) -> Result<()>;
}

/// Shared connection the root session falls back to
#[async_trait]
pub trait Connection: QueryExecutor {
    /// Begin a transaction honoring `ctx` for cancellation of the begin itself
    async fn begin(&self, ctx: &Context, options: Option<&TxOptions>) -> Result<Arc<dyn Transaction>>;

    /// Check that the connection is alive
    async fn ping(&self, ctx: &Context) -> Result<()>;
}

/// Live transaction handle
///
/// `commit` and `rollback` are final: whichever runs first ends the
/// transaction. What a second call does is up to the driver.
#[async_trait]
pub trait Transaction: QueryExecutor {
    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}

/// Outcome of a statement that returns no rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Identifier generated by the statement, for drivers that report one
    pub last_insert_id: Option<i64>,
}

impl ExecResult {
    pub fn new(last_insert_id: i64, rows_affected: u64) -> Self {
        Self {
            rows_affected,
            last_insert_id: Some(last_insert_id),
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            last_insert_id: None,
        }
    }
}

/// A result row: column names paired with values
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<DatabaseValue>,
}

impl Row {
    /// Build a row; extra values or columns beyond the shorter list are dropped
    pub fn new(mut columns: Vec<String>, mut values: Vec<DatabaseValue>) -> Self {
        let len = columns.len().min(values.len());
        columns.truncate(len);
        values.truncate(len);
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<DatabaseValue>,
    {
        let (columns, values): (Vec<String>, Vec<DatabaseValue>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        Self { columns, values }
    }

    /// Get a column value by index
    pub fn get_by_index(&self, index: usize) -> Result<&DatabaseValue> {
        self.values
            .get(index)
            .ok_or_else(|| Error::ColumnNotFound(format!("#{}", index)))
    }

    /// Get a column value by name
    pub fn get_by_name(&self, name: &str) -> Result<&DatabaseValue> {
        self.columns
            .iter()
            .position(|column| column == name)
            .map(|index| &self.values[index])
            .ok_or_else(|| Error::ColumnNotFound(name.to_string()))
    }

    /// Get a typed value from a column
    pub fn get<T>(&self, column: &str) -> Result<T>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let value = self.get_by_name(column)?;
        serde_json::from_value(value.to_json()).map_err(|e| {
            Error::Serialization(format!("Failed to deserialize column '{}': {}", column, e))
        })
    }

    /// Get an optional typed value; missing columns and NULL both map to `None`
    pub fn try_get<T>(&self, column: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.get_by_name(column) {
            Ok(value) if value.is_null() => Ok(None),
            Ok(_) => self.get(column).map(Some),
            Err(Error::ColumnNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[DatabaseValue] {
        &self.values
    }

    /// Convert row to a JSON object
    pub fn to_json(&self) -> JsonValue {
        let map = self
            .columns
            .iter()
            .zip(&self.values)
            .map(|(column, value)| (column.clone(), value.to_json()))
            .collect::<serde_json::Map<_, _>>();
        JsonValue::Object(map)
    }

    /// Convert row to a column-keyed map
    pub fn to_map(&self) -> HashMap<String, DatabaseValue> {
        self.columns
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    DateTime(chrono::DateTime<chrono::Utc>),
    Date(chrono::NaiveDate),
    Time(chrono::NaiveTime),
    Json(JsonValue),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Convert to JSON value
    pub fn to_json(&self) -> JsonValue {
        match self {
            DatabaseValue::Null => JsonValue::Null,
            DatabaseValue::Bool(b) => JsonValue::Bool(*b),
            DatabaseValue::Int32(i) => JsonValue::from(*i),
            DatabaseValue::Int64(i) => JsonValue::from(*i),
            DatabaseValue::Float32(f) => serde_json::Number::from_f64(f64::from(*f))
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DatabaseValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DatabaseValue::String(s) => JsonValue::String(s.clone()),
            DatabaseValue::Bytes(b) => JsonValue::Array(b.iter().map(|&x| JsonValue::from(x)).collect()),
            DatabaseValue::Uuid(u) => JsonValue::String(u.to_string()),
            DatabaseValue::DateTime(dt) => JsonValue::String(dt.to_rfc3339()),
            DatabaseValue::Date(d) => JsonValue::String(d.to_string()),
            DatabaseValue::Time(t) => JsonValue::String(t.to_string()),
            DatabaseValue::Json(j) => j.clone(),
        }
    }
}

macro_rules! impl_from_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for DatabaseValue {
                fn from(value: $ty) -> Self {
                    DatabaseValue::$variant(value)
                }
            }
        )*
    };
}

impl_from_value! {
    bool => Bool,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
    String => String,
    Vec<u8> => Bytes,
    uuid::Uuid => Uuid,
    chrono::DateTime<chrono::Utc> => DateTime,
    chrono::NaiveDate => Date,
    chrono::NaiveTime => Time,
    JsonValue => Json,
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}
