//! Expectation-driven mock connection
//!
//! Register the calls a test expects, in order, then hand
//! [`MockDatabase::connection`] to a session. Every call the session or
//! business code makes must match the next expectation; mismatches fail the
//! call with [`Error::Query`]. SQL expectations are regular expressions
//! matched against the statement text.
//!
//! ```
//! use txctx::{Context, ExecResult, QueryExecutor};
//! use txctx_testing::MockDatabase;
//!
//! # async fn demo() {
//! let mock = MockDatabase::new();
//! let session = mock.session(None);
//!
//! mock.expect_begin();
//! mock.expect_exec("INSERT INTO users").will_return_result(ExecResult::new(1, 1));
//! mock.expect_commit();
//!
//! session
//!     .transaction(&Context::background(), |ctx| {
//!         let executor = session.query_executor(&ctx);
//!         async move {
//!             executor.execute(&ctx, "INSERT INTO users (email) VALUES ($1)", &["a@b.c".into()]).await?;
//!             Ok::<_, txctx::Error>(())
//!         }
//!     })
//!     .await
//!     .unwrap();
//!
//! mock.expectations_were_met().unwrap();
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tracing::debug;

use txctx::{
    Connection, Context, DatabaseValue, Error, ExecResult, QueryExecutor, Result, Row, Session, Statement,
    Transaction, TxOptions,
};

use crate::{TestError, TestResult};

/// Kind of driver call an expectation stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Begin,
    Exec,
    Query,
    Prepare,
    Commit,
    Rollback,
    Ping,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallKind::Begin => "Begin",
            CallKind::Exec => "Exec",
            CallKind::Query => "Query",
            CallKind::Prepare => "Prepare",
            CallKind::Commit => "Commit",
            CallKind::Rollback => "Rollback",
            CallKind::Ping => "Ping",
        };
        f.write_str(name)
    }
}

/// A call the mock accepted
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    Begin { tx: u64, options: Option<TxOptions> },
    Exec { tx: Option<u64>, sql: String, args: Vec<DatabaseValue> },
    Query { tx: Option<u64>, sql: String, args: Vec<DatabaseValue> },
    Prepare { tx: Option<u64>, sql: String },
    Commit { tx: u64 },
    Rollback { tx: u64 },
    Ping,
}

#[derive(Debug, Clone)]
struct Expectation {
    kind: CallKind,
    pattern: Option<String>,
    args: Option<Vec<DatabaseValue>>,
    error: Option<Error>,
    result: ExecResult,
    rows: Vec<Row>,
    delay: Option<Duration>,
}

impl Expectation {
    fn new(kind: CallKind, pattern: Option<String>) -> Self {
        Self {
            kind,
            pattern,
            args: None,
            error: None,
            result: ExecResult::default(),
            rows: Vec::new(),
            delay: None,
        }
    }

    fn check(&self, kind: CallKind, sql: Option<&str>, args: &[DatabaseValue]) -> std::result::Result<(), String> {
        if self.kind != kind {
            return Err(format!(
                "call to {} was not expected, next expectation is: {}",
                kind, self
            ));
        }
        if let (Some(pattern), Some(sql)) = (&self.pattern, sql) {
            let re = Regex::new(pattern).map_err(|e| format!("invalid SQL pattern '{}': {}", pattern, e))?;
            if !re.is_match(sql) {
                return Err(format!(
                    "{} '{}' does not match expected pattern '{}'",
                    kind, sql, pattern
                ));
            }
        }
        if let Some(expected) = &self.args {
            if expected.as_slice() != args {
                return Err(format!(
                    "{} arguments do not match: expected {:?}, got {:?}",
                    kind, expected, args
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expected{}", self.kind)?;
        if let Some(pattern) = &self.pattern {
            write!(f, " matching '{}'", pattern)?;
        }
        if let Some(args) = &self.args {
            write!(f, " with args {:?}", args)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct MockState {
    expectations: Vec<Expectation>,
    cursor: usize,
    events: Vec<MockEvent>,
    next_tx: u64,
}

/// Mock database: expectation registry plus call log
#[derive(Clone, Default)]
pub struct MockDatabase {
    state: Arc<Mutex<MockState>>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared connection driven by this mock
    pub fn connection(&self) -> Arc<MockConnection> {
        Arc::new(MockConnection { db: self.clone() })
    }

    /// Root session over [`connection`](Self::connection)
    pub fn session(&self, options: Option<TxOptions>) -> Session {
        Session::new(self.connection(), options)
    }

    fn push(&self, expectation: Expectation) -> ExpectedCall {
        let mut state = self.state.lock();
        state.expectations.push(expectation);
        ExpectedCall {
            db: self.clone(),
            index: state.expectations.len() - 1,
        }
    }

    pub fn expect_begin(&self) -> ExpectedCall {
        self.push(Expectation::new(CallKind::Begin, None))
    }

    pub fn expect_exec(&self, pattern: &str) -> ExpectedCall {
        self.push(Expectation::new(CallKind::Exec, Some(pattern.to_string())))
    }

    pub fn expect_query(&self, pattern: &str) -> ExpectedCall {
        self.push(Expectation::new(CallKind::Query, Some(pattern.to_string())))
    }

    pub fn expect_prepare(&self, pattern: &str) -> ExpectedCall {
        self.push(Expectation::new(CallKind::Prepare, Some(pattern.to_string())))
    }

    pub fn expect_commit(&self) -> ExpectedCall {
        self.push(Expectation::new(CallKind::Commit, None))
    }

    pub fn expect_rollback(&self) -> ExpectedCall {
        self.push(Expectation::new(CallKind::Rollback, None))
    }

    pub fn expect_ping(&self) -> ExpectedCall {
        self.push(Expectation::new(CallKind::Ping, None))
    }

    /// Fails when any registered expectation was never matched
    pub fn expectations_were_met(&self) -> TestResult<()> {
        let state = self.state.lock();
        match state.expectations.get(state.cursor) {
            Some(remaining) => Err(TestError::UnmetExpectation(format!(
                "there is a remaining expectation which was not matched: {}",
                remaining
            ))),
            None => Ok(()),
        }
    }

    /// Calls accepted so far, in order
    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    pub fn begin_count(&self) -> usize {
        self.count(|event| matches!(event, MockEvent::Begin { .. }))
    }

    pub fn commit_count(&self) -> usize {
        self.count(|event| matches!(event, MockEvent::Commit { .. }))
    }

    pub fn rollback_count(&self) -> usize {
        self.count(|event| matches!(event, MockEvent::Rollback { .. }))
    }

    fn count(&self, predicate: impl Fn(&MockEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|event| predicate(event)).count()
    }

    fn consume(
        &self,
        kind: CallKind,
        sql: Option<&str>,
        args: &[DatabaseValue],
        event: MockEvent,
    ) -> Result<Expectation> {
        let mut state = self.state.lock();
        let next = state.expectations.get(state.cursor).ok_or_else(|| {
            Error::Query(format!(
                "all expectations were already fulfilled, call to {} was not expected",
                kind
            ))
        })?;
        if let Err(message) = next.check(kind, sql, args) {
            debug!("Rejected mock call: {}", message);
            return Err(Error::Query(message));
        }

        let expectation = next.clone();
        state.cursor += 1;
        state.events.push(event);
        Ok(expectation)
    }

    fn next_tx_id(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_tx += 1;
        state.next_tx
    }

    async fn exec(&self, ctx: &Context, tx: Option<u64>, sql: &str, args: &[DatabaseValue]) -> Result<ExecResult> {
        fail_if_done(ctx)?;
        let event = MockEvent::Exec {
            tx,
            sql: sql.to_string(),
            args: args.to_vec(),
        };
        let expectation = self.consume(CallKind::Exec, Some(sql), args, event)?;
        settle(ctx, &expectation).await?;
        Ok(expectation.result)
    }

    async fn query(&self, ctx: &Context, tx: Option<u64>, sql: &str, args: &[DatabaseValue]) -> Result<Vec<Row>> {
        fail_if_done(ctx)?;
        let event = MockEvent::Query {
            tx,
            sql: sql.to_string(),
            args: args.to_vec(),
        };
        let expectation = self.consume(CallKind::Query, Some(sql), args, event)?;
        settle(ctx, &expectation).await?;
        Ok(expectation.rows)
    }

    async fn prepare(&self, ctx: &Context, tx: Option<u64>, sql: &str) -> Result<Box<dyn Statement>> {
        fail_if_done(ctx)?;
        let event = MockEvent::Prepare {
            tx,
            sql: sql.to_string(),
        };
        let expectation = self.consume(CallKind::Prepare, Some(sql), &[], event)?;
        settle(ctx, &expectation).await?;
        Ok(Box::new(MockStatement {
            db: self.clone(),
            tx,
            sql: sql.to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Handle for refining the expectation just registered
pub struct ExpectedCall {
    db: MockDatabase,
    index: usize,
}

impl ExpectedCall {
    fn update(self, f: impl FnOnce(&mut Expectation)) -> Self {
        if let Some(expectation) = self.db.state.lock().expectations.get_mut(self.index) {
            f(expectation);
        }
        self
    }

    /// Require exactly these statement arguments
    pub fn with_args<I, V>(self, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DatabaseValue>,
    {
        let args = args.into_iter().map(Into::into).collect();
        self.update(|e| e.args = Some(args))
    }

    /// Fail the matched call with `error`
    pub fn will_return_error(self, error: Error) -> Self {
        self.update(|e| e.error = Some(error))
    }

    pub fn will_return_result(self, result: ExecResult) -> Self {
        self.update(|e| e.result = result)
    }

    pub fn will_return_rows(self, rows: Vec<Row>) -> Self {
        self.update(|e| e.rows = rows)
    }

    /// Hold the matched call for `delay`; calls taking a context give up
    /// early when it is canceled
    pub fn will_delay_for(self, delay: Duration) -> Self {
        self.update(|e| e.delay = Some(delay))
    }

    /// Expect an execution of the statement this prepare expectation registered
    pub fn expect_exec(self) -> ExpectedCall {
        let pattern = self.pattern();
        self.db.push(Expectation::new(CallKind::Exec, pattern))
    }

    /// Expect a query through the statement this prepare expectation registered
    pub fn expect_query(self) -> ExpectedCall {
        let pattern = self.pattern();
        self.db.push(Expectation::new(CallKind::Query, pattern))
    }

    fn pattern(&self) -> Option<String> {
        self.db
            .state
            .lock()
            .expectations
            .get(self.index)
            .and_then(|e| e.pattern.clone())
    }
}

fn fail_if_done(ctx: &Context) -> Result<()> {
    match ctx.err() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn settle(ctx: &Context, expectation: &Expectation) -> Result<()> {
    if let Some(delay) = expectation.delay {
        ctx.run(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await?;
    }
    match &expectation.error {
        Some(err) => Err(err.clone()),
        None => Ok(()),
    }
}

/// Shared connection backed by a [`MockDatabase`]
pub struct MockConnection {
    db: MockDatabase,
}

#[async_trait]
impl QueryExecutor for MockConnection {
    async fn execute(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult> {
        self.db.exec(ctx, None, sql, params).await
    }

    async fn query(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<Vec<Row>> {
        self.db.query(ctx, None, sql, params).await
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<Box<dyn Statement>> {
        self.db.prepare(ctx, None, sql).await
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn begin(&self, ctx: &Context, options: Option<&TxOptions>) -> Result<Arc<dyn Transaction>> {
        fail_if_done(ctx)?;
        let id = self.db.next_tx_id();
        let event = MockEvent::Begin {
            tx: id,
            options: options.copied(),
        };
        let expectation = self.db.consume(CallKind::Begin, None, &[], event)?;
        settle(ctx, &expectation).await?;
        Ok(Arc::new(MockTransaction {
            db: self.db.clone(),
            id,
            done: AtomicBool::new(false),
        }))
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        fail_if_done(ctx)?;
        let expectation = self.db.consume(CallKind::Ping, None, &[], MockEvent::Ping)?;
        settle(ctx, &expectation).await
    }
}

/// Transaction handle produced by [`MockConnection::begin`]
pub struct MockTransaction {
    db: MockDatabase,
    id: u64,
    done: AtomicBool,
}

impl MockTransaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_active(&self) -> Result<()> {
        if self.done.load(Ordering::SeqCst) {
            return Err(Error::TxDone);
        }
        Ok(())
    }

    async fn finish(&self, kind: CallKind, event: MockEvent) -> Result<()> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Err(Error::TxDone);
        }
        let expectation = self.db.consume(kind, None, &[], event)?;
        if let Some(delay) = expectation.delay {
            tokio::time::sleep(delay).await;
        }
        match expectation.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl QueryExecutor for MockTransaction {
    async fn execute(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult> {
        self.ensure_active()?;
        self.db.exec(ctx, Some(self.id), sql, params).await
    }

    async fn query(&self, ctx: &Context, sql: &str, params: &[DatabaseValue]) -> Result<Vec<Row>> {
        self.ensure_active()?;
        self.db.query(ctx, Some(self.id), sql, params).await
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<Box<dyn Statement>> {
        self.ensure_active()?;
        self.db.prepare(ctx, Some(self.id), sql).await
    }
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn commit(&self) -> Result<()> {
        self.finish(CallKind::Commit, MockEvent::Commit { tx: self.id }).await
    }

    async fn rollback(&self) -> Result<()> {
        self.finish(CallKind::Rollback, MockEvent::Rollback { tx: self.id }).await
    }
}

/// Prepared statement handed out by the mock
pub struct MockStatement {
    db: MockDatabase,
    tx: Option<u64>,
    sql: String,
    closed: AtomicBool,
}

impl MockStatement {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Query(format!("statement '{}' is closed", self.sql)));
        }
        Ok(())
    }
}

#[async_trait]
impl Statement for MockStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    async fn execute(&self, ctx: &Context, params: &[DatabaseValue]) -> Result<ExecResult> {
        self.ensure_open()?;
        self.db.exec(ctx, self.tx, &self.sql, params).await
    }

    async fn query(&self, ctx: &Context, params: &[DatabaseValue]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        self.db.query(ctx, self.tx, &self.sql, params).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unexpected_call_is_rejected() {
        let mock = MockDatabase::new();
        let conn = mock.connection();

        let err = conn
            .execute(&Context::background(), "DELETE FROM users", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Query(ref msg) if msg.contains("all expectations were already fulfilled")));
    }

    #[tokio::test]
    async fn test_kind_mismatch_keeps_expectation() {
        let mock = MockDatabase::new();
        let conn = mock.connection();
        mock.expect_begin();

        let err = conn.ping(&Context::background()).await.unwrap_err();
        assert!(matches!(err, Error::Query(ref msg) if msg.contains("call to Ping was not expected")));
        assert!(mock.expectations_were_met().is_err());

        conn.begin(&Context::background(), None).await.unwrap();
        assert!(mock.expectations_were_met().is_ok());
    }

    #[tokio::test]
    async fn test_sql_pattern_and_args() {
        let mock = MockDatabase::new();
        let conn = mock.connection();
        mock.expect_exec("INSERT INTO users")
            .with_args(["ada@example.com"])
            .will_return_result(ExecResult::new(9, 1));

        let ctx = Context::background();
        let err = conn.execute(&ctx, "UPDATE users SET x = 1", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Query(ref msg) if msg.contains("does not match")));

        let err = conn
            .execute(&ctx, "INSERT INTO users (email) VALUES ($1)", &["bob@example.com".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Query(ref msg) if msg.contains("arguments do not match")));

        let result = conn
            .execute(&ctx, "INSERT INTO users (email) VALUES ($1)", &["ada@example.com".into()])
            .await
            .unwrap();
        assert_eq!(result, ExecResult::new(9, 1));
        mock.expectations_were_met().unwrap();
    }

    #[tokio::test]
    async fn test_second_finalization_reports_tx_done() {
        let mock = MockDatabase::new();
        let conn = mock.connection();
        mock.expect_begin();
        mock.expect_commit();

        let tx = conn.begin(&Context::background(), None).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(tx.rollback().await, Err(Error::TxDone));
        assert_eq!(
            tx.execute(&Context::background(), "SELECT 1", &[]).await,
            Err(Error::TxDone)
        );
        mock.expectations_were_met().unwrap();
    }

    #[tokio::test]
    async fn test_delay_honors_context() {
        let mock = MockDatabase::new();
        let conn = mock.connection();
        mock.expect_ping().will_delay_for(Duration::from_secs(30));

        let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(20));
        assert_eq!(conn.ping(&ctx).await, Err(Error::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_canceled_context_fails_before_matching() {
        let mock = MockDatabase::new();
        let conn = mock.connection();
        mock.expect_begin();

        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();

        assert!(matches!(conn.begin(&ctx, None).await, Err(Error::Canceled)));
        assert_eq!(mock.begin_count(), 0);
        assert!(mock.expectations_were_met().is_err());
    }
}
