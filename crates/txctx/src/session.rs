//! Session Management
//!
//! A [`Session`] is one unit-of-work scope. The root session wraps the shared
//! connection; [`Session::begin`] and [`Session::transaction`] start a
//! transaction and bind it into a derived [`Context`]. Code further down the
//! call chain asks [`Session::query_executor`] for whatever the context it was
//! handed carries, and so runs inside the transaction or directly on the
//! connection without knowing which.
//!
//! ```no_run
//! use txctx::{Context, QueryExecutor, Session};
//!
//! # async fn example(session: Session) -> txctx::Result<()> {
//! session
//!     .transaction(&Context::background(), |ctx| {
//!         let session = session.clone();
//!         async move {
//!             let executor = session.query_executor(&ctx);
//!             executor
//!                 .execute(&ctx, "INSERT INTO users (email) VALUES ($1)", &["ada@example.com".into()])
//!                 .await?;
//!             Ok::<_, txctx::Error>(())
//!         }
//!     })
//!     .await
//! # }
//! ```
//!
//! Nested calls always begin a fresh transaction on the shared connection,
//! even when the context already carries one.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backends::{Connection, Transaction};
use crate::config::{ConfigError, SessionConfig, DEFAULT_HEALTH_CHECK_TIMEOUT_MS};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::health::{self, HealthReport};
use crate::transaction::TxOptions;

/// Context key under which the active transaction is bound
struct TxKey;

type TxHandle = Arc<dyn Transaction>;

/// Unit-of-work scope, root or derived
#[derive(Clone)]
pub struct Session {
    conn: Arc<dyn Connection>,
    tx: Option<TxHandle>,
    ctx: Context,
    options: Option<TxOptions>,
    health_check_timeout: Duration,
}

impl Session {
    /// Create the root session for a shared connection
    ///
    /// The options apply to every transaction begun through this session or
    /// any session derived from it. The connection is never closed by the
    /// session.
    pub fn new(conn: Arc<dyn Connection>, options: Option<TxOptions>) -> Self {
        Self {
            conn,
            tx: None,
            ctx: Context::background(),
            options,
            health_check_timeout: Duration::from_millis(DEFAULT_HEALTH_CHECK_TIMEOUT_MS),
        }
    }

    /// Create the root session from a [`SessionConfig`]
    ///
    /// Fails when the configuration does not pass [`SessionConfig::validate`].
    pub fn with_config(
        conn: Arc<dyn Connection>,
        config: &SessionConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            health_check_timeout: config.health_check_timeout_duration(),
            ..Self::new(conn, config.tx_options())
        })
    }

    /// Begin a transaction and return a session bound to it
    ///
    /// The returned session's context is `ctx` extended with the new
    /// transaction. The caller owns it and must call [`commit`](Self::commit)
    /// or [`rollback`](Self::rollback) before dropping it. A begin failure is
    /// returned as the driver reported it.
    pub async fn begin(&self, ctx: &Context) -> Result<Session> {
        let tx = self.begin_tx(ctx).await?;
        Ok(Session {
            conn: Arc::clone(&self.conn),
            ctx: ctx.with_value(TxKey, Arc::clone(&tx)),
            tx: Some(tx),
            options: self.options,
            health_check_timeout: self.health_check_timeout,
        })
    }

    /// Run `f` inside a new transaction
    ///
    /// `f` receives `ctx` extended with the transaction. When it returns `Ok`
    /// the transaction is committed and a commit failure is returned; when it
    /// returns `Err` the transaction is rolled back and that error is returned
    /// unchanged. A rollback failure on that path is logged, not returned. If
    /// the transaction cannot begin, `f` never runs.
    pub async fn transaction<F, Fut, T, E>(&self, ctx: &Context, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let tx = self.begin_tx(ctx).await?;
        let scoped = ctx.with_value(TxKey, Arc::clone(&tx));

        match f(scoped).await {
            Ok(value) => {
                debug!("Committing transaction");
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                debug!("Rolling back transaction");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback failed after unit of work error: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    async fn begin_tx(&self, ctx: &Context) -> Result<TxHandle> {
        debug!("Beginning transaction with options: {:?}", self.options);
        self.conn.begin(ctx, self.options.as_ref()).await
    }

    /// Commit this session's transaction. This action is final.
    ///
    /// No-op on the root session.
    pub async fn commit(&self) -> Result<()> {
        match &self.tx {
            Some(tx) => {
                debug!("Committing transaction");
                tx.commit().await
            }
            None => Ok(()),
        }
    }

    /// Roll back this session's transaction. This action is final.
    ///
    /// No-op on the root session.
    pub async fn rollback(&self) -> Result<()> {
        match &self.tx {
            Some(tx) => {
                debug!("Rolling back transaction");
                tx.rollback().await
            }
            None => Ok(()),
        }
    }

    /// The session's context: background for the root session, the begin
    /// context extended with the transaction for a derived one
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Executor for `ctx`: the transaction bound in it, or the shared
    /// connection when none is bound
    ///
    /// Looks only at `ctx`, not at the session's own context. Pass the context
    /// received from [`begin`](Self::begin) or [`transaction`](Self::transaction).
    pub fn query_executor(&self, ctx: &Context) -> Executor {
        match ctx.value::<TxKey, TxHandle>() {
            Some(tx) => Executor::Transaction(Arc::clone(tx)),
            None => Executor::Connection(Arc::clone(&self.conn)),
        }
    }

    /// True for sessions produced by [`begin`](Self::begin)
    pub fn is_transactional(&self) -> bool {
        self.tx.is_some()
    }

    /// Transaction options shared by this session and its ancestors
    pub fn options(&self) -> Option<&TxOptions> {
        self.options.as_ref()
    }

    /// Ping the shared connection within the configured timeout
    pub async fn health_check(&self) -> HealthReport {
        health::probe(self.conn.as_ref(), self.health_check_timeout).await
    }

    /// True when the shared connection did not answer a ping in time
    pub async fn failed(&self) -> bool {
        !self.health_check().await.is_healthy()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("transactional", &self.is_transactional())
            .field("options", &self.options)
            .field("ctx", &self.ctx)
            .finish()
    }
}
