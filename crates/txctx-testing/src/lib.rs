//! # txctx-testing
//!
//! Test support for code built on txctx sessions: an expectation-driven
//! [`MockDatabase`] that stands in for a real connection, plus small helpers
//! for test setup.
//!
//! ## Quick Start
//!
//! ```no_run
//! use txctx_testing::prelude::*;
//!
//! # async fn creates_user() {
//! init_tracing();
//! let mock = MockDatabase::new();
//! let session = mock.session(None);
//!
//! mock.expect_begin();
//! mock.expect_exec("INSERT INTO users").with_args([utils::random_email()]);
//! mock.expect_commit();
//!
//! // ... drive `session` ...
//! # drop(session);
//!
//! mock.expectations_were_met().unwrap();
//! # }
//! ```

pub mod mock;

pub use mock::{CallKind, ExpectedCall, MockConnection, MockDatabase, MockEvent, MockStatement, MockTransaction};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        init_tracing,
        mock::{CallKind, MockDatabase, MockEvent},
        utils, TestError, TestResult,
    };
}

#[derive(thiserror::Error, Debug)]
pub enum TestError {
    #[error("Unmet expectation: {0}")]
    UnmetExpectation(String),

    #[error("Test setup error: {0}")]
    Setup(String),
}

pub type TestResult<T> = Result<T, TestError>;

/// Install a test-writer tracing subscriber filtered by `RUST_LOG`
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Test data helpers
pub mod utils {
    /// Unique email address for test rows
    pub fn random_email() -> String {
        format!("test_{}@example.com", uuid::Uuid::new_v4().simple())
    }
}
