//! Database Driver Abstractions
//!
//! Capability traits a driver implements to back a session, plus the value
//! and row types that cross the boundary.

pub mod core;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use self::core::*;
#[cfg(feature = "postgres")]
pub use self::postgres::{PostgresConnection, PostgresStatement, PostgresTransaction};
