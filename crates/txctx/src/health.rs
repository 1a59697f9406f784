//! Connection health probe
//!
//! A bounded-duration ping against the shared connection. It has no
//! interaction with session or transaction state.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::backends::Connection;
use crate::context::Context;

/// Health status of the shared connection
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    /// Ping succeeded within the timeout
    Healthy,
    /// Ping failed or timed out
    Unhealthy { reason: String },
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Unhealthy { reason } => write!(f, "UNHEALTHY: {}", reason),
        }
    }
}

/// Outcome of one health probe
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub check_duration: Duration,
    pub timeout: Duration,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Ping `conn`, giving up after `timeout`
///
/// Timeouts and ping errors both classify as unhealthy.
pub async fn probe(conn: &dyn Connection, timeout: Duration) -> HealthReport {
    let start = Instant::now();
    let (ctx, cancel) = Context::background().with_timeout(timeout);

    let outcome = ctx.run(conn.ping(&ctx)).await;
    cancel.cancel();

    let status = match outcome {
        Ok(()) => HealthStatus::Healthy,
        Err(err) => {
            tracing::debug!("Health check failed: {}", err);
            HealthStatus::Unhealthy {
                reason: err.to_string(),
            }
        }
    };

    HealthReport {
        status,
        check_duration: start.elapsed(),
        timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "HEALTHY");
        let status = HealthStatus::Unhealthy {
            reason: "context deadline exceeded".to_string(),
        };
        assert_eq!(status.to_string(), "UNHEALTHY: context deadline exceeded");
    }

    #[test]
    fn test_report_health() {
        let report = HealthReport {
            status: HealthStatus::Healthy,
            check_duration: Duration::from_millis(3),
            timeout: Duration::from_secs(5),
        };
        assert!(report.is_healthy());

        let report = HealthReport {
            status: HealthStatus::Unhealthy {
                reason: "connection refused".to_string(),
            },
            ..report
        };
        assert!(!report.is_healthy());
    }
}
