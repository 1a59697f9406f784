//! Transaction Options
//!
//! Isolation level and access mode a root session applies to every
//! transaction it begins.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Read Uncommitted - lowest isolation level
    ReadUncommitted,
    /// Read Committed - default PostgreSQL isolation level
    ReadCommitted,
    /// Repeatable Read - stronger consistency guarantees
    RepeatableRead,
    /// Serializable - highest isolation level
    Serializable,
}

impl IsolationLevel {
    /// Convert to SQL string for SET TRANSACTION ISOLATION LEVEL command
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("Unsupported isolation level: {}", s)),
        }
    }
}

/// Options applied when a transaction begins
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOptions {
    /// Transaction isolation level; `None` keeps the server default
    pub isolation_level: Option<IsolationLevel>,
    /// Whether the transaction is read-only
    pub read_only: bool,
}

impl TxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Serializable isolation
    pub fn serializable() -> Self {
        Self::new().isolation_level(IsolationLevel::Serializable)
    }

    /// `SET TRANSACTION` statement applying these options, if any differ from
    /// the server defaults
    pub fn set_transaction_sql(&self) -> Option<String> {
        let mut modes = Vec::new();
        if let Some(level) = self.isolation_level {
            modes.push(format!("ISOLATION LEVEL {}", level.as_sql()));
        }
        if self.read_only {
            modes.push("READ ONLY".to_string());
        }
        if modes.is_empty() {
            None
        } else {
            Some(format!("SET TRANSACTION {}", modes.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(IsolationLevel::ReadUncommitted.as_sql(), "READ UNCOMMITTED");
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
    }

    #[test]
    fn test_isolation_level_parsing() {
        assert_eq!("serializable".parse(), Ok(IsolationLevel::Serializable));
        assert_eq!("READ_COMMITTED".parse(), Ok(IsolationLevel::ReadCommitted));
        assert_eq!("repeatable read".parse(), Ok(IsolationLevel::RepeatableRead));
        assert_eq!("read-uncommitted".parse(), Ok(IsolationLevel::ReadUncommitted));
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_tx_options_default() {
        let options = TxOptions::default();
        assert!(options.isolation_level.is_none());
        assert!(!options.read_only);
        assert_eq!(options.set_transaction_sql(), None);
    }

    #[test]
    fn test_set_transaction_sql() {
        let options = TxOptions::new()
            .isolation_level(IsolationLevel::Serializable)
            .read_only(true);
        assert_eq!(
            options.set_transaction_sql().as_deref(),
            Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ ONLY")
        );

        let options = TxOptions::new().read_only(true);
        assert_eq!(
            options.set_transaction_sql().as_deref(),
            Some("SET TRANSACTION READ ONLY")
        );

        assert_eq!(
            TxOptions::serializable().set_transaction_sql().as_deref(),
            Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        );
    }

    #[test]
    fn test_isolation_level_serde() {
        let json = serde_json::to_string(&IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(json, "\"repeatable_read\"");
    }
}
