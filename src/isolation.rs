//! Canonical isolation levels, translated at each backend boundary.

use serde::Deserialize;

/// Isolation level for a transaction.
///
/// Backends that do not support a requested level accept it and fall back to
/// their closest native behaviour (SQLite transactions are always
/// serializable, for example).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Statement issued on a fresh Postgres transaction to apply the level.
    pub(crate) fn postgres_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => {
                "SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED"
            }
            IsolationLevel::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            IsolationLevel::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}
