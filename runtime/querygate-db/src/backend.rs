//! The narrow surface every database driver implements.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ExecutionErrorKind;

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// How a driver spells a top-level row ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLimitSyntax {
    /// `FETCH FIRST n ROWS ONLY` (DB2, PostgreSQL).
    FetchFirst,
    /// `LIMIT n` (SQLite).
    Limit,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A live connection. Implementations must be safe to share behind a pool
/// guard; the pool guarantees a single owner at a time.
#[async_trait]
pub trait DbConnection: Send + Sync {
    /// Runs `sql` with positional parameters, reading at most `max_rows` rows.
    async fn fetch(&self, sql: &str, params: &[Value], max_rows: usize)
    -> Result<RowSet, BackendError>;

    async fn ping(&self) -> Result<(), BackendError>;

    /// Best-effort cancellation of whatever statement is in flight.
    async fn cancel_query(&self) -> Result<(), BackendError>;

    fn row_limit_syntax(&self) -> RowLimitSyntax;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, BackendError>;

    /// Target description for logs. Must not include credentials.
    fn describe(&self) -> String;
}
