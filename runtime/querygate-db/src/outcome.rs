use serde::{Deserialize, Serialize};

use crate::backend::Row;
use crate::error::{ExecutionErrorKind, GatewayError};

/// Result of running one accepted statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QueryOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<Row>,
        truncated: bool,
    },
    NoRows,
    Failed {
        kind: ExecutionErrorKind,
        message: String,
    },
}

impl QueryOutcome {
    pub fn row_count(&self) -> usize {
        match self {
            Self::Rows { rows, .. } => rows.len(),
            Self::NoRows | Self::Failed { .. } => 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Rows { truncated: true, .. })
    }

    /// Lifts `Failed` into the error channel.
    pub fn into_result(self) -> Result<Self, GatewayError> {
        match self {
            Self::Failed { kind, message } => Err(GatewayError::Execution { kind, message }),
            other => Ok(other),
        }
    }
}
