use std::fmt;

use querygate_policy::Rejection;
use serde::Serialize;

/// Remote messages longer than this are cut before they leave the crate.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionError {
    #[error("connection pool exhausted after waiting {waited_ms} ms")]
    Exhausted { waited_ms: u64 },
    #[error("connect failed after {attempts} attempt(s): {message}")]
    Connect { attempts: u32, message: String },
    #[error("connection acquire cancelled")]
    Cancelled,
}

/// Classification of a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    ConnectionLost,
    RemoteRejected,
    Timeout,
    Unknown,
}

impl ExecutionErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionLost => "connection_lost",
            Self::RemoteRejected => "remote_rejected",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    Task,
    Batch,
    Request,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Task => "task",
            Self::Batch => "batch",
            Self::Request => "request",
        })
    }
}

/// Everything that can stop a gateway operation from producing a
/// [`crate::QueryOutcome`].
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum GatewayError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("query rejected: {0}")]
    Validation(#[from] Rejection),
    #[error("execution failed ({kind}): {message}")]
    Execution {
        kind: ExecutionErrorKind,
        message: String,
    },
    #[error("{scope} deadline of {after_ms} ms exceeded")]
    Timeout { scope: TimeoutScope, after_ms: u64 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation panicked: {0}")]
    Panicked(String),
}

impl GatewayError {
    pub fn execution(kind: ExecutionErrorKind, message: &str) -> Self {
        Self::Execution {
            kind,
            message: truncate_message(message),
        }
    }

    /// True when resubmitting the same statement cannot help.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Keeps the first line of `message`, cut to [`MAX_ERROR_MESSAGE_CHARS`].
pub fn truncate_message(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or_default().trim();
    if first_line.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        return first_line.to_string();
    }
    let mut cut: String = first_line.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();
    cut.push_str("...");
    cut
}
