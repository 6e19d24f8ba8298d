use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use querygate_db::{CancelToken, GatewayError, QueryOutcome, QueryRequest, QueryRunner};
use serde::{Serialize, Serializer};

pub type OperationFuture = Pin<Box<dyn Future<Output = Result<QueryOutcome, GatewayError>> + Send>>;
pub type Operation = Box<dyn FnOnce(CancelToken) -> OperationFuture + Send>;

/// One named unit of work submitted to the scheduler.
pub struct TaskSpec {
    pub name: String,
    pub label: String,
    /// Entity tags the task covers, used when judging completeness.
    pub entities: Vec<String>,
    operation: Operation,
}

impl TaskSpec {
    pub fn new<F, Fut>(name: impl Into<String>, label: impl Into<String>, operation: F) -> Self
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<QueryOutcome, GatewayError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            label: label.into(),
            entities: Vec::new(),
            operation: Box::new(move |cancel| Box::pin(operation(cancel))),
        }
    }

    /// A task that runs one fixed request through `runner`.
    pub fn query(
        name: impl Into<String>,
        label: impl Into<String>,
        runner: Arc<dyn QueryRunner>,
        request: QueryRequest,
    ) -> Self {
        Self::new(name, label, move |cancel| async move {
            runner.run(&request, &cancel).await
        })
    }

    pub fn covering<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = entities.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn into_parts(self) -> (TaskMeta, Operation) {
        (
            TaskMeta {
                name: self.name,
                label: self.label,
                entities: self.entities,
            },
            self.operation,
        )
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("label", &self.label)
            .field("entities", &self.entities)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TaskMeta {
    pub name: String,
    pub label: String,
    pub entities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Error,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Timeout)
    }

    /// Forward-only: pending may skip straight to a terminal state (a batch
    /// deadline can hit before a worker frees up), terminal states are final.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            Self::Success | Self::Error | Self::Timeout => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub name: String,
    pub index: usize,
    pub label: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<QueryOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub row_count: usize,
    /// Orchestration round that produced this result; 0 outside the orchestrator.
    pub iteration: usize,
    pub entities: Vec<String>,
}

impl TaskResult {
    pub(crate) fn finished(
        index: usize,
        meta: TaskMeta,
        status: TaskStatus,
        result: Result<QueryOutcome, GatewayError>,
        elapsed: Duration,
    ) -> Self {
        let (outcome, error) = match result {
            Ok(outcome) => (Some(outcome), None),
            Err(err) => (None, Some(err)),
        };
        Self {
            name: meta.name,
            index,
            label: meta.label,
            status,
            row_count: outcome.as_ref().map_or(0, QueryOutcome::row_count),
            outcome,
            error,
            elapsed,
            iteration: 0,
            entities: meta.entities,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

pub(crate) fn as_millis<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}
