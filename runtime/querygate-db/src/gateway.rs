//! Validate, acquire, execute: the only path from query text to a backend.

use std::sync::Arc;

use async_trait::async_trait;
use querygate_policy::{PolicySummary, ValidationPolicy, validate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::async_pool::CancelToken;
use crate::error::{ExecutionErrorKind, GatewayError};
use crate::executor::QueryExecutor;
use crate::outcome::QueryOutcome;
use crate::pool::{ConnectionPool, db};

/// Raw statement plus what the caller wants bounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub max_rows: Option<i64>,
    #[serde(default)]
    pub max_bytes: Option<usize>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Self::default()
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_max_rows(mut self, rows: i64) -> Self {
        self.max_rows = Some(rows);
        self
    }
}

/// Anything that can answer a [`QueryRequest`]. [`Gateway`] is the real one;
/// callers depend on this seam so they can be exercised without a database.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn run(
        &self,
        request: &QueryRequest,
        cancel: &CancelToken,
    ) -> Result<QueryOutcome, GatewayError>;

    fn policy_summary(&self) -> PolicySummary;
}

pub struct Gateway {
    pool: ConnectionPool,
    policy: Arc<ValidationPolicy>,
    executor: QueryExecutor,
}

impl Gateway {
    pub fn new(pool: ConnectionPool, policy: Arc<ValidationPolicy>, executor: QueryExecutor) -> Self {
        Self {
            pool,
            policy,
            executor,
        }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }
}

#[async_trait]
impl QueryRunner for Gateway {
    async fn run(
        &self,
        request: &QueryRequest,
        cancel: &CancelToken,
    ) -> Result<QueryOutcome, GatewayError> {
        let accepted = match validate(&request.sql, &self.policy) {
            Ok(accepted) => accepted,
            Err(rejection) => {
                tracing::info!(
                    target: "querygate::audit",
                    reason = %rejection,
                    "query rejected"
                );
                return Err(rejection.into());
            }
        };
        let conn = self.pool.acquire(Some(cancel)).await?;
        let ceiling = self
            .executor
            .limits()
            .ceiling(request.max_rows, request.max_bytes);

        let outcome = tokio::select! {
            outcome = self.executor.execute(db(&conn), &accepted, &request.params, ceiling) => outcome,
            _ = cancel.cancelled() => {
                if let Err(err) = db(&conn).cancel_query().await {
                    tracing::debug!(error = %err, "server-side cancel failed");
                }
                // The connection may still be mid-statement.
                conn.discard();
                return Err(GatewayError::Cancelled);
            }
        };
        if matches!(
            outcome,
            QueryOutcome::Failed {
                kind: ExecutionErrorKind::ConnectionLost,
                ..
            }
        ) {
            conn.discard();
        }
        Ok(outcome)
    }

    fn policy_summary(&self) -> PolicySummary {
        self.policy.summary()
    }
}
