//! Bounded execution of accepted statements.

use std::time::Instant;

use querygate_policy::{AcceptedQuery, safe_limit};
use serde_json::Value;

use crate::backend::{DbConnection, RowLimitSyntax, RowSet};
use crate::error::truncate_message;
use crate::outcome::QueryOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorLimits {
    pub default_rows: usize,
    pub max_rows: usize,
    pub max_bytes: usize,
    pub audit: bool,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            default_rows: 100,
            max_rows: 500,
            max_bytes: 500_000,
            audit: true,
        }
    }
}

/// Effective ceilings for one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCeiling {
    pub rows: usize,
    pub bytes: usize,
}

impl ExecutorLimits {
    /// Clamps caller-requested ceilings to the configured maxima.
    pub fn ceiling(&self, rows: Option<i64>, bytes: Option<usize>) -> ResultCeiling {
        ResultCeiling {
            rows: safe_limit(rows, self.default_rows, self.max_rows),
            bytes: bytes.map_or(self.max_bytes, |b| b.clamp(1, self.max_bytes)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryExecutor {
    limits: ExecutorLimits,
}

impl QueryExecutor {
    pub fn new(limits: ExecutorLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ExecutorLimits {
        &self.limits
    }

    /// Runs `query` once. Failures come back as [`QueryOutcome::Failed`];
    /// nothing is retried.
    pub async fn execute(
        &self,
        conn: &dyn DbConnection,
        query: &AcceptedQuery,
        params: &[Value],
        ceiling: ResultCeiling,
    ) -> QueryOutcome {
        let sql = if query.has_row_bound() {
            query.text().to_string()
        } else {
            apply_row_ceiling(query.text(), ceiling.rows, conn.row_limit_syntax())
        };
        if self.limits.audit {
            tracing::info!(
                target: "querygate::audit",
                sql = %normalize_whitespace(&sql),
                params = params.len(),
                max_rows = ceiling.rows,
                "executing query"
            );
        }

        let started = Instant::now();
        let fetched = conn.fetch(&sql, params, ceiling.rows.saturating_add(1)).await;
        let elapsed_ms = started.elapsed().as_millis();
        match fetched {
            Ok(set) => {
                let outcome = shape(set, ceiling);
                tracing::debug!(
                    rows = outcome.row_count(),
                    truncated = outcome.is_truncated(),
                    elapsed_ms,
                    "query finished"
                );
                outcome
            }
            Err(err) => {
                tracing::warn!(kind = %err.kind, elapsed_ms, error = %err.message, "query failed");
                QueryOutcome::Failed {
                    kind: err.kind,
                    message: truncate_message(&err.message),
                }
            }
        }
    }
}

/// Appends a top-level row ceiling on its own line, so a trailing line
/// comment cannot swallow it.
pub fn apply_row_ceiling(sql: &str, rows: usize, syntax: RowLimitSyntax) -> String {
    let body = sql.trim_end();
    match syntax {
        RowLimitSyntax::FetchFirst => format!("{body}\nFETCH FIRST {rows} ROWS ONLY"),
        RowLimitSyntax::Limit => format!("{body}\nLIMIT {rows}"),
    }
}

fn shape(set: RowSet, ceiling: ResultCeiling) -> QueryOutcome {
    let RowSet { columns, rows } = set;
    if rows.is_empty() {
        return QueryOutcome::NoRows;
    }
    let mut truncated = rows.len() > ceiling.rows;
    let mut kept = Vec::with_capacity(rows.len().min(ceiling.rows));
    // Serialized as a JSON array: brackets plus one comma per extra row.
    let mut bytes = 2usize;
    for row in rows.into_iter().take(ceiling.rows) {
        let size = serde_json::to_vec(&row).map_or(0, |encoded| encoded.len());
        let separator = usize::from(!kept.is_empty());
        if bytes + separator + size > ceiling.bytes {
            truncated = true;
            break;
        }
        bytes += separator + size;
        kept.push(row);
    }
    QueryOutcome::Rows {
        columns,
        rows: kept,
        truncated,
    }
}

fn normalize_whitespace(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeConnection;
    use crate::error::{ExecutionErrorKind, MAX_ERROR_MESSAGE_CHARS};
    use querygate_policy::{ValidationPolicy, validate};

    fn accepted(sql: &str) -> AcceptedQuery {
        validate(sql, &ValidationPolicy::strict()).expect("accepted")
    }

    #[tokio::test]
    async fn unbounded_statements_get_a_ceiling() {
        let conn = FakeConnection::with_rows(3);
        let seen = conn.seen.clone();
        let executor = QueryExecutor::default();
        let ceiling = executor.limits().ceiling(None, None);
        executor
            .execute(&conn, &accepted("SELECT * FROM QSYS2.SYSTABLES"), &[], ceiling)
            .await;
        let (sql, max_rows) = seen.lock()[0].clone();
        assert_eq!(sql, "SELECT * FROM QSYS2.SYSTABLES\nFETCH FIRST 100 ROWS ONLY");
        assert_eq!(max_rows, 101);
    }

    #[tokio::test]
    async fn bounded_statements_are_sent_verbatim() {
        let mut conn = FakeConnection::with_rows(3);
        conn.syntax = RowLimitSyntax::Limit;
        let seen = conn.seen.clone();
        let executor = QueryExecutor::default();
        let text = "SELECT * FROM QSYS2.SYSTABLES FETCH FIRST 5 ROWS ONLY";
        executor
            .execute(&conn, &accepted(text), &[], executor.limits().ceiling(None, None))
            .await;
        assert_eq!(seen.lock()[0].0, text);
    }

    #[tokio::test]
    async fn oversized_results_are_truncated_to_the_ceiling() {
        let conn = FakeConnection::with_rows(50);
        let executor = QueryExecutor::default();
        let ceiling = executor.limits().ceiling(Some(10), None);
        let outcome = executor
            .execute(&conn, &accepted("SELECT * FROM QSYS2.T"), &[], ceiling)
            .await;
        assert_eq!(outcome.row_count(), 10);
        assert!(outcome.is_truncated());
    }

    #[tokio::test]
    async fn exact_fit_is_not_truncated() {
        let conn = FakeConnection::with_rows(10);
        let executor = QueryExecutor::default();
        let ceiling = executor.limits().ceiling(Some(10), None);
        let outcome = executor
            .execute(&conn, &accepted("SELECT * FROM QSYS2.T"), &[], ceiling)
            .await;
        assert_eq!(outcome.row_count(), 10);
        assert!(!outcome.is_truncated());
    }

    #[tokio::test]
    async fn byte_ceiling_truncates() {
        let conn = FakeConnection::with_rows(20);
        let executor = QueryExecutor::default();
        // Each fake row serializes to roughly 25 bytes.
        let ceiling = executor.limits().ceiling(None, Some(80));
        let outcome = executor
            .execute(&conn, &accepted("SELECT * FROM QSYS2.T"), &[], ceiling)
            .await;
        assert!(outcome.is_truncated());
        assert!(outcome.row_count() < 20);
        let QueryOutcome::Rows { rows, .. } = outcome else {
            panic!("expected rows");
        };
        assert!(serde_json::to_vec(&rows).unwrap().len() <= 80);
    }

    #[tokio::test]
    async fn empty_results_are_no_rows() {
        let conn = FakeConnection::with_rows(0);
        let executor = QueryExecutor::default();
        let outcome = executor
            .execute(
                &conn,
                &accepted("SELECT * FROM QSYS2.T"),
                &[],
                executor.limits().ceiling(None, None),
            )
            .await;
        assert_eq!(outcome, QueryOutcome::NoRows);
    }

    #[tokio::test]
    async fn failures_are_classified_and_truncated() {
        let long = format!("SQL0204 {} not found\n    at internal frame", "X".repeat(400));
        let conn = FakeConnection::failing(ExecutionErrorKind::RemoteRejected, &long);
        let executor = QueryExecutor::default();
        let outcome = executor
            .execute(
                &conn,
                &accepted("SELECT * FROM QSYS2.T"),
                &[],
                executor.limits().ceiling(None, None),
            )
            .await;
        let QueryOutcome::Failed { kind, message } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(kind, ExecutionErrorKind::RemoteRejected);
        assert!(message.chars().count() <= MAX_ERROR_MESSAGE_CHARS + 3);
        assert!(!message.contains("frame"));
    }

    #[test]
    fn ceilings_clamp_caller_requests() {
        let limits = ExecutorLimits::default();
        assert_eq!(limits.ceiling(Some(10_000), None).rows, 500);
        assert_eq!(limits.ceiling(Some(0), None).rows, 1);
        assert_eq!(limits.ceiling(None, Some(10_000_000)).bytes, 500_000);
    }

    #[test]
    fn limit_clause_goes_on_its_own_line() {
        assert_eq!(
            apply_row_ceiling("SELECT 1 FROM T -- note  ", 5, RowLimitSyntax::Limit),
            "SELECT 1 FROM T -- note\nLIMIT 5"
        );
    }
}
