//! Read-through existence checks for catalog services and views.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use querygate_db::{CancelToken, GatewayError, QueryOutcome, QueryRequest, QueryRunner, Row};
use querygate_policy::{IdentError, safe_ident};
use serde_json::Value;

const PRELOAD_SERVICES: &str = "SELECT SERVICE_SCHEMA_NAME, SERVICE_NAME FROM QSYS2.SERVICES_INFO";
const SERVICE_EXISTS: &str = "SELECT 1 FROM QSYS2.SERVICES_INFO \
     WHERE SERVICE_SCHEMA_NAME = ? AND SERVICE_NAME = ? FETCH FIRST 1 ROW ONLY";
const VIEW_EXISTS: &str = "SELECT 1 FROM QSYS2.SYSTABLES \
     WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? FETCH FIRST 1 ROW ONLY";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    InvalidName(#[from] IdentError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

type Key = (String, String);

#[derive(Default)]
struct Entries {
    services: HashMap<Key, bool>,
    views: HashMap<Key, bool>,
    /// The full service list is loaded, so a miss means "absent".
    services_complete: bool,
}

/// Caller-owned cache of which catalog services and views exist. Both
/// positive and negative answers are kept until [`CapabilityCache::clear`].
pub struct CapabilityCache {
    runner: Arc<dyn QueryRunner>,
    entries: Mutex<Entries>,
}

impl CapabilityCache {
    pub fn new(runner: Arc<dyn QueryRunner>) -> Self {
        Self {
            runner,
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Loads every `(schema, service)` pair in one query. Returns how many
    /// were loaded. A truncated list only seeds positive entries.
    pub async fn preload(&self, cancel: &CancelToken) -> Result<usize, CatalogError> {
        let request = QueryRequest::new(PRELOAD_SERVICES).with_max_rows(i64::MAX);
        let outcome = self.runner.run(&request, cancel).await?.into_result()?;
        let truncated = outcome.is_truncated();
        let pairs = match outcome {
            QueryOutcome::Rows { rows, .. } => rows
                .iter()
                .filter_map(|row| {
                    Some((
                        column(row, "SERVICE_SCHEMA_NAME")?,
                        column(row, "SERVICE_NAME")?,
                    ))
                })
                .collect::<Vec<_>>(),
            QueryOutcome::NoRows | QueryOutcome::Failed { .. } => Vec::new(),
        };
        let loaded = pairs.len();
        let mut entries = self.entries.lock();
        for key in pairs {
            entries.services.insert(key, true);
        }
        entries.services_complete = !truncated;
        tracing::debug!(loaded, truncated, "service catalog preloaded");
        Ok(loaded)
    }

    pub async fn service_exists(
        &self,
        schema: &str,
        service: &str,
        cancel: &CancelToken,
    ) -> Result<bool, CatalogError> {
        let key = (
            safe_ident(schema, "schema")?,
            safe_ident(service, "service")?,
        );
        {
            let entries = self.entries.lock();
            if let Some(known) = entries.services.get(&key) {
                return Ok(*known);
            }
            if entries.services_complete {
                return Ok(false);
            }
        }
        let exists = self.probe(SERVICE_EXISTS, &key, cancel).await?;
        self.entries.lock().services.insert(key, exists);
        Ok(exists)
    }

    pub async fn view_exists(
        &self,
        schema: &str,
        view: &str,
        cancel: &CancelToken,
    ) -> Result<bool, CatalogError> {
        let key = (safe_ident(schema, "schema")?, safe_ident(view, "view")?);
        let cached = self.entries.lock().views.get(&key).copied();
        if let Some(known) = cached {
            return Ok(known);
        }
        let exists = self.probe(VIEW_EXISTS, &key, cancel).await?;
        self.entries.lock().views.insert(key, exists);
        Ok(exists)
    }

    pub fn clear(&self) {
        *self.entries.lock() = Entries::default();
    }

    async fn probe(&self, sql: &str, key: &Key, cancel: &CancelToken) -> Result<bool, CatalogError> {
        let request = QueryRequest::new(sql).with_params(vec![
            Value::String(key.0.clone()),
            Value::String(key.1.clone()),
        ]);
        let outcome = self.runner.run(&request, cancel).await?.into_result()?;
        Ok(outcome.row_count() > 0)
    }
}

fn column(row: &Row, name: &str) -> Option<String> {
    row.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, value)| value.as_str())
        .map(|value| value.trim().to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use querygate_db::ExecutionErrorKind;
    use querygate_policy::{PolicySummary, ValidationPolicy};
    use serde_json::json;

    /// Answers every probe with the same outcome and counts calls.
    struct Fixed {
        outcome: QueryOutcome,
        calls: Mutex<Vec<QueryRequest>>,
    }

    impl Fixed {
        fn new(outcome: QueryOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl QueryRunner for Fixed {
        async fn run(
            &self,
            request: &QueryRequest,
            _: &CancelToken,
        ) -> Result<QueryOutcome, GatewayError> {
            self.calls.lock().push(request.clone());
            Ok(self.outcome.clone())
        }

        fn policy_summary(&self) -> PolicySummary {
            ValidationPolicy::strict().summary()
        }
    }

    fn rows(pairs: &[(&str, &str)], truncated: bool) -> QueryOutcome {
        QueryOutcome::Rows {
            columns: vec!["SERVICE_SCHEMA_NAME".into(), "SERVICE_NAME".into()],
            rows: pairs
                .iter()
                .map(|(schema, name)| {
                    let mut row = Row::new();
                    row.insert("service_schema_name".into(), json!(schema));
                    row.insert("service_name".into(), json!(name));
                    row
                })
                .collect(),
            truncated,
        }
    }

    #[tokio::test]
    async fn read_through_caches_both_answers() {
        let runner = Fixed::new(QueryOutcome::NoRows);
        let cache = CapabilityCache::new(runner.clone());
        let cancel = CancelToken::new();
        assert!(!cache.view_exists("qsys2", "missing_view", &cancel).await.unwrap());
        assert!(!cache.view_exists("QSYS2", "MISSING_VIEW", &cancel).await.unwrap());
        assert_eq!(runner.calls(), 1);
        let probe = runner.calls.lock()[0].clone();
        assert_eq!(probe.params, vec![json!("QSYS2"), json!("MISSING_VIEW")]);
        assert!(probe.sql.contains("QSYS2.SYSTABLES"));
    }

    #[tokio::test]
    async fn positive_probe_is_cached() {
        let runner = Fixed::new(rows(&[("QSYS2", "ACTIVE_JOB_INFO")], false));
        let cache = CapabilityCache::new(runner.clone());
        let cancel = CancelToken::new();
        for _ in 0..3 {
            assert!(cache.service_exists("QSYS2", "ACTIVE_JOB_INFO", &cancel).await.unwrap());
        }
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn unsafe_names_never_reach_the_database() {
        let runner = Fixed::new(QueryOutcome::NoRows);
        let cache = CapabilityCache::new(runner.clone());
        let err = cache
            .service_exists("QSYS2", "X' OR '1'='1", &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidName(_)));
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn complete_preload_answers_from_memory() {
        let runner = Fixed::new(rows(
            &[("QSYS2", "ACTIVE_JOB_INFO"), ("SYSTOOLS", "LPRINTF")],
            false,
        ));
        let cache = CapabilityCache::new(runner.clone());
        let cancel = CancelToken::new();
        assert_eq!(cache.preload(&cancel).await.unwrap(), 2);
        assert!(cache.service_exists("systools", "lprintf", &cancel).await.unwrap());
        assert!(!cache.service_exists("QSYS2", "NOPE", &cancel).await.unwrap());
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn truncated_preload_still_probes_misses() {
        let runner = Fixed::new(rows(&[("QSYS2", "ACTIVE_JOB_INFO")], true));
        let cache = CapabilityCache::new(runner.clone());
        let cancel = CancelToken::new();
        cache.preload(&cancel).await.unwrap();
        cache.service_exists("QSYS2", "OTHER", &cancel).await.unwrap();
        assert_eq!(runner.calls(), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let runner = Fixed::new(QueryOutcome::Failed {
            kind: ExecutionErrorKind::ConnectionLost,
            message: "reset".into(),
        });
        let cache = CapabilityCache::new(runner.clone());
        let cancel = CancelToken::new();
        for _ in 0..2 {
            let err = cache.view_exists("QSYS2", "SYSTABLES", &cancel).await.unwrap_err();
            assert!(matches!(err, CatalogError::Gateway(GatewayError::Execution { .. })));
        }
        assert_eq!(runner.calls(), 2);
    }
}
