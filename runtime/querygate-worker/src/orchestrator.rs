//! Select, execute, evaluate, repeat: the bounded loop that answers one inquiry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use querygate_db::{
    CancelToken, ExecutionErrorKind, GatewayError, QueryOutcome, QueryRequest, QueryRunner,
};
use querygate_policy::PolicySummary;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::scheduler::{SchedulerConfig, SchedulerError, run_all};
use crate::task::{TaskResult, TaskSpec, as_millis};

/// What the caller wants answered, plus the entity kinds the answer must cover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inquiry {
    pub question: String,
    #[serde(default)]
    pub entities: Vec<String>,
}

impl Inquiry {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            entities: Vec::new(),
        }
    }

    pub fn about<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = entities.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Complete,
    Incomplete { missing: Vec<String> },
}

impl Verdict {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Accumulated results for one inquiry. Nothing is ever removed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestrationState {
    pub results: Vec<TaskResult>,
    pub iteration: usize,
    pub verdict: Option<Verdict>,
}

impl OrchestrationState {
    pub fn successes(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.iter().filter(|result| result.is_success())
    }

    pub fn has_run(&self, name: &str) -> bool {
        self.results.iter().any(|result| result.name == name)
    }

    /// Entity tags covered by at least one successful task, lowercased.
    pub fn covered_entities(&self) -> HashSet<String> {
        covered(&self.results)
    }
}

/// Chooses the next operations to run. Returning nothing ends the loop.
#[async_trait]
pub trait OperationSelector: Send + Sync {
    async fn select(&self, inquiry: &Inquiry, state: &OrchestrationState) -> Vec<TaskSpec>;
}

pub trait CompletenessPolicy: Send + Sync {
    fn evaluate(&self, inquiry: &Inquiry, results: &[TaskResult]) -> Verdict;
}

/// Counts successes and entity coverage. A heuristic: it cannot tell whether
/// the rows that came back actually answer the question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageHeuristic {
    pub sufficient_successes: usize,
}

impl Default for CoverageHeuristic {
    fn default() -> Self {
        Self {
            sufficient_successes: 3,
        }
    }
}

impl CompletenessPolicy for CoverageHeuristic {
    fn evaluate(&self, inquiry: &Inquiry, results: &[TaskResult]) -> Verdict {
        let succeeded = results.iter().filter(|result| result.is_success()).count();
        let covered = covered(results);
        let missing = inquiry
            .entities
            .iter()
            .filter(|entity| !covered.contains(&entity.to_lowercase()))
            .cloned()
            .collect::<Vec<_>>();

        if succeeded == 0 {
            let missing = if inquiry.entities.is_empty() {
                vec!["no data retrieved".to_string()]
            } else {
                inquiry.entities.clone()
            };
            return Verdict::Incomplete { missing };
        }
        if !inquiry.entities.is_empty() && missing.is_empty() {
            return Verdict::Complete;
        }
        if succeeded >= self.sufficient_successes || results.len() < self.sufficient_successes {
            return Verdict::Complete;
        }
        if missing.is_empty() {
            let failed = results
                .iter()
                .filter(|result| !result.is_success())
                .map(|result| format!("task:{}", result.name))
                .collect();
            return Verdict::Incomplete { missing: failed };
        }
        Verdict::Incomplete { missing }
    }
}

fn covered(results: &[TaskResult]) -> HashSet<String> {
    results
        .iter()
        .filter(|result| result.is_success())
        .flat_map(|result| result.entities.iter().map(|entity| entity.to_lowercase()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub max_iterations: usize,
    pub scheduler: SchedulerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationReport {
    pub results: Vec<TaskResult>,
    pub iterations: usize,
    pub verdict: Verdict,
    /// The loop stopped without a complete verdict.
    pub partial: bool,
    /// Set when the inquiry was about the gateway's own access rules.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<PolicySummary>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

pub struct Orchestrator {
    selector: Arc<dyn OperationSelector>,
    policy: Arc<dyn CompletenessPolicy>,
    access: Option<PolicySummary>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(selector: Arc<dyn OperationSelector>, config: OrchestratorConfig) -> Self {
        Self {
            selector,
            policy: Arc::new(CoverageHeuristic::default()),
            access: None,
            config,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn CompletenessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Lets configuration questions be answered locally.
    pub fn with_access_summary(mut self, summary: PolicySummary) -> Self {
        self.access = Some(summary);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn run(&self, inquiry: &Inquiry) -> Result<OrchestrationReport, SchedulerError> {
        let started = Instant::now();
        if let Some(access) = self
            .access
            .as_ref()
            .filter(|_| is_configuration_question(&inquiry.question))
        {
            tracing::debug!("answering configuration question from policy");
            return Ok(OrchestrationReport {
                results: Vec::new(),
                iterations: 0,
                verdict: Verdict::Complete,
                partial: false,
                access: Some(access.clone()),
                elapsed: started.elapsed(),
            });
        }

        let mut state = OrchestrationState::default();
        for iteration in 1..=self.config.max_iterations {
            let tasks = self.selector.select(inquiry, &state).await;
            if tasks.is_empty() {
                tracing::debug!(iteration, "selector returned nothing, stopping");
                break;
            }
            let report = run_all(tasks, &self.config.scheduler).await?;
            state.iteration = iteration;
            state
                .results
                .extend(report.results.into_iter().map(|mut result| {
                    result.iteration = iteration;
                    result
                }));
            let verdict = self.policy.evaluate(inquiry, &state.results);
            tracing::info!(
                iteration,
                results = state.results.len(),
                complete = verdict.is_complete(),
                "orchestration round finished"
            );
            let complete = verdict.is_complete();
            state.verdict = Some(verdict);
            if complete {
                break;
            }
        }

        let verdict = state
            .verdict
            .take()
            .unwrap_or_else(|| self.policy.evaluate(inquiry, &state.results));
        let partial = !verdict.is_complete();
        if partial && state.iteration == self.config.max_iterations {
            tracing::warn!(
                max_iterations = self.config.max_iterations,
                "iteration ceiling reached, returning partial results"
            );
        }
        Ok(OrchestrationReport {
            results: state.results,
            iterations: state.iteration,
            verdict,
            partial,
            access: None,
            elapsed: started.elapsed(),
        })
    }
}

const CONFIGURATION_PHRASES: &[&str] = &[
    "which libraries can you access",
    "what libraries can you access",
    "which schemas can you access",
    "what schemas can you access",
    "which namespaces can you access",
    "allowed schemas",
    "allowed namespaces",
    "what schemas",
    "your configuration",
    "your settings",
];

/// True for questions about the gateway itself rather than the database.
pub fn is_configuration_question(question: &str) -> bool {
    let question = question.to_lowercase();
    CONFIGURATION_PHRASES
        .iter()
        .any(|phrase| question.contains(phrase))
}

/// Context handed to a [`SqlGenerator`] for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct Attempt<'a> {
    pub intent: &'a str,
    /// 1-based.
    pub number: u32,
    pub previous_sql: Option<&'a str>,
    pub previous_error: Option<&'a str>,
    pub access: &'a PolicySummary,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct GenerationError(pub String);

/// Writes a statement for an intent, typically by asking a language model.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, attempt: &Attempt<'_>) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DynamicQueryError {
    #[error("no usable statement after {attempts} attempt(s): {last_error}")]
    Exhausted {
        attempts: u32,
        last_sql: Option<String>,
        last_error: String,
    },
    #[error(transparent)]
    Gateway(GatewayError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DynamicAnswer {
    pub sql: String,
    pub outcome: QueryOutcome,
    pub attempts: u32,
}

/// Regenerates a statement until the gateway accepts and runs it, at most
/// `max_attempts` times. Rejections and remote failures are fed back to the
/// generator; pool and cancellation errors end the attempt loop.
pub struct DynamicQuery {
    runner: Arc<dyn QueryRunner>,
    generator: Arc<dyn SqlGenerator>,
    max_attempts: u32,
    max_rows: Option<i64>,
}

impl DynamicQuery {
    pub fn new(runner: Arc<dyn QueryRunner>, generator: Arc<dyn SqlGenerator>) -> Self {
        Self {
            runner,
            generator,
            max_attempts: 3,
            max_rows: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_max_rows(mut self, rows: i64) -> Self {
        self.max_rows = Some(rows);
        self
    }

    pub async fn run(
        &self,
        intent: &str,
        cancel: &CancelToken,
    ) -> Result<DynamicAnswer, DynamicQueryError> {
        let access = self.runner.policy_summary();
        let mut previous_sql: Option<String> = None;
        let mut previous_error: Option<String> = None;

        for number in 1..=self.max_attempts {
            let attempt = Attempt {
                intent,
                number,
                previous_sql: previous_sql.as_deref(),
                previous_error: previous_error.as_deref(),
                access: &access,
            };
            let sql = match self.generator.generate(&attempt).await {
                Ok(sql) => sql,
                Err(err) => {
                    tracing::debug!(attempt = number, error = %err, "statement generation failed");
                    previous_error = Some(err.0);
                    continue;
                }
            };

            let mut request = QueryRequest::new(sql.clone());
            request.max_rows = self.max_rows;
            let error = match self.runner.run(&request, cancel).await {
                Ok(QueryOutcome::Failed { kind, message }) => format!("{kind}: {message}"),
                Ok(outcome) => {
                    return Ok(DynamicAnswer {
                        sql,
                        outcome,
                        attempts: number,
                    });
                }
                Err(err @ (GatewayError::Validation(_) | GatewayError::Execution { .. })) => {
                    err.to_string()
                }
                Err(err) => return Err(DynamicQueryError::Gateway(err)),
            };
            tracing::info!(attempt = number, error = %error, "generated statement failed, retrying");
            previous_sql = Some(sql);
            previous_error = Some(error);
        }

        Err(DynamicQueryError::Exhausted {
            attempts: self.max_attempts,
            last_sql: previous_sql,
            last_error: previous_error.unwrap_or_default(),
        })
    }

    /// Wraps one intent as a schedulable task.
    pub fn task(
        self: &Arc<Self>,
        name: impl Into<String>,
        label: impl Into<String>,
        intent: impl Into<String>,
    ) -> TaskSpec {
        let this = Arc::clone(self);
        let intent = intent.into();
        TaskSpec::new(name, label, move |cancel| async move {
            match this.run(&intent, &cancel).await {
                Ok(answer) => Ok(answer.outcome),
                Err(DynamicQueryError::Gateway(err)) => Err(err),
                Err(err) => Err(GatewayError::execution(
                    ExecutionErrorKind::RemoteRejected,
                    &err.to_string(),
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use parking_lot::Mutex;
    use querygate_db::ConnectionError;
    use querygate_policy::{Rejection, ValidationPolicy};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok(name: &str, entities: &[&str]) -> TaskSpec {
        TaskSpec::new(name, name, |_| async { Ok(QueryOutcome::NoRows) }).covering(entities.to_vec())
    }

    fn failing(name: &str, entities: &[&str]) -> TaskSpec {
        TaskSpec::new(name, name, |_| async { Err(GatewayError::Cancelled) })
            .covering(entities.to_vec())
    }

    fn result(name: &str, status: TaskStatus, entities: &[&str]) -> TaskResult {
        TaskResult {
            name: name.into(),
            index: 0,
            label: name.into(),
            status,
            outcome: None,
            error: None,
            elapsed: Duration::ZERO,
            row_count: 0,
            iteration: 1,
            entities: entities.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Hands out one prepared round per call.
    struct Rounds {
        rounds: Mutex<VecDeque<Vec<TaskSpec>>>,
        calls: AtomicUsize,
    }

    impl Rounds {
        fn new(rounds: Vec<Vec<TaskSpec>>) -> Self {
            Self {
                rounds: Mutex::new(rounds.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OperationSelector for Rounds {
        async fn select(&self, _: &Inquiry, _: &OrchestrationState) -> Vec<TaskSpec> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.rounds.lock().pop_front().unwrap_or_default()
        }
    }

    /// Always schedules one failing task with a fresh name.
    struct Stubborn(AtomicUsize);

    #[async_trait]
    impl OperationSelector for Stubborn {
        async fn select(&self, _: &Inquiry, _: &OrchestrationState) -> Vec<TaskSpec> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            vec![failing(&format!("attempt{n}"), &["job"])]
        }
    }

    #[test]
    fn heuristic_rules() {
        let heuristic = CoverageHeuristic::default();
        let inquiry = Inquiry::new("jobs and users").about(["job", "user"]);

        let none = [result("a", TaskStatus::Error, &["job"])];
        assert_eq!(
            heuristic.evaluate(&inquiry, &none),
            Verdict::Incomplete {
                missing: vec!["job".into(), "user".into()]
            }
        );

        let covered = [
            result("a", TaskStatus::Success, &["Job"]),
            result("b", TaskStatus::Success, &["user"]),
        ];
        assert_eq!(heuristic.evaluate(&inquiry, &covered), Verdict::Complete);

        // Fewer than three requested and one success.
        let few = [
            result("a", TaskStatus::Success, &["job"]),
            result("b", TaskStatus::Timeout, &["user"]),
        ];
        assert_eq!(heuristic.evaluate(&inquiry, &few), Verdict::Complete);

        let mostly_failed = [
            result("a", TaskStatus::Success, &["job"]),
            result("b", TaskStatus::Error, &["user"]),
            result("c", TaskStatus::Error, &["user"]),
        ];
        assert_eq!(
            heuristic.evaluate(&inquiry, &mostly_failed),
            Verdict::Incomplete {
                missing: vec!["user".into()]
            }
        );

        let plenty = [
            result("a", TaskStatus::Success, &["job"]),
            result("b", TaskStatus::Success, &["job"]),
            result("c", TaskStatus::Success, &["job"]),
            result("d", TaskStatus::Error, &["user"]),
        ];
        assert_eq!(heuristic.evaluate(&inquiry, &plenty), Verdict::Complete);
    }

    #[test]
    fn heuristic_with_nothing_at_all() {
        assert_eq!(
            CoverageHeuristic::default().evaluate(&Inquiry::new("anything"), &[]),
            Verdict::Incomplete {
                missing: vec!["no data retrieved".into()]
            }
        );
    }

    #[tokio::test]
    async fn results_accumulate_across_rounds() {
        let selector = Arc::new(Rounds::new(vec![
            vec![ok("jobs", &["job"]), failing("users", &["user"]), failing("locks", &["lock"])],
            vec![ok("users_retry", &["user"])],
        ]));
        let orchestrator = Orchestrator::new(selector.clone(), OrchestratorConfig::default());
        let inquiry = Inquiry::new("who holds locks").about(["job", "user"]);
        let report = orchestrator.run(&inquiry).await.unwrap();

        assert_eq!(report.iterations, 2);
        assert_eq!(report.verdict, Verdict::Complete);
        assert!(!report.partial);
        let names: Vec<_> = report.results.iter().map(|r| (r.name.as_str(), r.iteration)).collect();
        assert_eq!(
            names,
            [("jobs", 1), ("users", 1), ("locks", 1), ("users_retry", 2)]
        );
        assert_eq!(selector.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn iteration_ceiling_flags_partial() {
        let orchestrator = Orchestrator::new(
            Arc::new(Stubborn(AtomicUsize::new(0))),
            OrchestratorConfig {
                max_iterations: 4,
                ..OrchestratorConfig::default()
            },
        );
        let report = orchestrator
            .run(&Inquiry::new("never works").about(["job"]))
            .await
            .unwrap();
        assert_eq!(report.iterations, 4);
        assert_eq!(report.results.len(), 4);
        assert!(report.partial);
        assert!(!report.verdict.is_complete());
    }

    #[tokio::test]
    async fn empty_selection_stops_immediately() {
        let selector = Arc::new(Rounds::new(Vec::new()));
        let report = Orchestrator::new(selector.clone(), OrchestratorConfig::default())
            .run(&Inquiry::new("nothing to do"))
            .await
            .unwrap();
        assert_eq!(report.iterations, 0);
        assert!(report.results.is_empty());
        assert!(report.partial);
        assert_eq!(selector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn configuration_questions_skip_the_selector() {
        let selector = Arc::new(Rounds::new(vec![vec![ok("jobs", &["job"])]]));
        let mut policy = ValidationPolicy::strict();
        policy.register_user_namespaces(["PRODDATA"]).unwrap();
        let report = Orchestrator::new(selector.clone(), OrchestratorConfig::default())
            .with_access_summary(policy.summary())
            .run(&Inquiry::new("Which schemas can you access?"))
            .await
            .unwrap();
        assert_eq!(selector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.access.unwrap().user_namespaces, vec!["PRODDATA"]);
        assert!(!is_configuration_question("list active jobs"));
    }

    /// Replays canned gateway answers and records what it was asked to run.
    struct ScriptedRunner {
        answers: Mutex<VecDeque<Result<QueryOutcome, GatewayError>>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(answers: Vec<Result<QueryOutcome, GatewayError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl QueryRunner for ScriptedRunner {
        async fn run(
            &self,
            request: &QueryRequest,
            _: &CancelToken,
        ) -> Result<QueryOutcome, GatewayError> {
            self.seen.lock().push(request.sql.clone());
            self.answers
                .lock()
                .pop_front()
                .unwrap_or(Ok(QueryOutcome::NoRows))
        }

        fn policy_summary(&self) -> PolicySummary {
            ValidationPolicy::strict().summary()
        }
    }

    /// Numbers each statement and remembers the feedback it was given.
    #[derive(Default)]
    struct Numbered {
        feedback: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl SqlGenerator for Numbered {
        async fn generate(&self, attempt: &Attempt<'_>) -> Result<String, GenerationError> {
            assert!(attempt.access.system_namespaces.contains(&"QSYS2".to_string()));
            self.feedback
                .lock()
                .push(attempt.previous_error.map(str::to_string));
            Ok(format!("SELECT {} FROM QSYS2.SYSTABLES", attempt.number))
        }
    }

    #[tokio::test]
    async fn dynamic_query_feeds_errors_back() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            Err(GatewayError::Validation(Rejection::MultiStatement)),
            Ok(QueryOutcome::Failed {
                kind: ExecutionErrorKind::RemoteRejected,
                message: "SQL0206 column not found".into(),
            }),
            Ok(QueryOutcome::NoRows),
        ]));
        let generator = Arc::new(Numbered::default());
        let answer = DynamicQuery::new(runner.clone(), generator.clone())
            .run("tables in QSYS2", &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(answer.attempts, 3);
        assert_eq!(answer.sql, "SELECT 3 FROM QSYS2.SYSTABLES");
        let feedback = generator.feedback.lock().clone();
        assert_eq!(feedback[0], None);
        assert!(feedback[1].as_deref().unwrap().contains("multiple statements"));
        assert!(feedback[2].as_deref().unwrap().contains("SQL0206"));
    }

    #[tokio::test]
    async fn dynamic_query_gives_up_after_max_attempts() {
        let rejection = || Err(GatewayError::Validation(Rejection::NotReadOnly));
        let runner = Arc::new(ScriptedRunner::new(vec![rejection(), rejection(), rejection()]));
        let err = DynamicQuery::new(runner.clone(), Arc::new(Numbered::default()))
            .with_max_attempts(2)
            .run("delete everything", &CancelToken::new())
            .await
            .unwrap_err();
        let DynamicQueryError::Exhausted { attempts, last_sql, .. } = err else {
            panic!("expected exhaustion");
        };
        assert_eq!(attempts, 2);
        assert_eq!(last_sql.as_deref(), Some("SELECT 2 FROM QSYS2.SYSTABLES"));
        assert_eq!(runner.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn pool_errors_stop_regeneration() {
        let runner = Arc::new(ScriptedRunner::new(vec![Err(GatewayError::Connection(
            ConnectionError::Exhausted { waited_ms: 30_000 },
        ))]));
        let query = Arc::new(DynamicQuery::new(runner.clone(), Arc::new(Numbered::default())));
        let report = run_all(
            vec![query.task("dynamic", "Writing a query", "busy system")],
            &SchedulerConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(report.results[0].status, TaskStatus::Error);
        assert_eq!(
            report.results[0].error,
            Some(GatewayError::Connection(ConnectionError::Exhausted {
                waited_ms: 30_000
            }))
        );
        assert_eq!(runner.seen.lock().len(), 1);
    }
}
