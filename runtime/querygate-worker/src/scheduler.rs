//! Bounded concurrent execution of a batch of named tasks.
//!
//! Each task runs under its own supervisor: the supervisor waits for a worker
//! permit, spawns the operation (so a panic is contained in a `JoinError`),
//! and enforces the per-task deadline. The batch deadline is enforced both by
//! the supervisors and by the collector, which aborts whatever is left once the
//! grace period after the deadline has passed.

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use querygate_db::{CancelToken, GatewayError, QueryOutcome, TimeoutScope};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::status::StatusBoard;
use crate::task::{Operation, TaskMeta, TaskResult, TaskSpec, TaskStatus, as_millis};

/// Extra wait after the batch grace period so supervisors can report their
/// own timeouts before the collector aborts them.
const COLLECT_SLACK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub per_task_timeout: Duration,
    pub overall_timeout: Duration,
    pub cancel_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            per_task_timeout: Duration::from_secs(60),
            overall_timeout: Duration::from_secs(120),
            cancel_grace: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SchedulerError {
    #[error("task name {0:?} appears more than once in the batch")]
    DuplicateTask(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// One result per submitted task, in submission order.
    pub results: Vec<TaskResult>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub deadline_exceeded: bool,
}

impl BatchReport {
    fn empty() -> Self {
        Self {
            results: Vec::new(),
            elapsed: Duration::ZERO,
            deadline_exceeded: false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&TaskResult> {
        self.results.iter().find(|result| result.name == name)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.results
            .iter()
            .filter(|result| result.status == status)
            .count()
    }

    pub fn successes(&self) -> usize {
        self.count(TaskStatus::Success)
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// A validated batch whose status board can be observed before it runs.
pub struct Batch {
    tasks: Vec<(TaskMeta, Operation)>,
    board: Arc<StatusBoard>,
    config: SchedulerConfig,
    cancel: CancelToken,
}

impl Batch {
    pub fn prepare(tasks: Vec<TaskSpec>, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let mut seen = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if !seen.insert(task.name.as_str()) {
                return Err(SchedulerError::DuplicateTask(task.name.clone()));
            }
        }
        let tasks = tasks
            .into_iter()
            .map(TaskSpec::into_parts)
            .collect::<Vec<_>>();
        let board = StatusBoard::new(
            tasks
                .iter()
                .map(|(meta, _)| (meta.name.clone(), meta.label.clone())),
        );
        Ok(Self {
            tasks,
            board: Arc::new(board),
            config,
            cancel: CancelToken::new(),
        })
    }

    /// Ties the batch to an outer token. Firing it winds the batch down the
    /// same way the batch deadline does: every running task is cancelled,
    /// given `cancel_grace`, then aborted.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.board)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs every task to a terminal state. Never waits on a stuck task past
    /// `overall_timeout + cancel_grace`.
    pub async fn run(self) -> BatchReport {
        if self.tasks.is_empty() {
            return BatchReport::empty();
        }
        let Self {
            tasks,
            board,
            config,
            cancel: batch_cancel,
        } = self;
        let started = Instant::now();
        let deadline = started + config.overall_timeout;
        let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
        let total = tasks.len();

        tracing::debug!(
            tasks = total,
            max_workers = config.max_workers,
            per_task_ms = config.per_task_timeout.as_millis(),
            overall_ms = config.overall_timeout.as_millis(),
            "batch started"
        );

        let mut metas = Vec::with_capacity(total);
        let mut join_set = JoinSet::new();
        for (index, (meta, operation)) in tasks.into_iter().enumerate() {
            metas.push(meta.clone());
            let supervisor = Supervisor {
                index,
                meta,
                board: Arc::clone(&board),
                semaphore: Arc::clone(&semaphore),
                batch_cancel: batch_cancel.clone(),
                config: config.clone(),
            };
            join_set.spawn(supervisor.run(operation));
        }

        let mut results: Vec<Option<TaskResult>> = (0..total).map(|_| None).collect();
        let finished = tokio::select! {
            gathered = tokio::time::timeout_at(deadline, gather(&mut join_set, &mut results)) => {
                gathered.is_ok()
            }
            () = batch_cancel.cancelled() => false,
        };
        let cancelled_outside = !finished && batch_cancel.is_cancelled();
        if !finished {
            if cancelled_outside {
                tracing::info!("batch cancelled, winding down remaining tasks");
            } else {
                tracing::warn!(
                    overall_ms = config.overall_timeout.as_millis(),
                    "batch deadline exceeded, cancelling remaining tasks"
                );
                batch_cancel.cancel();
            }
            let _ = tokio::time::timeout(
                config.cancel_grace + COLLECT_SLACK,
                gather(&mut join_set, &mut results),
            )
            .await;
            join_set.abort_all();
        }

        let elapsed = started.elapsed();
        let results = results
            .into_iter()
            .zip(metas)
            .enumerate()
            .map(|(index, (result, meta))| {
                result.unwrap_or_else(|| {
                    board.transition(index, TaskStatus::Timeout);
                    TaskResult::finished(
                        index,
                        meta,
                        TaskStatus::Timeout,
                        Err(batch_timeout(&config)),
                        elapsed,
                    )
                })
            })
            .collect();
        let report = BatchReport {
            results,
            elapsed,
            deadline_exceeded: !finished && !cancelled_outside,
        };
        tracing::info!(
            tasks = total,
            succeeded = report.successes(),
            timed_out = report.count(TaskStatus::Timeout),
            elapsed_ms = elapsed.as_millis(),
            "batch finished"
        );
        report
    }
}

/// Runs `tasks` with at most `config.max_workers` in flight.
pub async fn run_all(
    tasks: Vec<TaskSpec>,
    config: &SchedulerConfig,
) -> Result<BatchReport, SchedulerError> {
    Ok(Batch::prepare(tasks, config.clone())?.run().await)
}

async fn gather(join_set: &mut JoinSet<TaskResult>, results: &mut [Option<TaskResult>]) {
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(result) => {
                let index = result.index;
                if let Some(slot) = results.get_mut(index) {
                    *slot = Some(result);
                }
            }
            // Supervisors do not panic; an abort here is the collector's own.
            Err(err) => tracing::debug!(error = %err, "task supervisor ended without a result"),
        }
    }
}

fn batch_timeout(config: &SchedulerConfig) -> GatewayError {
    GatewayError::Timeout {
        scope: TimeoutScope::Batch,
        after_ms: millis(config.overall_timeout),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Aborts the operation if its supervisor is dropped or aborted.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Supervisor {
    index: usize,
    meta: TaskMeta,
    board: Arc<StatusBoard>,
    semaphore: Arc<Semaphore>,
    batch_cancel: CancelToken,
    config: SchedulerConfig,
}

impl Supervisor {
    async fn run(self, operation: Operation) -> TaskResult {
        let queued = Instant::now();
        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit,
            () = self.batch_cancel.cancelled() => {
                return self.complete(
                    TaskStatus::Timeout,
                    Err(batch_timeout(&self.config)),
                    queued.elapsed(),
                );
            }
        };
        let Ok(_permit) = permit else {
            return self.complete(TaskStatus::Error, Err(GatewayError::Cancelled), queued.elapsed());
        };
        // A permit freed by a cancelled task must not start new work.
        if self.batch_cancel.is_cancelled() {
            return self.complete(
                TaskStatus::Timeout,
                Err(batch_timeout(&self.config)),
                queued.elapsed(),
            );
        }

        self.board.transition(self.index, TaskStatus::Running);
        tracing::debug!(task = %self.meta.name, "task running");
        let started = Instant::now();
        let token = CancelToken::new();
        let mut handle = AbortOnDrop(tokio::spawn(operation(token.clone())));

        let scope = tokio::select! {
            joined = &mut handle.0 => {
                let (status, result) = classify(joined);
                return self.complete(status, result, started.elapsed());
            }
            () = tokio::time::sleep(self.config.per_task_timeout) => TimeoutScope::Task,
            () = self.batch_cancel.cancelled() => TimeoutScope::Batch,
        };

        token.cancel();
        if tokio::time::timeout(self.config.cancel_grace, &mut handle.0)
            .await
            .is_err()
        {
            tracing::warn!(task = %self.meta.name, "task ignored cancellation, aborting");
        }
        handle.0.abort();
        let after = match scope {
            TimeoutScope::Batch => self.config.overall_timeout,
            TimeoutScope::Task | TimeoutScope::Request => self.config.per_task_timeout,
        };
        self.complete(
            TaskStatus::Timeout,
            Err(GatewayError::Timeout {
                scope,
                after_ms: millis(after),
            }),
            started.elapsed(),
        )
    }

    fn complete(
        &self,
        status: TaskStatus,
        result: Result<QueryOutcome, GatewayError>,
        elapsed: Duration,
    ) -> TaskResult {
        self.board.transition(self.index, status);
        match &result {
            Err(err) => tracing::info!(
                task = %self.meta.name,
                %status,
                elapsed_ms = elapsed.as_millis(),
                error = %err,
                "task finished"
            ),
            Ok(outcome) => tracing::info!(
                task = %self.meta.name,
                %status,
                elapsed_ms = elapsed.as_millis(),
                rows = outcome.row_count(),
                "task finished"
            ),
        }
        TaskResult::finished(self.index, self.meta.clone(), status, result, elapsed)
    }
}

fn classify(
    joined: Result<Result<QueryOutcome, GatewayError>, JoinError>,
) -> (TaskStatus, Result<QueryOutcome, GatewayError>) {
    match joined {
        Ok(Ok(outcome)) if outcome.is_failed() => (TaskStatus::Error, Ok(outcome)),
        Ok(Ok(outcome)) => (TaskStatus::Success, Ok(outcome)),
        Ok(Err(err @ GatewayError::Timeout { .. })) => (TaskStatus::Timeout, Err(err)),
        Ok(Err(err)) => (TaskStatus::Error, Err(err)),
        Err(err) if err.is_panic() => (
            TaskStatus::Error,
            Err(GatewayError::Panicked(panic_message(err.into_panic()))),
        ),
        Err(_) => (TaskStatus::Error, Err(GatewayError::Cancelled)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use querygate_db::{ExecutionErrorKind, Row};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rows(n: usize) -> QueryOutcome {
        QueryOutcome::Rows {
            columns: vec!["N".into()],
            rows: (0..n)
                .map(|i| {
                    let mut row = Row::new();
                    row.insert("N".into(), json!(i));
                    row
                })
                .collect(),
            truncated: false,
        }
    }

    fn sleeper(name: &str, delay: Duration) -> TaskSpec {
        TaskSpec::new(name, format!("Running {name}"), move |_| async move {
            tokio::time::sleep(delay).await;
            Ok(rows(1))
        })
    }

    fn config(max_workers: usize, per_task: u64, overall: u64) -> SchedulerConfig {
        SchedulerConfig {
            max_workers,
            per_task_timeout: Duration::from_secs(per_task),
            overall_timeout: Duration::from_secs(overall),
            cancel_grace: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_task_times_out_while_the_rest_succeed() {
        let tasks = vec![
            sleeper("a", Duration::from_millis(50)),
            sleeper("slow", Duration::from_secs(30)),
            sleeper("b", Duration::from_millis(80)),
            sleeper("c", Duration::from_millis(20)),
            sleeper("d", Duration::from_millis(60)),
        ];
        let started = Instant::now();
        let report = run_all(tasks, &config(2, 2, 10)).await.unwrap();
        let wall = started.elapsed();

        assert_eq!(report.successes(), 4);
        assert_eq!(report.count(TaskStatus::Timeout), 1);
        let slow = report.get("slow").unwrap();
        assert_eq!(slow.status, TaskStatus::Timeout);
        assert_eq!(
            slow.error,
            Some(GatewayError::Timeout {
                scope: TimeoutScope::Task,
                after_ms: 2000
            })
        );
        assert!(!report.deadline_exceeded);
        assert!(wall >= Duration::from_secs(2));
        assert!(wall < Duration::from_secs(3), "took {wall:?}");
        let names: Vec<_> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a", "slow", "b", "c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_deadline_bounds_the_whole_call() {
        let tasks = (0..3)
            .map(|i| sleeper(&format!("stuck{i}"), Duration::from_secs(3600)))
            .collect();
        let started = Instant::now();
        let report = run_all(tasks, &config(1, 60, 1)).await.unwrap();
        let wall = started.elapsed();

        assert!(report.deadline_exceeded);
        assert_eq!(report.count(TaskStatus::Timeout), 3);
        for result in &report.results {
            assert_eq!(
                result.error,
                Some(GatewayError::Timeout {
                    scope: TimeoutScope::Batch,
                    after_ms: 1000
                })
            );
        }
        assert!(wall <= Duration::from_secs(1) + Duration::from_millis(100) + COLLECT_SLACK);
    }

    #[tokio::test]
    async fn panics_become_error_results() {
        let tasks = vec![
            TaskSpec::new("boom", "Exploding", |_| async {
                if true {
                    panic!("driver exploded");
                }
                Ok(QueryOutcome::NoRows)
            }),
            sleeper("fine", Duration::from_millis(1)),
        ];
        let report = run_all(tasks, &SchedulerConfig::default()).await.unwrap();
        let boom = report.get("boom").unwrap();
        assert_eq!(boom.status, TaskStatus::Error);
        assert_eq!(
            boom.error,
            Some(GatewayError::Panicked("driver exploded".into()))
        );
        assert_eq!(report.get("fine").unwrap().status, TaskStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn cooperative_cancellation_still_reports_timeout() {
        let observed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&observed);
        let task = TaskSpec::new("polite", "Waiting politely", move |cancel| async move {
            cancel.cancelled().await;
            seen.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::Cancelled)
        });
        let report = run_all(vec![task], &config(1, 1, 10)).await.unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(report.results[0].status, TaskStatus::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn outer_cancel_reaches_running_and_queued_tasks() {
        let observed = Arc::new(AtomicUsize::new(0));
        let tasks = (0..3)
            .map(|i| {
                let seen = Arc::clone(&observed);
                TaskSpec::new(format!("wait{i}"), "Waiting", move |cancel| async move {
                    cancel.cancelled().await;
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::Cancelled)
                })
            })
            .collect();
        let outer = CancelToken::new();
        let batch = Batch::prepare(tasks, config(2, 60, 120))
            .unwrap()
            .with_cancel(outer.clone());
        let board = batch.board();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            outer.cancel();
        });

        let started = Instant::now();
        let report = batch.run().await;
        canceller.await.unwrap();

        // Two were running and saw their own token; the third never got a permit.
        assert_eq!(observed.load(Ordering::SeqCst), 2);
        assert_eq!(report.count(TaskStatus::Timeout), 3);
        assert!(!report.deadline_exceeded);
        assert!(board.all_terminal());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn worker_cap_is_respected() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks = (0..8)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                TaskSpec::new(format!("t{i}"), "Counting", move |_| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(QueryOutcome::NoRows)
                })
            })
            .collect();
        let report = run_all(tasks, &config(3, 5, 10)).await.unwrap();
        assert_eq!(report.successes(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn failed_outcomes_and_errors_are_error_status() {
        let tasks = vec![
            TaskSpec::new("rejected", "Rejected", |_| async {
                Ok(QueryOutcome::Failed {
                    kind: ExecutionErrorKind::RemoteRejected,
                    message: "SQL0204".into(),
                })
            }),
            TaskSpec::new("lost", "Lost", |_| async {
                Err(GatewayError::execution(ExecutionErrorKind::ConnectionLost, "reset"))
            }),
        ];
        let report = run_all(tasks, &SchedulerConfig::default()).await.unwrap();
        assert_eq!(report.count(TaskStatus::Error), 2);
        assert!(report.get("rejected").unwrap().outcome.is_some());
    }

    #[tokio::test]
    async fn duplicate_names_are_refused() {
        let err = run_all(
            vec![
                sleeper("same", Duration::ZERO),
                sleeper("same", Duration::ZERO),
            ],
            &SchedulerConfig::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err, SchedulerError::DuplicateTask("same".into()));
    }

    #[tokio::test]
    async fn empty_batch_is_an_empty_report() {
        let report = run_all(Vec::new(), &SchedulerConfig::default()).await.unwrap();
        assert!(report.is_empty());
        assert!(!report.deadline_exceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn board_reaches_terminal_state_for_every_task() {
        let batch = Batch::prepare(
            vec![
                sleeper("x", Duration::from_millis(5)),
                sleeper("y", Duration::from_secs(10)),
            ],
            config(2, 1, 5),
        )
        .unwrap();
        let board = batch.board();
        let mut versions = board.subscribe();
        assert_eq!(board.len(), 2);
        batch.run().await;
        assert!(versions.has_changed().unwrap());
        assert!(board.all_terminal());
        let snapshot = board.snapshot();
        assert_eq!(snapshot[0].status, TaskStatus::Success);
        assert_eq!(snapshot[1].status, TaskStatus::Timeout);
    }
}
