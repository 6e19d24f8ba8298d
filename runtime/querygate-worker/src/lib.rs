//! Concurrent task scheduling, the orchestration loop and the stdio worker
//! surface built on top of the querygate gateway.

pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod orchestrator;
pub mod scheduler;
pub mod status;
pub mod task;
pub mod telemetry;
pub mod wire;

pub use catalog::{CapabilityCache, CatalogError};
pub use config::{ConfigError, GatewayConfig};
pub use dispatch::Dispatcher;
pub use orchestrator::{
    Attempt, CompletenessPolicy, CoverageHeuristic, DynamicAnswer, DynamicQuery, DynamicQueryError,
    GenerationError, Inquiry, OperationSelector, OrchestrationReport, OrchestrationState,
    Orchestrator, OrchestratorConfig, SqlGenerator, Verdict, is_configuration_question,
};
pub use scheduler::{Batch, BatchReport, SchedulerConfig, SchedulerError, run_all};
pub use status::{StatusBoard, StatusSnapshot};
pub use task::{TaskResult, TaskSpec, TaskStatus};
