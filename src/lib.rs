// Seqflow Library - multi-token workflow engine for sequencing pipelines
// This exposes the engine components for embedding applications and tests

pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod instance;
pub mod observability;
pub mod persistence;
pub mod task;
pub mod telemetry;

// Re-export key types for easy access
pub use config::{config, SeqflowConfig};
pub use definition::{
    DefinitionDocument, State, StateId, Transition, TransitionId, WorkflowDefinition,
    WorkflowDefinitionBuilder,
};
pub use engine::{
    Driver, RetryDecision, RetryPolicy, TickOutcome, TickReport, TickScheduler, TransitionGuard,
};
pub use error::{DefinitionError, EngineError, EngineResult};
pub use instance::{ExecutionInstance, FailureDetail, InstanceId, InstanceStatus};
pub use observability::{engine_metrics, EngineMetrics, OperationTimer};
pub use persistence::{FileStore, InstanceStore, MemoryStore, PersistenceError};
pub use task::{Task, TaskContext, TaskEnvironment, TaskRegistry, TaskResult, TaskStatus};
pub use telemetry::{create_tick_span, generate_correlation_id, init_telemetry};
