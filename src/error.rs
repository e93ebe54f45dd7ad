// Error taxonomy for the workflow engine

use thiserror::Error;

use crate::definition::StateId;
use crate::instance::InstanceId;
use crate::persistence::PersistenceError;

/// Malformed workflow graph. Fatal at load time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("Workflow {workflow} declares no start state")]
    NoStartState { workflow: String },

    #[error("Workflow {workflow} declares {count} start states: {states:?}")]
    AmbiguousStartState {
        workflow: String,
        count: usize,
        states: Vec<String>,
    },

    #[error("Workflow {workflow} declares state {state} more than once")]
    DuplicateState { workflow: String, state: String },

    #[error("Workflow {workflow} has an empty state name")]
    EmptyStateName { workflow: String },

    #[error("Transition {transition} in workflow {workflow} references undeclared state {state}")]
    DanglingTransition {
        workflow: String,
        transition: String,
        state: String,
    },

    #[error("Workflow {workflow} references unknown task {task}")]
    UnknownTask { workflow: String, task: String },

    #[error("Invalid definition document: {reason}")]
    InvalidDocument { reason: String },
}

/// Errors surfaced by the engine to its callers.
///
/// Task failures are deliberately absent: a failing task is recorded on the
/// state it belongs to and never aborts a tick.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("Instance {instance_id} is being ticked elsewhere: {reason}")]
    Contention {
        instance_id: InstanceId,
        reason: String,
    },

    #[error("Instance {instance_id} halted: {reason}")]
    TerminalFailure {
        instance_id: InstanceId,
        reason: String,
    },

    #[error("State {state} is not declared by workflow {workflow}")]
    UnknownState { workflow: String, state: StateId },

    #[error("Instance {instance_id} belongs to workflow {actual}, not {expected}")]
    WorkflowMismatch {
        instance_id: InstanceId,
        expected: String,
        actual: String,
    },

    #[error("Instance {instance_id} not found")]
    InstanceNotFound { instance_id: InstanceId },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl EngineError {
    /// Whether a caller should back off and try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Contention { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
