// Workflow definitions: states, transitions and the graph that holds them

pub mod document;
pub mod types;
pub mod workflow;

pub use document::{DefinitionDocument, StateDocument, TaskSpec, TransitionDocument};
pub use types::{State, StateId, TaskRef, Transition, TransitionId};
pub use workflow::{WorkflowDefinition, WorkflowDefinitionBuilder};
