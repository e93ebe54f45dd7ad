// Graph nodes and edges of a workflow definition

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::task::Task;

/// Name of a state, unique within its workflow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(pub String);

impl StateId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StateId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for StateId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl PartialEq<str> for StateId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for StateId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Position of a transition in its workflow's declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionId(pub usize);

impl fmt::Display for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type TaskRef = Arc<dyn Task>;

/// A node of the workflow graph
#[derive(Clone)]
pub struct State {
    id: StateId,
    is_start: bool,
    fan_out: bool,
    on_enter: Option<TaskRef>,
    on_exit: Option<TaskRef>,
}

impl State {
    pub fn new(id: impl Into<StateId>) -> Self {
        Self {
            id: id.into(),
            is_start: false,
            fan_out: false,
            on_enter: None,
            on_exit: None,
        }
    }

    /// Mark this state as the workflow's start state
    pub fn start(mut self) -> Self {
        self.is_start = true;
        self
    }

    /// Fire every outgoing transition instead of the first one that succeeds.
    /// The state is left once all of them have fired.
    pub fn fan_out(mut self) -> Self {
        self.fan_out = true;
        self
    }

    pub fn with_on_enter(mut self, task: TaskRef) -> Self {
        self.on_enter = Some(task);
        self
    }

    pub fn with_on_exit(mut self, task: TaskRef) -> Self {
        self.on_exit = Some(task);
        self
    }

    pub fn id(&self) -> &StateId {
        &self.id
    }

    pub fn is_start(&self) -> bool {
        self.is_start
    }

    pub fn is_fan_out(&self) -> bool {
        self.fan_out
    }

    pub fn on_enter(&self) -> Option<&TaskRef> {
        self.on_enter.as_ref()
    }

    pub fn on_exit(&self) -> Option<&TaskRef> {
        self.on_exit.as_ref()
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id)
            .field("is_start", &self.is_start)
            .field("fan_out", &self.fan_out)
            .field("on_enter", &self.on_enter.as_ref().map(|t| t.name().to_string()))
            .field("on_exit", &self.on_exit.as_ref().map(|t| t.name().to_string()))
            .finish()
    }
}

/// A directed edge between two states
#[derive(Clone)]
pub struct Transition {
    id: TransitionId,
    name: String,
    from: StateId,
    to: StateId,
    task: Option<TaskRef>,
}

impl Transition {
    pub fn new(name: impl Into<String>, from: impl Into<StateId>, to: impl Into<StateId>) -> Self {
        Self {
            id: TransitionId(0),
            name: name.into(),
            from: from.into(),
            to: to.into(),
            task: None,
        }
    }

    pub fn with_task(mut self, task: TaskRef) -> Self {
        self.task = Some(task);
        self
    }

    pub(crate) fn assign_id(&mut self, id: TransitionId) {
        self.id = id;
    }

    pub fn id(&self) -> TransitionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn from_state(&self) -> &StateId {
        &self.from
    }

    pub fn to_state(&self) -> &StateId {
        &self.to
    }

    pub fn task(&self) -> Option<&TaskRef> {
        self.task.as_ref()
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("task", &self.task.as_ref().map(|t| t.name().to_string()))
            .finish()
    }
}
