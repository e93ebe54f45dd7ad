// Immutable workflow graph, validated once at construction

use std::collections::HashMap;
use tracing::debug;

use super::types::{State, StateId, Transition, TransitionId};
use crate::error::DefinitionError;

/// Immutable graph of states and transitions shared read-only by every run.
///
/// Cycles are allowed; a state may be entered again after it was left.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    name: String,
    states: Vec<State>,
    transitions: Vec<Transition>,
    state_index: HashMap<StateId, usize>,
    outgoing: HashMap<StateId, Vec<usize>>,
}

impl WorkflowDefinition {
    /// Build a definition, failing if a state name is empty or repeated, if
    /// a transition points at an undeclared state, or unless exactly one
    /// state is flagged as start.
    pub fn new(
        name: impl Into<String>,
        states: Vec<State>,
        mut transitions: Vec<Transition>,
    ) -> Result<Self, DefinitionError> {
        let name = name.into();

        let mut state_index = HashMap::with_capacity(states.len());
        for (position, state) in states.iter().enumerate() {
            if state.id().as_str().trim().is_empty() {
                return Err(DefinitionError::EmptyStateName { workflow: name });
            }
            if state_index.insert(state.id().clone(), position).is_some() {
                return Err(DefinitionError::DuplicateState {
                    workflow: name,
                    state: state.id().to_string(),
                });
            }
        }

        let mut outgoing: HashMap<StateId, Vec<usize>> = HashMap::new();
        for (position, transition) in transitions.iter_mut().enumerate() {
            for endpoint in [transition.from_state(), transition.to_state()] {
                if !state_index.contains_key(endpoint) {
                    return Err(DefinitionError::DanglingTransition {
                        workflow: name,
                        transition: transition.name().to_string(),
                        state: endpoint.to_string(),
                    });
                }
            }
            transition.assign_id(TransitionId(position));
            outgoing
                .entry(transition.from_state().clone())
                .or_default()
                .push(position);
        }

        let definition = Self {
            name,
            states,
            transitions,
            state_index,
            outgoing,
        };
        definition.validate()?;

        debug!(
            workflow = %definition.name,
            states = definition.states.len(),
            transitions = definition.transitions.len(),
            "Workflow definition validated"
        );
        Ok(definition)
    }

    pub fn builder(name: impl Into<String>) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unique state flagged as start.
    pub fn start_state(&self) -> Result<&State, DefinitionError> {
        let starts: Vec<&State> = self.states.iter().filter(|s| s.is_start()).collect();
        match starts.as_slice() {
            [only] => Ok(*only),
            [] => Err(DefinitionError::NoStartState {
                workflow: self.name.clone(),
            }),
            many => Err(DefinitionError::AmbiguousStartState {
                workflow: self.name.clone(),
                count: many.len(),
                states: many.iter().map(|s| s.id().to_string()).collect(),
            }),
        }
    }

    /// Check everything the engine needs before it will run this definition
    pub fn validate(&self) -> Result<(), DefinitionError> {
        self.start_state().map(|_| ())
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn state(&self, id: &StateId) -> Option<&State> {
        self.state_index.get(id).map(|&i| &self.states[i])
    }

    pub fn contains_state(&self, id: &StateId) -> bool {
        self.state_index.contains_key(id)
    }

    pub fn transition(&self, id: TransitionId) -> Option<&Transition> {
        self.transitions.get(id.0)
    }

    /// Outgoing transitions of `state` in declaration order
    pub fn transitions_from(&self, state: &StateId) -> Vec<&Transition> {
        self.outgoing
            .get(state)
            .map(|positions| positions.iter().map(|&i| &self.transitions[i]).collect())
            .unwrap_or_default()
    }

    /// A state with no outgoing transitions
    pub fn is_terminal(&self, state: &StateId) -> bool {
        self.outgoing.get(state).map_or(true, |t| t.is_empty())
    }
}

/// Incremental construction of a [`WorkflowDefinition`]
#[derive(Debug)]
pub struct WorkflowDefinitionBuilder {
    name: String,
    states: Vec<State>,
    transitions: Vec<Transition>,
}

impl WorkflowDefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn state(mut self, state: State) -> Self {
        self.states.push(state);
        self
    }

    pub fn transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        WorkflowDefinition::new(self.name, self.states, self.transitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::builder("linear")
            .state(State::new("START").start())
            .state(State::new("DEMUX"))
            .state(State::new("ALIGN"))
            .transition(Transition::new("start-demux", "START", "DEMUX"))
            .transition(Transition::new("demux-align", "DEMUX", "ALIGN"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_start_state_is_unique_start() {
        let definition = linear();
        let start = definition.start_state().unwrap();
        assert_eq!(start.id(), &StateId::from("START"));
        assert!(start.is_start());
    }

    #[test]
    fn test_no_start_state_fails() {
        let err = WorkflowDefinition::builder("headless")
            .state(State::new("A"))
            .state(State::new("B"))
            .build()
            .unwrap_err();

        assert_eq!(
            err,
            DefinitionError::NoStartState {
                workflow: "headless".to_string()
            }
        );
    }

    #[test]
    fn test_two_start_states_fail() {
        let result = WorkflowDefinition::builder("two-heads")
            .state(State::new("A").start())
            .state(State::new("B").start())
            .build();

        match result {
            Err(DefinitionError::AmbiguousStartState { count, states, .. }) => {
                assert_eq!(count, 2);
                assert_eq!(states, vec!["A".to_string(), "B".to_string()]);
            }
            other => panic!("expected ambiguous start state, got {:?}", other),
        }
    }

    #[test]
    fn test_dangling_transition_rejected() {
        let result = WorkflowDefinition::builder("dangling")
            .state(State::new("A").start())
            .transition(Transition::new("to-nowhere", "A", "B"))
            .build();

        assert_eq!(
            result.unwrap_err(),
            DefinitionError::DanglingTransition {
                workflow: "dangling".to_string(),
                transition: "to-nowhere".to_string(),
                state: "B".to_string(),
            }
        );
    }

    #[test]
    fn test_duplicate_state_rejected() {
        let result = WorkflowDefinition::builder("dup")
            .state(State::new("A").start())
            .state(State::new("A"))
            .build();
        assert!(matches!(result, Err(DefinitionError::DuplicateState { .. })));
    }

    #[test]
    fn test_transition_endpoints_belong_to_definition() {
        let definition = linear();
        for transition in definition.transitions() {
            assert!(definition.contains_state(transition.from_state()));
            assert!(definition.contains_state(transition.to_state()));
        }
    }

    #[test]
    fn test_transitions_from_keep_declaration_order() {
        let definition = WorkflowDefinition::builder("fork")
            .state(State::new("A").start())
            .state(State::new("B"))
            .state(State::new("C"))
            .transition(Transition::new("second-declared-first", "A", "C"))
            .transition(Transition::new("b-to-a", "B", "A"))
            .transition(Transition::new("then-b", "A", "B"))
            .build()
            .unwrap();

        let names: Vec<&str> = definition
            .transitions_from(&StateId::from("A"))
            .iter()
            .map(|t| t.name())
            .collect();
        assert_eq!(names, vec!["second-declared-first", "then-b"]);
        assert_eq!(definition.transitions()[2].id(), TransitionId(2));
    }

    #[test]
    fn test_cycles_are_permitted() {
        let definition = WorkflowDefinition::builder("retry-lane")
            .state(State::new("ALIGN").start())
            .state(State::new("CHECK"))
            .transition(Transition::new("check", "ALIGN", "CHECK"))
            .transition(Transition::new("realign", "CHECK", "ALIGN"))
            .build();
        assert!(definition.is_ok());
    }

    #[test]
    fn test_terminal_state_detection() {
        let definition = linear();
        assert!(definition.is_terminal(&StateId::from("ALIGN")));
        assert!(!definition.is_terminal(&StateId::from("START")));
    }
}
