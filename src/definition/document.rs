// Declarative workflow documents (TOML or JSON)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::types::{State, TaskRef, Transition};
use super::workflow::WorkflowDefinition;
use crate::error::DefinitionError;
use crate::task::{CommandTask, NoopTask, TaskRegistry, WaitForFileTask};

/// On-disk shape of a workflow.
///
/// ```toml
/// name = "novaseq-run"
///
/// [[states]]
/// name = "SEQUENCING"
/// start = true
///
/// [[states]]
/// name = "DEMUX"
///
/// [[transitions]]
/// name = "SequencingToDemux"
/// from = "SEQUENCING"
/// to = "DEMUX"
/// task = "rta-complete"
///
/// [tasks.rta-complete]
/// kind = "wait_for_file"
/// path = "{run_dir}/RTAComplete.txt"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefinitionDocument {
    pub name: String,
    #[serde(default)]
    pub states: Vec<StateDocument>,
    #[serde(default)]
    pub transitions: Vec<TransitionDocument>,
    /// Built-in tasks declared inline, by name
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateDocument {
    pub name: String,
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub fan_out: bool,
    pub on_enter: Option<String>,
    pub on_exit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionDocument {
    pub name: String,
    pub from: String,
    pub to: String,
    pub task: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSpec {
    Noop,
    WaitForFile {
        path: String,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        working_dir: Option<String>,
    },
}

impl TaskSpec {
    fn instantiate(&self, name: &str) -> TaskRef {
        match self {
            TaskSpec::Noop => Arc::new(NoopTask::new(name)),
            TaskSpec::WaitForFile { path } => Arc::new(WaitForFileTask::new(name, path.as_str())),
            TaskSpec::Command {
                program,
                args,
                working_dir,
            } => {
                let task = CommandTask::new(name, program.as_str()).with_args(args.iter().cloned());
                match working_dir {
                    Some(dir) => Arc::new(task.with_working_dir(dir.as_str())),
                    None => Arc::new(task),
                }
            }
        }
    }
}

impl DefinitionDocument {
    pub fn from_toml_str(source: &str) -> Result<Self, DefinitionError> {
        toml::from_str(source).map_err(|e| DefinitionError::InvalidDocument {
            reason: e.to_string(),
        })
    }

    pub fn from_json_str(source: &str) -> Result<Self, DefinitionError> {
        serde_json::from_str(source).map_err(|e| DefinitionError::InvalidDocument {
            reason: e.to_string(),
        })
    }

    /// Read a document, choosing the format from the file extension (`.json`
    /// or TOML otherwise)
    pub fn read(path: &Path) -> Result<Self, DefinitionError> {
        let source = std::fs::read_to_string(path).map_err(|e| DefinitionError::InvalidDocument {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&source)
        } else {
            Self::from_toml_str(&source)
        }
    }

    /// Read and build in one step
    pub fn load(path: &Path, registry: &TaskRegistry) -> Result<WorkflowDefinition, DefinitionError> {
        let definition = Self::read(path)?.build(registry)?;
        info!(
            workflow = definition.name(),
            file = ?path,
            states = definition.states().len(),
            transitions = definition.transitions().len(),
            "Workflow definition loaded"
        );
        Ok(definition)
    }

    /// Resolve task names and build a validated definition.
    ///
    /// Inline `[tasks]` shadow same-named tasks in `registry`. Every error is
    /// fatal: unknown task, dangling transition, missing or repeated start.
    pub fn build(&self, registry: &TaskRegistry) -> Result<WorkflowDefinition, DefinitionError> {
        let mut tasks = registry.clone();
        for (name, spec) in &self.tasks {
            debug!(task = %name, spec = ?spec, "Registering inline task");
            tasks.register(name.as_str(), spec.instantiate(name));
        }

        let resolve = |name: &str| -> Result<TaskRef, DefinitionError> {
            tasks.get(name).ok_or_else(|| DefinitionError::UnknownTask {
                workflow: self.name.clone(),
                task: name.to_string(),
            })
        };

        let mut states = Vec::with_capacity(self.states.len());
        for doc in &self.states {
            let mut state = State::new(doc.name.as_str());
            if doc.start {
                state = state.start();
            }
            if doc.fan_out {
                state = state.fan_out();
            }
            if let Some(task) = &doc.on_enter {
                state = state.with_on_enter(resolve(task)?);
            }
            if let Some(task) = &doc.on_exit {
                state = state.with_on_exit(resolve(task)?);
            }
            states.push(state);
        }

        let mut transitions = Vec::with_capacity(self.transitions.len());
        for doc in &self.transitions {
            let mut transition = Transition::new(doc.name.as_str(), doc.from.as_str(), doc.to.as_str());
            if let Some(task) = &doc.task {
                transition = transition.with_task(resolve(task)?);
            }
            transitions.push(transition);
        }

        WorkflowDefinition::new(self.name.as_str(), states, transitions)
    }
}
