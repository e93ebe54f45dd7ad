// Explicit name -> task lookup handed to loaders

use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use super::Task;
use crate::definition::TaskRef;

/// Tasks addressable by name from definition documents
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskRef>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task under `name`, returning any task it replaced
    pub fn register(&mut self, name: impl Into<String>, task: Arc<dyn Task>) -> Option<TaskRef> {
        let name = name.into();
        let previous = self.tasks.insert(name.clone(), task);
        if previous.is_some() {
            warn!(task = %name, "Replaced previously registered task");
        }
        previous
    }

    pub fn with(mut self, name: impl Into<String>, task: Arc<dyn Task>) -> Self {
        self.register(name, task);
        self
    }

    pub fn get(&self, name: &str) -> Option<TaskRef> {
        self.tasks.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry").field("tasks", &self.names()).finish()
    }
}
