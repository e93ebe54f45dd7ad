// Task contract - the only call the engine makes into external tooling

pub mod builtin;
pub mod launcher;
pub mod registry;

#[cfg(test)]
pub mod mocks;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::definition::{StateId, TransitionId};
use crate::instance::InstanceId;

pub use builtin::{CommandTask, FnTask, NoopTask, WaitForFileTask};
pub use launcher::{DisabledLauncher, JobLauncher, JobSpec, JobStatus, LaunchError, LocalProcessLauncher};
pub use registry::TaskRegistry;

/// Exit code used for results that carry no process exit code of their own.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code reported while a task is still in progress.
pub const EXIT_RUNNING: i32 = -2;
/// Exit code of a failure synthesized from an error or panic inside a task.
pub const EXIT_SYNTHETIC_FAILURE: i32 = -1;

/// How the engine must treat a task result. Always explicit, never derived
/// from the exit code by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Work finished; the transition may fire
    Success,
    /// Work is still in progress; poll again on a later tick
    Running,
    /// Work failed; the retry policy decides what happens next
    Failed,
    /// Work failed in a way retrying cannot fix
    Fatal,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub exit_code: i32,
    pub output: String,
    /// Opaque token handed back to the task on its next invocation
    pub handle: Option<String>,
}

impl TaskResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            exit_code: EXIT_SUCCESS,
            output: output.into(),
            handle: None,
        }
    }

    pub fn running(output: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Running,
            exit_code: EXIT_RUNNING,
            output: output.into(),
            handle: None,
        }
    }

    pub fn failed(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            exit_code,
            output: output.into(),
            handle: None,
        }
    }

    pub fn fatal(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Fatal,
            exit_code,
            output: output.into(),
            handle: None,
        }
    }

    /// Process convention: zero is success, anything else a retryable failure
    pub fn from_exit_code(exit_code: i32, output: impl Into<String>) -> Self {
        if exit_code == EXIT_SUCCESS {
            Self::success(output)
        } else {
            Self::failed(exit_code, output)
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// Where in the graph a task is attached
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKey {
    Transition(TransitionId),
    Enter(StateId),
    Exit(StateId),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Transition(id) => write!(f, "transition{}", id),
            TaskKey::Enter(state) => write!(f, "enter:{}", state),
            TaskKey::Exit(state) => write!(f, "exit:{}", state),
        }
    }
}

/// Everything the surrounding application supplies to tasks.
///
/// The engine passes it through unmodified.
#[derive(Clone)]
pub struct TaskEnvironment {
    pub variables: BTreeMap<String, String>,
    pub launcher: Arc<dyn JobLauncher>,
}

impl TaskEnvironment {
    pub fn new(launcher: Arc<dyn JobLauncher>) -> Self {
        Self {
            variables: BTreeMap::new(),
            launcher,
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

impl Default for TaskEnvironment {
    fn default() -> Self {
        Self::new(Arc::new(DisabledLauncher))
    }
}

impl fmt::Debug for TaskEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEnvironment")
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

/// Per-invocation view handed to [`Task::execute`]
#[derive(Debug, Clone)]
pub struct TaskContext<'a> {
    pub environment: &'a TaskEnvironment,
    pub instance_id: &'a InstanceId,
    pub workflow: &'a str,
    pub instance_variables: &'a BTreeMap<String, String>,
    pub key: TaskKey,
    /// 1 on the first attempt after an activation, incremented per failure
    pub attempt: u32,
    /// Handle returned by the previous invocation while it was running
    pub handle: Option<&'a str>,
}

impl<'a> TaskContext<'a> {
    /// Look up a variable, instance values shadowing environment values
    pub fn var(&self, key: &str) -> Option<&'a str> {
        self.instance_variables
            .get(key)
            .or_else(|| self.environment.variables.get(key))
            .map(String::as_str)
    }

    pub fn launcher(&self) -> &'a Arc<dyn JobLauncher> {
        &self.environment.launcher
    }
}

/// A unit of work invoked on state entry/exit or transition traversal.
///
/// Tasks hold no engine state; anything they need arrives in the context.
/// Long-running work must return [`TaskStatus::Running`] promptly and report
/// completion when invoked again on a later tick.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, context: &TaskContext<'_>) -> anyhow::Result<TaskResult>;
}

/// Run a task, converting errors and panics into failed results
pub async fn invoke(task: &dyn Task, context: &TaskContext<'_>) -> TaskResult {
    debug!(
        task = task.name(),
        key = %context.key,
        attempt = context.attempt,
        instance_id = %context.instance_id,
        "Executing task"
    );

    match AssertUnwindSafe(task.execute(context)).catch_unwind().await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!(task = task.name(), key = %context.key, error = %e, "Task returned an error");
            TaskResult::failed(EXIT_SYNTHETIC_FAILURE, format!("{:#}", e))
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "task panicked".to_string());
            warn!(task = task.name(), key = %context.key, panic = %message, "Task panicked");
            TaskResult::failed(EXIT_SYNTHETIC_FAILURE, format!("panic: {}", message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context<'a>(
        environment: &'a TaskEnvironment,
        instance_id: &'a InstanceId,
        vars: &'a BTreeMap<String, String>,
    ) -> TaskContext<'a> {
        TaskContext {
            environment,
            instance_id,
            workflow: "test",
            instance_variables: vars,
            key: TaskKey::Enter(StateId::from("A")),
            attempt: 1,
            handle: None,
        }
    }

    #[test]
    fn test_exit_code_convention() {
        assert_eq!(TaskResult::from_exit_code(0, "ok").status, TaskStatus::Success);
        let failed = TaskResult::from_exit_code(3, "boom");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.exit_code, 3);
        assert!(!TaskResult::running("").status.is_terminal());
    }

    #[test]
    fn test_instance_variables_shadow_environment() {
        let environment = TaskEnvironment::default()
            .with_variable("run_dir", "/env/run")
            .with_variable("reference", "hg38");
        let mut vars = BTreeMap::new();
        vars.insert("run_dir".to_string(), "/instance/run".to_string());
        let instance_id = InstanceId::new();
        let ctx = context(&environment, &instance_id, &vars);

        assert_eq!(ctx.var("run_dir"), Some("/instance/run"));
        assert_eq!(ctx.var("reference"), Some("hg38"));
        assert_eq!(ctx.var("missing"), None);
    }

    #[test]
    fn test_task_key_display() {
        assert_eq!(TaskKey::Transition(TransitionId(4)).to_string(), "transition#4");
        assert_eq!(TaskKey::Exit(StateId::from("DEMUX")).to_string(), "exit:DEMUX");
    }

    #[tokio::test]
    async fn test_invoke_converts_error_to_failure() {
        let task = FnTask::new("erroring", |_| Err(anyhow::anyhow!("disk full")));
        let environment = TaskEnvironment::default();
        let instance_id = InstanceId::new();
        let vars = BTreeMap::new();

        let result = invoke(&task, &context(&environment, &instance_id, &vars)).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.exit_code, EXIT_SYNTHETIC_FAILURE);
        assert!(result.output.contains("disk full"));
    }

    #[tokio::test]
    async fn test_invoke_converts_panic_to_failure() {
        let task = FnTask::new("panicking", |_| panic!("lane 3 exploded"));
        let environment = TaskEnvironment::default();
        let instance_id = InstanceId::new();
        let vars = BTreeMap::new();

        let result = invoke(&task, &context(&environment, &instance_id, &vars)).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.output.contains("lane 3 exploded"));
    }
}
