// Mock tasks and launchers for testing - no side effects

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::launcher::{JobLauncher, JobSpec, JobStatus, LaunchError};
use super::{Task, TaskContext, TaskResult};

/// Shared, ordered log of task invocations across several mock tasks
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.calls.lock().unwrap().push(entry.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.as_str() == entry).count()
    }
}

/// Task that returns scripted results in order and records each call.
/// Once the script is exhausted the last result repeats.
pub struct ScriptedTask {
    name: String,
    log: CallLog,
    script: Mutex<VecDeque<TaskResult>>,
    last: Mutex<TaskResult>,
}

impl ScriptedTask {
    pub fn new(name: &str, log: &CallLog, script: Vec<TaskResult>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
            script: Mutex::new(script.into()),
            last: Mutex::new(TaskResult::success("")),
        })
    }

    /// Task that always succeeds
    pub fn succeeding(name: &str, log: &CallLog) -> Arc<Self> {
        Self::new(name, log, vec![TaskResult::success(name)])
    }

    pub fn push(&self, result: TaskResult) {
        self.script.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl Task for ScriptedTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _context: &TaskContext<'_>) -> anyhow::Result<TaskResult> {
        self.log.record(self.name.clone());
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(result) = next {
            *last = result;
        }
        Ok(last.clone())
    }
}

/// Launcher whose jobs finish only when a test says so
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    submitted: Mutex<Vec<JobSpec>>,
    outcomes: Mutex<HashMap<String, JobStatus>>,
    cancelled: Mutex<Vec<String>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<JobSpec> {
        self.submitted.lock().unwrap().clone()
    }

    /// Handles passed to `cancel`, in call order
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn finish(&self, handle: &str, code: i32, output: &str) {
        self.outcomes.lock().unwrap().insert(
            handle.to_string(),
            JobStatus::Exited {
                code,
                output: output.to_string(),
            },
        );
    }
}

#[async_trait]
impl JobLauncher for ScriptedLauncher {
    async fn submit(&self, spec: &JobSpec) -> Result<String, LaunchError> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(spec.clone());
        let handle = format!("job-{}", submitted.len());
        self.outcomes
            .lock()
            .unwrap()
            .insert(handle.clone(), JobStatus::Running);
        Ok(handle)
    }

    async fn poll(&self, handle: &str) -> Result<JobStatus, LaunchError> {
        Ok(self
            .outcomes
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .unwrap_or(JobStatus::Unknown))
    }

    async fn cancel(&self, handle: &str) -> Result<(), LaunchError> {
        self.cancelled.lock().unwrap().push(handle.to_string());
        if let Some(status) = self.outcomes.lock().unwrap().get_mut(handle) {
            if *status == JobStatus::Running {
                *status = JobStatus::Exited {
                    code: -1,
                    output: "cancelled".to_string(),
                };
            }
        }
        Ok(())
    }
}
