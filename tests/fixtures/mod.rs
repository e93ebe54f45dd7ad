//! Shared test tasks that record what the engine asked of them

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use seqflow::task::{Task, TaskContext, TaskResult};

/// Ordered log shared by every task of one test
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries.lock().unwrap().iter().filter(|e| e.as_str() == entry).count()
    }
}

/// Task returning queued results (the last one repeats), journaling each call
pub struct RecordingTask {
    name: String,
    journal: Journal,
    queue: Mutex<VecDeque<TaskResult>>,
    last: Mutex<TaskResult>,
    handles_seen: Mutex<Vec<Option<String>>>,
}

impl RecordingTask {
    pub fn new(name: &str, journal: &Journal, results: Vec<TaskResult>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            journal: journal.clone(),
            queue: Mutex::new(results.into()),
            last: Mutex::new(TaskResult::success(name)),
            handles_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn ok(name: &str, journal: &Journal) -> Arc<Self> {
        Self::new(name, journal, Vec::new())
    }

    /// Handle passed in on each invocation, in call order
    pub fn handles_seen(&self) -> Vec<Option<String>> {
        self.handles_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Task for RecordingTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, context: &TaskContext<'_>) -> anyhow::Result<TaskResult> {
        self.journal.push(self.name.clone());
        self.handles_seen
            .lock()
            .unwrap()
            .push(context.handle.map(str::to_string));

        let next = self.queue.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(result) = next {
            *last = result;
        }
        Ok(last.clone())
    }
}
