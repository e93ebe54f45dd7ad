// Execution instance - the mutable, persisted run of a workflow definition
//
// A run tracks a *set* of active states; parallel branches (one per lane,
// one per sample) are active at the same time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

use crate::definition::{StateId, TransitionId, WorkflowDefinition};
use crate::error::{DefinitionError, EngineError, EngineResult};
use crate::task::{TaskKey, TaskResult, TaskStatus};

/// Audit events kept per instance unless configured otherwise
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Eligible for ticking
    Running,
    /// No active states remain
    Complete,
    /// Halted by a terminal failure; waits for an operator
    Failed,
    /// Cleared by an operator
    Cancelled,
}

impl InstanceStatus {
    pub fn is_tickable(&self) -> bool {
        matches!(self, InstanceStatus::Running)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Complete => "complete",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Why the most recent task attached to an active state failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub state: StateId,
    pub task_key: String,
    pub task: String,
    pub exit_code: i32,
    pub output: String,
    /// Consecutive failures since the state was activated
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    /// Earliest time the state may be evaluated again
    pub retry_at: Option<DateTime<Utc>>,
}

/// Bookkeeping for one task slot of an active state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: String,
    pub invocations: u32,
    pub handle: Option<String>,
    pub last_status: TaskStatus,
    pub last_exit_code: i32,
    pub last_output: String,
    pub updated_at: DateTime<Utc>,
}

/// Audit trail entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InstanceEvent {
    Activated {
        state: StateId,
        at: DateTime<Utc>,
    },
    AlreadyActive {
        state: StateId,
        at: DateTime<Utc>,
    },
    Deactivated {
        state: StateId,
        at: DateTime<Utc>,
    },
    TransitionFired {
        transition: TransitionId,
        name: String,
        from: StateId,
        to: StateId,
        at: DateTime<Utc>,
    },
    TaskFailed {
        state: StateId,
        task_key: String,
        exit_code: i32,
        attempts: u32,
        at: DateTime<Utc>,
    },
    RoutedToFailureState {
        from: StateId,
        to: StateId,
        at: DateTime<Utc>,
    },
    Halted {
        reason: String,
        at: DateTime<Utc>,
    },
    Cancelled {
        reason: String,
        cleared: Vec<StateId>,
        at: DateTime<Utc>,
    },
    Resumed {
        at: DateTime<Utc>,
    },
}

impl InstanceEvent {
    /// Fold a repeat of this event into it. Returns false if `next` is a
    /// different event and must be appended.
    fn absorb(&mut self, next: &InstanceEvent) -> bool {
        match (self, next) {
            (
                InstanceEvent::TaskFailed {
                    state,
                    task_key,
                    exit_code,
                    attempts,
                    at,
                },
                InstanceEvent::TaskFailed {
                    state: next_state,
                    task_key: next_key,
                    exit_code: next_code,
                    attempts: next_attempts,
                    at: next_at,
                },
            ) if state == next_state && task_key == next_key => {
                *exit_code = *next_code;
                *attempts = *next_attempts;
                *at = *next_at;
                true
            }
            (
                InstanceEvent::AlreadyActive { state, at },
                InstanceEvent::AlreadyActive {
                    state: next_state,
                    at: next_at,
                },
            ) if state == next_state => {
                *at = *next_at;
                true
            }
            _ => false,
        }
    }
}

/// Key of a task record, scoped by the state that owns it
pub fn record_key(state: &StateId, key: &TaskKey) -> String {
    format!("{}/{}", state, key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInstance {
    id: InstanceId,
    workflow: String,
    status: InstanceStatus,
    active: BTreeSet<StateId>,
    /// Activated states whose entry task has not run yet
    entry_pending: BTreeSet<StateId>,
    /// Fan-out progress: transitions already fired per active state
    fired: BTreeMap<StateId, BTreeSet<TransitionId>>,
    failures: BTreeMap<StateId, FailureDetail>,
    task_records: BTreeMap<String, TaskRecord>,
    variables: BTreeMap<String, String>,
    history: Vec<InstanceEvent>,
    /// Oldest events are dropped once the history holds this many
    #[serde(default = "default_history_limit")]
    history_limit: usize,
    /// Events dropped from the front of the history so far
    #[serde(default)]
    history_dropped: u64,
    halted_reason: Option<String>,
    created_at: DateTime<Utc>,
    last_ticked_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by every successful save
    version: u64,
}

impl ExecutionInstance {
    /// New run seeded with the definition's start state
    pub fn new(definition: &WorkflowDefinition) -> Result<Self, DefinitionError> {
        let start = definition.start_state()?.id().clone();
        Ok(Self::seeded(definition.name(), [start]))
    }

    /// New run seeded with explicit states, e.g. one per flowcell lane
    pub fn with_seeds(definition: &WorkflowDefinition, seeds: &[StateId]) -> EngineResult<Self> {
        for seed in seeds {
            if !definition.contains_state(seed) {
                return Err(EngineError::UnknownState {
                    workflow: definition.name().to_string(),
                    state: seed.clone(),
                });
            }
        }
        Ok(Self::seeded(definition.name(), seeds.iter().cloned()))
    }

    fn seeded(workflow: &str, seeds: impl IntoIterator<Item = StateId>) -> Self {
        let now = Utc::now();
        let mut instance = Self {
            id: InstanceId::new(),
            workflow: workflow.to_string(),
            status: InstanceStatus::Running,
            active: BTreeSet::new(),
            entry_pending: BTreeSet::new(),
            fired: BTreeMap::new(),
            failures: BTreeMap::new(),
            task_records: BTreeMap::new(),
            variables: BTreeMap::new(),
            history: Vec::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            history_dropped: 0,
            halted_reason: None,
            created_at: now,
            last_ticked_at: None,
            version: 0,
        };
        for seed in seeds {
            instance.activate(seed);
        }
        instance.refresh_status();
        instance
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_ticked_at(&self) -> Option<DateTime<Utc>> {
        self.last_ticked_at
    }

    pub(crate) fn mark_ticked(&mut self, at: DateTime<Utc>) {
        self.last_ticked_at = Some(at);
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    /// Most recent audit events, oldest first. Consecutive repeats of a
    /// failure or of a redundant activation are merged into one entry.
    pub fn history(&self) -> &[InstanceEvent] {
        &self.history
    }

    /// Number of events trimmed from the front of [`history`](Self::history)
    pub fn history_dropped(&self) -> u64 {
        self.history_dropped
    }

    /// Cap the audit history at `limit` events (at least one)
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self.trim_history();
        self
    }

    fn push_event(&mut self, event: InstanceEvent) {
        if let Some(last) = self.history.last_mut() {
            if last.absorb(&event) {
                return;
            }
        }
        self.history.push(event);
        self.trim_history();
    }

    fn trim_history(&mut self) {
        let excess = self.history.len().saturating_sub(self.history_limit.max(1));
        if excess > 0 {
            self.history.drain(..excess);
            self.history_dropped += excess as u64;
        }
    }

    pub fn halted_reason(&self) -> Option<&str> {
        self.halted_reason.as_deref()
    }

    /// Snapshot of the active states, ordered by name
    pub fn active_states(&self) -> Vec<StateId> {
        self.active.iter().cloned().collect()
    }

    pub fn is_active(&self, state: &StateId) -> bool {
        self.active.contains(state)
    }

    /// True exactly when no state is active
    pub fn is_complete(&self) -> bool {
        self.active.is_empty()
    }

    pub fn failure(&self, state: &StateId) -> Option<&FailureDetail> {
        self.failures.get(state)
    }

    pub fn failures(&self) -> impl Iterator<Item = &FailureDetail> {
        self.failures.values()
    }

    pub fn task_record(&self, key: &str) -> Option<&TaskRecord> {
        self.task_records.get(key)
    }

    /// Launcher handles of tasks still running, keyed by task record key
    pub fn running_jobs(&self) -> Vec<(String, String)> {
        self.task_records
            .iter()
            .filter_map(|(key, record)| record.handle.as_ref().map(|handle| (key.clone(), handle.clone())))
            .collect()
    }

    /// Activate `state`. Returns false (and logs) if it was already active.
    pub fn add_active_state(
        &mut self,
        definition: &WorkflowDefinition,
        state: &StateId,
    ) -> EngineResult<bool> {
        self.ensure_workflow(definition)?;
        if !definition.contains_state(state) {
            return Err(EngineError::UnknownState {
                workflow: definition.name().to_string(),
                state: state.clone(),
            });
        }
        let added = self.activate(state.clone());
        self.refresh_status();
        Ok(added)
    }

    fn activate(&mut self, state: StateId) -> bool {
        let now = Utc::now();
        if self.active.contains(&state) {
            info!(
                instance_id = %self.id,
                state = %state,
                "State already active; treating repeat activation as informational"
            );
            self.push_event(InstanceEvent::AlreadyActive { state, at: now });
            return false;
        }

        self.active.insert(state.clone());
        self.entry_pending.insert(state.clone());
        self.push_event(InstanceEvent::Activated { state, at: now });
        true
    }

    /// Remove `state` from the active set. Absent states are a no-op.
    pub fn inactivate_state(&mut self, state: &StateId) -> bool {
        if !self.active.remove(state) {
            return false;
        }

        self.entry_pending.remove(state);
        self.fired.remove(state);
        self.failures.remove(state);
        let prefix = format!("{}/", state);
        self.task_records.retain(|key, _| !key.starts_with(&prefix));
        self.push_event(InstanceEvent::Deactivated {
            state: state.clone(),
            at: Utc::now(),
        });
        self.refresh_status();
        true
    }

    /// Operator cancellation: clear every active state without exit tasks.
    /// Already-launched external jobs keep running.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Vec<StateId> {
        let reason = reason.into();
        let cleared: Vec<StateId> = self.active.iter().cloned().collect();

        self.active.clear();
        self.entry_pending.clear();
        self.fired.clear();
        self.failures.clear();
        self.task_records.clear();
        self.status = InstanceStatus::Cancelled;

        warn!(
            instance_id = %self.id,
            reason = %reason,
            cleared = ?cleared,
            "Instance cancelled by operator"
        );
        self.push_event(InstanceEvent::Cancelled {
            reason,
            cleared: cleared.clone(),
            at: Utc::now(),
        });
        cleared
    }

    /// Stop automatic ticking until an operator resumes the instance
    pub(crate) fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.status = InstanceStatus::Failed;
        self.halted_reason = Some(reason.clone());
        self.push_event(InstanceEvent::Halted {
            reason,
            at: Utc::now(),
        });
    }

    /// Operator resume after a halt: failure counters and retry delays are
    /// reset so every active state is evaluated on the next tick
    pub fn resume(&mut self) {
        self.halted_reason = None;
        self.failures.clear();
        self.status = InstanceStatus::Running;
        self.push_event(InstanceEvent::Resumed { at: Utc::now() });
        self.refresh_status();
        info!(instance_id = %self.id, "Instance resumed by operator");
    }

    fn refresh_status(&mut self) {
        match (self.status, self.active.is_empty()) {
            (InstanceStatus::Running, true) => self.status = InstanceStatus::Complete,
            (InstanceStatus::Complete, false) => self.status = InstanceStatus::Running,
            _ => {}
        }
    }

    fn ensure_workflow(&self, definition: &WorkflowDefinition) -> EngineResult<()> {
        if definition.name() != self.workflow {
            return Err(EngineError::WorkflowMismatch {
                instance_id: self.id,
                expected: definition.name().to_string(),
                actual: self.workflow.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn check_workflow(&self, definition: &WorkflowDefinition) -> EngineResult<()> {
        self.ensure_workflow(definition)
    }

    pub(crate) fn take_entry_pending(&mut self, state: &StateId) -> bool {
        self.entry_pending.remove(state)
    }

    pub(crate) fn pending_entries(&self) -> Vec<StateId> {
        self.entry_pending.iter().cloned().collect()
    }

    pub(crate) fn has_fired(&self, state: &StateId, transition: TransitionId) -> bool {
        self.fired.get(state).is_some_and(|fired| fired.contains(&transition))
    }

    pub(crate) fn mark_fired(&mut self, state: &StateId, transition: TransitionId) {
        self.fired.entry(state.clone()).or_default().insert(transition);
    }

    pub(crate) fn record_transition(&mut self, transition: TransitionId, name: &str, from: &StateId, to: &StateId) {
        self.push_event(InstanceEvent::TransitionFired {
            transition,
            name: name.to_string(),
            from: from.clone(),
            to: to.clone(),
            at: Utc::now(),
        });
    }

    pub(crate) fn record_routed(&mut self, from: &StateId, to: &StateId) {
        self.push_event(InstanceEvent::RoutedToFailureState {
            from: from.clone(),
            to: to.clone(),
            at: Utc::now(),
        });
    }

    /// Handle stored by the previous invocation of a still-running task
    pub(crate) fn task_handle(&self, key: &str) -> Option<&str> {
        self.task_records.get(key).and_then(|r| r.handle.as_deref())
    }

    pub(crate) fn record_task_result(&mut self, key: &str, task: &str, result: &TaskResult, at: DateTime<Utc>) {
        let record = self
            .task_records
            .entry(key.to_string())
            .or_insert_with(|| TaskRecord {
                task: task.to_string(),
                invocations: 0,
                handle: None,
                last_status: result.status,
                last_exit_code: result.exit_code,
                last_output: String::new(),
                updated_at: at,
            });
        record.invocations += 1;
        record.last_status = result.status;
        record.last_exit_code = result.exit_code;
        record.last_output = result.output.clone();
        record.updated_at = at;
        // A finished task starts from scratch on its next invocation
        record.handle = match result.status {
            TaskStatus::Running => result.handle.clone(),
            _ => None,
        };
    }

    pub(crate) fn clear_failure(&mut self, state: &StateId) {
        self.failures.remove(state);
    }

    /// Record a failed task on `state` and return the updated detail
    pub(crate) fn record_failure(
        &mut self,
        state: &StateId,
        task_key: &str,
        task: &str,
        result: &TaskResult,
        at: DateTime<Utc>,
    ) -> FailureDetail {
        let detail = self
            .failures
            .entry(state.clone())
            .and_modify(|d| {
                d.attempts += 1;
                d.last_failed_at = at;
                d.task_key = task_key.to_string();
                d.task = task.to_string();
                d.exit_code = result.exit_code;
                d.output = result.output.clone();
                d.retry_at = None;
            })
            .or_insert_with(|| FailureDetail {
                state: state.clone(),
                task_key: task_key.to_string(),
                task: task.to_string(),
                exit_code: result.exit_code,
                output: result.output.clone(),
                attempts: 1,
                first_failed_at: at,
                last_failed_at: at,
                retry_at: None,
            })
            .clone();

        self.push_event(InstanceEvent::TaskFailed {
            state: state.clone(),
            task_key: task_key.to_string(),
            exit_code: result.exit_code,
            attempts: detail.attempts,
            at,
        });
        detail
    }

    pub(crate) fn set_retry_at(&mut self, state: &StateId, retry_at: DateTime<Utc>) {
        if let Some(detail) = self.failures.get_mut(state) {
            detail.retry_at = Some(retry_at);
        }
    }

    /// Attempt number the next invocation for `state` will carry
    pub(crate) fn next_attempt(&self, state: &StateId) -> u32 {
        self.failures.get(state).map_or(1, |d| d.attempts + 1)
    }
}
