// Driver - one tick advances every active state of one instance at most once

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use super::guard::{AllowAll, TransitionGuard};
use super::retry::{RetryDecision, RetryForever, RetryPolicy};
use super::store_error;
use crate::definition::{StateId, TaskRef, Transition, TransitionId, WorkflowDefinition};
use crate::error::{EngineError, EngineResult};
use crate::instance::{record_key, ExecutionInstance, InstanceId, InstanceStatus, DEFAULT_HISTORY_LIMIT};
use crate::observability::engine_metrics;
use crate::persistence::InstanceStore;
use crate::task::{self, TaskContext, TaskEnvironment, TaskKey, TaskResult, TaskStatus};
use crate::telemetry::{create_tick_span, generate_correlation_id};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTransition {
    pub id: TransitionId,
    pub name: String,
    pub from: StateId,
    pub to: StateId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TickOutcome {
    /// The instance was not running; nothing was evaluated or saved
    #[default]
    Skipped,
    /// Active states were evaluated
    Advanced,
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TickReport {
    pub outcome: TickOutcome,
    pub fired: Vec<FiredTransition>,
    /// States whose activation was processed (entry task run if any)
    pub entered: Vec<StateId>,
    pub exited: Vec<StateId>,
    /// States waiting on a task that reported Running
    pub running: Vec<StateId>,
    /// States with a task that failed this tick
    pub failed: Vec<StateId>,
    /// States skipped because their retry time has not come
    pub deferred: Vec<StateId>,
    /// (from, to) pairs moved by the retry policy
    pub routed: Vec<(StateId, StateId)>,
}

impl TickReport {
    fn skipped() -> Self {
        Self::default()
    }

    pub fn made_progress(&self) -> bool {
        !self.fired.is_empty() || !self.entered.is_empty() || !self.routed.is_empty()
    }
}

/// Advances execution instances.
///
/// The driver holds no per-instance state; everything a tick needs is loaded
/// from the store and written back before the lock is released.
#[derive(Clone)]
pub struct Driver {
    retry: Arc<dyn RetryPolicy>,
    guard: Arc<dyn TransitionGuard>,
    history_limit: usize,
}

impl Default for Driver {
    fn default() -> Self {
        Self {
            retry: Arc::new(RetryForever),
            guard: Arc::new(AllowAll),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl Driver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_policy(mut self, retry: Arc<dyn RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_guard(mut self, guard: Arc<dyn TransitionGuard>) -> Self {
        self.guard = guard;
        self
    }

    /// Audit events kept by instances this driver starts
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Create and persist a run seeded with the start state.
    /// Entry tasks run on the first tick.
    pub async fn start_instance(
        &self,
        store: &dyn InstanceStore,
        definition: &WorkflowDefinition,
        variables: BTreeMap<String, String>,
    ) -> EngineResult<ExecutionInstance> {
        let instance = ExecutionInstance::new(definition)?;
        self.persist_new(store, instance, variables).await
    }

    /// Create and persist a run seeded with explicit states
    pub async fn start_seeded(
        &self,
        store: &dyn InstanceStore,
        definition: &WorkflowDefinition,
        seeds: &[StateId],
        variables: BTreeMap<String, String>,
    ) -> EngineResult<ExecutionInstance> {
        let instance = ExecutionInstance::with_seeds(definition, seeds)?;
        self.persist_new(store, instance, variables).await
    }

    async fn persist_new(
        &self,
        store: &dyn InstanceStore,
        instance: ExecutionInstance,
        variables: BTreeMap<String, String>,
    ) -> EngineResult<ExecutionInstance> {
        let mut instance = variables
            .into_iter()
            .fold(instance, |instance, (key, value)| instance.with_variable(key, value))
            .with_history_limit(self.history_limit);
        store.save(&mut instance).await.map_err(store_error)?;
        info!(
            instance_id = %instance.id(),
            workflow = instance.workflow(),
            active = ?instance.active_states(),
            "Instance started"
        );
        Ok(instance)
    }

    /// Lock, load, advance and save one instance.
    ///
    /// Fails fast with [`EngineError::Contention`] if another tick holds the
    /// instance, and with [`EngineError::TerminalFailure`] once it has halted
    /// (the halted state is saved first).
    pub async fn tick(
        &self,
        store: &dyn InstanceStore,
        definition: &WorkflowDefinition,
        instance_id: InstanceId,
        environment: &TaskEnvironment,
    ) -> EngineResult<TickReport> {
        let correlation_id = generate_correlation_id();
        let span = create_tick_span(definition.name(), instance_id, &correlation_id);

        async move {
            let _lease = store.lock(instance_id).await.map_err(store_error)?;
            let mut instance = store
                .load(instance_id)
                .await
                .map_err(store_error)?
                .ok_or(EngineError::InstanceNotFound { instance_id })?;

            let previous_tick = instance.last_ticked_at();
            let outcome = self.advance(definition, &mut instance, environment).await;

            // Skipped instances and early rejections leave nothing to write
            if instance.last_ticked_at() != previous_tick {
                store.save(&mut instance).await.map_err(store_error)?;
            }
            outcome
        }
        .instrument(span)
        .await
    }

    /// Advance an in-memory instance using the current time
    pub async fn advance(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut ExecutionInstance,
        environment: &TaskEnvironment,
    ) -> EngineResult<TickReport> {
        self.advance_at(definition, instance, environment, Utc::now()).await
    }

    /// Advance an in-memory instance as of `now`. No persistence, no locking.
    pub async fn advance_at(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut ExecutionInstance,
        environment: &TaskEnvironment,
        now: DateTime<Utc>,
    ) -> EngineResult<TickReport> {
        instance.check_workflow(definition)?;
        match instance.status() {
            InstanceStatus::Complete | InstanceStatus::Cancelled => {
                debug!(instance_id = %instance.id(), status = %instance.status(), "Nothing to tick");
                return Ok(TickReport::skipped());
            }
            InstanceStatus::Failed => {
                return Err(terminal_failure(instance));
            }
            InstanceStatus::Running => {}
        }

        // Reject stale instances before anything runs
        for state in instance.active_states() {
            if !definition.contains_state(&state) {
                return Err(EngineError::UnknownState {
                    workflow: definition.name().to_string(),
                    state,
                });
            }
        }

        engine_metrics().record_tick();
        instance.mark_ticked(now);

        let run = TickRun {
            definition,
            environment,
            retry: self.retry.as_ref(),
            guard: self.guard.as_ref(),
            now,
            report: TickReport {
                outcome: TickOutcome::Advanced,
                ..TickReport::default()
            },
        };
        let report = run.run(instance).await?;

        if instance.status() == InstanceStatus::Failed {
            return Err(terminal_failure(instance));
        }

        debug!(
            instance_id = %instance.id(),
            fired = report.fired.len(),
            running = report.running.len(),
            failed = report.failed.len(),
            "Tick finished"
        );
        Ok(report)
    }
}

fn terminal_failure(instance: &ExecutionInstance) -> EngineError {
    EngineError::TerminalFailure {
        instance_id: instance.id(),
        reason: instance.halted_reason().unwrap_or("instance halted").to_string(),
    }
}

/// Working set of a single tick
struct TickRun<'a> {
    definition: &'a WorkflowDefinition,
    environment: &'a TaskEnvironment,
    retry: &'a dyn RetryPolicy,
    guard: &'a dyn TransitionGuard,
    now: DateTime<Utc>,
    report: TickReport,
}

impl TickRun<'_> {
    async fn run(mut self, instance: &mut ExecutionInstance) -> EngineResult<TickReport> {
        // Seeds and operator-added states have not had their entry task yet
        for state in instance.pending_entries() {
            if halted(instance) {
                return Ok(self.report);
            }
            self.enter(instance, &state).await;
        }

        // States activated below are not in the snapshot and wait for the next tick
        for state in instance.active_states() {
            if halted(instance) {
                break;
            }
            if !instance.is_active(&state) {
                continue;
            }
            if let Some(retry_at) = instance.failure(&state).and_then(|f| f.retry_at) {
                if retry_at > self.now {
                    debug!(state = %state, retry_at = %retry_at, "State deferred by retry policy");
                    self.report.deferred.push(state);
                    continue;
                }
            }
            self.advance_state(instance, &state).await?;
        }

        Ok(self.report)
    }

    async fn advance_state(&mut self, instance: &mut ExecutionInstance, state: &StateId) -> EngineResult<()> {
        let definition = self.definition;
        let fan_out = definition.state(state).is_some_and(|s| s.is_fan_out());
        let transitions = definition.transitions_from(state);
        if transitions.is_empty() {
            // Terminal states stay active until removed externally
            return Ok(());
        }

        for transition in transitions.iter().copied() {
            if fan_out && instance.has_fired(state, transition.id()) {
                continue;
            }
            if !self.guard.permits(instance, transition) {
                debug!(state = %state, transition = %transition.id(), "Transition held back by guard");
                continue;
            }

            let key = TaskKey::Transition(transition.id());
            let result = match transition.task() {
                Some(task) => self.run_task(instance, state, key.clone(), task).await,
                None => TaskResult::success("automatic transition"),
            };

            match result.status {
                TaskStatus::Success => {
                    self.fire(instance, state, transition);
                    if fan_out {
                        instance.mark_fired(state, transition.id());
                        self.activate(instance, transition.to_state()).await?;
                        if halted(instance) {
                            return Ok(());
                        }
                        continue;
                    }
                    self.exit(instance, state).await;
                    self.activate(instance, transition.to_state()).await?;
                    return Ok(());
                }
                TaskStatus::Running => {
                    debug!(state = %state, transition = %transition.id(), "Task still running");
                    if !self.report.running.contains(state) {
                        self.report.running.push(state.clone());
                    }
                    if fan_out {
                        continue;
                    }
                    return Ok(());
                }
                TaskStatus::Failed => {
                    let task_name = transition.task().map_or(transition.name(), |t| t.name());
                    self.fail(instance, state, &key, task_name, &result).await?;
                    if fan_out && instance.is_active(state) && !halted(instance) {
                        continue;
                    }
                    return Ok(());
                }
                TaskStatus::Fatal => {
                    let task_name = transition.task().map_or(transition.name(), |t| t.name());
                    instance.record_failure(state, &record_key(state, &key), task_name, &result, self.now);
                    engine_metrics().record_task_failure();
                    self.report.failed.push(state.clone());
                    self.halt(
                        instance,
                        format!("fatal result from {} on {}: {}", task_name, state, result.output),
                    );
                    return Ok(());
                }
            }
        }

        if fan_out && transitions.iter().all(|t| instance.has_fired(state, t.id())) {
            debug!(state = %state, "Every fan-out transition fired");
            self.exit(instance, state).await;
        }
        Ok(())
    }

    fn fire(&mut self, instance: &mut ExecutionInstance, from: &StateId, transition: &Transition) {
        instance.clear_failure(from);
        instance.record_transition(transition.id(), transition.name(), from, transition.to_state());
        engine_metrics().record_transition();
        info!(
            instance_id = %instance.id(),
            transition = %transition.id(),
            name = transition.name(),
            from = %from,
            to = %transition.to_state(),
            "Transition fired"
        );
        self.report.fired.push(FiredTransition {
            id: transition.id(),
            name: transition.name().to_string(),
            from: from.clone(),
            to: transition.to_state().clone(),
        });
    }

    /// Activate `state`; an already-active target merges into the existing token
    async fn activate(&mut self, instance: &mut ExecutionInstance, state: &StateId) -> EngineResult<()> {
        let added = instance.add_active_state(self.definition, state)?;
        if added && !halted(instance) {
            self.enter(instance, state).await;
        }
        Ok(())
    }

    async fn enter(&mut self, instance: &mut ExecutionInstance, state: &StateId) {
        if !instance.take_entry_pending(state) {
            return;
        }
        self.report.entered.push(state.clone());

        let definition = self.definition;
        let Some(task) = definition.state(state).and_then(|s| s.on_enter()) else {
            return;
        };
        let key = TaskKey::Enter(state.clone());
        let result = self.run_task(instance, state, key.clone(), task).await;
        self.settle_hook(instance, state, &key, task, result);
    }

    /// Run the exit task (if any) and deactivate `state`
    async fn exit(&mut self, instance: &mut ExecutionInstance, state: &StateId) {
        let definition = self.definition;
        if let Some(task) = definition.state(state).and_then(|s| s.on_exit()) {
            let key = TaskKey::Exit(state.clone());
            let result = self.run_task(instance, state, key.clone(), task).await;
            self.settle_hook(instance, state, &key, task, result);
        }
        instance.inactivate_state(state);
        self.report.exited.push(state.clone());
    }

    /// Entry and exit tasks run exactly once; their failures are recorded, not retried
    fn settle_hook(
        &mut self,
        instance: &mut ExecutionInstance,
        state: &StateId,
        key: &TaskKey,
        task: &TaskRef,
        result: TaskResult,
    ) {
        match result.status {
            TaskStatus::Success => {}
            TaskStatus::Running => {
                warn!(state = %state, task = task.name(), key = %key, "Entry/exit task reported Running; it is not polled again");
            }
            TaskStatus::Failed => {
                warn!(
                    state = %state,
                    task = task.name(),
                    key = %key,
                    exit_code = result.exit_code,
                    "Entry/exit task failed"
                );
                instance.record_failure(state, &record_key(state, key), task.name(), &result, self.now);
                engine_metrics().record_task_failure();
                self.report.failed.push(state.clone());
            }
            TaskStatus::Fatal => {
                instance.record_failure(state, &record_key(state, key), task.name(), &result, self.now);
                engine_metrics().record_task_failure();
                self.report.failed.push(state.clone());
                self.halt(
                    instance,
                    format!("fatal result from {} ({}) on {}: {}", task.name(), key, state, result.output),
                );
            }
        }
    }

    async fn fail(
        &mut self,
        instance: &mut ExecutionInstance,
        state: &StateId,
        key: &TaskKey,
        task_name: &str,
        result: &TaskResult,
    ) -> EngineResult<()> {
        let detail = instance.record_failure(state, &record_key(state, key), task_name, result, self.now);
        engine_metrics().record_task_failure();
        self.report.failed.push(state.clone());
        warn!(
            instance_id = %instance.id(),
            state = %state,
            task = task_name,
            exit_code = result.exit_code,
            attempts = detail.attempts,
            "Task failed"
        );

        match self.retry.decide(&detail, self.now) {
            RetryDecision::Retry => {}
            RetryDecision::RetryAt(retry_at) => instance.set_retry_at(state, retry_at),
            RetryDecision::RouteTo(target) => {
                if !self.definition.contains_state(&target) {
                    self.halt(
                        instance,
                        format!("retry policy routed {} to undeclared state {}", state, target),
                    );
                    return Ok(());
                }
                warn!(from = %state, to = %target, "Routing failed state to failure state");
                instance.record_routed(state, &target);
                // The state did not complete, so its exit task is skipped
                instance.inactivate_state(state);
                self.report.routed.push((state.clone(), target.clone()));
                self.activate(instance, &target).await?;
            }
            RetryDecision::GiveUp { reason } => self.halt(instance, reason),
        }
        Ok(())
    }

    fn halt(&mut self, instance: &mut ExecutionInstance, reason: String) {
        error!(instance_id = %instance.id(), reason = %reason, "Instance halted");
        engine_metrics().record_halt();
        instance.halt(reason);
    }

    async fn run_task(
        &mut self,
        instance: &mut ExecutionInstance,
        state: &StateId,
        key: TaskKey,
        task: &TaskRef,
    ) -> TaskResult {
        let record = record_key(state, &key);
        let handle = instance.task_handle(&record).map(str::to_owned);
        let attempt = instance.next_attempt(state);
        let instance_id = instance.id();
        let workflow = instance.workflow().to_string();
        let variables = instance.variables().clone();

        let context = TaskContext {
            environment: self.environment,
            instance_id: &instance_id,
            workflow: &workflow,
            instance_variables: &variables,
            key,
            attempt,
            handle: handle.as_deref(),
        };

        engine_metrics().record_task_invocation();
        let result = task::invoke(task.as_ref(), &context).await;
        instance.record_task_result(&record, task.name(), &result, self.now);
        result
    }
}

fn halted(instance: &ExecutionInstance) -> bool {
    instance.status() == InstanceStatus::Failed
}
