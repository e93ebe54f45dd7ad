// Operator actions on persisted instances
//
// Each action takes the same per-instance lock as a tick, so it never
// interleaves with one.

use tracing::{info, warn};

use super::store_error;
use crate::definition::{StateId, WorkflowDefinition};
use crate::error::{EngineError, EngineResult};
use crate::instance::{ExecutionInstance, InstanceId};
use crate::persistence::InstanceStore;
use crate::task::JobLauncher;

async fn update<T>(
    store: &dyn InstanceStore,
    instance_id: InstanceId,
    change: impl FnOnce(&mut ExecutionInstance) -> EngineResult<T>,
) -> EngineResult<T> {
    let _lease = store.lock(instance_id).await.map_err(store_error)?;
    let mut instance = store
        .load(instance_id)
        .await
        .map_err(store_error)?
        .ok_or(EngineError::InstanceNotFound { instance_id })?;

    let value = change(&mut instance)?;
    store.save(&mut instance).await.map_err(store_error)?;
    Ok(value)
}

/// Clear every active state without running exit tasks. Returns the cleared states.
pub async fn cancel_instance(
    store: &dyn InstanceStore,
    instance_id: InstanceId,
    reason: &str,
) -> EngineResult<Vec<StateId>> {
    update(store, instance_id, |instance| Ok(instance.cancel(reason))).await
}

/// Cancel the instance and ask the launcher to stop every job its tasks
/// still hold a handle for. Returns the cleared states and the handles that
/// were signalled. A job that cannot be signalled is logged and skipped.
pub async fn cancel_instance_with_jobs(
    store: &dyn InstanceStore,
    launcher: &dyn JobLauncher,
    instance_id: InstanceId,
    reason: &str,
) -> EngineResult<(Vec<StateId>, Vec<String>)> {
    let _lease = store.lock(instance_id).await.map_err(store_error)?;
    let mut instance = store
        .load(instance_id)
        .await
        .map_err(store_error)?
        .ok_or(EngineError::InstanceNotFound { instance_id })?;

    let mut signalled = Vec::new();
    for (key, handle) in instance.running_jobs() {
        match launcher.cancel(&handle).await {
            Ok(()) => {
                info!(instance_id = %instance_id, task = %key, handle = %handle, "Stopped job");
                signalled.push(handle);
            }
            Err(e) => warn!(instance_id = %instance_id, task = %key, handle = %handle, error = %e, "Failed to stop job"),
        }
    }

    let cleared = instance.cancel(reason);
    store.save(&mut instance).await.map_err(store_error)?;
    Ok((cleared, signalled))
}

/// Force a state out of the active set. Exit tasks are not run.
pub async fn deactivate_state(
    store: &dyn InstanceStore,
    instance_id: InstanceId,
    state: &StateId,
) -> EngineResult<bool> {
    let removed = update(store, instance_id, |instance| Ok(instance.inactivate_state(state))).await?;
    info!(instance_id = %instance_id, state = %state, removed, "Operator deactivated state");
    Ok(removed)
}

/// Add a state to the active set; its entry task runs on the next tick
pub async fn activate_state(
    store: &dyn InstanceStore,
    definition: &WorkflowDefinition,
    instance_id: InstanceId,
    state: &StateId,
) -> EngineResult<bool> {
    let added = update(store, instance_id, |instance| instance.add_active_state(definition, state)).await?;
    info!(instance_id = %instance_id, state = %state, added, "Operator activated state");
    Ok(added)
}

/// Clear a halt or cancellation so the scheduler picks the instance up again
pub async fn resume_instance(store: &dyn InstanceStore, instance_id: InstanceId) -> EngineResult<()> {
    update(store, instance_id, |instance| {
        instance.resume();
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{State, Transition};
    use crate::engine::Driver;
    use crate::instance::InstanceStatus;
    use crate::persistence::MemoryStore;
    use crate::task::mocks::ScriptedLauncher;
    use crate::task::{CommandTask, JobStatus, TaskEnvironment};
    use std::sync::Arc;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::builder("ops")
            .state(State::new("START").start())
            .state(State::new("RERUN"))
            .transition(Transition::new("again", "START", "RERUN"))
            .build()
            .unwrap()
    }

    async fn stored(store: &MemoryStore, definition: &WorkflowDefinition) -> InstanceId {
        let mut instance = ExecutionInstance::new(definition).unwrap();
        store.save(&mut instance).await.unwrap();
        instance.id()
    }

    #[tokio::test]
    async fn test_cancel_persists_cleared_instance() {
        let store = MemoryStore::new();
        let definition = definition();
        let id = stored(&store, &definition).await;

        let cleared = cancel_instance(&store, id, "run aborted").await.unwrap();
        assert_eq!(cleared, vec![StateId::from("START")]);

        let instance = store.load(id).await.unwrap().unwrap();
        assert_eq!(instance.status(), InstanceStatus::Cancelled);
        assert!(instance.is_complete());
    }

    #[tokio::test]
    async fn test_cancel_with_jobs_stops_running_jobs() {
        let store = MemoryStore::new();
        let launcher = Arc::new(ScriptedLauncher::new());
        let definition = WorkflowDefinition::builder("align")
            .state(State::new("DEMUX").start())
            .state(State::new("ALIGN"))
            .transition(
                Transition::new("DemuxToAlign", "DEMUX", "ALIGN")
                    .with_task(Arc::new(CommandTask::new("bcl2fastq", "bcl2fastq"))),
            )
            .build()
            .unwrap();
        let environment = TaskEnvironment::new(launcher.clone());
        let driver = Driver::new();
        let instance = driver
            .start_instance(&store, &definition, Default::default())
            .await
            .unwrap();
        driver.tick(&store, &definition, instance.id(), &environment).await.unwrap();
        assert_eq!(launcher.submitted().len(), 1);

        let (cleared, stopped) = cancel_instance_with_jobs(&store, launcher.as_ref(), instance.id(), "bad flowcell")
            .await
            .unwrap();
        assert_eq!(cleared, vec![StateId::from("DEMUX")]);
        assert_eq!(stopped, vec!["job-1".to_string()]);
        assert_eq!(launcher.cancelled(), vec!["job-1".to_string()]);
        assert!(matches!(launcher.poll("job-1").await.unwrap(), JobStatus::Exited { .. }));

        let stored = store.load(instance.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), InstanceStatus::Cancelled);
        assert!(stored.running_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_with_jobs_without_jobs_matches_cancel() {
        let store = MemoryStore::new();
        let launcher = ScriptedLauncher::new();
        let definition = definition();
        let id = stored(&store, &definition).await;

        let (cleared, stopped) = cancel_instance_with_jobs(&store, &launcher, id, "no longer needed")
            .await
            .unwrap();
        assert_eq!(cleared, vec![StateId::from("START")]);
        assert!(stopped.is_empty());
        assert!(launcher.cancelled().is_empty());
    }

    #[tokio::test]
    async fn test_activate_and_deactivate() {
        let store = MemoryStore::new();
        let definition = definition();
        let id = stored(&store, &definition).await;
        let rerun = StateId::from("RERUN");

        assert!(activate_state(&store, &definition, id, &rerun).await.unwrap());
        assert!(!activate_state(&store, &definition, id, &rerun).await.unwrap());
        assert!(deactivate_state(&store, id, &rerun).await.unwrap());
        assert!(!deactivate_state(&store, id, &rerun).await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_after_cancel_with_new_state() {
        let store = MemoryStore::new();
        let definition = definition();
        let id = stored(&store, &definition).await;
        cancel_instance(&store, id, "wrong sample sheet").await.unwrap();

        activate_state(&store, &definition, id, &StateId::from("START")).await.unwrap();
        resume_instance(&store, id).await.unwrap();

        let instance = store.load(id).await.unwrap().unwrap();
        assert_eq!(instance.status(), InstanceStatus::Running);
        assert_eq!(instance.active_states(), vec![StateId::from("START")]);
    }

    #[tokio::test]
    async fn test_operator_action_respects_lock() {
        let store = MemoryStore::new();
        let definition = definition();
        let id = stored(&store, &definition).await;

        let _lease = store.lock(id).await.unwrap();
        let err = cancel_instance(&store, id, "too late").await.unwrap_err();
        assert!(matches!(err, EngineError::Contention { .. }));
    }
}
