// In-process store, used by tests and single-process deployments

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{check_version, InstanceLease, InstanceStore, PersistenceError};
use crate::instance::{ExecutionInstance, InstanceId};

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    instances: Arc<Mutex<HashMap<InstanceId, ExecutionInstance>>>,
    locks: Arc<Mutex<HashSet<InstanceId>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Removes the lock entry when the lease is dropped
struct MemoryLockGuard {
    instance_id: InstanceId,
    locks: Arc<Mutex<HashSet<InstanceId>>>,
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.remove(&self.instance_id);
        debug!(instance_id = %self.instance_id, "Released in-memory instance lock");
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn load(&self, instance_id: InstanceId) -> Result<Option<ExecutionInstance>, PersistenceError> {
        let instances = self.instances.lock().unwrap_or_else(|p| p.into_inner());
        Ok(instances.get(&instance_id).cloned())
    }

    async fn save(&self, instance: &mut ExecutionInstance) -> Result<(), PersistenceError> {
        let mut instances = self.instances.lock().unwrap_or_else(|p| p.into_inner());
        check_version(instance, instances.get(&instance.id()).map(|s| s.version()))?;

        instance.set_version(instance.version() + 1);
        instances.insert(instance.id(), instance.clone());
        Ok(())
    }

    async fn lock(&self, instance_id: InstanceId) -> Result<InstanceLease, PersistenceError> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if !locks.insert(instance_id) {
            return Err(PersistenceError::Locked { instance_id });
        }

        Ok(InstanceLease::new(
            instance_id,
            MemoryLockGuard {
                instance_id,
                locks: self.locks.clone(),
            },
        ))
    }

    async fn list(&self) -> Result<Vec<InstanceId>, PersistenceError> {
        let instances = self.instances.lock().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<InstanceId> = instances.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{State, WorkflowDefinition};

    fn instance() -> ExecutionInstance {
        let definition = WorkflowDefinition::builder("mem")
            .state(State::new("A").start())
            .build()
            .unwrap();
        ExecutionInstance::new(&definition).unwrap()
    }

    #[tokio::test]
    async fn test_second_lock_fails_fast_until_released() {
        let store = MemoryStore::new();
        let id = InstanceId::new();

        let lease = store.lock(id).await.unwrap();
        assert!(matches!(store.lock(id).await, Err(PersistenceError::Locked { .. })));

        drop(lease);
        assert!(store.lock(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_save_is_rejected() {
        let store = MemoryStore::new();
        let mut first = instance();
        store.save(&mut first).await.unwrap();
        assert_eq!(first.version(), 1);

        let mut stale = first.clone();
        store.save(&mut first).await.unwrap();

        let err = store.save(&mut stale).await.unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::VersionConflict { expected: 1, found: 2, .. }
        ));
    }
}
