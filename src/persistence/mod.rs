// Persistence adapter boundary
//
// The engine only needs load/save/lock; storage layout stays behind the trait.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use thiserror::Error;

use crate::instance::{ExecutionInstance, InstanceId};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Errors that can occur during persistence operations
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Instance {instance_id} is locked by another holder")]
    Locked { instance_id: InstanceId },

    #[error("Version conflict for {instance_id}: expected {expected}, found {found}")]
    VersionConflict {
        instance_id: InstanceId,
        expected: u64,
        found: u64,
    },

    #[error("State corruption detected: {reason}")]
    StateCorruption { reason: String },
}

/// Exclusive right to tick one instance. Released on drop.
pub struct InstanceLease {
    instance_id: InstanceId,
    _guard: Box<dyn Any + Send>,
}

impl InstanceLease {
    pub fn new(instance_id: InstanceId, guard: impl Any + Send) -> Self {
        Self {
            instance_id,
            _guard: Box::new(guard),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }
}

impl fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceLease")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

/// Loads, saves and locks execution instances
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn load(&self, instance_id: InstanceId) -> Result<Option<ExecutionInstance>, PersistenceError>;

    /// Persist `instance` if the stored copy still carries `instance.version()`,
    /// then bump the version on both.
    async fn save(&self, instance: &mut ExecutionInstance) -> Result<(), PersistenceError>;

    /// Acquire the per-instance lock without waiting
    async fn lock(&self, instance_id: InstanceId) -> Result<InstanceLease, PersistenceError>;

    /// Ids of every stored instance
    async fn list(&self) -> Result<Vec<InstanceId>, PersistenceError>;
}

/// Shared optimistic check used by the bundled stores
pub(crate) fn check_version(
    instance: &ExecutionInstance,
    stored: Option<u64>,
) -> Result<(), PersistenceError> {
    let found = stored.unwrap_or(0);
    if found != instance.version() {
        return Err(PersistenceError::VersionConflict {
            instance_id: instance.id(),
            expected: instance.version(),
            found,
        });
    }
    Ok(())
}
