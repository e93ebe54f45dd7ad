// JSON-file store: one document per instance plus an advisory lock file

use async_trait::async_trait;
use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use super::{check_version, InstanceLease, InstanceStore, PersistenceError};
use crate::instance::{ExecutionInstance, InstanceId};

const INSTANCE_SUFFIX: &str = ".instance.json";

/// File system implementation of the instance store.
///
/// Writes go to a temporary file that is renamed over the previous copy, so a
/// crash mid-save leaves the last good state in place.
#[derive(Debug, Clone)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn instance_path(&self, instance_id: InstanceId) -> PathBuf {
        self.directory.join(format!("{}{}", instance_id, INSTANCE_SUFFIX))
    }

    fn lock_path(&self, instance_id: InstanceId) -> PathBuf {
        self.directory.join(format!("{}.lock", instance_id))
    }

    async fn read_instance(&self, path: &Path) -> Result<Option<ExecutionInstance>, PersistenceError> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let instance: ExecutionInstance = serde_json::from_str(&contents)?;
        Ok(Some(instance))
    }
}

/// Holds the locked lock file open; closing it releases the OS lock
struct FileLockGuard {
    _lock: RwLock<File>,
    path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        debug!(file = ?self.path, "Released instance lock file");
    }
}

#[async_trait]
impl InstanceStore for FileStore {
    async fn load(&self, instance_id: InstanceId) -> Result<Option<ExecutionInstance>, PersistenceError> {
        let path = self.instance_path(instance_id);
        let instance = self.read_instance(&path).await?;

        if let Some(instance) = &instance {
            if instance.id() != instance_id {
                return Err(PersistenceError::StateCorruption {
                    reason: format!("{} contains instance {}", path.display(), instance.id()),
                });
            }
            debug!(instance_id = %instance_id, version = instance.version(), "Instance loaded");
        }
        Ok(instance)
    }

    async fn save(&self, instance: &mut ExecutionInstance) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.directory).await?;

        let path = self.instance_path(instance.id());
        let stored = self.read_instance(&path).await?;
        check_version(instance, stored.map(|s| s.version()))?;

        let mut to_save = instance.clone();
        to_save.set_version(instance.version() + 1);
        let serialized = serde_json::to_string_pretty(&to_save)?;

        // Write to temporary file first, then rename (atomic operation)
        let temp_file = path.with_extension("json.tmp");
        fs::write(&temp_file, serialized).await?;
        fs::rename(&temp_file, &path).await?;

        instance.set_version(to_save.version());
        info!(
            instance_id = %instance.id(),
            version = instance.version(),
            file = ?path,
            "Instance saved"
        );
        Ok(())
    }

    async fn lock(&self, instance_id: InstanceId) -> Result<InstanceLease, PersistenceError> {
        fs::create_dir_all(&self.directory).await?;

        let path = self.lock_path(instance_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut lock = RwLock::new(file);

        match lock.try_write() {
            Ok(mut guard) => {
                let holder = format!(
                    "pid={} host={}\n",
                    std::process::id(),
                    hostname::get().unwrap_or_default().to_string_lossy()
                );
                if let Err(e) = guard.set_len(0).and_then(|_| guard.write_all(holder.as_bytes())) {
                    warn!(file = ?path, error = %e, "Could not record lock holder");
                }
                // Keep the OS lock for as long as the file stays open
                std::mem::forget(guard);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(PersistenceError::Locked { instance_id });
            }
            Err(e) => return Err(e.into()),
        }

        debug!(instance_id = %instance_id, file = ?path, "Acquired instance lock file");
        Ok(InstanceLease::new(instance_id, FileLockGuard { _lock: lock, path }))
    }

    async fn list(&self) -> Result<Vec<InstanceId>, PersistenceError> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(INSTANCE_SUFFIX) {
                match stem.parse::<InstanceId>() {
                    Ok(id) => ids.push(id),
                    Err(_) => warn!(file = %name, "Ignoring unrecognised instance file"),
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{State, StateId, Transition, WorkflowDefinition};
    use tempfile::TempDir;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::builder("file-store")
            .state(State::new("START").start())
            .state(State::new("DONE"))
            .transition(Transition::new("finish", "START", "DONE"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let definition = definition();
        let mut instance = ExecutionInstance::new(&definition)
            .unwrap()
            .with_variable("run_dir", "/seq/run");
        instance.add_active_state(&definition, &StateId::from("DONE")).unwrap();

        store.save(&mut instance).await.unwrap();
        assert_eq!(instance.version(), 1);

        let loaded = store.load(instance.id()).await.unwrap().unwrap();
        assert_eq!(loaded, instance);
        assert_eq!(store.list().await.unwrap(), vec![instance.id()]);
    }

    #[tokio::test]
    async fn test_load_missing_instance_returns_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().join("not-created-yet"));
        assert!(store.load(InstanceId::new()).await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_writer_gets_version_conflict() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let mut instance = ExecutionInstance::new(&definition()).unwrap();
        store.save(&mut instance).await.unwrap();

        let mut stale = instance.clone();
        store.save(&mut instance).await.unwrap();
        assert!(matches!(
            store.save(&mut stale).await,
            Err(PersistenceError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_lock_file_is_exclusive() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let id = InstanceId::new();

        let lease = store.lock(id).await.unwrap();
        assert!(matches!(store.lock(id).await, Err(PersistenceError::Locked { .. })));

        drop(lease);
        let relocked = store.lock(id).await;
        assert!(relocked.is_ok());
    }
}
