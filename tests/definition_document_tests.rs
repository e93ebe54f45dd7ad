//! Workflows loaded from documents and run through the scheduler

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use seqflow::config::SchedulerConfig;
use seqflow::task::{LocalProcessLauncher, TaskRegistry};
use seqflow::{
    DefinitionDocument, DefinitionError, Driver, FileStore, InstanceStore, StateId, TaskEnvironment,
    TickScheduler,
};

fn write(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_document_with_two_start_states_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = write(
        temp_dir.path(),
        "broken.toml",
        r#"
name = "broken"

[[states]]
name = "A"
start = true

[[states]]
name = "B"
start = true
"#,
    );

    let err = DefinitionDocument::load(&path, &TaskRegistry::new()).unwrap_err();
    assert!(matches!(err, DefinitionError::AmbiguousStartState { count: 2, .. }));
}

#[test]
fn test_missing_file_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let err = DefinitionDocument::load(&temp_dir.path().join("nope.toml"), &TaskRegistry::new()).unwrap_err();
    assert!(matches!(err, DefinitionError::InvalidDocument { .. }));
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_workflow_runs_to_terminal_state() {
    let temp_dir = TempDir::new().unwrap();
    let run_dir = temp_dir.path().join("run");
    std::fs::create_dir_all(&run_dir).unwrap();

    let path = write(
        temp_dir.path(),
        "pipeline.toml",
        r#"
name = "pipeline"

[[states]]
name = "DEMUX"
start = true

[[states]]
name = "ALIGNED"

[[transitions]]
name = "DemuxToAlign"
from = "DEMUX"
to = "ALIGNED"
task = "touch-bam"

[tasks.touch-bam]
kind = "command"
program = "sh"
args = ["-c", "echo aligning && touch {run_dir}/sample.bam"]
"#,
    );

    let definition = Arc::new(DefinitionDocument::load(&path, &TaskRegistry::new()).unwrap());
    let store = Arc::new(FileStore::new(temp_dir.path().join("instances")));
    let environment = Arc::new(
        TaskEnvironment::new(Arc::new(LocalProcessLauncher::new(temp_dir.path().join("jobs"))))
            .with_variable("run_dir", run_dir.display().to_string()),
    );
    let driver = Arc::new(Driver::new());
    let instance = driver
        .start_instance(&*store, &definition, Default::default())
        .await
        .unwrap();

    let scheduler = TickScheduler::new(driver, store.clone(), environment)
        .with_config(SchedulerConfig {
            tick_interval_seconds: 1,
            max_concurrent_ticks: 4,
        })
        .with_definition(definition);

    // First sweep submits the job, later sweeps poll it
    let mut reached = false;
    for _ in 0..50 {
        scheduler.sweep().await.unwrap();
        let stored = store.load(instance.id()).await.unwrap().unwrap();
        if stored.is_active(&StateId::from("ALIGNED")) {
            reached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(reached, "job never completed");
    assert!(run_dir.join("sample.bam").exists());
}
