//! External job launching
//!
//! Long-running pipeline programs are started through a [`JobLauncher`] and
//! observed by polling, so a tick never waits on a child process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on captured output returned with a finished job
const MAX_CAPTURED_OUTPUT: usize = 16 * 1024;

const EXIT_FILE_ENV: &str = "SEQFLOW_EXIT_FILE";

/// Runs the job's argv, then publishes its exit status with an atomic rename
const STATUS_WRAPPER: &str = r#""$@"; status=$?; printf '%s\n' "$status" > "$SEQFLOW_EXIT_FILE.tmp" && mv "$SEQFLOW_EXIT_FILE.tmp" "$SEQFLOW_EXIT_FILE"; exit "$status""#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Exited { code: i32, output: String },
    /// The launcher has no record of the handle
    Unknown,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to launch {label}: {message}")]
    SpawnFailed { label: String, message: String },

    #[error("Job record for {handle} is unreadable: {message}")]
    InvalidRecord { handle: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No job launcher is configured")]
    Unavailable,
}

/// Starts and polls external jobs
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Start a job and return its handle without waiting for it
    async fn submit(&self, spec: &JobSpec) -> Result<String, LaunchError>;

    async fn poll(&self, handle: &str) -> Result<JobStatus, LaunchError>;

    /// Ask a running job to stop. Unknown or finished handles are ignored.
    async fn cancel(&self, handle: &str) -> Result<(), LaunchError>;
}

/// Launcher used when the application wires none; every submission fails
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledLauncher;

#[async_trait]
impl JobLauncher for DisabledLauncher {
    async fn submit(&self, _spec: &JobSpec) -> Result<String, LaunchError> {
        Err(LaunchError::Unavailable)
    }

    async fn poll(&self, _handle: &str) -> Result<JobStatus, LaunchError> {
        Ok(JobStatus::Unknown)
    }

    async fn cancel(&self, _handle: &str) -> Result<(), LaunchError> {
        Ok(())
    }
}

/// What is written next to a job's log so any later process can find it
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    label: String,
    program: String,
    args: Vec<String>,
    /// Leader of the job's process group
    pid: u32,
    submitted_at: DateTime<Utc>,
}

/// Runs jobs as local processes with output captured to log files.
///
/// Every job leaves three files in the log directory: `{handle}.job` (pid and
/// command), `{handle}.log` (stdout and stderr) and, once it finishes,
/// `{handle}.exit`. A launcher created after a restart polls and cancels jobs
/// from those files alone.
pub struct LocalProcessLauncher {
    log_dir: PathBuf,
    /// Children spawned by this process, kept so they can be reaped
    children: Mutex<HashMap<String, Child>>,
}

impl LocalProcessLauncher {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn job_file(&self, handle: &str, extension: &str) -> PathBuf {
        self.log_dir.join(format!("{}.{}", handle, extension))
    }

    fn lock_children(&self) -> std::sync::MutexGuard<'_, HashMap<String, Child>> {
        self.children.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn write_record(&self, handle: &str, record: &JobRecord) -> Result<(), LaunchError> {
        let json = serde_json::to_vec_pretty(record).map_err(|e| LaunchError::InvalidRecord {
            handle: handle.to_string(),
            message: e.to_string(),
        })?;
        let path = self.job_file(handle, "job");
        let temp = self.job_file(handle, "job.tmp");
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }

    async fn read_record(&self, handle: &str) -> Result<Option<JobRecord>, LaunchError> {
        let bytes = match tokio::fs::read(self.job_file(handle, "job")).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| LaunchError::InvalidRecord {
                handle: handle.to_string(),
                message: e.to_string(),
            })
    }

    /// Exit status published by the wrapper, if the job got that far
    async fn recorded_exit(&self, handle: &str) -> Result<Option<i32>, LaunchError> {
        match tokio::fs::read_to_string(self.job_file(handle, "exit")).await {
            Ok(text) => Ok(Some(text.trim().parse().unwrap_or(-1))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exited(&self, handle: &str, code: i32) -> JobStatus {
        let output = read_output(&self.job_file(handle, "log")).await;
        debug!(handle = %handle, code, "Local job exited");
        JobStatus::Exited { code, output }
    }

    /// Reap a child of this process. `Some(None)` means it is still running.
    fn reap(&self, handle: &str) -> Result<Option<Option<i32>>, LaunchError> {
        let mut children = self.lock_children();
        let Some(child) = children.get_mut(handle) else {
            return Ok(None);
        };
        match child.try_wait()? {
            None => Ok(Some(None)),
            Some(status) => {
                children.remove(handle);
                // Killed by a signal: report a non-zero code
                Ok(Some(Some(status.code().unwrap_or(-1))))
            }
        }
    }

    #[cfg(unix)]
    async fn signal_job(&self, _handle: &str, pid: u32) -> Result<(), LaunchError> {
        if pid == 0 {
            return Ok(());
        }
        // Negative pid addresses the job's whole process group
        let status = Command::new("kill")
            .arg("-TERM")
            .arg("--")
            .arg(format!("-{}", pid))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            debug!(pid, "Job process group already gone");
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn signal_job(&self, handle: &str, _pid: u32) -> Result<(), LaunchError> {
        if let Some(child) = self.lock_children().get_mut(handle) {
            child.start_kill()?;
        }
        Ok(())
    }
}

async fn read_output(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(MAX_CAPTURED_OUTPUT);
            String::from_utf8_lossy(&bytes[start..]).to_string()
        }
        Err(e) => format!("<output unavailable: {}>", e),
    }
}

#[cfg(unix)]
async fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
async fn process_alive(_pid: u32) -> bool {
    false
}

#[async_trait]
impl JobLauncher for LocalProcessLauncher {
    async fn submit(&self, spec: &JobSpec) -> Result<String, LaunchError> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        // The job may run in another directory
        let log_dir = tokio::fs::canonicalize(&self.log_dir).await?;

        let handle = Uuid::new_v4().to_string();
        let stdout = File::create(log_dir.join(format!("{}.log", handle)))?;
        let stderr = stdout.try_clone()?;

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(STATUS_WRAPPER)
            .arg("seqflow-job")
            .arg(&spec.program)
            .args(&spec.args)
            .env(EXIT_FILE_ENV, log_dir.join(format!("{}.exit", handle)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| LaunchError::SpawnFailed {
            label: spec.label.clone(),
            message: e.to_string(),
        })?;
        let pid = child.id().unwrap_or_default();

        let record = JobRecord {
            label: spec.label.clone(),
            program: spec.program.clone(),
            args: spec.args.clone(),
            pid,
            submitted_at: Utc::now(),
        };
        if let Err(e) = self.write_record(&handle, &record).await {
            // A job nobody can find again must not keep running
            if let Err(kill_error) = child.start_kill() {
                warn!(handle = %handle, error = %kill_error, "Failed to stop untracked job");
            }
            return Err(e);
        }

        info!(
            handle = %handle,
            label = %spec.label,
            program = %spec.program,
            pid,
            "Launched local job"
        );
        self.lock_children().insert(handle.clone(), child);
        Ok(handle)
    }

    async fn poll(&self, handle: &str) -> Result<JobStatus, LaunchError> {
        if Uuid::parse_str(handle).is_err() {
            return Ok(JobStatus::Unknown);
        }

        let reaped = match self.reap(handle)? {
            Some(None) => return Ok(JobStatus::Running),
            Some(Some(code)) => Some(code),
            None => None,
        };
        if let Some(code) = self.recorded_exit(handle).await? {
            return Ok(self.exited(handle, code).await);
        }
        if let Some(code) = reaped {
            return Ok(self.exited(handle, code).await);
        }

        // Not a child of this process: rely on the files it left behind
        let Some(record) = self.read_record(handle).await? else {
            return Ok(JobStatus::Unknown);
        };
        if process_alive(record.pid).await {
            return Ok(JobStatus::Running);
        }
        if let Some(code) = self.recorded_exit(handle).await? {
            return Ok(self.exited(handle, code).await);
        }

        warn!(handle = %handle, label = %record.label, pid = record.pid, "Job ended without recording an exit status");
        let output = read_output(&self.job_file(handle, "log")).await;
        Ok(JobStatus::Exited {
            code: -1,
            output: format!("{}\n<job ended without recording an exit status>", output),
        })
    }

    async fn cancel(&self, handle: &str) -> Result<(), LaunchError> {
        if Uuid::parse_str(handle).is_err() || self.recorded_exit(handle).await?.is_some() {
            return Ok(());
        }
        let Some(record) = self.read_record(handle).await? else {
            return Ok(());
        };

        self.signal_job(handle, record.pid).await?;
        info!(handle = %handle, label = %record.label, pid = record.pid, "Cancelled local job");
        Ok(())
    }
}
