// Built-in tasks: closures, no-ops, file waits and external commands

use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::{debug, info};

use super::launcher::{JobSpec, JobStatus};
use super::{Task, TaskContext, TaskResult, EXIT_SYNTHETIC_FAILURE};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder pattern"));

/// Replace `{name}` placeholders with context variables
pub fn expand_template(template: &str, context: &TaskContext<'_>) -> anyhow::Result<String> {
    let mut missing = Vec::new();
    let expanded = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
        match context.var(&caps[1]) {
            Some(value) => value.to_string(),
            None => {
                missing.push(caps[1].to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        anyhow::bail!("undefined variables in '{}': {}", template, missing.join(", "));
    }
    Ok(expanded.into_owned())
}

type TaskFn = dyn Fn(&TaskContext<'_>) -> anyhow::Result<TaskResult> + Send + Sync;

/// Task backed by a closure
pub struct FnTask {
    name: String,
    f: Box<TaskFn>,
}

impl FnTask {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<TaskResult> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl Task for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, context: &TaskContext<'_>) -> anyhow::Result<TaskResult> {
        (self.f)(context)
    }
}

/// Always succeeds
#[derive(Debug, Clone)]
pub struct NoopTask {
    name: String,
}

impl NoopTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Task for NoopTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _context: &TaskContext<'_>) -> anyhow::Result<TaskResult> {
        Ok(TaskResult::success(""))
    }
}

/// Running until a file appears, e.g. a sequencer's completion marker
#[derive(Debug, Clone)]
pub struct WaitForFileTask {
    name: String,
    path: String,
}

impl WaitForFileTask {
    /// `path` may contain `{var}` placeholders
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl Task for WaitForFileTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, context: &TaskContext<'_>) -> anyhow::Result<TaskResult> {
        let path = PathBuf::from(expand_template(&self.path, context)?);
        if tokio::fs::try_exists(&path).await? {
            info!(task = %self.name, path = ?path, "Awaited file is present");
            Ok(TaskResult::success(format!("found {}", path.display())))
        } else {
            debug!(task = %self.name, path = ?path, "Still waiting for file");
            Ok(TaskResult::running(format!("waiting for {}", path.display())))
        }
    }
}

/// Launches an external program through the context's job launcher and
/// polls it on later invocations
#[derive(Debug, Clone)]
pub struct CommandTask {
    name: String,
    program: String,
    args: Vec<String>,
    working_dir: Option<String>,
}

impl CommandTask {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn job_spec(&self, context: &TaskContext<'_>) -> anyhow::Result<JobSpec> {
        let args = self
            .args
            .iter()
            .map(|arg| expand_template(arg, context))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let working_dir = self
            .working_dir
            .as_deref()
            .map(|dir| expand_template(dir, context).map(PathBuf::from))
            .transpose()?;

        Ok(JobSpec {
            label: format!("{}:{}", self.name, context.instance_id),
            program: expand_template(&self.program, context)?,
            args,
            working_dir,
        })
    }
}

#[async_trait]
impl Task for CommandTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, context: &TaskContext<'_>) -> anyhow::Result<TaskResult> {
        let Some(handle) = context.handle else {
            let spec = self.job_spec(context)?;
            let handle = context.launcher().submit(&spec).await?;
            return Ok(TaskResult::running(format!("submitted {}", spec.label)).with_handle(handle));
        };

        match context.launcher().poll(handle).await? {
            JobStatus::Running => Ok(TaskResult::running(format!("job {} running", handle)).with_handle(handle)),
            JobStatus::Exited { code, output } => Ok(TaskResult::from_exit_code(code, output)),
            JobStatus::Unknown => Ok(TaskResult::failed(
                EXIT_SYNTHETIC_FAILURE,
                format!("job {} is unknown to the launcher", handle),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StateId;
    use crate::instance::InstanceId;
    use crate::task::mocks::ScriptedLauncher;
    use crate::task::{TaskEnvironment, TaskKey, TaskStatus};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        environment: TaskEnvironment,
        instance_id: InstanceId,
        vars: BTreeMap<String, String>,
    }

    impl Fixture {
        fn new(environment: TaskEnvironment) -> Self {
            Self {
                environment,
                instance_id: InstanceId::new(),
                vars: BTreeMap::new(),
            }
        }

        fn context<'a>(&'a self, handle: Option<&'a str>) -> TaskContext<'a> {
            TaskContext {
                environment: &self.environment,
                instance_id: &self.instance_id,
                workflow: "demux",
                instance_variables: &self.vars,
                key: TaskKey::Enter(StateId::from("DEMUX")),
                attempt: 1,
                handle,
            }
        }
    }

    #[test]
    fn test_template_expansion_reports_missing_variables() {
        let fixture = Fixture::new(TaskEnvironment::default().with_variable("run", "R1"));
        let ctx = fixture.context(None);

        assert_eq!(expand_template("/runs/{run}/fastq", &ctx).unwrap(), "/runs/R1/fastq");
        let err = expand_template("{run}/{lane}", &ctx).unwrap_err();
        assert!(err.to_string().contains("lane"));
    }

    #[tokio::test]
    async fn test_wait_for_file_runs_until_file_exists() {
        let temp_dir = TempDir::new().unwrap();
        let marker = temp_dir.path().join("RTAComplete.txt");
        let environment = TaskEnvironment::default()
            .with_variable("run_dir", temp_dir.path().display().to_string());
        let fixture = Fixture::new(environment);
        let task = WaitForFileTask::new("wait-rta", "{run_dir}/RTAComplete.txt");

        let first = task.execute(&fixture.context(None)).await.unwrap();
        assert_eq!(first.status, TaskStatus::Running);

        std::fs::write(&marker, "").unwrap();
        let second = task.execute(&fixture.context(None)).await.unwrap();
        assert_eq!(second.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_command_task_submits_then_polls() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let environment = TaskEnvironment::new(launcher.clone()).with_variable("sample", "NA12878");
        let fixture = Fixture::new(environment);
        let task = CommandTask::new("align", "dragen").with_args(["--sample", "{sample}"]);

        let submitted = task.execute(&fixture.context(None)).await.unwrap();
        assert_eq!(submitted.status, TaskStatus::Running);
        let handle = submitted.handle.clone().unwrap();
        assert_eq!(launcher.submitted()[0].args, vec!["--sample", "NA12878"]);

        let still_running = task.execute(&fixture.context(Some(&handle))).await.unwrap();
        assert_eq!(still_running.status, TaskStatus::Running);
        assert_eq!(still_running.handle.as_deref(), Some(handle.as_str()));

        launcher.finish(&handle, 0, "aligned");
        let done = task.execute(&fixture.context(Some(&handle))).await.unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(done.output, "aligned");
    }

    #[tokio::test]
    async fn test_command_task_with_unknown_handle_fails() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let fixture = Fixture::new(TaskEnvironment::new(launcher));
        let task = CommandTask::new("align", "dragen");

        let result = task.execute(&fixture.context(Some("lost-after-restart"))).await.unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
    }
}
