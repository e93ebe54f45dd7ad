use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use seqflow::config::SeqflowConfig;
use seqflow::definition::{DefinitionDocument, WorkflowDefinition};
use seqflow::engine::Driver;
use seqflow::instance::InstanceId;
use seqflow::persistence::InstanceStore;
use seqflow::task::{LocalProcessLauncher, TaskEnvironment, TaskRegistry};

use super::Commands;

pub mod admin;
pub mod run;
pub mod start;
pub mod status;
pub mod tick;
pub mod validate;

/// Everything a command needs, built once from configuration
pub struct CommandContext {
    pub config: SeqflowConfig,
    pub store: Arc<dyn InstanceStore>,
    pub driver: Arc<Driver>,
    pub environment: Arc<TaskEnvironment>,
    pub registry: TaskRegistry,
}

impl CommandContext {
    pub fn new(config: SeqflowConfig) -> Result<Self> {
        let store = config.persistence.build_store();
        let retry = config.retry.build_policy()?;
        let driver = Arc::new(
            Driver::new()
                .with_retry_policy(retry)
                .with_history_limit(config.persistence.history_limit),
        );
        let launcher = LocalProcessLauncher::new(config.persistence.directory.join("jobs"));
        let environment = Arc::new(TaskEnvironment::new(Arc::new(launcher)));

        Ok(Self {
            config,
            store,
            driver,
            environment,
            registry: TaskRegistry::new(),
        })
    }

    pub fn load_definition(&self, path: &Path) -> Result<WorkflowDefinition> {
        DefinitionDocument::load(path, &self.registry)
            .with_context(|| format!("Failed to load workflow definition {}", path.display()))
    }
}

pub fn parse_instance_id(raw: &str) -> Result<InstanceId> {
    raw.parse::<InstanceId>()
        .with_context(|| format!("'{}' is not a valid instance id", raw))
}

pub async fn dispatch(command: Commands, config: SeqflowConfig) -> Result<()> {
    let context = CommandContext::new(config)?;

    match command {
        Commands::Validate { definition } => validate::execute(&context, &definition),
        Commands::Start {
            definition,
            vars,
            seeds,
        } => start::execute(&context, &definition, vars, seeds).await,
        Commands::Tick {
            definition,
            instance,
        } => tick::execute(&context, &definition, &instance).await,
        Commands::Run { definitions, once } => run::execute(&context, &definitions, once).await,
        Commands::Status { instance, json } => status::show(&context, &instance, json).await,
        Commands::List { workflow } => status::list(&context, workflow.as_deref()).await,
        Commands::Cancel {
            instance,
            reason,
            kill_jobs,
        } => admin::cancel(&context, &instance, &reason, kill_jobs).await,
        Commands::Deactivate { instance, state } => {
            admin::deactivate(&context, &instance, &state).await
        }
        Commands::Activate {
            definition,
            instance,
            state,
        } => admin::activate(&context, &definition, &instance, &state).await,
        Commands::Resume { instance } => admin::resume(&context, &instance).await,
    }
}
