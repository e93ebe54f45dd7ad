use anyhow::{bail, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::retry::{
    ExponentialBackoff, MaxAttempts, RetryForever, RetryPolicy, RouteToFailureState,
};
use crate::instance::DEFAULT_HISTORY_LIMIT;
use crate::persistence::{FileStore, InstanceStore, MemoryStore};

/// Main configuration structure for seqflow
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SeqflowConfig {
    /// Where instances are stored
    pub persistence: PersistenceConfig,
    /// What happens after a task fails
    pub retry: RetryConfig,
    /// Background tick loop settings
    pub scheduler: SchedulerConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    File,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: StoreBackend,
    /// Directory holding instance documents and lock files
    pub directory: PathBuf,
    /// Audit events kept per instance
    pub history_limit: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            directory: PathBuf::from(".seqflow/instances"),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl PersistenceConfig {
    pub fn build_store(&self) -> Arc<dyn InstanceStore> {
        match self.backend {
            StoreBackend::File => Arc::new(FileStore::new(&self.directory)),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Forever,
    MaxAttempts,
    Backoff,
    RouteToFailureState,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub strategy: RetryStrategy,
    /// Failures tolerated before giving up or routing away
    pub max_attempts: u32,
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub jitter: bool,
    /// Target state for `route_to_failure_state`
    pub failure_state: Option<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Forever,
            max_attempts: 5,
            base_delay_seconds: 30,
            max_delay_seconds: 1800, // 30 minutes
            jitter: true,
            failure_state: None,
        }
    }
}

impl RetryConfig {
    pub fn build_policy(&self) -> Result<Arc<dyn RetryPolicy>> {
        let policy: Arc<dyn RetryPolicy> = match self.strategy {
            RetryStrategy::Forever => Arc::new(RetryForever),
            RetryStrategy::MaxAttempts => Arc::new(MaxAttempts::new(self.max_attempts)),
            RetryStrategy::Backoff => Arc::new(ExponentialBackoff {
                base_delay: Duration::from_secs(self.base_delay_seconds),
                max_delay: Duration::from_secs(self.max_delay_seconds),
                max_attempts: Some(self.max_attempts),
                jitter: self.jitter,
            }),
            RetryStrategy::RouteToFailureState => {
                let Some(state) = &self.failure_state else {
                    bail!("retry.failure_state is required for the route_to_failure_state strategy");
                };
                Arc::new(RouteToFailureState::new(state.as_str(), self.max_attempts))
            }
        };
        Ok(policy)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_seconds: u64,
    /// Upper bound on instances ticked in parallel
    pub max_concurrent_ticks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 60,
            max_concurrent_ticks: 8,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Filter directive used when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl SeqflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (seqflow.toml, .seqflow-rc)
    /// 3. Environment variables (prefixed with SEQFLOW_)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Same as [`SeqflowConfig::load`], looking for files under `dir`
    pub fn load_from(dir: &Path) -> Result<Self> {
        // Missing keys fall back to the serde defaults
        let mut builder = Config::builder();

        let toml_file = dir.join("seqflow.toml");
        if toml_file.exists() {
            builder = builder.add_source(File::from(toml_file));
        }

        let rc_file = dir.join(".seqflow-rc");
        if rc_file.exists() {
            builder = builder.add_source(File::from(rc_file).format(config::FileFormat::Toml));
        }

        // SEQFLOW_RETRY__MAX_ATTEMPTS=3 overrides retry.max_attempts
        builder = builder.add_source(
            Environment::with_prefix("SEQFLOW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let seqflow_config: SeqflowConfig = config.try_deserialize()?;
        Ok(seqflow_config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<SeqflowConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = SeqflowConfig::load_env_file();
        SeqflowConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static SeqflowConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}
