// Interval ticking across many instances

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

use super::driver::{Driver, TickOutcome};
use crate::config::SchedulerConfig;
use crate::definition::WorkflowDefinition;
use crate::error::{EngineError, EngineResult};
use crate::instance::InstanceId;
use crate::observability::{engine_metrics, OperationTimer};
use crate::persistence::InstanceStore;
use crate::task::TaskEnvironment;
use crate::telemetry::{create_sweep_span, generate_correlation_id};

/// Tally of one pass over the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub ticked: usize,
    pub transitions_fired: usize,
    pub skipped: usize,
    pub contended: usize,
    pub halted: usize,
    pub errors: usize,
}

/// Ticks every running instance of the registered workflows.
///
/// Instances are ticked in parallel up to `max_concurrent_ticks`; an instance
/// whose lock is held elsewhere is skipped until the next sweep.
pub struct TickScheduler {
    driver: Arc<Driver>,
    store: Arc<dyn InstanceStore>,
    environment: Arc<TaskEnvironment>,
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
    config: SchedulerConfig,
}

impl TickScheduler {
    pub fn new(driver: Arc<Driver>, store: Arc<dyn InstanceStore>, environment: Arc<TaskEnvironment>) -> Self {
        Self {
            driver,
            store,
            environment,
            definitions: HashMap::new(),
            config: SchedulerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_definition(mut self, definition: Arc<WorkflowDefinition>) -> Self {
        self.definitions.insert(definition.name().to_string(), definition);
        self
    }

    /// Tick every running instance once and wait for all ticks to finish
    pub async fn sweep(&self) -> EngineResult<SweepSummary> {
        let span = create_sweep_span(&generate_correlation_id());
        self.sweep_inner().instrument(span).await
    }

    async fn sweep_inner(&self) -> EngineResult<SweepSummary> {
        let timer = OperationTimer::new("sweep");
        let mut summary = SweepSummary::default();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_ticks.max(1)));
        let mut ticks: JoinSet<(InstanceId, EngineResult<usize>)> = JoinSet::new();

        for instance_id in self.store.list().await? {
            let instance = match self.store.load(instance_id).await {
                Ok(Some(instance)) => instance,
                Ok(None) => continue,
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "Could not read instance");
                    summary.errors += 1;
                    continue;
                }
            };
            if !instance.status().is_tickable() {
                summary.skipped += 1;
                continue;
            }
            let Some(definition) = self.definitions.get(instance.workflow()).cloned() else {
                debug!(instance_id = %instance_id, workflow = instance.workflow(), "No definition registered");
                summary.skipped += 1;
                continue;
            };

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let driver = Arc::clone(&self.driver);
            let store = Arc::clone(&self.store);
            let environment = Arc::clone(&self.environment);

            ticks.spawn(
                async move {
                    let _permit = permit;
                    let result = driver
                        .tick(store.as_ref(), &definition, instance_id, &environment)
                        .await
                        .map(|report| match report.outcome {
                            TickOutcome::Advanced => report.fired.len(),
                            TickOutcome::Skipped => 0,
                        });
                    (instance_id, result)
                }
                .in_current_span(),
            );
        }

        while let Some(joined) = ticks.join_next().await {
            let (instance_id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Tick task aborted");
                    summary.errors += 1;
                    continue;
                }
            };
            match result {
                Ok(fired) => {
                    summary.ticked += 1;
                    summary.transitions_fired += fired;
                }
                Err(EngineError::Contention { reason, .. }) => {
                    debug!(instance_id = %instance_id, reason = %reason, "Instance busy; skipping");
                    summary.contended += 1;
                }
                Err(EngineError::TerminalFailure { reason, .. }) => {
                    warn!(instance_id = %instance_id, reason = %reason, "Instance needs operator attention");
                    summary.halted += 1;
                }
                Err(e) => {
                    error!(instance_id = %instance_id, error = %e, "Tick failed");
                    summary.errors += 1;
                }
            }
        }

        info!(
            ticked = summary.ticked,
            fired = summary.transitions_fired,
            contended = summary.contended,
            halted = summary.halted,
            errors = summary.errors,
            "Sweep complete"
        );
        timer.finish();
        Ok(summary)
    }

    /// Sweep on every interval until `shutdown` resolves
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> EngineResult<()> {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(
            interval_seconds = self.config.tick_interval().as_secs(),
            workflows = ?self.definitions.keys().collect::<Vec<_>>(),
            "Tick scheduler started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Tick scheduler stopping");
                    engine_metrics().log_stats();
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Sweep failed");
                    }
                }
            }
        }
    }
}
