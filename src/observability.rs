use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Process-wide counters for the tick loop
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub ticks: AtomicU64,
    pub transitions_fired: AtomicU64,
    pub task_invocations: AtomicU64,
    pub task_failures: AtomicU64,
    pub contended_ticks: AtomicU64,
    pub halted_instances: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition(&self) {
        self.transitions_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_invocation(&self) {
        self.task_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_failure(&self) {
        self.task_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_contention(&self) {
        self.contended_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_halt(&self) {
        self.halted_instances.fetch_add(1, Ordering::Relaxed);
        warn!("Instance halted on terminal failure");
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            transitions_fired: self.transitions_fired.load(Ordering::Relaxed),
            task_invocations: self.task_invocations.load(Ordering::Relaxed),
            task_failures: self.task_failures.load(Ordering::Relaxed),
            contended_ticks: self.contended_ticks.load(Ordering::Relaxed),
            halted_instances: self.halted_instances.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Engine metrics: ticks={}, transitions={}, tasks={}, task_failures={}, contended={}, halted={}",
            stats.ticks,
            stats.transitions_fired,
            stats.task_invocations,
            stats.task_failures,
            stats.contended_ticks,
            stats.halted_instances
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub ticks: u64,
    pub transitions_fired: u64,
    pub task_invocations: u64,
    pub task_failures: u64,
    pub contended_ticks: u64,
    pub halted_instances: u64,
}

/// Global metrics instance
static ENGINE_METRICS: std::sync::LazyLock<EngineMetrics> = std::sync::LazyLock::new(EngineMetrics::new);

pub fn engine_metrics() -> &'static EngineMetrics {
    &ENGINE_METRICS
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = EngineMetrics::new();
        metrics.record_tick();
        metrics.record_tick();
        metrics.record_transition();
        metrics.record_contention();

        let stats = metrics.get_stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.transitions_fired, 1);
        assert_eq!(stats.contended_ticks, 1);
        assert_eq!(stats.task_failures, 0);
    }
}
