// Tick engine: advances execution instances through their workflow graph

pub mod admin;
pub mod driver;
pub mod guard;
pub mod retry;
pub mod scheduler;

pub use admin::{activate_state, cancel_instance, cancel_instance_with_jobs, deactivate_state, resume_instance};
pub use driver::{Driver, FiredTransition, TickOutcome, TickReport};
pub use guard::{AllowAll, FnGuard, TransitionGuard};
pub use retry::{
    ExponentialBackoff, MaxAttempts, RetryDecision, RetryForever, RetryPolicy, RouteToFailureState,
};
pub use scheduler::{SweepSummary, TickScheduler};

use crate::error::EngineError;
use crate::observability::engine_metrics;
use crate::persistence::PersistenceError;

/// Lock and version conflicts mean another tick owns the instance
pub(crate) fn store_error(error: PersistenceError) -> EngineError {
    match error {
        PersistenceError::Locked { instance_id } => {
            engine_metrics().record_contention();
            EngineError::Contention {
                instance_id,
                reason: "instance lock is held".to_string(),
            }
        }
        PersistenceError::VersionConflict {
            instance_id,
            expected,
            found,
        } => {
            engine_metrics().record_contention();
            EngineError::Contention {
                instance_id,
                reason: format!("stored version {} does not match loaded version {}", found, expected),
            }
        }
        other => EngineError::Persistence(other),
    }
}
