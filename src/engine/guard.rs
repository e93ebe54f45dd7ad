use crate::definition::Transition;
use crate::instance::ExecutionInstance;

/// Precondition checked before a transition's task is invoked
pub trait TransitionGuard: Send + Sync {
    fn permits(&self, instance: &ExecutionInstance, transition: &Transition) -> bool;
}

/// Every transition is eligible
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl TransitionGuard for AllowAll {
    fn permits(&self, _instance: &ExecutionInstance, _transition: &Transition) -> bool {
        true
    }
}

/// Closure-backed guard, e.g. to hold back transitions while a variable is unset
pub struct FnGuard<F>(pub F);

impl<F> TransitionGuard for FnGuard<F>
where
    F: Fn(&ExecutionInstance, &Transition) -> bool + Send + Sync,
{
    fn permits(&self, instance: &ExecutionInstance, transition: &Transition) -> bool {
        (self.0)(instance, transition)
    }
}
