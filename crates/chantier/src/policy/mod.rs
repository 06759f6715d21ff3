//! Failure policies (circuit breakers) for task pools.
//!
//! A policy counts task outcomes and answers whether the pool should stop
//! accepting new work. Policies never retry or reschedule anything.
//!
//! - [`NoLimit`]: never trips
//! - [`Count`]: trips after a fixed number of failures
//! - [`Percentage`]: trips when the failure ratio crosses a threshold
//! - [`WithinInterval`]: wraps another policy and forgets its counts every window
//!
//! Policies are plain `&mut self` state machines. The pool wraps whichever one
//! it is given in a [`SharedPolicy`] so watchers can record outcomes concurrently.

mod counters;
mod interval;
mod shared;

pub use counters::{Count, Percentage};
pub use interval::WithinInterval;
pub use shared::SharedPolicy;

/// The four-operation contract every failure policy implements.
pub trait FailurePolicy: Send + 'static {
    /// Reset all counters to their initial state.
    ///
    /// Called once when the pool is built; callers may call it again to
    /// close a tripped breaker.
    fn arm(&mut self);

    /// Record a failed task.
    fn failure(&mut self);

    /// Record a successful task.
    fn success(&mut self);

    /// Whether enough failures have accumulated to refuse new work.
    fn limit_reached(&self) -> bool;
}

impl<P: FailurePolicy + ?Sized> FailurePolicy for Box<P> {
    fn arm(&mut self) {
        (**self).arm()
    }

    fn failure(&mut self) {
        (**self).failure()
    }

    fn success(&mut self) {
        (**self).success()
    }

    fn limit_reached(&self) -> bool {
        (**self).limit_reached()
    }
}

/// Policy that records nothing and never trips.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimit;

impl FailurePolicy for NoLimit {
    fn arm(&mut self) {}

    fn failure(&mut self) {}

    fn success(&mut self) {}

    fn limit_reached(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_limit_never_trips() {
        let mut policy = NoLimit;
        policy.arm();
        for _ in 0..1000 {
            policy.failure();
        }
        assert!(!policy.limit_reached());
    }

    #[test]
    fn boxed_policy_delegates() {
        let mut policy: Box<dyn FailurePolicy> = Box::new(Count::new(2));
        policy.arm();
        policy.failure();
        assert!(!policy.limit_reached());
        policy.failure();
        assert!(policy.limit_reached());
        policy.arm();
        assert!(!policy.limit_reached());
    }
}
