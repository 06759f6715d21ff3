//! Lock-wrapped policy shared between the pool and its watchers.

use std::sync::{Mutex, MutexGuard};

use super::FailurePolicy;

/// Serializes every policy operation behind a single mutex.
///
/// Each call is atomic on its own. A `failure()` followed by
/// `limit_reached()` may observe outcomes recorded by other watchers in
/// between.
pub struct SharedPolicy {
    inner: Mutex<Box<dyn FailurePolicy>>,
}

impl SharedPolicy {
    pub fn new(policy: impl FailurePolicy) -> Self {
        Self::from_boxed(Box::new(policy))
    }

    pub fn from_boxed(policy: Box<dyn FailurePolicy>) -> Self {
        Self {
            inner: Mutex::new(policy),
        }
    }

    /// Policy state is plain counters, so a panic while holding the lock
    /// cannot leave it inconsistent. Recover instead of propagating.
    fn lock(&self) -> MutexGuard<'_, Box<dyn FailurePolicy>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Failure policy mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    pub fn arm(&self) {
        self.lock().arm()
    }

    pub fn failure(&self) {
        self.lock().failure()
    }

    pub fn success(&self) {
        self.lock().success()
    }

    pub fn limit_reached(&self) -> bool {
        self.lock().limit_reached()
    }
}

impl std::fmt::Debug for SharedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPolicy")
            .field("limit_reached", &self.limit_reached())
            .finish()
    }
}
