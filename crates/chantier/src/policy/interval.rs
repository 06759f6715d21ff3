//! Time-window decorator over another failure policy.

use std::time::Duration;

use tokio::time::Instant;

use super::FailurePolicy;

/// Restarts the wrapped policy whenever `window` has elapsed since the
/// window began.
///
/// The check happens before each recorded outcome, so old failures age out
/// and a slow trickle of errors never trips the breaker. `Count` inside a
/// `WithinInterval` means "N failures within T"; `Percentage` inside means
/// "failure rate of X% within T".
#[derive(Debug, Clone)]
pub struct WithinInterval<P> {
    inner: P,
    window: Duration,
    window_start: Instant,
}

impl<P: FailurePolicy> WithinInterval<P> {
    pub fn new(inner: P, window: Duration) -> Self {
        Self {
            inner,
            window,
            window_start: Instant::now(),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn roll_window(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.window_start) > self.window {
            tracing::trace!(window = ?self.window, "Failure window elapsed, re-arming");
            self.window_start = now;
            self.inner.arm();
        }
    }
}

impl<P: FailurePolicy> FailurePolicy for WithinInterval<P> {
    fn arm(&mut self) {
        self.inner.arm();
        self.window_start = Instant::now();
    }

    fn failure(&mut self) {
        self.roll_window();
        self.inner.failure();
    }

    fn success(&mut self) {
        self.roll_window();
        self.inner.success();
    }

    fn limit_reached(&self) -> bool {
        self.inner.limit_reached()
    }
}
