//! Counting policies: absolute failure count and failure percentage.

use super::FailurePolicy;

/// Trips once `max` failures have been recorded since the last arm.
///
/// ```
/// use chantier::policy::{Count, FailurePolicy};
///
/// let mut policy = Count::new(4);
/// policy.arm();
/// for _ in 0..4 {
///     policy.failure();
/// }
/// assert!(policy.limit_reached());
/// ```
#[derive(Debug, Clone)]
pub struct Count {
    max: u64,
    failures: u64,
}

impl Count {
    pub fn new(max: u64) -> Self {
        Self { max, failures: 0 }
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}

impl FailurePolicy for Count {
    fn arm(&mut self) {
        self.failures = 0;
    }

    fn failure(&mut self) {
        self.failures += 1;
    }

    fn success(&mut self) {}

    fn limit_reached(&self) -> bool {
        self.failures >= self.max
    }
}

/// Trips when failures make up at least `threshold` percent of all outcomes.
///
/// Small samples never trip: at least 5 outcomes must be recorded before the
/// ratio is considered.
#[derive(Debug, Clone)]
pub struct Percentage {
    threshold: f64,
    failures: u64,
    successes: u64,
}

impl Percentage {
    /// Outcomes at or below this count are too few to judge.
    const MIN_SAMPLE: u64 = 4;

    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            failures: 0,
            successes: 0,
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }
}

impl FailurePolicy for Percentage {
    fn arm(&mut self) {
        self.failures = 0;
        self.successes = 0;
    }

    fn failure(&mut self) {
        self.failures += 1;
    }

    fn success(&mut self) {
        self.successes += 1;
    }

    fn limit_reached(&self) -> bool {
        let total = self.failures + self.successes;
        if total <= Self::MIN_SAMPLE {
            return false;
        }
        // failures / total * 100 >= threshold, kept exact for integral thresholds.
        self.failures as f64 * 100.0 >= self.threshold * total as f64
    }
}
