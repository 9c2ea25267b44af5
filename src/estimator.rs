//! Question-size estimator: a moving estimate of the total padded query
//! size an upstream is willing to accept over UDP, feeding the crypto
//! box's padding target.

use std::sync::Mutex;

const INITIAL_ESTIMATE: f64 = 512.0;
const MIN_ESTIMATE: f64 = 256.0;
const MAX_ESTIMATE: f64 = 4096.0;
/// How much `blind_adjust` shrinks the estimate by when a response comes
/// back truncated with no size observation to anchor on.
const BLIND_SHRINK_FACTOR: f64 = 0.9;
/// How quickly `adjust` moves the estimate toward an observed size.
const ADJUST_RATE: f64 = 0.25;

/// Tracks a single moving estimate. Shared across all exchanges to a given
/// proxy (not per-server): it's a workload-wide guess, not per-upstream.
pub struct QuestionSizeEstimator {
    estimate: Mutex<f64>,
}

impl QuestionSizeEstimator {
    pub fn new() -> Self {
        Self {
            estimate: Mutex::new(INITIAL_ESTIMATE),
        }
    }

    /// Current padding target, in bytes.
    pub fn current(&self) -> usize {
        *self.estimate.lock().unwrap() as usize
    }

    /// Raise the ceiling toward an observed size (response overhead plus
    /// response length), smoothed rather than snapped to the new value.
    pub fn adjust(&self, observed: usize) {
        let mut estimate = self.estimate.lock().unwrap();
        let observed = observed as f64;
        *estimate = (*estimate + (observed - *estimate) * ADJUST_RATE).clamp(MIN_ESTIMATE, MAX_ESTIMATE);
    }

    /// Lower the estimate without a numeric observation: called when a
    /// response came back truncated, signalling the upstream's UDP ceiling
    /// was exceeded by whatever size we padded to.
    pub fn blind_adjust(&self) {
        let mut estimate = self.estimate.lock().unwrap();
        *estimate = (*estimate * BLIND_SHRINK_FACTOR).max(MIN_ESTIMATE);
    }
}

impl Default for QuestionSizeEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_moves_toward_observed_size() {
        let estimator = QuestionSizeEstimator::new();
        let before = estimator.current();
        estimator.adjust(4000);
        assert!(estimator.current() > before);
    }

    #[test]
    fn blind_adjust_shrinks_estimate() {
        let estimator = QuestionSizeEstimator::new();
        let before = estimator.current();
        estimator.blind_adjust();
        assert!(estimator.current() < before);
    }

    #[test]
    fn estimate_stays_within_bounds() {
        let estimator = QuestionSizeEstimator::new();
        for _ in 0..50 {
            estimator.adjust(100_000);
        }
        assert!(estimator.current() <= MAX_ESTIMATE as usize);

        for _ in 0..50 {
            estimator.blind_adjust();
        }
        assert!(estimator.current() >= MIN_ESTIMATE as usize);
    }
}
