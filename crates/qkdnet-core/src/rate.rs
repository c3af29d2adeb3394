//! Link generation-rate estimators.
//!
//! Two layers: each KME smooths the raw bit count of arriving blocks with an
//! exponentially-weighted moving average ([`RateEstimator`]) and reports the
//! result to the controller, which keeps the reports in a time-bounded
//! rolling buffer ([`CapacityWindow`]). Admission control reads the window's
//! minimum, so a drop in generation rate takes effect immediately and is
//! phased out only as the low sample ages out of the window.

use std::{collections::VecDeque, ops::Sub, time::Duration};

/// EWMA over block arrivals, in bits per interval.
#[derive(Debug, Clone, PartialEq)]
pub struct RateEstimator {
    alpha: f64,
    interval_secs: f64,
    rate: Option<f64>,
}

impl RateEstimator {
    /// Weight of the newest sample.
    pub const ALPHA: f64 = 0.1;

    /// Estimator with the default weight over one-second intervals.
    pub fn new() -> Self {
        Self::with_alpha(Self::ALPHA, 1.0)
    }

    /// Estimator with an explicit weight and sampling interval.
    pub fn with_alpha(alpha: f64, interval_secs: f64) -> Self {
        debug_assert!((0.0..=1.0).contains(&alpha));
        debug_assert!(interval_secs > 0.0);
        Self { alpha, interval_secs, rate: None }
    }

    /// Estimator resuming from a previously reported rate.
    pub fn resume(rate: f64) -> Self {
        Self { rate: Some(rate), ..Self::new() }
    }

    /// Folds in a block of `bytes` and returns the updated rate.
    ///
    /// The first sample seeds the estimate directly.
    pub fn observe(&mut self, bytes: usize) -> f64 {
        let bits = (bytes as f64 * 8.0) / self.interval_secs;
        let next = match self.rate {
            None => bits,
            Some(rate) => self.alpha * bits + (1.0 - self.alpha) * rate,
        };
        self.rate = Some(next);
        next
    }

    /// Current estimate, zero before the first sample.
    pub fn rate(&self) -> f64 {
        self.rate.unwrap_or(0.0)
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-size rolling buffer of rate samples spanning a time window.
#[derive(Debug, Clone)]
pub struct CapacityWindow<I> {
    span: Duration,
    max_samples: usize,
    samples: VecDeque<(I, f64)>,
}

impl<I> CapacityWindow<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Window covering `span`, holding one sample per `interval`.
    pub fn spanning(span: Duration, interval: Duration) -> Self {
        let slots = if interval.is_zero() {
            1
        } else {
            (span.as_secs_f64() / interval.as_secs_f64()).ceil().max(1.0) as usize
        };
        Self::with_capacity(span, slots)
    }

    /// Window covering `span`, holding at most `max_samples` samples.
    pub fn with_capacity(span: Duration, max_samples: usize) -> Self {
        let max_samples = max_samples.max(1);
        Self { span, max_samples, samples: VecDeque::with_capacity(max_samples) }
    }

    /// Records a rate reported at `at`. Evicts aged-out samples first, then
    /// the oldest one if the buffer is full.
    pub fn record(&mut self, at: I, rate: f64) {
        self.prune(at);
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back((at, rate));
    }

    /// Conservative capacity estimate: the smallest live sample, or zero if
    /// every sample has aged out.
    pub fn estimate(&self, now: I) -> f64 {
        self.samples
            .iter()
            .filter(|(at, _)| now - *at < self.span)
            .map(|(_, rate)| *rate)
            .reduce(f64::min)
            .unwrap_or(0.0)
    }

    /// Number of samples currently buffered.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True before the first sample.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn prune(&mut self, now: I) {
        while let Some((at, _)) = self.samples.front() {
            if now - *at < self.span {
                break;
            }
            self.samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    struct T(u64);

    impl Sub for T {
        type Output = Duration;

        fn sub(self, rhs: Self) -> Duration {
            Duration::from_secs(self.0.saturating_sub(rhs.0))
        }
    }

    #[test]
    fn first_sample_seeds_estimate() {
        let mut ewma = RateEstimator::new();
        assert!((ewma.observe(1000) - 8000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn later_samples_are_smoothed() {
        let mut ewma = RateEstimator::new();
        ewma.observe(1000);
        let next = ewma.observe(2000);
        assert!((next - (0.1 * 16000.0 + 0.9 * 8000.0)).abs() < 1e-9);
    }

    #[test]
    fn drop_in_rate_lingers_until_aged_out() {
        let mut window = CapacityWindow::spanning(Duration::from_secs(15), Duration::from_secs(1));
        window.record(T(0), 100.0);
        window.record(T(1), 10.0);
        window.record(T(2), 100.0);

        assert!((window.estimate(T(2)) - 10.0).abs() < f64::EPSILON);
        assert!((window.estimate(T(16)) - 100.0).abs() < f64::EPSILON);
        assert!(window.estimate(T(40)).abs() < f64::EPSILON);
    }

    #[test]
    fn buffer_is_bounded() {
        let mut window = CapacityWindow::with_capacity(Duration::from_secs(100), 3);
        for t in 0..10 {
            window.record(T(t), t as f64);
        }
        assert_eq!(window.len(), 3);
        assert!((window.estimate(T(9)) - 7.0).abs() < f64::EPSILON);
    }
}
