//! See [`RttEstimator`].

use web_time::Duration;

/// Smoothing factor for the moving average; smaller reacts more slowly to
/// samples.
const ALPHA: f64 = 0.05;

/// Flat margin added on top of the RTT-derived resend delay, so that near-zero
/// RTT links (loopback) do not resend on every flush.
const RESEND_MARGIN: Duration = Duration::from_millis(10);

/// Round-trip time estimate for a connection, fed by packet acknowledgements.
///
/// An exponentially weighted moving average over samples: each acked packet
/// contributes `now - send_time` through [`RttEstimator::update`]. Until the
/// first sample arrives the estimate is the configured initial value.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Duration,
    has_sample: bool,
}

/// Initial RTT assumed before any acknowledgement has been observed.
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(100);

impl RttEstimator {
    /// Creates an estimator reporting `initial` until the first sample.
    #[must_use]
    pub const fn new(initial: Duration) -> Self {
        Self {
            latest: initial,
            smoothed: initial,
            has_sample: false,
        }
    }

    /// Current smoothed estimate.
    #[must_use]
    pub const fn get(&self) -> Duration {
        self.smoothed
    }

    /// Most recent raw sample.
    #[must_use]
    pub const fn latest(&self) -> Duration {
        self.latest
    }

    /// How long to wait after sending a reliable message before sending it
    /// again, if no acknowledgement for it arrived: twice the round trip plus
    /// a small flat margin.
    #[must_use]
    pub fn resend_delay(&self) -> Duration {
        self.smoothed * 2 + RESEND_MARGIN
    }

    /// Feeds one round-trip sample into the average.
    pub fn update(&mut self, sample: Duration) {
        self.latest = sample;
        if self.has_sample {
            self.smoothed = self.smoothed.mul_f64(1.0 - ALPHA) + sample.mul_f64(ALPHA);
        } else {
            // the first real sample replaces the configured guess outright
            self.smoothed = sample;
            self.has_sample = true;
        }
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RTT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_replaces_initial() {
        let mut rtt = RttEstimator::default();
        assert_eq!(DEFAULT_INITIAL_RTT, rtt.get());

        rtt.update(Duration::from_millis(20));
        assert_eq!(Duration::from_millis(20), rtt.get());
    }

    #[test]
    fn converges_towards_samples() {
        let mut rtt = RttEstimator::default();
        for _ in 0..200 {
            rtt.update(Duration::from_millis(50));
        }
        let got = rtt.get().as_secs_f64() * 1000.0;
        assert!((40.0..60.0).contains(&got), "smoothed RTT was {got} ms");
    }

    #[test]
    fn single_spike_barely_moves_average() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(50));
        rtt.update(Duration::from_millis(500));
        let got = rtt.get().as_secs_f64() * 1000.0;
        assert!(got < 100.0, "smoothed RTT jumped to {got} ms");
        assert_eq!(Duration::from_millis(500), rtt.latest());
    }

    #[test]
    fn resend_delay_tracks_rtt() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(45));
        assert_eq!(Duration::from_millis(100), rtt.resend_delay());
    }
}
