use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A time-bounded sliding window over a stream of samples, maintaining sum
///  and mean in an efficient way: the sum is cached and adjusted as samples
///  enter and expire instead of being recomputed per query.
///
/// Used for the client's round-trip average (mean over the ping window) and
///  the socket byte-rate meters (sum over the last second).
pub struct SlidingWindow {
    window: Duration,
    entries: VecDeque<(Instant, f64)>,
    cached_sum: f64,
}

impl SlidingWindow {
    pub fn new(window: Duration) -> SlidingWindow {
        SlidingWindow {
            window,
            entries: VecDeque::new(),
            cached_sum: 0.0,
        }
    }

    pub fn record(&mut self, now: Instant, value: f64) {
        self.prune(now);
        self.entries.push_back((now, value));
        self.cached_sum += value;
    }

    /// Mean of the samples still inside the window, 0.0 when there are none.
    pub fn mean(&mut self, now: Instant) -> f64 {
        self.prune(now);
        if self.entries.is_empty() {
            return 0.0;
        }
        self.cached_sum / self.entries.len() as f64
    }

    pub fn sum(&mut self, now: Instant) -> f64 {
        self.prune(now);
        self.cached_sum
    }

    pub fn len(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.entries.len()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, value)) = self.entries.front() {
            if now.duration_since(at) <= self.window {
                break;
            }
            self.cached_sum -= value;
            self.entries.pop_front();
        }
        if self.entries.is_empty() {
            // re-zero so expired samples cannot accumulate float drift
            self.cached_sum = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx_eq(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {} to approximately equal {}",
            actual,
            expected
        );
    }

    #[test]
    fn test_empty_window_means_zero() {
        let mut window = SlidingWindow::new(Duration::from_secs(1));
        assert_approx_eq(window.mean(Instant::now()), 0.0);
        assert_approx_eq(window.sum(Instant::now()), 0.0);
    }

    #[test]
    fn test_mean_and_sum_inside_window() {
        let base = Instant::now();
        let mut window = SlidingWindow::new(Duration::from_secs(1));

        window.record(base, 1.0);
        window.record(base + Duration::from_millis(100), 2.0);
        window.record(base + Duration::from_millis(200), 1.5);

        let query = base + Duration::from_millis(300);
        assert_approx_eq(window.sum(query), 4.5);
        assert_approx_eq(window.mean(query), 1.5);
        assert_eq!(window.len(query), 3);
    }

    #[test]
    fn test_samples_expire() {
        let base = Instant::now();
        let mut window = SlidingWindow::new(Duration::from_secs(1));

        window.record(base, 10.0);
        window.record(base + Duration::from_millis(900), 2.0);
        window.record(base + Duration::from_millis(1100), 4.0);

        // the first sample is now outside the window
        let query = base + Duration::from_millis(1500);
        assert_approx_eq(window.mean(query), 3.0);
        assert_eq!(window.len(query), 2);

        // everything expired
        let query = base + Duration::from_secs(5);
        assert_approx_eq(window.mean(query), 0.0);
        assert_eq!(window.len(query), 0);
    }

    #[test]
    fn test_recording_prunes_expired_samples() {
        let base = Instant::now();
        let mut window = SlidingWindow::new(Duration::from_millis(100));

        window.record(base, 100.0);
        window.record(base + Duration::from_secs(1), 1.0);

        assert_approx_eq(window.sum(base + Duration::from_secs(1)), 1.0);
    }
}
