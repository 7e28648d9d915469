use std::time::Instant;

/// Sliding estimate of a stream's arrival rate.
///
/// Keeps the last `max(round(rate), 1)` inter-arrival intervals (about one
/// second at the declared rate) in a fixed ring with a running sum. The ring
/// starts filled with the nominal interval, so the estimate begins at the
/// declared rate and converges to the true one within a window.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    intervals: Box<[f64]>,
    index: usize,
    running_sum: f64,
    last_arrival: Instant,
}

impl RateEstimator {
    /// `rate_hz` must be positive and finite.
    pub fn new(rate_hz: f64, now: Instant) -> Self {
        let len = (rate_hz.round() as usize).max(1);
        let nominal = 1.0 / rate_hz;
        Self {
            intervals: vec![nominal; len].into_boxed_slice(),
            index: 0,
            running_sum: nominal * len as f64,
            last_arrival: now,
        }
    }

    /// Records an arrival at `at`.
    pub fn observe(&mut self, at: Instant) {
        let dt = at.saturating_duration_since(self.last_arrival).as_secs_f64();
        self.last_arrival = at;

        self.running_sum += dt - self.intervals[self.index];
        self.intervals[self.index] = dt;
        self.index = (self.index + 1) % self.intervals.len();

        // Re-sum once per lap so floating-point drift cannot accumulate.
        if self.index == 0 {
            self.running_sum = self.intervals.iter().sum();
        }
    }

    /// Samples per second over the window. Infinite when every interval in
    /// the window was zero.
    pub fn rate_hz(&self) -> f64 {
        if self.running_sum <= 0.0 {
            return f64::INFINITY;
        }
        self.intervals.len() as f64 / self.running_sum
    }

    pub fn window_len(&self) -> usize {
        self.intervals.len()
    }
}
