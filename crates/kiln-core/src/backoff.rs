use std::time::Duration;

/// Bounded geometric retry schedule shared by every reconnect loop.
///
/// Attempt numbers are zero-based: `delay_for(0)` is the wait after the
/// first failure. Delays never shrink from one attempt to the next and never
/// exceed `cap`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            factor,
            cap,
            max_attempts,
        }
    }

    /// Doubling schedule.
    pub fn doubling(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self::new(base, 2.0, cap, max_attempts)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = if self.factor.is_finite() {
            self.factor.max(1.0)
        } else {
            1.0
        };
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * factor.powi(exp);
        let cap = self.cap.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.cap;
        }
        Duration::from_secs_f64(secs)
    }

    /// Whether a 1-based attempt number is still inside the budget.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Waits between consecutive attempts: one fewer than `max_attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(move |i| self.delay_for(i))
    }
}
