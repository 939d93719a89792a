use std::time::{Duration, Instant};

/// A non-decreasing time source used only to measure durations.
pub trait MonotonicClock: Send + Sync {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Positive difference between two clock readings, `None` if the clock did not advance.
pub fn period_between(earlier: Duration, later: Duration) -> Option<Duration> {
    match later.checked_sub(earlier) {
        Some(period) if !period.is_zero() => Some(period),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_requires_strictly_later_reading() {
        let t1 = Duration::from_millis(10);
        let t2 = Duration::from_millis(35);

        assert_eq!(period_between(t1, t2), Some(Duration::from_millis(25)));
        assert_eq!(period_between(t1, t1), None);
        assert_eq!(period_between(t2, t1), None);
    }

    #[test]
    fn system_clock_does_not_go_backwards() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
