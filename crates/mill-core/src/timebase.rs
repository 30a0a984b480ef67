use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
pub struct TimeBase {
    start: Instant,
}

impl TimeBase {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Monotonic microseconds since start.
    pub fn now_us(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    /// Wall-clock microseconds since Unix epoch (for logs and audit only).
    pub fn unix_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or_default()
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of waiting for the next cycle deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    OnTime,
    /// The deadline had already passed by this much.
    Late(Duration),
}

/// Fixed-period deadline tracker for the servo thread.
///
/// Deadlines advance by exactly one period per cycle regardless of how late
/// a cycle ran, so the long-run rate never drifts.
#[derive(Debug, Clone)]
pub struct CycleClock {
    period: Duration,
    next: Instant,
}

impl CycleClock {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Spin until the current deadline, then schedule the next one.
    pub fn wait(&mut self) -> Deadline {
        let now = Instant::now();
        let outcome = if now < self.next {
            while Instant::now() < self.next {
                std::hint::spin_loop();
            }
            Deadline::OnTime
        } else {
            Deadline::Late(now.duration_since(self.next))
        };
        self.next += self.period;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_are_paced_by_period() {
        let mut clock = CycleClock::new(Duration::from_millis(2));
        let start = Instant::now();
        for _ in 0..5 {
            assert_eq!(clock.wait(), Deadline::OnTime);
        }
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn reports_lateness() {
        let mut clock = CycleClock::new(Duration::from_micros(100));
        clock.wait();
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(clock.wait(), Deadline::Late(d) if d >= Duration::from_millis(4)));
    }

    #[test]
    fn monotonic_clock_advances() {
        let tb = TimeBase::new();
        let a = tb.now_us();
        std::thread::sleep(Duration::from_millis(2));
        assert!(tb.now_us() > a);
        assert!(tb.unix_us() > 1_600_000_000_000_000);
    }
}
