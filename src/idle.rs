//! Idle strategies for polling loops
//!
//! Both the conductor tick loop and blocking registration waits spin on
//! shared memory; the strategy decides how aggressively. The default
//! backoff ladder (spin, then yield, then sleep with doubling pauses)
//! trades a little latency after quiet periods for not burning a core.

use std::time::Duration;

/// Policy applied between unproductive polls of a shared-memory resource.
pub trait IdleStrategy: Send {
    /// Record the outcome of one poll; a non-zero `work_count` resets any
    /// accumulated backoff state.
    fn idle(&mut self, work_count: usize);

    /// Reset accumulated backoff state.
    fn reset(&mut self);
}

/// Spin without pausing. Lowest latency, one core pinned.
#[derive(Debug, Default)]
pub struct BusySpinIdleStrategy;

impl IdleStrategy for BusySpinIdleStrategy {
    fn idle(&mut self, _work_count: usize) {
        std::hint::spin_loop();
    }

    fn reset(&mut self) {}
}

/// Sleep a fixed interval whenever a poll comes back empty.
#[derive(Debug)]
pub struct SleepingIdleStrategy {
    interval: Duration,
}

impl SleepingIdleStrategy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl IdleStrategy for SleepingIdleStrategy {
    fn idle(&mut self, work_count: usize) {
        if work_count == 0 {
            std::thread::sleep(self.interval);
        }
    }

    fn reset(&mut self) {}
}

/// Spin, then yield, then sleep with doubling pauses up to a cap.
#[derive(Debug)]
pub struct BackoffIdleStrategy {
    max_spins: u32,
    max_yields: u32,
    min_park: Duration,
    max_park: Duration,
    spins: u32,
    yields: u32,
    park: Duration,
}

impl BackoffIdleStrategy {
    pub fn new(max_spins: u32, max_yields: u32, min_park: Duration, max_park: Duration) -> Self {
        Self {
            max_spins,
            max_yields,
            min_park,
            max_park,
            spins: 0,
            yields: 0,
            park: min_park,
        }
    }
}

impl Default for BackoffIdleStrategy {
    fn default() -> Self {
        Self::new(
            10,
            20,
            Duration::from_micros(50),
            Duration::from_millis(1),
        )
    }
}

impl IdleStrategy for BackoffIdleStrategy {
    fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }

        if self.spins < self.max_spins {
            self.spins += 1;
            std::hint::spin_loop();
        } else if self.yields < self.max_yields {
            self.yields += 1;
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.park);
            self.park = (self.park * 2).min(self.max_park);
        }
    }

    fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park = self.min_park;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_escalates_then_resets() {
        let mut strategy = BackoffIdleStrategy::new(
            2,
            2,
            Duration::from_nanos(1),
            Duration::from_nanos(8),
        );

        for _ in 0..10 {
            strategy.idle(0);
        }
        assert_eq!(strategy.park, Duration::from_nanos(8));

        strategy.idle(1);
        assert_eq!(strategy.spins, 0);
        assert_eq!(strategy.park, Duration::from_nanos(1));
    }
}
