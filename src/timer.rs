//! Timer Scheduler
//!
//! Owns randomized election deadlines and the fixed tickers driving the
//! heartbeat, health-probe, and purge loops. All time-driven events in the
//! daemon originate here.

use std::time::{Duration, Instant};
use rand::Rng;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Randomized election timer.
///
/// Each deadline is drawn uniformly from `[timeout, 2 * timeout)` and
/// re-randomized on every reset, so peers that time out together do not keep
/// re-electing in lockstep.
#[derive(Debug)]
pub struct ElectionTimer {
    base: Duration,
    deadline: Instant,
}

impl ElectionTimer {
    /// Create a timer with an initial randomized deadline
    pub fn new(base: Duration) -> Self {
        let mut timer = Self {
            base,
            deadline: Instant::now(),
        };
        timer.reset();
        timer
    }

    /// Draw a fresh timeout from `[base, 2 * base)`
    fn draw(base: Duration) -> Duration {
        let min = base.as_millis() as u64;
        let ms = rand::thread_rng().gen_range(min..min * 2);
        Duration::from_millis(ms)
    }

    /// Re-arm the timer with a freshly randomized deadline
    pub fn reset(&mut self) {
        self.deadline = Instant::now() + Self::draw(self.base);
    }

    /// Check whether the current deadline has passed
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time remaining until the deadline (zero if already expired)
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Fixed-period ticker for the heartbeat, health, and purge loops.
///
/// Missed ticks are delayed rather than bursted: a loop stalled behind a slow
/// peer round must not fire a backlog of rounds when it recovers.
pub fn fixed_ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_within_randomized_window() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let drawn = ElectionTimer::draw(base);
            assert!(drawn >= base);
            assert!(drawn < base * 2);
        }
    }

    #[test]
    fn test_reset_rearms() {
        let mut timer = ElectionTimer::new(Duration::from_millis(50));
        assert!(!timer.expired());
        std::thread::sleep(Duration::from_millis(110));
        assert!(timer.expired());

        timer.reset();
        assert!(!timer.expired());
        assert!(timer.remaining() >= Duration::from_millis(40));
    }
}
