//! Shared LLM pacing ticker.
//!
//! One permit per `period`, shared by every task. Missed ticks are skipped
//! rather than bursted, so in any window of length `T` at most
//! `ceil(T / period) + 1` permits are handed out, however many tasks queue up.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, Interval, MissedTickBehavior};

pub struct PacingTicker {
    ticker: Mutex<Interval>,
}

impl PacingTicker {
    /// Must be called inside a tokio runtime. The first permit is immediate.
    pub fn new(period: Duration) -> Self {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            ticker: Mutex::new(ticker),
        }
    }

    /// Wait for the next permit. Waiters are served in FIFO order.
    pub async fn acquire(&self) {
        let mut ticker = self.ticker.lock().await;
        ticker.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_permits_are_spaced_by_period() {
        let ticker = Arc::new(PacingTicker::new(Duration::from_millis(100)));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let t = Arc::clone(&ticker);
            handles.push(tokio::spawn(async move {
                t.acquire().await;
                Instant::now()
            }));
        }
        let mut times = Vec::new();
        for h in handles {
            times.push(h.await.unwrap() - start);
        }
        times.sort();
        for (i, t) in times.iter().enumerate() {
            assert_eq!(*t, Duration::from_millis(100 * i as u64));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_period_does_not_bank_a_burst() {
        let ticker = PacingTicker::new(Duration::from_millis(100));
        ticker.acquire().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let start = Instant::now();
        for _ in 0..3 {
            ticker.acquire().await;
        }
        // One catch-up permit at most, then back on the 100ms cadence.
        assert!(Instant::now() - start >= Duration::from_millis(100));
    }
}
