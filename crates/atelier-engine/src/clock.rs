use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

/// Monotonic time source plus the single sleep primitive the retry loop suspends on.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl Default for TokioClock {
    fn default() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Clock that never blocks: `sleep` advances time instantly and is recorded.
#[derive(Debug, Default)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug, Default)]
struct ManualState {
    now: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.now += by;
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .map(|state| state.sleeps.clone())
            .unwrap_or_default()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().into_iter().sum()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.state
            .lock()
            .map(|state| state.now)
            .unwrap_or_default()
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.now += duration;
            state.sleeps.push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Clock, ManualClock, TokioClock};

    #[tokio::test]
    async fn manual_clock_records_and_advances() {
        let clock = ManualClock::new();
        clock.sleep(Duration::from_secs(8)).await;
        clock.advance(Duration::from_millis(500));
        clock.sleep(Duration::from_secs(12)).await;
        assert_eq!(clock.now(), Duration::from_millis(20_500));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(8), Duration::from_secs(12)]
        );
        assert_eq!(clock.total_slept(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_runtime_time() {
        let clock = TokioClock::default();
        clock.sleep(Duration::from_secs(30)).await;
        assert!(clock.now() >= Duration::from_secs(30));
    }
}
