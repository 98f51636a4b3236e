use std::time::Duration;

use crate::tasks::TaskKind;

pub const LOADING_GROWTH: f64 = 1.5;
pub const RATE_LIMIT_GROWTH: f64 = 2.0;

/// Retry constants for one task kind. The numbers are tunable; only the shape of the policy is fixed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub loading_growth: f64,
    pub rate_limit_growth: f64,
    pub max_retries: u32,
    pub total_budget: Duration,
}

impl RetryPolicy {
    pub fn for_task(task: TaskKind) -> Self {
        let (initial_s, max_s, max_retries, budget_s) = match task {
            TaskKind::TextGeneration | TaskKind::Chat => (8, 30, 5, 120),
            TaskKind::ImageGeneration => (10, 60, 8, 300),
            TaskKind::SpeechToText | TaskKind::TextToSpeech => (10, 45, 6, 180),
            TaskKind::VisionTask => (8, 30, 5, 150),
        };
        Self {
            initial_delay: Duration::from_secs(initial_s),
            max_delay: Duration::from_secs(max_s),
            loading_growth: LOADING_GROWTH,
            rate_limit_growth: RATE_LIMIT_GROWTH,
            max_retries,
            total_budget: Duration::from_secs(budget_s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Loading,
    RateLimited,
}

/// Per-candidate backoff state. Loading and rate-limit delays grow independently.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    next_loading: Duration,
    next_rate_limited: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            next_loading: policy.initial_delay.min(policy.max_delay),
            next_rate_limited: policy.initial_delay.min(policy.max_delay),
        }
    }

    /// Returns the wait before the next retry and advances the growth for `kind`.
    /// A provider hint replaces the computed delay but is still capped.
    pub fn next_wait(&mut self, kind: BackoffKind, hint: Option<Duration>) -> Duration {
        let max = self.policy.max_delay;
        let (slot, growth) = match kind {
            BackoffKind::Loading => (&mut self.next_loading, self.policy.loading_growth),
            BackoffKind::RateLimited => (&mut self.next_rate_limited, self.policy.rate_limit_growth),
        };
        let computed = *slot;
        *slot = computed.mul_f64(growth).min(max);
        hint.unwrap_or(computed).min(max)
    }
}
