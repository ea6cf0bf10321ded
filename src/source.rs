// src/source.rs
//! Collaborator boundary for the external batch collector. The engine never
//! performs network I/O itself; the harness hands it batch text through this
//! trait. Retry behavior is an explicit policy object rather than something
//! hardwired into the engine.

use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::warn;

/// Provider of raw batch text for one tick.
#[async_trait::async_trait]
pub trait BatchSource: Send + Sync {
    async fn fetch_batch(&self) -> Result<String>;
    fn name(&self) -> &'static str;
}

/// Retry/backoff knobs for a `BatchSource`, passed into the harness.
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// How long the breaker stays open before a half-open probe.
    pub open_cooldown: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            failure_threshold: 5,
            open_cooldown: Duration::from_secs(300),
        }
    }
}

impl FetchPolicy {
    /// Delay before the given retry attempt (attempt 0 is the first retry).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        self.initial_backoff.mul_f64(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Minimal circuit breaker over consecutive fetch failures. Closed passes
/// requests through; Open rejects them until the cooldown elapses; the first
/// probe after the cooldown runs HalfOpen, and its outcome decides the state.
#[derive(Debug)]
pub struct CircuitBreaker {
    policy: FetchPolicy,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(policy: FetchPolicy) -> Self {
        Self {
            policy,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a request may go out right now.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| now.duration_since(t))
                    .unwrap_or_default();
                if elapsed >= self.policy.open_cooldown {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        if self.state == CircuitState::HalfOpen
            || self.consecutive_failures >= self.policy.failure_threshold
        {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
        }
    }
}

/// Fetch with retries under the given policy. Intended for the scheduling
/// harness, not the tick hot path.
pub async fn fetch_with_policy(
    source: &dyn BatchSource,
    policy: &FetchPolicy,
    breaker: &mut CircuitBreaker,
) -> Result<String> {
    if !breaker.allow(Instant::now()) {
        anyhow::bail!("circuit open for source {}", source.name());
    }

    let mut last_err = None;
    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.backoff_delay(attempt - 1)).await;
        }
        match source.fetch_batch().await {
            Ok(batch) => {
                breaker.record_success();
                return Ok(batch);
            }
            Err(e) => {
                warn!(
                    source = source.name(),
                    attempt,
                    error = ?e,
                    "batch fetch failed"
                );
                last_err = Some(e);
            }
        }
    }
    breaker.record_failure(Instant::now());
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("fetch failed with no attempts")))
}
