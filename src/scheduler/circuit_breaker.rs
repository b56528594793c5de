//! Failure gate for the dispatch loop.
//!
//! The breaker counts consecutive dispatch failures. Once the count reaches
//! the threshold the breaker is open and the dispatcher skips iterations.
//! Half-open is implicit: after `timeout` has passed since the last failure
//! `is_open()` reports false again without the counter being cleared, so the
//! next failure reopens it immediately.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Thresholds for the circuit breaker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open after the last failure.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Consecutive-failure circuit breaker.
///
/// Owned by the dispatch loop, so it needs no interior locking.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    failures: u32,
    tripped: bool,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            failures: 0,
            tripped: false,
            last_failure: None,
        }
    }

    /// Counts a failure, opening the breaker once the threshold is reached.
    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(Instant::now());
        if self.failures >= self.config.failure_threshold {
            self.tripped = true;
        }
    }

    /// Clears the failure count and closes the breaker.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.tripped = false;
        self.last_failure = None;
    }

    /// Returns whether dispatching should be skipped right now.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn state(&self) -> CircuitState {
        if !self.tripped {
            return CircuitState::Closed;
        }
        match self.last_failure {
            Some(at) if at.elapsed() < self.config.timeout => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failures
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let mut breaker = breaker(3, 30);

        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert!(breaker.is_open());
        assert_eq!(breaker.failure_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout() {
        let mut breaker = breaker(2, 30);
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // A failure while half-open reopens immediately.
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes() {
        let mut breaker = breaker(1, 30);
        breaker.record_failure();
        assert!(breaker.is_open());

        breaker.reset();
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }
}
