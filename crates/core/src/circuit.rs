//! Circuit breaker for external dependencies.
//!
//! Closed → Open after `failure_threshold` consecutive failures; Open →
//! HalfOpen after `cooldown`; HalfOpen → Closed after `success_threshold`
//! probe successes, or back to Open on any probe failure.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
}

/// Failure-rate gate guarding one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Admission check. A tripped circuit short-circuits with
    /// `ProviderUnavailable`; an elapsed cool-down moves to half-open.
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    tracing::info!(circuit = %self.name, "circuit half-open, probing");
                    Ok(())
                } else {
                    Err(Error::ProviderUnavailable {
                        provider: self.name.clone(),
                        message: format!(
                            "circuit open, retry in {}s",
                            (self.config.cooldown - elapsed).as_secs()
                        ),
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.opened_at = None;
                    tracing::info!(circuit = %self.name, "circuit closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!(circuit = %self.name, "probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Run an operation through the breaker. Only infrastructure errors
    /// count as circuit failures; domain errors pass through untouched.
    pub async fn call<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.check()?;
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if err.is_infrastructure() {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(err)
            }
        }
    }
}
