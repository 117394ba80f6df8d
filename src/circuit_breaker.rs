//! Circuit breaker + retry policy wrapping fallible upstream calls.
//!
//! The retry policy runs *inside* the breaker's protected call (see spec
//! §4.6 / §9 "Retry / breaker composition") so a whole batch of retries
//! counts as exactly one success/failure for breaker purposes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, warn};

use chrono::{DateTime, Utc};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

/// One named breaker. `threshold` consecutive (net) failures open it;
/// `timeout` is how long it stays open before allowing one trial call.
///
/// Timing runs through an injected [`Clock`] rather than `Instant::now()`
/// directly, so the open -> half-open transition can be driven
/// deterministically in tests with `FixedClock::advance` instead of a
/// real sleep.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            threshold,
            timeout,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
            }),
        }
    }

    /// Returns `true` if a call is currently permitted, transitioning
    /// `Open -> HalfOpen` in place when the timeout has elapsed.
    pub async fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let now = self.clock.now_utc();
                let elapsed = inner
                    .last_failure_at
                    .map(|t| (now - t).to_std().unwrap_or(Duration::MAX))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.timeout {
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
            }
            _ => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
        }
    }

    pub async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.failure_count += 1;
        inner.last_failure_at = Some(self.clock.now_utc());
        match inner.state {
            CircuitState::HalfOpen => {
                warn!(name = %self.name, "breaker trial call failed, reopening");
                inner.state = CircuitState::Open;
            }
            _ => {
                if inner.failure_count >= self.threshold {
                    warn!(name = %self.name, failure_count = inner.failure_count, "breaker threshold exceeded, opening");
                    inner.state = CircuitState::Open;
                }
            }
        }
    }

    pub async fn is_open(&self) -> bool {
        matches!(self.inner.lock().await.state, CircuitState::Open)
    }

    /// 0.0 when closed/half-open, 1.0 when open — matches the
    /// `circuit_breaker_state{dtu}` gauge's binary convention.
    pub async fn gauge_value(&self) -> f64 {
        if self.is_open().await {
            1.0
        } else {
            0.0
        }
    }

    pub async fn record(&self) -> CircuitBreakerRecord {
        let inner = self.inner.lock().await;
        CircuitBreakerRecord {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
        }
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure_at = None;
    }
}

/// Exponential backoff applied inside a breaker's protected call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            min_wait,
            max_wait,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn run<F, Fut, T, E>(&self, name: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut wait = self.min_wait;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt >= self.max_attempts {
                        return Err(e);
                    }
                    warn!(name, attempt, wait_ms = wait.as_millis() as u64, error = %e, "retrying after failure");
                    tokio::time::sleep(wait).await;
                    wait = (wait * 2).min(self.max_wait);
                }
            }
        }
    }
}

pub enum RecoveryOutcome<T, E> {
    Success(T),
    Rejected,
    Exhausted(E),
}

/// Owns one [`CircuitBreaker`] per named upstream, lazily created, and
/// applies a shared [`RetryPolicy`] inside each breaker's protected call.
pub struct ErrorRecovery {
    breakers: StdMutex<HashMap<String, Arc<CircuitBreaker>>>,
    threshold: u32,
    timeout: Duration,
    retry: RetryPolicy,
    use_retry: bool,
    clock: Arc<dyn Clock>,
}

impl ErrorRecovery {
    pub fn new(threshold: u32, timeout: Duration, retry: RetryPolicy, use_retry: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: StdMutex::new(HashMap::new()),
            threshold,
            timeout,
            retry,
            use_retry,
            clock,
        }
    }

    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.threshold, self.timeout, self.clock.clone())))
            .clone()
    }

    pub async fn execute<F, Fut, T, E>(&self, name: &str, f: F) -> RecoveryOutcome<T, E>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let breaker = self.breaker(name);
        if !breaker.try_acquire().await {
            return RecoveryOutcome::Rejected;
        }

        let result = if self.use_retry {
            self.retry.run(name, &f).await
        } else {
            f().await
        };

        match result {
            Ok(v) => {
                breaker.on_success().await;
                RecoveryOutcome::Success(v)
            }
            Err(e) => {
                breaker.on_failure().await;
                error!(name, error = %e, "error recovery exhausted for call");
                RecoveryOutcome::Exhausted(e)
            }
        }
    }
}
