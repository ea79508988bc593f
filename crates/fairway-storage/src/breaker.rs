use std::future::Future;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BreakerError {
    #[error("circuit {name} open for another {remaining_secs}s")]
    Open {
        name: String,
        until: DateTime<Utc>,
        remaining_secs: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cool_down: Duration::minutes(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CircuitState {
    pub consecutive_failures: u32,
    pub open_until: Option<DateTime<Utc>>,
}

impl CircuitState {
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.open_until.is_some_and(|until| now < until)
    }
}

/// Per-source failure counter that short-circuits calls while open.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(CircuitState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().clone()
    }

    pub fn check_at(&self, now: DateTime<Utc>) -> Result<(), BreakerError> {
        let state = self.lock();
        match state.open_until {
            Some(until) if now < until => Err(BreakerError::Open {
                name: self.name.clone(),
                until,
                remaining_secs: (until - now).num_seconds(),
            }),
            _ => Ok(()),
        }
    }

    /// Returns false while the circuit is open. Once the cool-down has passed the
    /// next call is let through; its outcome decides whether the circuit stays closed.
    pub fn allow_at(&self, now: DateTime<Utc>) -> bool {
        !self.lock().is_open_at(now)
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    /// Returns true when this failure opened the circuit.
    pub fn record_failure_at(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.config.threshold.max(1) {
            let until = now
                .checked_add_signed(self.config.cool_down)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            state.open_until = Some(until);
            warn!(breaker = %self.name, %until, "circuit opened");
            return true;
        }
        false
    }

    /// Runs `f` unless the circuit is open, recording the outcome. `None` means skipped.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Option<Result<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow_at(Utc::now()) {
            return None;
        }
        let outcome = f().await;
        match &outcome {
            Ok(_) => self.record_success(),
            Err(_) => {
                self.record_failure_at(Utc::now());
            }
        }
        Some(outcome)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 11, 6, 0, 0).unwrap()
    }

    #[test]
    fn opens_after_threshold_and_closes_after_cool_down() {
        let breaker = CircuitBreaker::new("golfpang", CircuitBreakerConfig::default());
        for _ in 0..4 {
            assert!(!breaker.record_failure_at(t0()));
        }
        assert!(breaker.allow_at(t0()));
        assert!(breaker.record_failure_at(t0()));

        assert!(!breaker.allow_at(t0() + Duration::minutes(1)));
        assert!(!breaker.allow_at(t0() + Duration::seconds(299)));
        assert!(breaker.allow_at(t0() + Duration::minutes(5)));
    }

    #[test]
    fn failure_after_cool_down_reopens_immediately() {
        let breaker = CircuitBreaker::new("golfpang", CircuitBreakerConfig::default());
        for _ in 0..5 {
            breaker.record_failure_at(t0());
        }
        let later = t0() + Duration::minutes(6);
        assert!(breaker.check_at(later).is_ok());
        assert!(breaker.record_failure_at(later));
        match breaker.check_at(later + Duration::seconds(30)) {
            Err(BreakerError::Open { remaining_secs, .. }) => assert_eq!(remaining_secs, 270),
            other => panic!("expected open circuit, got {other:?}"),
        }
    }

    #[test]
    fn cool_down_past_the_calendar_end_saturates() {
        let breaker = CircuitBreaker::new(
            "golfpang",
            CircuitBreakerConfig {
                threshold: 1,
                cool_down: Duration::days(100_000_000),
            },
        );
        assert!(breaker.record_failure_at(t0()));
        assert_eq!(breaker.state().open_until, Some(DateTime::<Utc>::MAX_UTC));
        assert!(!breaker.allow_at(t0() + Duration::weeks(52)));
    }

    #[test]
    fn success_resets_the_counter() {
        let breaker = CircuitBreaker::new("golfpang", CircuitBreakerConfig::default());
        for _ in 0..4 {
            breaker.record_failure_at(t0());
        }
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::default());
        for _ in 0..4 {
            assert!(!breaker.record_failure_at(t0()));
        }
        assert!(breaker.allow_at(t0()));
    }

    #[tokio::test]
    async fn open_circuit_skips_the_call() {
        let breaker = CircuitBreaker::new(
            "golfpang",
            CircuitBreakerConfig {
                threshold: 1,
                cool_down: Duration::minutes(5),
            },
        );
        let counter = AtomicUsize::new(0);
        let attempts = &counter;

        let first = breaker
            .call(|| async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("down")
            })
            .await;
        assert_eq!(first, Some(Err("down")));

        let second = breaker
            .call(|| async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        assert_eq!(second, None);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(breaker.state().open_until.is_some());
    }
}
