//! Circuit breaker guarding an upstream's health probes.
//!
//! The breaker trips after consecutive failed probes and stays open for a
//! recovery timeout. Each time a half-open trial fails the timeout doubles,
//! up to a cap, so a pathologically failing endpoint is probed less and less
//! often. A successful trial closes the breaker and resets the timeout.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Normal operation; probes and new connections are permitted.
    Closed,
    /// Too many failures; probing is suspended.
    Open { since: Instant },
    /// Recovery trial; one round of probes is permitted.
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    failure_threshold: u32,
    base_recovery: Duration,
    max_recovery: Duration,
    recovery_timeout: Duration,
    trips: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, base_recovery: Duration, max_recovery: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            base_recovery,
            max_recovery: max_recovery.max(base_recovery),
            recovery_timeout: base_recovery,
            trips: 0,
        }
    }

    /// Whether a probe may run now. Moves an expired open breaker to half-open.
    pub fn is_call_permitted(&mut self) -> bool {
        self.is_call_permitted_at(Instant::now())
    }

    pub fn is_call_permitted_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open { since } => {
                if now.saturating_duration_since(since) >= self.recovery_timeout {
                    debug!("Circuit breaker transitioning to half-open");
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!(trips = self.trips, "Circuit breaker closing after successful probe");
        }
        self.failure_count = 0;
        self.trips = 0;
        self.recovery_timeout = self.base_recovery;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        match self.state {
            CircuitState::HalfOpen => {
                self.recovery_timeout = (self.recovery_timeout * 2).min(self.max_recovery);
                self.trips += 1;
                warn!(
                    recovery_secs = self.recovery_timeout.as_secs_f64(),
                    trips = self.trips,
                    "Circuit breaker re-opening after failed trial"
                );
                self.state = CircuitState::Open { since: now };
            }
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.trips += 1;
                    warn!(
                        failures = self.failure_count,
                        threshold = self.failure_threshold,
                        "Circuit breaker opening"
                    );
                    self.state = CircuitState::Open { since: now };
                }
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Open { .. })
    }

    /// Current wait before the next half-open trial.
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(10), Duration::from_secs(35))
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = breaker();
        let now = Instant::now();
        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure_at(now);
        assert!(cb.is_open());
        assert!(!cb.is_call_permitted_at(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_half_open_after_recovery_timeout() {
        let mut cb = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(now);
        }
        assert!(cb.is_call_permitted_at(now + Duration::from_secs(10)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_recovery_timeout_doubles_and_caps() {
        let mut cb = breaker();
        let mut now = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(now);
        }
        assert_eq!(cb.recovery_timeout(), Duration::from_secs(10));

        for expected in [20, 35, 35] {
            now += cb.recovery_timeout();
            assert!(cb.is_call_permitted_at(now));
            cb.record_failure_at(now);
            assert!(cb.is_open());
            assert_eq!(cb.recovery_timeout(), Duration::from_secs(expected));
        }

        now += cb.recovery_timeout();
        assert!(cb.is_call_permitted_at(now));
        cb.record_success();
        assert_eq!(cb.recovery_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
