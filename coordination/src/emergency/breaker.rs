//! Per-operation circuit breakers.
//!
//! A breaker is created the first time a failure is recorded for an
//! operation name. Consecutive failures reaching the threshold *open* it;
//! once the cooldown has passed since the last failure it reads as
//! *half-open*, and the next outcome decides: a success closes it, a
//! failure opens it again.
//!
//! The half-open transition is evaluated whenever the state is observed,
//! so no background timer is needed. [`CircuitBreakers::note_half_open`]
//! reports the first observation of each half-open period so callers can
//! audit it.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Circuit breaker state for a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Healthy, calls allowed.
    Closed,
    /// Tripped, calls refused until the cooldown expires.
    Open,
    /// Cooldown expired, the next call tests recovery.
    HalfOpen,
}

/// What a recorded failure did to the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still closed; `failures` consecutive so far
    Counted { failures: u32 },
    /// This failure opened the breaker
    Tripped { failures: u32 },
    /// Already open; the cooldown restarts
    StillOpen { failures: u32 },
}

impl FailureOutcome {
    pub fn tripped(&self) -> bool {
        matches!(self, Self::Tripped { .. })
    }
}

#[derive(Debug, Clone)]
struct Breaker {
    failures: u32,
    open: bool,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    /// The current half-open period has already been reported
    half_open_noted: bool,
}

/// Observable breaker state for snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Breaker table keyed by operation name
#[derive(Debug, Clone)]
pub struct CircuitBreakers {
    breakers: HashMap<String, Breaker>,
    /// Consecutive failures before a breaker opens.
    pub max_failures: u32,
    /// Time after the last failure before Open reads as HalfOpen.
    pub cooldown: Duration,
}

impl CircuitBreakers {
    pub fn new(max_failures: u32, cooldown: Duration) -> Self {
        Self {
            breakers: HashMap::new(),
            max_failures: max_failures.max(1),
            cooldown,
        }
    }

    fn state_of(&self, breaker: &Breaker) -> CircuitState {
        if !breaker.open {
            return CircuitState::Closed;
        }
        match breaker.last_failure {
            Some(at) if at.elapsed() >= self.cooldown => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }

    /// Current state of the breaker for `operation`.
    pub fn state(&self, operation: &str) -> CircuitState {
        self.breakers
            .get(operation)
            .map_or(CircuitState::Closed, |b| self.state_of(b))
    }

    /// Whether calls to `operation` are refused right now.
    pub fn is_open(&self, operation: &str) -> bool {
        self.state(operation) == CircuitState::Open
    }

    /// Consecutive failures recorded for `operation`.
    pub fn failure_count(&self, operation: &str) -> u32 {
        self.breakers.get(operation).map_or(0, |b| b.failures)
    }

    /// Mark the half-open period of `operation` as seen. Returns `true`
    /// only the first time it is called during a given half-open period.
    pub fn note_half_open(&mut self, operation: &str) -> bool {
        if self.state(operation) != CircuitState::HalfOpen {
            return false;
        }
        match self.breakers.get_mut(operation) {
            Some(breaker) if !breaker.half_open_noted => {
                breaker.half_open_noted = true;
                true
            }
            _ => false,
        }
    }

    /// Record a failure. Reaching the threshold, or failing the half-open
    /// call, opens the breaker.
    pub fn record_failure(&mut self, operation: &str) -> FailureOutcome {
        let before = self.state(operation);
        let max_failures = self.max_failures;
        let breaker = self
            .breakers
            .entry(operation.to_string())
            .or_insert(Breaker {
                failures: 0,
                open: false,
                last_failure: None,
                last_failure_at: None,
                half_open_noted: false,
            });

        breaker.failures = breaker.failures.saturating_add(1);
        breaker.last_failure = Some(Instant::now());
        breaker.last_failure_at = Some(Utc::now());
        let failures = breaker.failures;

        match before {
            CircuitState::Open => FailureOutcome::StillOpen { failures },
            CircuitState::HalfOpen => {
                breaker.open = true;
                breaker.half_open_noted = false;
                FailureOutcome::Tripped { failures }
            }
            CircuitState::Closed if failures >= max_failures => {
                breaker.open = true;
                breaker.half_open_noted = false;
                FailureOutcome::Tripped { failures }
            }
            CircuitState::Closed => FailureOutcome::Counted { failures },
        }
    }

    /// Record a success. Closes a half-open breaker and clears the
    /// consecutive-failure count of a closed one; an open breaker ignores
    /// it. Returns `true` when a half-open breaker closed.
    pub fn record_success(&mut self, operation: &str) -> bool {
        let state = self.state(operation);
        let Some(breaker) = self.breakers.get_mut(operation) else {
            return false;
        };
        match state {
            CircuitState::HalfOpen => {
                breaker.open = false;
                breaker.failures = 0;
                breaker.half_open_noted = false;
                true
            }
            CircuitState::Closed => {
                breaker.failures = 0;
                false
            }
            CircuitState::Open => false,
        }
    }

    /// Force `operation` back to closed. Returns `false` if no breaker exists.
    pub fn reset(&mut self, operation: &str) -> bool {
        match self.breakers.get_mut(operation) {
            Some(breaker) => {
                breaker.open = false;
                breaker.failures = 0;
                breaker.last_failure = None;
                breaker.last_failure_at = None;
                breaker.half_open_noted = false;
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|(op, b)| {
                (
                    op.clone(),
                    BreakerSnapshot {
                        state: self.state_of(b),
                        failures: b.failures,
                        last_failure_at: b.last_failure_at,
                    },
                )
            })
            .collect()
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreakers::default();
        assert_eq!(cb.state("analysis"), CircuitState::Closed);
        assert!(!cb.is_open("analysis"));
        assert!(cb.snapshot().is_empty());
    }

    #[test]
    fn test_circuit_opens_at_threshold() {
        let mut cb = CircuitBreakers::new(3, Duration::from_secs(9999));
        assert_eq!(
            cb.record_failure("rpc"),
            FailureOutcome::Counted { failures: 1 }
        );
        cb.record_failure("rpc");
        assert_eq!(cb.state("rpc"), CircuitState::Closed);
        assert!(cb.record_failure("rpc").tripped());
        assert_eq!(cb.state("rpc"), CircuitState::Open);
        assert_eq!(
            cb.record_failure("rpc"),
            FailureOutcome::StillOpen { failures: 4 }
        );
    }

    #[test]
    fn test_success_clears_closed_count() {
        let mut cb = CircuitBreakers::new(3, Duration::from_secs(9999));
        cb.record_failure("rpc");
        cb.record_failure("rpc");
        assert!(!cb.record_success("rpc"));
        assert_eq!(cb.failure_count("rpc"), 0);
        cb.record_failure("rpc");
        assert_eq!(cb.state("rpc"), CircuitState::Closed);
    }

    #[test]
    fn test_success_ignored_while_open() {
        let mut cb = CircuitBreakers::new(1, Duration::from_secs(9999));
        cb.record_failure("rpc");
        assert!(!cb.record_success("rpc"));
        assert_eq!(cb.state("rpc"), CircuitState::Open);
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let mut cb = CircuitBreakers::new(1, Duration::ZERO);
        cb.record_failure("rpc");
        assert_eq!(cb.state("rpc"), CircuitState::HalfOpen);
        assert!(!cb.is_open("rpc"));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut cb = CircuitBreakers::new(5, Duration::ZERO);
        for _ in 0..5 {
            cb.record_failure("rpc");
        }
        assert_eq!(cb.state("rpc"), CircuitState::HalfOpen);
        assert!(cb.record_failure("rpc").tripped());
    }

    #[test]
    fn test_half_open_noted_once_per_period() {
        let mut cb = CircuitBreakers::new(1, Duration::ZERO);
        assert!(!cb.note_half_open("rpc"));
        cb.record_failure("rpc");
        assert!(cb.note_half_open("rpc"));
        assert!(!cb.note_half_open("rpc"));

        // Failing the half-open call starts a new period.
        assert!(cb.record_failure("rpc").tripped());
        assert!(cb.note_half_open("rpc"));
    }

    #[test]
    fn test_reset() {
        let mut cb = CircuitBreakers::new(1, Duration::from_secs(9999));
        assert!(!cb.reset("rpc"));
        cb.record_failure("rpc");
        assert!(cb.reset("rpc"));
        assert_eq!(cb.state("rpc"), CircuitState::Closed);
        let snap = cb.snapshot();
        assert_eq!(snap["rpc"].failures, 0);
        assert_eq!(snap["rpc"].last_failure_at, None);
    }
}
