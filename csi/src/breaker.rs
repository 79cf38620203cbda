//! Per-volume circuit breaker. Placed around format+mount
//! (and health-check) in `NodeStageVolume` for filesystem volumes only —
//! connect retries are already bounded, and the breaker's job is to
//! suppress mount-storm amplification when a filesystem is corrupt, not to
//! paper over transient connection errors.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

const FAILURE_THRESHOLD: u32 = 3;
const COOLING_PERIOD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Record {
    state: State,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl Default for Record {
    fn default() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            open_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerError;

impl std::fmt::Display for BreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circuit breaker open; see the persistent volume's reset-circuit-breaker annotation")
    }
}

impl std::error::Error for BreakerError {}

/// Per-volume failure-rate limiter. `N` and the cooling period are fixed
/// at the spec's defaults (3 failures, 5 minute cooldown); a future
/// revision could make them configurable per breaker instance if an
/// operator ever needs that.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooling_period: Duration,
    records: Mutex<HashMap<String, Record>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD, COOLING_PERIOD)
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooling_period: Duration) -> Self {
        Self {
            failure_threshold,
            cooling_period,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Run `op` through the breaker for `volume_id`. Returns `Ok(Err(BreakerError))`-shaped
    /// behavior via a plain `Result`: an open breaker fails immediately
    /// without calling `op` at all (no I/O, matching the testable
    /// property).
    pub async fn call<F, Fut, T, E>(&self, volume_id: &str, op: F) -> std::result::Result<T, BreakerOutcome<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
    {
        if !self.permit(volume_id) {
            return Err(BreakerOutcome::Open);
        }

        match op().await {
            Ok(value) => {
                self.record_success(volume_id);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(volume_id);
                Err(BreakerOutcome::OperationFailed(err))
            }
        }
    }

    /// Is a call currently permitted? Transitions Open -> HalfOpen when the
    /// cooling period has elapsed, consuming the single HalfOpen probe
    /// slot for this caller.
    fn permit(&self, volume_id: &str) -> bool {
        let mut records = self.records.lock();
        let record = records.entry(volume_id.to_string()).or_default();
        match record.state {
            State::Closed => true,
            State::HalfOpen => false, // a probe is already in flight
            State::Open => {
                let Some(open_until) = record.open_until else {
                    return true;
                };
                if Instant::now() >= open_until {
                    record.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self, volume_id: &str) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(volume_id) {
            if record.state != State::Closed {
                info!(volume_id, "circuit breaker closing after successful probe");
            }
            record.state = State::Closed;
            record.consecutive_failures = 0;
            record.open_until = None;
        }
    }

    fn record_failure(&self, volume_id: &str) {
        let mut records = self.records.lock();
        let record = records.entry(volume_id.to_string()).or_default();
        record.consecutive_failures += 1;
        if record.state == State::HalfOpen || record.consecutive_failures >= self.failure_threshold {
            record.state = State::Open;
            record.open_until = Some(Instant::now() + self.cooling_period);
            warn!(volume_id, failures = record.consecutive_failures, "circuit breaker open");
        }
    }

    pub fn state(&self, volume_id: &str) -> State {
        self.records
            .lock()
            .get(volume_id)
            .map(|r| r.state)
            .unwrap_or(State::Closed)
    }

    /// Operator reset via the `reset-circuit-breaker=true` annotation on
    /// the persistent volume. Clears the record entirely.
    pub fn reset(&self, volume_id: &str) {
        if self.records.lock().remove(volume_id).is_some() {
            info!(volume_id, "circuit breaker reset by operator annotation");
        }
    }
}

#[derive(Debug)]
pub enum BreakerOutcome<E> {
    Open,
    OperationFailed(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(300));
        for _ in 0..3 {
            let result: std::result::Result<(), BreakerOutcome<&str>> =
                breaker.call("pvc-aaa", || async { Err("boom") }).await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state("pvc-aaa"), State::Open);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_calling_op() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(300));
        let _: std::result::Result<(), BreakerOutcome<&str>> =
            breaker.call("pvc-aaa", || async { Err("boom") }).await;
        assert_eq!(breaker.state("pvc-aaa"), State::Open);

        let mut called = false;
        let result: std::result::Result<(), BreakerOutcome<&str>> = breaker
            .call("pvc-aaa", || {
                called = true;
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(BreakerOutcome::Open)));
        assert!(!called);
    }

    #[tokio::test]
    async fn half_open_closes_on_success() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        let _: std::result::Result<(), BreakerOutcome<&str>> =
            breaker.call("pvc-aaa", || async { Err("boom") }).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let result: std::result::Result<(), BreakerOutcome<&str>> =
            breaker.call("pvc-aaa", || async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state("pvc-aaa"), State::Closed);
    }

    #[tokio::test]
    async fn half_open_reopens_on_failure() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        let _: std::result::Result<(), BreakerOutcome<&str>> =
            breaker.call("pvc-aaa", || async { Err("boom") }).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let result: std::result::Result<(), BreakerOutcome<&str>> =
            breaker.call("pvc-aaa", || async { Err("boom again") }).await;
        assert!(result.is_err());
        assert_eq!(breaker.state("pvc-aaa"), State::Open);
    }

    #[test]
    fn operator_reset_clears_open_record() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(300));
        breaker.record_failure("pvc-aaa");
        assert_eq!(breaker.state("pvc-aaa"), State::Open);
        breaker.reset("pvc-aaa");
        assert_eq!(breaker.state("pvc-aaa"), State::Closed);
    }
}
