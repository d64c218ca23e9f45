//! Off-ledger settlement backend
//!
//! The in-memory ledger is the source of truth for balances. A backend (an
//! on-chain escrow, a payment processor) can mirror each release, refund and
//! dispute as a secondary record. Backend calls go through a
//! [`CircuitBreaker`] so a failing backend is skipped instead of slowing
//! every settlement down.

use std::time::{Duration, Instant};

use agora_types::TaskId;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BackendError;

/// Secondary settlement record keyed by task
#[async_trait]
pub trait SettlementBackend: Send + Sync {
    /// Returns the backend's transaction reference
    async fn release(&self, task: &TaskId) -> Result<String, BackendError>;

    async fn refund(&self, task: &TaskId) -> Result<String, BackendError>;

    async fn dispute(&self, task: &TaskId, reason: &str) -> Result<String, BackendError>;

    fn is_enabled(&self) -> bool;
}

/// Backend for deployments without off-ledger settlement
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledBackend;

#[async_trait]
impl SettlementBackend for DisabledBackend {
    async fn release(&self, _task: &TaskId) -> Result<String, BackendError> {
        Err(disabled())
    }

    async fn refund(&self, _task: &TaskId) -> Result<String, BackendError> {
        Err(disabled())
    }

    async fn dispute(&self, _task: &TaskId, _reason: &str) -> Result<String, BackendError> {
        Err(disabled())
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

fn disabled() -> BackendError {
    BackendError::Unavailable {
        message: "settlement backend disabled".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    /// Cooldown elapsed; the next call is a trial
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// Opens after `threshold` consecutive failures and lets a trial call through
/// once `cooldown` has passed
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooled = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.cooldown);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                }
                cooled
            }
        }
    }

    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock();
        if success {
            inner.consecutive_failures = 0;
            if inner.state != BreakerState::Closed {
                info!("Settlement backend recovered, closing circuit");
            }
            inner.state = BreakerState::Closed;
            return;
        }

        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());
        let trip = inner.state == BreakerState::HalfOpen || inner.consecutive_failures >= self.threshold;
        if trip && inner.state != BreakerState::Open {
            warn!(
                failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs_f64(),
                "Opening settlement backend circuit"
            );
            metrics::counter!("agora_settlement_breaker_opened_total").increment(1);
            inner.state = BreakerState::Open;
        }
    }

    /// Run `call` unless the circuit is open
    pub async fn call<T, F>(&self, call: F) -> Result<T, BackendError>
    where
        F: std::future::Future<Output = Result<T, BackendError>>,
    {
        if !self.allow_request() {
            return Err(BackendError::CircuitOpen);
        }
        let result = call.await;
        self.record(result.is_ok());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record(false);
        breaker.record(false);
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record(true);
        breaker.record(false);
        breaker.record(false);
        assert!(breaker.allow_request());
        breaker.record(false);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_half_open_trial_call() {
        let breaker = CircuitBreaker::new(1, Duration::ZERO);
        breaker.record(false);
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record(false);
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(breaker.allow_request());
        breaker.record(true);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_call_short_circuits_when_open() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        let first: Result<(), _> = breaker.call(async { Err(disabled()) }).await;
        assert!(first.is_err());

        let second = breaker.call(async { Ok::<_, BackendError>("tx-1".to_string()) }).await;
        assert_eq!(second, Err(BackendError::CircuitOpen));
    }

    #[tokio::test]
    async fn test_disabled_backend() {
        let backend = DisabledBackend;
        assert!(!backend.is_enabled());
        assert!(backend.release(&TaskId::new("t")).await.is_err());
    }
}
