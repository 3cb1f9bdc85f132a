//! Circuit breaker for the LLM transport.
//!
//! Pure state transitions over `{closed, open, half-open}` so the logic
//! is testable without any I/O. The breaker is shared across sessions:
//! one provider, one failure budget.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trips: u64,
}

/// Consecutive-failure circuit breaker with a timed open window.
pub struct CircuitBreaker {
    threshold: u32,
    open_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_timeout: Duration) -> Self {
        Self {
            threshold,
            open_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trips: 0,
            }),
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// An expired open window transitions the breaker to half-open and
    /// lets one probe call through.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let expired = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.open_timeout)
                    .unwrap_or(true);
                if expired {
                    inner.state = BreakerState::HalfOpen;
                    tracing::debug!("circuit breaker half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call. Closes the breaker and zeroes the
    /// failure count from any state.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!("circuit breaker closed after success");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Record a failed call. Trips the breaker once the consecutive
    /// failure count reaches the threshold; a failure in half-open
    /// re-opens immediately.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let should_open = inner.state == BreakerState::HalfOpen
            || inner.consecutive_failures >= self.threshold;
        if should_open && inner.state != BreakerState::Open {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trips += 1;
            tracing::warn!(
                consecutive_failures = inner.consecutive_failures,
                "circuit breaker opened"
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// How many times the breaker has opened.
    pub fn trips(&self) -> u64 {
        self.inner.lock().trips
    }
}
