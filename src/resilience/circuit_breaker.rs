//! Circuit breaker for broker calls.
//!
//! Each trading worker wraps its broker in a breaker so one venue's
//! outage trips only that worker's loop and never stalls the others.
//!
//! States: **Closed** passes requests through; **Open** blocks them
//! after `failure_threshold` consecutive failures; after `cooldown` a
//! probe request is allowed (**HalfOpen**) and its outcome decides
//! between reopening and closing.
//!
//! The hot path (`allow_request`) is lock-free.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Breaker state, encoded as u32 for atomic storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    state: AtomicU32,
    consecutive_failures: AtomicU32,
    /// Time of the trip, as nanos since `created`.
    opened_at_nanos: AtomicU64,
    created: Instant,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: AtomicU32::new(CircuitState::Closed as u32),
            consecutive_failures: AtomicU32::new(0),
            opened_at_nanos: AtomicU64::new(0),
            created: Instant::now(),
            failure_threshold,
            cooldown,
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Whether a request may proceed now. An open breaker past its
    /// cooldown transitions to half-open and admits one probe.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened = self.opened_at_nanos.load(Ordering::Acquire);
                let elapsed = self.created.elapsed().as_nanos() as u64 - opened;
                if elapsed >= self.cooldown.as_nanos() as u64 {
                    // One winner flips to half-open and probes.
                    let flipped = self
                        .state
                        .compare_exchange(
                            CircuitState::Open as u32,
                            CircuitState::HalfOpen as u32,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok();
                    if flipped {
                        info!("Circuit breaker half-open; probing");
                    }
                    flipped
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let previous = self.state.swap(CircuitState::Closed as u32, Ordering::AcqRel);
        self.consecutive_failures.store(0, Ordering::Release);
        if previous != CircuitState::Closed as u32 {
            info!("Circuit breaker closed after successful probe");
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let half_open = self.state.load(Ordering::Acquire) == CircuitState::HalfOpen as u32;
        if failures >= self.failure_threshold || half_open {
            let previous = self.state.swap(CircuitState::Open as u32, Ordering::AcqRel);
            self.opened_at_nanos
                .store(self.created.elapsed().as_nanos() as u64, Ordering::Release);
            if previous != CircuitState::Open as u32 {
                warn!(
                    consecutive_failures = failures,
                    threshold = self.failure_threshold,
                    "Circuit breaker opened"
                );
            }
        }
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }
}
