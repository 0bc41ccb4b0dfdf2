//! Circuit breaker around the shared counter store.
//!
//! After a run of consecutive store failures the circuit opens and the engine
//! stops calling the store, answering from the in-process fallback instead.
//! Once the recovery timeout has passed a single trial call is let through
//! (half-open) while every other check stays on the fallback; the trial's
//! outcome closes or reopens the circuit. A trial that never reports back
//! is replaced after another recovery timeout.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Store calls proceed normally
    Closed = 0,
    /// Store is considered down; calls are skipped
    Open = 1,
    /// One trial call is testing recovery; other calls are skipped
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive store failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial is allowed
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

const NO_TRIAL: u64 = u64::MAX;

/// Lock-free circuit breaker shared by all admission checks of a process.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    last_failure_nanos: AtomicU64,
    /// When the in-flight half-open trial started, or `NO_TRIAL`.
    trial_started_nanos: AtomicU64,
    config: CircuitBreakerConfig,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU64::new(0),
            last_failure_nanos: AtomicU64::new(0),
            trial_started_nanos: AtomicU64::new(NO_TRIAL),
            config,
            epoch: Instant::now(),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Whether the next admission check should try the store.
    ///
    /// Returns `false` while the circuit is open, and in half-open for every
    /// caller but the one trial; those callers are served from the fallback
    /// path.
    pub fn allow_store_call(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => self.claim_trial(),
            CircuitState::Open => {
                let elapsed = Instant::now().saturating_duration_since(self.last_failure());
                if elapsed < self.config.recovery_timeout || !self.claim_trial() {
                    return false;
                }
                // A late success may already have closed the circuit.
                let _ = self.state.compare_exchange(
                    CircuitState::Open as u8,
                    CircuitState::HalfOpen as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                true
            }
        }
    }

    /// Take the trial slot if it is free or its holder went quiet.
    fn claim_trial(&self) -> bool {
        let now = self.elapsed_nanos();
        let current = self.trial_started_nanos.load(Ordering::Acquire);
        if current != NO_TRIAL {
            let running = Duration::from_nanos(now.saturating_sub(current));
            if running < self.config.recovery_timeout {
                return false;
            }
        }
        self.trial_started_nanos
            .compare_exchange(current, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release_trial(&self) {
        self.trial_started_nanos.store(NO_TRIAL, Ordering::Release);
    }

    pub fn record_success(&self) {
        if self.state() != CircuitState::Open {
            self.consecutive_failures.store(0, Ordering::Release);
            self.state
                .store(CircuitState::Closed as u8, Ordering::Release);
            self.release_trial();
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_failure_nanos
            .store(self.elapsed_nanos(), Ordering::Release);

        match self.state() {
            CircuitState::HalfOpen => {
                tracing::warn!("Counter store trial call failed, circuit reopened");
                self.state
                    .store(CircuitState::Open as u8, Ordering::Release);
                self.release_trial();
            }
            CircuitState::Closed if failures >= u64::from(self.config.failure_threshold) => {
                tracing::warn!(
                    failures,
                    recovery_timeout = ?self.config.recovery_timeout,
                    "Counter store circuit opened, serving from fallback"
                );
                self.state
                    .store(CircuitState::Open as u8, Ordering::Release);
            }
            _ => {}
        }
    }

    fn elapsed_nanos(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.epoch)
            .as_nanos()
            .try_into()
            .unwrap_or(NO_TRIAL - 1)
    }

    fn last_failure(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.last_failure_nanos.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.release_trial();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
