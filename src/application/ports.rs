//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use crate::domain::decision::AdmissionLimits;
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::{Duration, SystemTime};

/// Port for obtaining current wall-clock time.
///
/// Window indices are derived from Unix time, so this is wall time rather
/// than a monotonic instant. Infrastructure provides `SystemClock` and,
/// for tests, `MockClock`.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> SystemTime;
}

/// Error raised by a counter store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store did not answer within the configured bound.
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),
    /// The store could not be reached or refused the command.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with something that could not be interpreted.
    #[error("unexpected counter store reply: {0}")]
    Protocol(String),
    #[cfg(feature = "redis-storage")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// One fixed-window counter touched by a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSlot {
    pub key: String,
    pub ttl: Duration,
}

/// The in-flight marker pushed by a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSlot {
    pub key: String,
    /// Opaque marker value, unique per request.
    pub token: String,
    /// List length kept after the push.
    pub max_len: u64,
    pub ttl: Duration,
}

/// Everything one admission attempt reads and, if admitted, writes.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    /// User minute, user hour, org minute, org hour, then the tier-wide
    /// second counter when `limits` carries a global ceiling.
    pub counters: Vec<CounterSlot>,
    pub queue: QueueSlot,
    /// Limits the current values are evaluated against.
    pub limits: AdmissionLimits,
}

/// Outcome of a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedCounts {
    /// Whether the increments and the marker push were applied.
    pub admitted: bool,
    /// Value of each counter before this request, in reservation order.
    pub counters: Vec<u64>,
    /// Queue length before this request's push.
    pub queue_len: u64,
}

/// Current values of a set of counters and one queue, read without writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeekedCounts {
    pub counters: Vec<u64>,
    pub queue_len: u64,
}

/// Port for the shared coordination store.
///
/// Each method is one atomic batch: either every command in it applies or
/// none does, and no other client observes a partial state.
#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Read every counter and the queue length, evaluate them against
    /// `reservation.limits` with [`AdmissionLimits::evaluate`], and only if
    /// the request is admitted increment every counter (creating it and
    /// refreshing its TTL) and push the queue marker, trimming the list to
    /// `max_len` newest entries.
    ///
    /// A denied reservation writes nothing, so no other client ever counts
    /// a denied request.
    async fn reserve(&self, reservation: &Reservation) -> Result<ReservedCounts, StoreError>;

    /// Remove the oldest marker from a queue.
    async fn pop_marker(&self, queue_key: &str) -> Result<(), StoreError>;

    /// Read counters and a queue length without modifying anything.
    async fn peek(&self, counter_keys: &[String], queue_key: &str)
        -> Result<PeekedCounts, StoreError>;
}
