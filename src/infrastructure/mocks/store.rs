//! Counter store doubles.

use crate::application::ports::{
    CounterStore, PeekedCounts, Reservation, ReservedCounts, StoreError,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// A store that is always down.
///
/// Every call fails with `StoreError::Unavailable`; [`calls`](Self::calls)
/// counts how often the store was actually asked.
#[derive(Debug, Default)]
pub struct UnavailableStore {
    calls: AtomicU64,
}

impl UnavailableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[async_trait]
impl CounterStore for UnavailableStore {
    async fn reserve(&self, _reservation: &Reservation) -> Result<ReservedCounts, StoreError> {
        self.fail()
    }

    async fn pop_marker(&self, _queue_key: &str) -> Result<(), StoreError> {
        self.fail()
    }

    async fn peek(
        &self,
        _counter_keys: &[String],
        _queue_key: &str,
    ) -> Result<PeekedCounts, StoreError> {
        self.fail()
    }
}
