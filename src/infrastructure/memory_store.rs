//! In-process counter store.
//!
//! Implements the same atomic batch semantics as the Redis store behind one
//! mutex: a reservation holds the lock while it reads, evaluates and counts.
//! Expiry is lazy and driven by the injected clock, so tests can move time
//! forward and watch windows roll over.
//!
//! Counts are only shared within one process; use the Redis store when
//! several processes must agree.

use crate::application::ports::{
    Clock, CounterStore, PeekedCounts, Reservation, ReservedCounts, StoreError,
};
use crate::domain::decision::CounterSnapshot;
use crate::infrastructure::clock::SystemClock;
use ahash::AHashMap;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

#[derive(Debug)]
enum Value {
    Counter(i64),
    Queue(VecDeque<String>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: SystemTime,
}

impl Slot {
    fn is_live(&self, now: SystemTime) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    slots: AHashMap<String, Slot>,
}

impl Keyspace {
    /// Drop `key` if it has expired.
    fn expire(&mut self, key: &str, now: SystemTime) {
        if self.slots.get(key).is_some_and(|slot| !slot.is_live(now)) {
            self.slots.remove(key);
        }
    }

    fn counter(&self, key: &str) -> Result<i64, StoreError> {
        match self.slots.get(key).map(|slot| &slot.value) {
            None => Ok(0),
            Some(Value::Counter(n)) => Ok(*n),
            Some(Value::Queue(_)) => Err(wrong_type(key)),
        }
    }

    fn queue_len(&self, key: &str) -> Result<u64, StoreError> {
        match self.slots.get(key).map(|slot| &slot.value) {
            None => Ok(0),
            Some(Value::Queue(q)) => Ok(q.len() as u64),
            Some(Value::Counter(_)) => Err(wrong_type(key)),
        }
    }

    /// Increment a counter and refresh its TTL.
    fn incr(&mut self, key: &str, ttl: Duration, now: SystemTime) -> Result<(), StoreError> {
        let slot = self.slots.entry(key.to_string()).or_insert(Slot {
            value: Value::Counter(0),
            expires_at: now,
        });
        match &mut slot.value {
            Value::Counter(n) => {
                *n += 1;
                slot.expires_at = now + ttl;
                Ok(())
            }
            Value::Queue(_) => Err(wrong_type(key)),
        }
    }

    fn queue_mut(&mut self, key: &str) -> Result<Option<&mut Slot>, StoreError> {
        match self.slots.get_mut(key) {
            None => Ok(None),
            Some(slot) if matches!(slot.value, Value::Queue(_)) => Ok(Some(slot)),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Protocol(format!("key {key} holds the wrong kind of value"))
}

fn non_negative(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

/// Single-process [`CounterStore`].
#[derive(Debug)]
pub struct InMemoryCounterStore {
    keyspace: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store whose TTLs follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Keyspace> {
        self.keyspace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut keyspace = self.lock();
        let before = keyspace.slots.len();
        keyspace.slots.retain(|_, slot| slot.is_live(now));
        before - keyspace.slots.len()
    }

    /// Number of keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current value of a counter, 0 if absent or expired.
    pub fn counter_value(&self, key: &str) -> i64 {
        let now = self.clock.now();
        let mut keyspace = self.lock();
        keyspace.expire(key, now);
        keyspace.counter(key).unwrap_or(0)
    }

    /// Current markers of a queue, oldest first.
    pub fn queue_markers(&self, key: &str) -> Vec<String> {
        let now = self.clock.now();
        let mut keyspace = self.lock();
        keyspace.expire(key, now);
        match keyspace.slots.get(key).map(|slot| &slot.value) {
            Some(Value::Queue(q)) => q.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn reserve(&self, reservation: &Reservation) -> Result<ReservedCounts, StoreError> {
        let now = self.clock.now();
        let mut keyspace = self.lock();

        // Reading every key also validates its type, so a failed batch
        // leaves no trace.
        let mut counters = Vec::with_capacity(reservation.counters.len());
        for slot in &reservation.counters {
            keyspace.expire(&slot.key, now);
            counters.push(non_negative(keyspace.counter(&slot.key)?));
        }
        let queue = &reservation.queue;
        keyspace.expire(&queue.key, now);
        let queue_len = keyspace.queue_len(&queue.key)?;

        let limits = &reservation.limits;
        let snapshot =
            CounterSnapshot::from_counts(&counters, queue_len, limits.global_per_second.is_some())
                .ok_or_else(|| {
                    StoreError::Protocol(format!(
                        "reservation holds {} counters",
                        reservation.counters.len()
                    ))
                })?;
        let admitted = limits.evaluate(&snapshot).is_admit();

        if admitted {
            for slot in &reservation.counters {
                keyspace.incr(&slot.key, slot.ttl, now)?;
            }
            let entry = keyspace.slots.entry(queue.key.clone()).or_insert(Slot {
                value: Value::Queue(VecDeque::new()),
                expires_at: now,
            });
            entry.expires_at = now + queue.ttl;
            if let Value::Queue(markers) = &mut entry.value {
                markers.push_back(queue.token.clone());
                while markers.len() as u64 > queue.max_len {
                    markers.pop_front();
                }
            }
        }

        Ok(ReservedCounts {
            admitted,
            counters,
            queue_len,
        })
    }

    async fn pop_marker(&self, queue_key: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut keyspace = self.lock();
        keyspace.expire(queue_key, now);
        if let Some(slot) = keyspace.queue_mut(queue_key)? {
            if let Value::Queue(markers) = &mut slot.value {
                markers.pop_front();
            }
        }
        Ok(())
    }

    async fn peek(
        &self,
        counter_keys: &[String],
        queue_key: &str,
    ) -> Result<PeekedCounts, StoreError> {
        let now = self.clock.now();
        let mut keyspace = self.lock();

        let mut counters = Vec::with_capacity(counter_keys.len());
        for key in counter_keys {
            keyspace.expire(key, now);
            counters.push(non_negative(keyspace.counter(key)?));
        }
        keyspace.expire(queue_key, now);
        let queue_len = keyspace.queue_len(queue_key)?;

        Ok(PeekedCounts {
            counters,
            queue_len,
        })
    }
}
