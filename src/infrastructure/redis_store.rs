//! Redis-backed counter store.
//!
//! Lets every process of a deployment share the same counters.
//!
//! ## Layout
//!
//! - Window counters are plain integers (`INCR`) with a TTL refreshed on
//!   every write.
//! - In-flight markers live in one list per organization and category
//!   (`RPUSH`/`LPOP`), trimmed to the newest entries.
//!
//! ## Atomicity
//!
//! A reservation is one Lua script: it reads the counters and the queue
//! length, applies the admission predicate, and only for an admitted request
//! increments the counters and pushes the marker. Redis runs scripts without
//! interleaving other clients, so a denied request is never visible to
//! anyone. Reads are one `MULTI`/`EXEC` pipeline. Connection handling is
//! left to `ConnectionManager`, which reconnects on its own; callers bound
//! each call with a timeout.
//!
//! ## Example
//!
//! ```rust,ignore
//! use admission_gate::{AdmissionEngine, RedisCounterStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = RedisCounterStore::connect("redis://127.0.0.1/")
//!         .await
//!         .expect("Failed to connect to Redis");
//!
//!     let engine = AdmissionEngine::builder()
//!         .with_store(Arc::new(store))
//!         .build()
//!         .unwrap();
//! }
//! ```

use crate::application::ports::{
    CounterStore, PeekedCounts, Reservation, ReservedCounts, StoreError,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::fmt;

/// Conditional reservation.
///
/// KEYS: the counters in reservation order, then the queue.
/// ARGV: counter count, per-minute, per-hour, burst, org per-minute,
/// org per-hour, queue depth, global ceiling (-1 for none), one TTL per
/// counter, marker, negated queue length kept, queue TTL.
///
/// Returns the counter values and queue length read before any write,
/// followed by 1 if the request was admitted and counted, else 0. The
/// predicate mirrors `AdmissionLimits::evaluate`.
const RESERVE_SCRIPT: &str = r"
local n = tonumber(ARGV[1])
local seen = {}
for i = 1, n do
  seen[i] = tonumber(redis.call('GET', KEYS[i]) or '0')
end
local queue_key = KEYS[n + 1]
local queue_len = redis.call('LLEN', queue_key)

local per_minute = tonumber(ARGV[2])
local per_hour = tonumber(ARGV[3])
local burst = tonumber(ARGV[4])
local global = tonumber(ARGV[8])

local violated = seen[1] >= per_minute or seen[2] >= per_hour
  or seen[3] >= tonumber(ARGV[5]) or seen[4] >= tonumber(ARGV[6])
  or queue_len >= tonumber(ARGV[7])
local over_global = global >= 0 and n > 4 and seen[5] >= global
local burst_ok = seen[1] < per_minute + burst and seen[2] < per_hour
local admit = not over_global and (not violated or burst_ok)

if admit then
  for i = 1, n do
    redis.call('INCR', KEYS[i])
    redis.call('EXPIRE', KEYS[i], ARGV[8 + i])
  end
  redis.call('RPUSH', queue_key, ARGV[9 + n])
  redis.call('LTRIM', queue_key, ARGV[10 + n], -1)
  redis.call('EXPIRE', queue_key, ARGV[11 + n])
end

seen[n + 1] = queue_len
seen[n + 2] = admit and 1 or 0
return seen
";

/// Counter store shared through Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    reserve_script: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the first connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(connection))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            reserve_script: Script::new(RESERVE_SCRIPT),
        }
    }

    /// Delete every key under `prefix`. Intended for tests and tooling.
    ///
    /// # Errors
    /// Returns error if a SCAN or DEL fails.
    pub async fn clear_prefix(&self, prefix: &str) -> Result<usize, RedisError> {
        let pattern = format!("{prefix}:*");
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: usize = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += deleted;
            }

            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }
}

fn as_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn reserve(&self, reservation: &Reservation) -> Result<ReservedCounts, StoreError> {
        let limits = &reservation.limits;
        let queue = &reservation.queue;
        let n = reservation.counters.len();

        let mut invocation = self.reserve_script.prepare_invoke();
        for slot in &reservation.counters {
            invocation.key(&slot.key);
        }
        invocation
            .key(&queue.key)
            .arg(n)
            .arg(limits.per_minute)
            .arg(limits.per_hour)
            .arg(limits.burst_allowance)
            .arg(limits.org_per_minute)
            .arg(limits.org_per_hour)
            .arg(limits.queue_depth)
            .arg(limits.global_per_second.map_or(-1, |g| i64::try_from(g).unwrap_or(i64::MAX)));
        for slot in &reservation.counters {
            invocation.arg(slot.ttl.as_secs());
        }
        invocation
            .arg(&queue.token)
            // Keep the newest `max_len` markers.
            .arg(-i64::try_from(queue.max_len).unwrap_or(i64::MAX))
            .arg(queue.ttl.as_secs());

        let mut conn = self.connection.clone();
        let mut replies: Vec<i64> = invocation.invoke_async(&mut conn).await?;

        if replies.len() != n + 2 {
            return Err(StoreError::Protocol(format!(
                "expected {} replies to reservation, got {}",
                n + 2,
                replies.len()
            )));
        }
        let admitted = replies.pop() == Some(1);
        let queue_len = replies.pop().map(as_count).unwrap_or(0);
        Ok(ReservedCounts {
            admitted,
            counters: replies.into_iter().map(as_count).collect(),
            queue_len,
        })
    }

    async fn pop_marker(&self, queue_key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: Option<String> = redis::cmd("LPOP")
            .arg(queue_key)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn peek(
        &self,
        counter_keys: &[String],
        queue_key: &str,
    ) -> Result<PeekedCounts, StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in counter_keys {
            pipe.cmd("GET").arg(key);
        }
        pipe.cmd("LLEN").arg(queue_key);

        let mut conn = self.connection.clone();
        let mut replies: Vec<Option<i64>> = pipe.query_async(&mut conn).await?;

        if replies.len() != counter_keys.len() + 1 {
            return Err(StoreError::Protocol(format!(
                "expected {} replies to peek, got {}",
                counter_keys.len() + 1,
                replies.len()
            )));
        }
        let queue_len = replies.pop().flatten().map(as_count).unwrap_or(0);
        Ok(PeekedCounts {
            counters: replies
                .into_iter()
                .map(|v| v.map(as_count).unwrap_or(0))
                .collect(),
            queue_len,
        })
    }
}
