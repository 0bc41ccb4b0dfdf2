//! In-process fallback limiter.
//!
//! Used when the shared store cannot answer. It keeps a sliding log of
//! request timestamps per user and category and enforces the per-minute and
//! per-hour user limits only; organization, queue and global limits need the
//! shared store and are not applied here.
//!
//! The whole prune-check-append sequence runs under one mutex so concurrent
//! checks in a process never double count.

use crate::application::ports::Clock;
use crate::domain::category::Category;
use crate::domain::decision::{Decision, DecisionSource};
use crate::domain::rule::Rule;
use crate::domain::window::{unix_secs, WindowKind};
use ahash::AHashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3_600);

/// Default minimum wall time between inline sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FallbackKey {
    user_id: String,
    category: Category,
}

#[derive(Debug, Default)]
struct RequestLog {
    minute: VecDeque<SystemTime>,
    hour: VecDeque<SystemTime>,
}

impl RequestLog {
    fn prune(&mut self, now: SystemTime) {
        prune_older_than(&mut self.minute, now, MINUTE);
        prune_older_than(&mut self.hour, now, HOUR);
    }
}

fn prune_older_than(log: &mut VecDeque<SystemTime>, now: SystemTime, window: Duration) {
    while let Some(&oldest) = log.front() {
        let age = now.duration_since(oldest).unwrap_or_default();
        if age > window {
            log.pop_front();
        } else {
            break;
        }
    }
}

#[derive(Debug)]
struct FallbackState {
    logs: AHashMap<FallbackKey, RequestLog>,
    last_sweep: SystemTime,
}

/// Process-local limiter used while the shared store is unavailable.
#[derive(Debug)]
pub struct FallbackLimiter {
    state: Mutex<FallbackState>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
}

impl FallbackLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_sweep_interval(clock, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(clock: Arc<dyn Clock>, sweep_interval: Duration) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(FallbackState {
                logs: AHashMap::new(),
                last_sweep: now,
            }),
            clock,
            sweep_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FallbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide and, on admit, record the request.
    pub fn check(&self, user_id: &str, category: Category, rule: &Rule) -> Decision {
        let now = self.clock.now();
        let mut state = self.lock();

        if elapsed(state.last_sweep, now) >= self.sweep_interval {
            Self::sweep_locked(&mut state, now);
        }

        let log = state
            .logs
            .entry(FallbackKey {
                user_id: user_id.to_string(),
                category,
            })
            .or_default();
        log.prune(now);

        if exceeds(log, rule) {
            return denied(log, rule, now);
        }

        log.minute.push_back(now);
        log.hour.push_back(now);
        admitted(log.minute.len() as u64, rule, now)
    }

    /// Decide without recording anything.
    pub fn preview(&self, user_id: &str, category: Category, rule: &Rule) -> Decision {
        let now = self.clock.now();
        let mut state = self.lock();
        let key = FallbackKey {
            user_id: user_id.to_string(),
            category,
        };
        match state.logs.get_mut(&key) {
            Some(log) => {
                log.prune(now);
                if exceeds(log, rule) {
                    denied(log, rule, now)
                } else {
                    admitted(log.minute.len() as u64 + 1, rule, now)
                }
            }
            None => admitted(1, rule, now),
        }
    }

    /// Drop every log with no request in the last hour.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        Self::sweep_locked(&mut state, now)
    }

    fn sweep_locked(state: &mut FallbackState, now: SystemTime) -> usize {
        let before = state.logs.len();
        state.logs.retain(|_, log| {
            log.prune(now);
            !log.hour.is_empty()
        });
        state.last_sweep = now;
        let removed = before - state.logs.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = state.logs.len(), "Swept fallback limiter");
        }
        removed
    }

    /// Number of tracked (user, category) entries.
    pub fn len(&self) -> usize {
        self.lock().logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn elapsed(since: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(since).unwrap_or_default()
}

fn exceeds(log: &RequestLog, rule: &Rule) -> bool {
    log.minute.len() as u64 >= rule.requests_per_minute
        || log.hour.len() as u64 >= rule.requests_per_hour
}

fn admitted(minute_count: u64, rule: &Rule, now: SystemTime) -> Decision {
    Decision {
        allowed: true,
        limit: rule.requests_per_minute,
        requests_remaining: rule.requests_per_minute.saturating_sub(minute_count),
        reset_time: WindowKind::Minute.next_start(unix_secs(now)),
        retry_after: None,
        queue_depth: 0,
        source: DecisionSource::Fallback,
    }
}

fn denied(log: &RequestLog, rule: &Rule, now: SystemTime) -> Decision {
    // The sliding log frees a slot once its oldest entry in the blocking
    // window ages out.
    let minute_full = log.minute.len() as u64 >= rule.requests_per_minute;
    let (oldest, window) = if minute_full {
        (log.minute.front(), MINUTE)
    } else {
        (log.hour.front(), HOUR)
    };
    let retry_after = oldest
        .map(|t| window.saturating_sub(elapsed(*t, now)).as_secs_f64().ceil() as u64)
        .unwrap_or(1)
        .max(1);

    Decision {
        allowed: false,
        limit: rule.requests_per_minute,
        requests_remaining: rule
            .requests_per_minute
            .saturating_sub(log.minute.len() as u64),
        reset_time: WindowKind::Minute.next_start(unix_secs(now)),
        retry_after: Some(retry_after),
        queue_depth: 0,
        source: DecisionSource::Fallback,
    }
}
