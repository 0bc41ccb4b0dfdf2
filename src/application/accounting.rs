//! Decision accounting for monitoring.
//!
//! Counts decisions per user, organization and category and keeps a rolling
//! latency sample per category. Accounting never feeds back into admission.
//!
//! Keyed counters grow with the number of distinct callers; call
//! [`DecisionAccounting::reset`] periodically to bound them.

use crate::domain::category::Category;
use crate::domain::decision::{Decision, DecisionSource};
use crate::domain::identity::CallerIdentity;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latency samples kept per category.
pub const LATENCY_SAMPLE_CAP: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AccountingKey {
    User(String),
    Org(String),
    Category(Category),
}

#[derive(Debug, Default)]
struct KeyCounters {
    total: AtomicU64,
    denied: AtomicU64,
}

impl KeyCounters {
    fn tally(&self) -> Tally {
        Tally {
            total: self.total.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        }
    }
}

/// Request and denial counts for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub total: u64,
    pub denied: u64,
}

impl Tally {
    /// Denials over total, 0.0 when nothing was recorded.
    pub fn hit_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.denied as f64 / self.total as f64
        }
    }
}

/// Thread-safe decision counters. Clones share the same state.
#[derive(Debug, Clone)]
pub struct DecisionAccounting {
    inner: Arc<AccountingInner>,
}

#[derive(Debug)]
struct AccountingInner {
    started: Instant,
    allowed: AtomicU64,
    denied: AtomicU64,
    /// Decisions served by the in-process fallback
    fallback: AtomicU64,
    /// Decisions failed closed because the store was down
    strict: AtomicU64,
    /// Requests admitted without a check (identity unresolved)
    bypassed: AtomicU64,
    store_errors: AtomicU64,
    keys: DashMap<AccountingKey, KeyCounters>,
    latencies: DashMap<Category, VecDeque<Duration>>,
}

impl DecisionAccounting {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AccountingInner {
                started: Instant::now(),
                allowed: AtomicU64::new(0),
                denied: AtomicU64::new(0),
                fallback: AtomicU64::new(0),
                strict: AtomicU64::new(0),
                bypassed: AtomicU64::new(0),
                store_errors: AtomicU64::new(0),
                keys: DashMap::new(),
                latencies: DashMap::new(),
            }),
        }
    }

    /// Record one decision and how long it took.
    pub fn record(
        &self,
        identity: &CallerIdentity,
        category: Category,
        decision: &Decision,
        latency: Duration,
    ) {
        let inner = &self.inner;
        if decision.allowed {
            inner.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.denied.fetch_add(1, Ordering::Relaxed);
        }
        match decision.source {
            DecisionSource::Shared => {}
            DecisionSource::Fallback => {
                inner.fallback.fetch_add(1, Ordering::Relaxed);
            }
            DecisionSource::Strict => {
                inner.strict.fetch_add(1, Ordering::Relaxed);
            }
        }

        for key in [
            AccountingKey::User(identity.user_id.clone()),
            AccountingKey::Org(identity.org_id.clone()),
            AccountingKey::Category(category),
        ] {
            let counters = inner.keys.entry(key).or_default();
            counters.total.fetch_add(1, Ordering::Relaxed);
            if !decision.allowed {
                counters.denied.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut samples = inner.latencies.entry(category).or_default();
        if samples.len() == LATENCY_SAMPLE_CAP {
            samples.pop_front();
        }
        samples.push_back(latency);
    }

    /// Record a request admitted without a check.
    pub fn record_bypass(&self) {
        self.inner.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_error(&self) {
        self.inner.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn allowed(&self) -> u64 {
        self.inner.allowed.load(Ordering::Relaxed)
    }

    pub fn denied(&self) -> u64 {
        self.inner.denied.load(Ordering::Relaxed)
    }

    pub fn fallback_decisions(&self) -> u64 {
        self.inner.fallback.load(Ordering::Relaxed)
    }

    pub fn bypassed(&self) -> u64 {
        self.inner.bypassed.load(Ordering::Relaxed)
    }

    pub fn store_errors(&self) -> u64 {
        self.inner.store_errors.load(Ordering::Relaxed)
    }

    pub fn user(&self, user_id: &str) -> Tally {
        self.tally(&AccountingKey::User(user_id.to_string()))
    }

    pub fn org(&self, org_id: &str) -> Tally {
        self.tally(&AccountingKey::Org(org_id.to_string()))
    }

    pub fn category(&self, category: Category) -> Tally {
        self.tally(&AccountingKey::Category(category))
    }

    fn tally(&self, key: &AccountingKey) -> Tally {
        self.inner
            .keys
            .get(key)
            .map(|c| c.tally())
            .unwrap_or_default()
    }

    /// Point-in-time view of everything recorded since the last reset.
    pub fn summary(&self) -> AccountingSummary {
        let inner = &self.inner;
        let mut categories = BTreeMap::new();
        for category in Category::ALL {
            let tally = self.category(category);
            let latency = inner
                .latencies
                .get(&category)
                .map(|s| LatencySummary::from_samples(s.iter().copied()))
                .unwrap_or_default();
            if tally.total == 0 && latency.samples == 0 {
                continue;
            }
            categories.insert(
                category,
                CategorySummary {
                    total: tally.total,
                    denied: tally.denied,
                    hit_rate: tally.hit_rate(),
                    latency,
                },
            );
        }

        AccountingSummary {
            uptime_secs: inner.started.elapsed().as_secs(),
            total_requests: self.allowed().saturating_add(self.denied()),
            allowed: self.allowed(),
            denied: self.denied(),
            fallback_decisions: self.fallback_decisions(),
            strict_denials: inner.strict.load(Ordering::Relaxed),
            bypassed: self.bypassed(),
            store_errors: self.store_errors(),
            active_keys: inner.keys.len(),
            categories,
        }
    }

    /// Clear counters and latency samples. Uptime keeps running.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.allowed.store(0, Ordering::Relaxed);
        inner.denied.store(0, Ordering::Relaxed);
        inner.fallback.store(0, Ordering::Relaxed);
        inner.strict.store(0, Ordering::Relaxed);
        inner.bypassed.store(0, Ordering::Relaxed);
        inner.store_errors.store(0, Ordering::Relaxed);
        inner.keys.clear();
        inner.latencies.clear();
    }
}

impl Default for DecisionAccounting {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable accounting report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountingSummary {
    pub uptime_secs: u64,
    pub total_requests: u64,
    pub allowed: u64,
    pub denied: u64,
    pub fallback_decisions: u64,
    pub strict_denials: u64,
    pub bypassed: u64,
    pub store_errors: u64,
    /// Distinct user, org and category keys being counted
    pub active_keys: usize,
    pub categories: BTreeMap<Category, CategorySummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySummary {
    pub total: u64,
    pub denied: u64,
    /// Denials over total requests
    pub hit_rate: f64,
    pub latency: LatencySummary,
}

/// Latency statistics in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

impl LatencySummary {
    fn from_samples(samples: impl Iterator<Item = Duration>) -> Self {
        let mut ms: Vec<f64> = samples.map(|d| d.as_secs_f64() * 1_000.0).collect();
        if ms.is_empty() {
            return Self::default();
        }
        ms.sort_by(f64::total_cmp);
        let avg_ms = ms.iter().sum::<f64>() / ms.len() as f64;
        Self {
            samples: ms.len(),
            avg_ms,
            p50_ms: nearest_rank(&ms, 0.50),
            p95_ms: nearest_rank(&ms, 0.95),
        }
    }
}

fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
