//! Admission decisions and the predicate that produces them.
//!
//! Evaluation is pure: given the counter values observed for a request and
//! the limits that apply to it, [`AdmissionLimits::evaluate`] says whether to
//! admit. The counter store evaluates it in the same atomic step that
//! counts an admitted request.

use crate::domain::rule::{Quota, Rule};
use serde::Serialize;

/// Which path produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Shared coordination store.
    Shared,
    /// In-process fallback limiter (store unavailable).
    Fallback,
    /// Store unavailable and the rule does not degrade gracefully.
    Strict,
}

/// Outcome of an admission check.
///
/// The shape is identical whichever path served the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    /// Per-minute limit reported to clients.
    pub limit: u64,
    pub requests_remaining: u64,
    /// Unix seconds at which the next minute window starts.
    pub reset_time: u64,
    /// Seconds to wait before retrying; only set on denial.
    pub retry_after: Option<u64>,
    pub queue_depth: u64,
    pub source: DecisionSource,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn is_denied(&self) -> bool {
        !self.allowed
    }

    /// Whether admitting this request left an in-flight marker in the shared
    /// store. Only these decisions are followed by
    /// [`complete`](crate::AdmissionEngine::complete).
    pub fn holds_marker(&self) -> bool {
        self.allowed && self.source == DecisionSource::Shared
    }
}

/// Counter values observed for one request before it is counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub user_minute: u64,
    pub user_hour: u64,
    pub org_minute: u64,
    pub org_hour: u64,
    pub queue_depth: u64,
    /// Tier-wide requests in the current second, when the tier has a ceiling.
    pub global_second: Option<u64>,
}

impl CounterSnapshot {
    /// Build a snapshot from counter values laid out as user minute, user
    /// hour, org minute, org hour and, with a global ceiling, tier second.
    ///
    /// Returns `None` if the number of values does not match that layout.
    pub fn from_counts(counters: &[u64], queue_depth: u64, has_global: bool) -> Option<Self> {
        let global_second = match (counters, has_global) {
            ([_, _, _, _], false) => None,
            ([_, _, _, _, global], true) => Some(*global),
            _ => return None,
        };
        Some(Self {
            user_minute: counters[0],
            user_hour: counters[1],
            org_minute: counters[2],
            org_hour: counters[3],
            queue_depth,
            global_second,
        })
    }
}

/// Limits a request is evaluated against, derived from its rule and tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionLimits {
    pub per_minute: u64,
    pub per_hour: u64,
    pub burst_allowance: u64,
    pub org_per_minute: u64,
    pub org_per_hour: u64,
    pub queue_depth: u64,
    pub global_per_second: Option<u64>,
}

impl AdmissionLimits {
    /// Derive limits; organization limits scale the per-user limits by the
    /// tier multiplier and the estimated number of active users.
    pub fn derive(rule: &Rule, quota: &Quota, estimated_active_users: u64) -> Self {
        let scale = quota.org_multiplier * estimated_active_users as f64;
        Self {
            per_minute: rule.requests_per_minute,
            per_hour: rule.requests_per_hour,
            burst_allowance: rule.burst_allowance,
            org_per_minute: scale_limit(rule.requests_per_minute, scale),
            org_per_hour: scale_limit(rule.requests_per_hour, scale),
            queue_depth: rule.queue_depth_limit,
            global_per_second: quota.global_requests_per_second,
        }
    }

    /// Which limits the request would exceed if admitted.
    pub fn violations(&self, s: &CounterSnapshot) -> Violations {
        Violations {
            user_minute: s.user_minute >= self.per_minute,
            user_hour: s.user_hour >= self.per_hour,
            org_minute: s.org_minute >= self.org_per_minute,
            org_hour: s.org_hour >= self.org_per_hour,
            queue: s.queue_depth >= self.queue_depth,
            global: match (s.global_second, self.global_per_second) {
                (Some(seen), Some(limit)) => seen >= limit,
                _ => false,
            },
        }
    }

    /// Burst headroom: still under per-minute cap plus allowance and under
    /// the hourly cap.
    pub fn burst_allowed(&self, s: &CounterSnapshot) -> bool {
        s.user_minute < self.per_minute.saturating_add(self.burst_allowance)
            && s.user_hour < self.per_hour
    }

    pub fn evaluate(&self, s: &CounterSnapshot) -> Verdict {
        let violations = self.violations(s);
        if !violations.any() {
            return Verdict::Admit;
        }
        if violations.beyond_burst() || !self.burst_allowed(s) {
            return Verdict::Deny(violations);
        }
        Verdict::Admit
    }
}

fn scale_limit(limit: u64, scale: f64) -> u64 {
    let scaled = (limit as f64 * scale).floor();
    if scaled >= u64::MAX as f64 {
        u64::MAX
    } else {
        scaled.max(1.0) as u64
    }
}

/// Limits that would be exceeded by admitting a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Violations {
    pub user_minute: bool,
    pub user_hour: bool,
    pub org_minute: bool,
    pub org_hour: bool,
    pub queue: bool,
    pub global: bool,
}

impl Violations {
    pub fn any(&self) -> bool {
        self.user_minute
            || self.user_hour
            || self.org_minute
            || self.org_hour
            || self.queue
            || self.global
    }

    /// Violations that burst headroom cannot override.
    ///
    /// Burst headroom currently forgives the user, organization and queue
    /// limits alike; only the tier-wide ceiling is absolute. Narrowing burst to
    /// user limits means adding `self.org_minute || self.org_hour || self.queue`
    /// here and in the Redis reservation script.
    pub fn beyond_burst(&self) -> bool {
        self.global
    }
}

/// Result of evaluating a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Deny(Violations),
}

impl Verdict {
    pub fn is_admit(&self) -> bool {
        matches!(self, Verdict::Admit)
    }
}
