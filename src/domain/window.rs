//! Fixed time windows and the store key namespace.
//!
//! Counters are keyed by `floor(unix_seconds / window_length)`, so every
//! process sharing a store agrees on the current window without coordination.
//! Keys expire on their own; nothing ever deletes a counter explicitly.

use crate::domain::category::Category;
use crate::domain::identity::Tier;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default key prefix; the whole namespace below it belongs to this crate.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// TTL of in-flight queue lists.
pub const QUEUE_TTL: Duration = Duration::from_secs(300);

/// Length of a fixed counting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    Second,
    Minute,
    Hour,
}

impl WindowKind {
    pub const fn length_secs(&self) -> u64 {
        match self {
            WindowKind::Second => 1,
            WindowKind::Minute => 60,
            WindowKind::Hour => 3_600,
        }
    }

    /// How long a counter for this window lives in the store.
    pub const fn ttl(&self) -> Duration {
        match self {
            WindowKind::Second => Duration::from_secs(5),
            WindowKind::Minute => Duration::from_secs(120),
            WindowKind::Hour => Duration::from_secs(7_200),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Second => "second",
            WindowKind::Minute => "minute",
            WindowKind::Hour => "hour",
        }
    }

    /// Index of the window containing `unix_secs`.
    pub const fn index(&self, unix_secs: u64) -> u64 {
        unix_secs / self.length_secs()
    }

    /// Unix second at which the window after the one containing `unix_secs` starts.
    pub const fn next_start(&self, unix_secs: u64) -> u64 {
        (self.index(unix_secs) + 1) * self.length_secs()
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seconds since the Unix epoch; times before the epoch clamp to zero.
pub fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Whole seconds from `now` until the next minute window opens, never zero.
pub fn secs_until_next_minute(now: SystemTime) -> u64 {
    let elapsed = time_since_epoch(now);
    let next = WindowKind::Minute.next_start(elapsed.as_secs());
    let remaining = Duration::from_secs(next).saturating_sub(elapsed);
    remaining.as_secs_f64().ceil().max(1.0) as u64
}

fn time_since_epoch(time: SystemTime) -> Duration {
    time.duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Whether a counter belongs to a single user or a whole organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    User,
    Org,
}

impl Scope {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Org => "org",
        }
    }
}

/// Builds store keys under a fixed prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}:{scope}:{id}:{category}:{window}:{idx}`
    pub fn counter(
        &self,
        scope: Scope,
        id: &str,
        category: Category,
        window: WindowKind,
        unix_secs: u64,
    ) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.prefix,
            scope.as_str(),
            id,
            category,
            window,
            window.index(unix_secs)
        )
    }

    /// `{prefix}:queue:{org}:{category}`
    pub fn queue(&self, org_id: &str, category: Category) -> String {
        format!("{}:queue:{}:{}", self.prefix, org_id, category)
    }

    /// `{prefix}:global:{tier}:second:{idx}`
    pub fn global(&self, tier: Tier, unix_secs: u64) -> String {
        format!(
            "{}:global:{}:second:{}",
            self.prefix,
            tier,
            WindowKind::Second.index(unix_secs)
        )
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_index_and_next_start() {
        assert_eq!(WindowKind::Minute.index(119), 1);
        assert_eq!(WindowKind::Minute.index(120), 2);
        assert_eq!(WindowKind::Minute.next_start(119), 120);
        assert_eq!(WindowKind::Hour.index(7_199), 1);
        assert_eq!(WindowKind::Hour.next_start(0), 3_600);
    }

    #[test]
    fn test_counter_key_layout() {
        let keys = KeySpace::default();
        assert_eq!(
            keys.counter(Scope::User, "u1", Category::Read, WindowKind::Minute, 600),
            "ratelimit:user:u1:read:minute:10"
        );
        assert_eq!(
            keys.counter(Scope::Org, "acme", Category::Upload, WindowKind::Hour, 7_200),
            "ratelimit:org:acme:upload:hour:2"
        );
        assert_eq!(
            keys.queue("acme", Category::PresenceHeartbeat),
            "ratelimit:queue:acme:presence_heartbeat"
        );
        assert_eq!(
            keys.global(Tier::Premium, 42),
            "ratelimit:global:premium:second:42"
        );
    }

    #[test]
    fn test_secs_until_next_minute() {
        let at = |secs: u64, millis: u64| {
            UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_millis(millis)
        };
        assert_eq!(secs_until_next_minute(at(600, 0)), 60);
        assert_eq!(secs_until_next_minute(at(659, 0)), 1);
        assert_eq!(secs_until_next_minute(at(659, 500)), 1);
        assert_eq!(secs_until_next_minute(at(630, 250)), 30);
    }
}
