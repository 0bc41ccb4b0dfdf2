//! Request categories.
//!
//! A category is the class of endpoint being protected. The interceptor picks
//! exactly one per request and it never outlives that request.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of request classes that quotas are configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Safe reads (GET/HEAD/OPTIONS).
    Read,
    /// Mutating requests that match no more specific category.
    Write,
    /// Administrative endpoints.
    Admin,
    /// Login, token and credential endpoints.
    Auth,
    /// File and attachment uploads.
    Upload,
    /// Exports, downloads and reports.
    Export,
    /// Search and query endpoints.
    Search,
    /// Presence heartbeats from connected clients.
    PresenceHeartbeat,
}

impl Category {
    /// Every category, in declaration order.
    pub const ALL: [Category; 8] = [
        Category::Read,
        Category::Write,
        Category::Admin,
        Category::Auth,
        Category::Upload,
        Category::Export,
        Category::Search,
        Category::PresenceHeartbeat,
    ];

    /// Stable name used in store keys, headers and logs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Category::Read => "read",
            Category::Write => "write",
            Category::Admin => "admin",
            Category::Auth => "auth",
            Category::Upload => "upload",
            Category::Export => "export",
            Category::Search => "search",
            Category::PresenceHeartbeat => "presence_heartbeat",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown category name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown request category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_through_from_str() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>(), Ok(category));
        }
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let err = "billing".parse::<Category>().unwrap_err();
        assert_eq!(err, UnknownCategory("billing".to_string()));
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&Category::PresenceHeartbeat).unwrap();
        assert_eq!(json, "\"presence_heartbeat\"");
    }
}
