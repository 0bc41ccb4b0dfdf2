//! Caller identity and plan tiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Organization name under which anonymous traffic is bucketed.
pub const ANONYMOUS_ORG: &str = "anonymous";

/// Named quota tier, selected by the caller's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Standard,
    Premium,
}

impl Tier {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Tier::Standard => "standard",
            Tier::Premium => "premium",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is making a request, as far as admission control is concerned.
///
/// Authentication layers earlier in the pipeline attach this to the request
/// (as an extension); the interceptor synthesizes one for anonymous callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub user_id: String,
    pub org_id: String,
    pub is_premium: bool,
}

impl CallerIdentity {
    pub fn new(user_id: impl Into<String>, org_id: impl Into<String>, is_premium: bool) -> Self {
        Self {
            user_id: user_id.into(),
            org_id: org_id.into(),
            is_premium,
        }
    }

    /// Identity for unauthenticated traffic, keyed by network address.
    pub fn anonymous(addr: IpAddr, org_id: &str) -> Self {
        Self {
            user_id: format!("ip:{addr}"),
            org_id: org_id.to_string(),
            is_premium: false,
        }
    }

    pub fn tier(&self) -> Tier {
        if self.is_premium {
            Tier::Premium
        } else {
            Tier::Standard
        }
    }
}
