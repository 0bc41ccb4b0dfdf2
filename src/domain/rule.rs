//! Quota rules and tiers.
//!
//! A [`Rule`] holds the thresholds for one category; a [`Quota`] bundles the
//! rules of one tier together with the organization scaling factor and the
//! tier-wide per-second ceiling. Both are immutable once loaded.

use crate::domain::category::Category;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Error returned when a rule or quota fails validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleError {
    #[error("requests_per_minute must be greater than 0")]
    ZeroPerMinute,
    #[error("requests_per_hour must be greater than 0")]
    ZeroPerHour,
    #[error("requests_per_hour ({per_hour}) is below requests_per_minute ({per_minute})")]
    HourBelowMinute { per_minute: u64, per_hour: u64 },
    #[error("queue_depth_limit must be greater than 0")]
    ZeroQueueDepth,
    #[error("org_multiplier must be a positive finite number, got {0}")]
    InvalidOrgMultiplier(f64),
    #[error("global_requests_per_second must be greater than 0 when set")]
    ZeroGlobalRate,
}

/// Per-category thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
    /// Extra requests tolerated above the per-minute cap in the same window.
    #[serde(default)]
    pub burst_allowance: u64,
    /// Max in-flight requests per organization and category.
    pub queue_depth_limit: u64,
    /// Serve from the in-process fallback when the shared store fails.
    /// When false, store failures deny requests in this category.
    #[serde(default = "default_graceful_degradation")]
    pub graceful_degradation: bool,
}

fn default_graceful_degradation() -> bool {
    true
}

impl Rule {
    /// Create a rule with graceful degradation enabled.
    pub const fn new(
        requests_per_minute: u64,
        requests_per_hour: u64,
        burst_allowance: u64,
        queue_depth_limit: u64,
    ) -> Self {
        Self {
            requests_per_minute,
            requests_per_hour,
            burst_allowance,
            queue_depth_limit,
            graceful_degradation: true,
        }
    }

    /// Generous rule applied to categories a tier does not configure.
    pub const fn permissive() -> Self {
        Self::new(1_000, 60_000, 100, 1_000)
    }

    pub fn with_graceful_degradation(mut self, enabled: bool) -> Self {
        self.graceful_degradation = enabled;
        self
    }

    /// Check the thresholds are usable.
    ///
    /// # Errors
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.requests_per_minute == 0 {
            return Err(RuleError::ZeroPerMinute);
        }
        if self.requests_per_hour == 0 {
            return Err(RuleError::ZeroPerHour);
        }
        if self.requests_per_hour < self.requests_per_minute {
            return Err(RuleError::HourBelowMinute {
                per_minute: self.requests_per_minute,
                per_hour: self.requests_per_hour,
            });
        }
        if self.queue_depth_limit == 0 {
            return Err(RuleError::ZeroQueueDepth);
        }
        Ok(())
    }
}

/// A named tier: per-category rules plus organization and global scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    #[serde(default)]
    pub rules: BTreeMap<Category, Rule>,
    /// Factor applied to per-user limits (together with the estimated active
    /// user count) to derive organization-wide limits.
    pub org_multiplier: f64,
    /// Tier-wide ceiling across all processes; `None` disables it.
    #[serde(default)]
    pub global_requests_per_second: Option<u64>,
}

impl Quota {
    pub fn new(org_multiplier: f64) -> Self {
        Self {
            rules: BTreeMap::new(),
            org_multiplier,
            global_requests_per_second: None,
        }
    }

    pub fn with_rule(mut self, category: Category, rule: Rule) -> Self {
        self.rules.insert(category, rule);
        self
    }

    pub fn with_global_requests_per_second(mut self, limit: Option<u64>) -> Self {
        self.global_requests_per_second = limit;
        self
    }

    pub fn rule(&self, category: Category) -> Option<&Rule> {
        self.rules.get(&category)
    }

    /// Validate the tier-level settings and every configured rule.
    ///
    /// # Errors
    /// Returns the offending category (if any) with the rule error.
    pub fn validate(&self) -> Result<(), (Option<Category>, RuleError)> {
        if !self.org_multiplier.is_finite() || self.org_multiplier <= 0.0 {
            return Err((None, RuleError::InvalidOrgMultiplier(self.org_multiplier)));
        }
        if self.global_requests_per_second == Some(0) {
            return Err((None, RuleError::ZeroGlobalRate));
        }
        for (category, rule) in &self.rules {
            rule.validate().map_err(|e| (Some(*category), e))?;
        }
        Ok(())
    }

    /// Built-in limits for the standard plan.
    pub fn standard() -> Self {
        Self::new(1.5)
            .with_global_requests_per_second(Some(2_000))
            .with_rule(Category::Read, Rule::new(120, 3_000, 20, 50))
            .with_rule(Category::Write, Rule::new(60, 1_000, 10, 25))
            .with_rule(Category::Admin, Rule::new(30, 300, 5, 10))
            .with_rule(Category::Auth, Rule::new(10, 60, 2, 5))
            .with_rule(Category::Upload, Rule::new(10, 100, 2, 5))
            .with_rule(Category::Export, Rule::new(5, 50, 1, 3))
            .with_rule(Category::Search, Rule::new(60, 1_000, 10, 20))
            .with_rule(Category::PresenceHeartbeat, Rule::new(120, 7_200, 30, 100))
    }

    /// Built-in limits for the premium plan.
    pub fn premium() -> Self {
        Self::new(2.0)
            .with_global_requests_per_second(Some(5_000))
            .with_rule(Category::Read, Rule::new(360, 10_000, 60, 150))
            .with_rule(Category::Write, Rule::new(180, 3_000, 30, 75))
            .with_rule(Category::Admin, Rule::new(90, 1_000, 15, 30))
            .with_rule(Category::Auth, Rule::new(20, 120, 4, 10))
            .with_rule(Category::Upload, Rule::new(30, 500, 6, 15))
            .with_rule(Category::Export, Rule::new(15, 200, 3, 10))
            .with_rule(Category::Search, Rule::new(180, 3_000, 30, 60))
            .with_rule(Category::PresenceHeartbeat, Rule::new(240, 14_400, 60, 300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tiers_are_valid_and_complete() {
        for quota in [Quota::standard(), Quota::premium()] {
            assert!(quota.validate().is_ok());
            for category in Category::ALL {
                assert!(quota.rule(category).is_some(), "{category} missing");
            }
        }
    }

    #[test]
    fn test_premium_limits_exceed_standard() {
        let standard = Quota::standard();
        let premium = Quota::premium();
        for category in Category::ALL {
            let s = standard.rule(category).unwrap();
            let p = premium.rule(category).unwrap();
            assert!(p.requests_per_minute > s.requests_per_minute);
        }
    }

    #[test]
    fn test_rule_validation() {
        assert_eq!(Rule::new(0, 10, 0, 1).validate(), Err(RuleError::ZeroPerMinute));
        assert_eq!(Rule::new(10, 0, 0, 1).validate(), Err(RuleError::ZeroPerHour));
        assert_eq!(
            Rule::new(10, 5, 0, 1).validate(),
            Err(RuleError::HourBelowMinute {
                per_minute: 10,
                per_hour: 5
            })
        );
        assert_eq!(Rule::new(10, 100, 0, 0).validate(), Err(RuleError::ZeroQueueDepth));
        assert!(Rule::new(10, 100, 0, 1).validate().is_ok());
    }

    #[test]
    fn test_quota_validation_reports_category() {
        let quota = Quota::new(1.0).with_rule(Category::Export, Rule::new(0, 10, 0, 1));
        assert_eq!(
            quota.validate(),
            Err((Some(Category::Export), RuleError::ZeroPerMinute))
        );

        let quota = Quota::new(-1.0);
        assert!(matches!(
            quota.validate(),
            Err((None, RuleError::InvalidOrgMultiplier(_)))
        ));
    }

    #[test]
    fn test_graceful_degradation_defaults_on_when_deserialized() {
        let rule: Rule = serde_json::from_str(
            r#"{"requests_per_minute": 5, "requests_per_hour": 50, "queue_depth_limit": 2}"#,
        )
        .unwrap();
        assert!(rule.graceful_degradation);
        assert_eq!(rule.burst_allowance, 0);
    }
}
