//! Quota catalog: tier and category to rule lookup.
//!
//! The catalog is validated once when it is built. After that every lookup
//! is total: a category a tier leaves unmapped (only possible when the
//! required set is relaxed) resolves to [`Rule::permissive`].

use crate::domain::category::Category;
use crate::domain::identity::Tier;
use crate::domain::rule::{Quota, Rule, RuleError};
use std::collections::BTreeSet;

/// Error returned when a catalog fails validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogError {
    #[error("tier {tier} has no rule for required category {category}")]
    UnmappedCategory { tier: Tier, category: Category },
    #[error("tier {tier} has an invalid rule{}: {source}", category_suffix(.category))]
    InvalidRule {
        tier: Tier,
        category: Option<Category>,
        source: RuleError,
    },
}

fn category_suffix(category: &Option<Category>) -> String {
    category.map(|c| format!(" for {c}")).unwrap_or_default()
}

/// Immutable mapping from tier and category to admission rules.
#[derive(Debug, Clone)]
pub struct QuotaCatalog {
    standard: Quota,
    premium: Quota,
}

impl QuotaCatalog {
    /// Build a catalog requiring every category in both tiers.
    ///
    /// # Errors
    /// Returns `CatalogError` if a category is unmapped or a rule is invalid.
    pub fn new(standard: Quota, premium: Quota) -> Result<Self, CatalogError> {
        Self::with_required(standard, premium, &Category::ALL)
    }

    /// Build a catalog that only requires the given categories to be mapped.
    ///
    /// # Errors
    /// Returns `CatalogError` if a required category is unmapped or any
    /// configured rule is invalid.
    pub fn with_required(
        standard: Quota,
        premium: Quota,
        required: &[Category],
    ) -> Result<Self, CatalogError> {
        let required: BTreeSet<Category> = required.iter().copied().collect();
        for (tier, quota) in [(Tier::Standard, &standard), (Tier::Premium, &premium)] {
            quota
                .validate()
                .map_err(|(category, source)| CatalogError::InvalidRule {
                    tier,
                    category,
                    source,
                })?;
            if let Some(category) = required.iter().find(|c| quota.rule(**c).is_none()) {
                return Err(CatalogError::UnmappedCategory {
                    tier,
                    category: *category,
                });
            }
        }
        Ok(Self { standard, premium })
    }

    pub fn lookup_quota(&self, tier: Tier) -> &Quota {
        match tier {
            Tier::Standard => &self.standard,
            Tier::Premium => &self.premium,
        }
    }

    pub fn lookup(&self, tier: Tier, category: Category) -> Rule {
        match self.lookup_quota(tier).rule(category) {
            Some(rule) => *rule,
            None => {
                tracing::warn!(
                    tier = %tier,
                    category = %category,
                    "No rule configured for category, applying permissive default"
                );
                Rule::permissive()
            }
        }
    }
}

impl Default for QuotaCatalog {
    fn default() -> Self {
        Self {
            standard: Quota::standard(),
            premium: Quota::premium(),
        }
    }
}
