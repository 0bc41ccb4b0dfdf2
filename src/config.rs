//! Deployment configuration.
//!
//! Settings are layered, lowest priority first:
//! 1. Built-in defaults (including the standard and premium tiers)
//! 2. `config/admission.{toml,...}`, if present
//! 3. `ADMISSION__*` environment variables, `__` separating nested keys
//!    (e.g. `ADMISSION__STORE__REDIS_URL`,
//!    `ADMISSION__TIERS__STANDARD__RULES__READ__REQUESTS_PER_MINUTE`)
//!
//! The loaded configuration is validated before it is returned, so a bad
//! tier fails at startup rather than on the first request.

use crate::application::catalog::{CatalogError, QuotaCatalog};
use crate::application::circuit_breaker::CircuitBreakerConfig;
use crate::application::engine::{
    AdmissionEngine, AdmissionEngineBuilder, BuildError, DEFAULT_ESTIMATED_ACTIVE_USERS,
    DEFAULT_STORE_TIMEOUT,
};
use crate::application::fallback::DEFAULT_SWEEP_INTERVAL;
use crate::domain::identity::ANONYMOUS_ORG;
use crate::domain::rule::Quota;
use crate::domain::window::DEFAULT_KEY_PREFIX;
use crate::infrastructure::classifier::{RequestClassifier, DEFAULT_EXEMPT_PATHS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default configuration file, without extension.
pub const DEFAULT_CONFIG_FILE: &str = "config/admission";

/// Default environment variable prefix.
pub const DEFAULT_ENV_PREFIX: &str = "ADMISSION";

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Configuration source error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid tier configuration: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Invalid engine configuration: {0}")]
    Engine(#[from] BuildError),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub interceptor: InterceptorConfig,
    pub tiers: TierConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Shared Redis store; counts stay process-local when unset.
    pub redis_url: Option<String>,
    pub key_prefix: String,
    /// Bound on each store round trip.
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout_ms: DEFAULT_STORE_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub estimated_active_users: u64,
    pub fallback_sweep_interval_secs: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_recovery_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let circuit = CircuitBreakerConfig::default();
        Self {
            estimated_active_users: DEFAULT_ESTIMATED_ACTIVE_USERS,
            fallback_sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            circuit_failure_threshold: circuit.failure_threshold,
            circuit_recovery_secs: circuit.recovery_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    pub exempt_paths: Vec<String>,
    pub anonymous_org: String,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            exempt_paths: DEFAULT_EXEMPT_PATHS.iter().map(|p| p.to_string()).collect(),
            anonymous_org: ANONYMOUS_ORG.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub standard: Quota,
    pub premium: Quota,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            standard: Quota::standard(),
            premium: Quota::premium(),
        }
    }
}

impl AdmissionConfig {
    /// Load from `config/admission` and `ADMISSION__*` variables.
    pub fn load() -> Result<Self, ConfigLoadError> {
        Self::load_from(Some(DEFAULT_CONFIG_FILE), DEFAULT_ENV_PREFIX)
    }

    /// Load from an optional file (any format the `config` crate detects by
    /// extension) and variables under `env_prefix`.
    pub fn load_from(file: Option<&str>, env_prefix: &str) -> Result<Self, ConfigLoadError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&AdmissionConfig::default())?);
        if let Some(file) = file {
            builder = builder.add_source(config::File::with_name(file).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config: AdmissionConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document layered over the defaults.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigLoadError> {
        let config: AdmissionConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AdmissionConfig::default())?)
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigLoadError> {
        self.engine_builder()?.build()?;
        Ok(())
    }

    pub fn catalog(&self) -> Result<QuotaCatalog, CatalogError> {
        QuotaCatalog::new(self.tiers.standard.clone(), self.tiers.premium.clone())
    }

    /// An engine builder carrying every setting except the store.
    pub fn engine_builder(&self) -> Result<AdmissionEngineBuilder, CatalogError> {
        Ok(AdmissionEngine::builder()
            .with_catalog(self.catalog()?)
            .with_key_prefix(self.store.key_prefix.clone())
            .with_store_timeout(Duration::from_millis(self.store.timeout_ms))
            .with_estimated_active_users(self.engine.estimated_active_users)
            .with_fallback_sweep_interval(Duration::from_secs(
                self.engine.fallback_sweep_interval_secs,
            ))
            .with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: self.engine.circuit_failure_threshold,
                recovery_timeout: Duration::from_secs(self.engine.circuit_recovery_secs),
            }))
    }

    pub fn classifier(&self) -> RequestClassifier {
        RequestClassifier::with_exempt_paths(self.interceptor.exempt_paths.iter().cloned())
    }

    /// Connect to the configured Redis store, if any.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the first connection fails.
    #[cfg(feature = "redis-storage")]
    pub async fn connect_store(
        &self,
    ) -> Result<Option<crate::infrastructure::redis_store::RedisCounterStore>, redis::RedisError>
    {
        match &self.store.redis_url {
            Some(url) => crate::infrastructure::redis_store::RedisCounterStore::connect(url)
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    /// Middleware state for `engine` with this configuration's interceptor settings.
    #[cfg(feature = "http")]
    pub fn admission_state(
        &self,
        engine: std::sync::Arc<AdmissionEngine>,
    ) -> crate::infrastructure::interceptor::AdmissionState {
        crate::infrastructure::interceptor::AdmissionState::new(engine)
            .with_classifier(self.classifier())
            .with_anonymous_org(self.interceptor.anonymous_org.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::category::Category;
    use crate::domain::identity::Tier;

    #[test]
    fn test_defaults_are_valid() {
        let config = AdmissionConfig::from_toml("").unwrap();
        assert_eq!(config, AdmissionConfig::default());
        assert_eq!(config.store.timeout_ms, 100);
        assert_eq!(config.engine.estimated_active_users, 10);
        assert!(config.store.redis_url.is_none());
    }

    #[test]
    fn test_toml_overrides_single_rule_field() {
        let config = AdmissionConfig::from_toml(
            r#"
            [store]
            redis_url = "redis://cache:6379/"
            key_prefix = "gate"

            [tiers.standard.rules.export]
            requests_per_minute = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.store.redis_url.as_deref(), Some("redis://cache:6379/"));
        let catalog = config.catalog().unwrap();
        let export = catalog.lookup(Tier::Standard, Category::Export);
        assert_eq!(export.requests_per_minute, 2);
        // untouched fields keep their built-in values
        assert_eq!(export.requests_per_hour, 50);
        assert_eq!(
            catalog.lookup(Tier::Standard, Category::Read),
            *Quota::standard().rule(Category::Read).unwrap()
        );
    }

    #[test]
    fn test_invalid_rule_fails_loudly() {
        let err = AdmissionConfig::from_toml(
            r#"
            [tiers.premium.rules.auth]
            queue_depth_limit = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigLoadError::Catalog(_)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = AdmissionConfig::from_toml("[store]\ntimeout_ms = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::Engine(BuildError::ZeroStoreTimeout)
        ));
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("ADMISSION_CFG_TEST__ENGINE__ESTIMATED_ACTIVE_USERS", "25");
        std::env::set_var("ADMISSION_CFG_TEST__STORE__KEY_PREFIX", "edge");

        let config = AdmissionConfig::load_from(None, "ADMISSION_CFG_TEST").unwrap();
        assert_eq!(config.engine.estimated_active_users, 25);
        assert_eq!(config.store.key_prefix, "edge");
        assert_eq!(config.tiers, TierConfig::default());

        std::env::remove_var("ADMISSION_CFG_TEST__ENGINE__ESTIMATED_ACTIVE_USERS");
        std::env::remove_var("ADMISSION_CFG_TEST__STORE__KEY_PREFIX");
    }
}
