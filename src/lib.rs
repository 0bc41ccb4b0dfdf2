//! # admission-gate
//!
//! Distributed admission control for HTTP services: decides, per request,
//! whether a caller may proceed based on per-user, per-organization and
//! tier-wide limits shared across every process of a deployment.
//!
//! Requests are classified into a [`Category`] (read, write, admin, auth,
//! upload, export, search, presence heartbeat). Each caller tier (standard or
//! premium) maps every category to a [`Rule`]: per-minute and per-hour caps,
//! a burst allowance and a per-organization in-flight queue limit.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use admission_gate::{AdmissionEngine, CallerIdentity, Category};
//!
//! # async fn run() {
//! // In-process counters and the built-in tiers
//! let engine = AdmissionEngine::builder().build().unwrap();
//!
//! let caller = CallerIdentity::new("user-42", "acme", false);
//! let decision = engine.check(&caller, Category::Write).await;
//!
//! if decision.allowed {
//!     // ... handle the request ...
//!     if decision.holds_marker() {
//!         engine.complete(&caller, Category::Write).await;
//!     }
//! } else {
//!     println!("retry in {}s", decision.retry_after.unwrap_or(1));
//! }
//! # }
//! ```
//!
//! With the `http` feature (default) the [`infrastructure::interceptor`]
//! module wires the engine into an axum router as middleware.
//!
//! ## How a check works
//!
//! 1. The caller's tier selects a [`Quota`]; the category selects its rule.
//! 2. One atomic store step reads the user and organization counters for the
//!    current minute and hour windows (and the tier's per-second counter,
//!    when set) together with the in-flight queue length.
//! 3. In the same step those values are evaluated. Exceeding a limit denies
//!    unless the caller is still within its burst headroom; the tier-wide
//!    ceiling is never forgiven.
//! 4. Only an admitted request increments the counters and pushes an
//!    in-flight marker, so denied requests consume nothing and are never
//!    seen by other callers.
//!
//! Evaluating and counting atomically means simultaneous requests always see
//! distinct counts: a limit of 10 admits exactly 10 of 50 concurrent calls.
//!
//! ## Failure behavior
//!
//! The engine never returns an error.
//!
//! - **Store down or slow** (bounded by a 100 ms timeout by default): the
//!   check is answered by an in-process sliding-window limiter enforcing the
//!   per-user limits only. Repeated failures open a circuit breaker so the
//!   store is not hammered while it recovers. Rules with
//!   `graceful_degradation = false` deny instead.
//! - **Category without a rule**: a permissive default applies and a warning
//!   is logged.
//! - **Caller identity unresolved** (middleware): the request is admitted
//!   without a check and a warning is logged.
//!
//! ## Multi-process deployments
//!
//! Enable the `redis-storage` feature and pass a [`RedisCounterStore`] to
//! the builder. All keys live under one prefix (`ratelimit` by default) and
//! expire on their own.
//!
//! ## Configuration
//!
//! [`AdmissionConfig::load`] reads `config/admission.toml` (optional) and
//! `ADMISSION__*` environment variables over the built-in defaults:
//!
//! ```toml
//! [store]
//! redis_url = "redis://127.0.0.1/"
//! timeout_ms = 100
//!
//! [engine]
//! estimated_active_users = 10
//!
//! [tiers.standard.rules.export]
//! requests_per_minute = 5
//! requests_per_hour = 50
//! burst_allowance = 1
//! queue_depth_limit = 3
//! ```
//!
//! ## Observability
//!
//! Decisions are logged through `tracing` (`debug` per decision, `warn` for
//! store failures, rejections and unresolved callers). [`DecisionAccounting`]
//! keeps per-user, per-organization and per-category counts plus latency
//! percentiles; its [`summary`](DecisionAccounting::summary) is serializable.

// Domain layer - pure admission logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

pub mod config;

// Re-export commonly used types for convenience
pub use domain::{
    category::{Category, UnknownCategory},
    decision::{AdmissionLimits, CounterSnapshot, Decision, DecisionSource, Verdict, Violations},
    identity::{CallerIdentity, Tier, ANONYMOUS_ORG},
    rule::{Quota, Rule, RuleError},
    window::{KeySpace, WindowKind},
};

pub use application::{
    accounting::{AccountingSummary, CategorySummary, DecisionAccounting, LatencySummary, Tally},
    catalog::{CatalogError, QuotaCatalog},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    engine::{AdmissionEngine, AdmissionEngineBuilder, BuildError},
    fallback::FallbackLimiter,
    ports::{Clock, CounterStore, StoreError},
    sweeper::{FallbackSweeper, ShutdownError, SweeperConfigError, SweeperHandle},
};

pub use config::{AdmissionConfig, ConfigLoadError};

pub use infrastructure::{
    classifier::RequestClassifier, clock::SystemClock, memory_store::InMemoryCounterStore,
};

#[cfg(feature = "http")]
pub use infrastructure::interceptor::{
    accounting_summary, admission_middleware, AdmissionState, InterceptError,
};

#[cfg(feature = "redis-storage")]
pub use infrastructure::redis_store::RedisCounterStore;
