//! The admission engine.
//!
//! Each check is one conditional reservation: the store reads the counters,
//! evaluates them against the request's limits, and counts the request only
//! if it is admitted, all in one atomic step. Concurrent checks for the same
//! identity therefore observe distinct values, a limit of N admits exactly N,
//! and denied requests never show up in anyone else's counts.
//!
//! When the store fails, times out or sits behind an open circuit, the check
//! is answered by the in-process [`FallbackLimiter`] instead (or denied, for
//! rules that do not degrade gracefully). Callers cannot tell the paths apart
//! except through [`Decision::source`].

use crate::application::accounting::DecisionAccounting;
use crate::application::catalog::QuotaCatalog;
use crate::application::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::application::fallback::{FallbackLimiter, DEFAULT_SWEEP_INTERVAL};
use crate::application::ports::{
    Clock, CounterSlot, CounterStore, QueueSlot, Reservation, StoreError,
};
use crate::application::sweeper::{FallbackSweeper, SweeperConfigError};
use crate::domain::category::Category;
use crate::domain::decision::{
    AdmissionLimits, CounterSnapshot, Decision, DecisionSource, Verdict,
};
use crate::domain::identity::{CallerIdentity, Tier};
use crate::domain::rule::Rule;
use crate::domain::window::{
    secs_until_next_minute, unix_secs, KeySpace, Scope, WindowKind, DEFAULT_KEY_PREFIX, QUEUE_TTL,
};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::memory_store::InMemoryCounterStore;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Default bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// Default active-user estimate used to scale organization limits.
pub const DEFAULT_ESTIMATED_ACTIVE_USERS: u64 = 10;

/// Error returned when building an [`AdmissionEngine`] fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("store timeout must be greater than 0")]
    ZeroStoreTimeout,
    #[error("estimated active users must be greater than 0")]
    ZeroEstimatedActiveUsers,
    #[error("circuit breaker failure threshold must be greater than 0")]
    ZeroFailureThreshold,
    #[error("fallback sweep interval must be greater than 0")]
    ZeroSweepInterval,
    #[error("key prefix must not be empty")]
    EmptyKeyPrefix,
}

/// Builder for constructing an [`AdmissionEngine`].
#[derive(Debug)]
pub struct AdmissionEngineBuilder {
    store: Option<Arc<dyn CounterStore>>,
    clock: Option<Arc<dyn Clock>>,
    catalog: QuotaCatalog,
    accounting: Option<DecisionAccounting>,
    circuit: CircuitBreakerConfig,
    key_prefix: String,
    store_timeout: Duration,
    estimated_active_users: u64,
    sweep_interval: Duration,
}

impl AdmissionEngineBuilder {
    /// Use a shared counter store.
    ///
    /// Without one the engine counts in an [`InMemoryCounterStore`], which
    /// only coordinates within this process.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use admission_gate::{AdmissionEngine, InMemoryCounterStore};
    /// # use std::sync::Arc;
    /// let engine = AdmissionEngine::builder()
    ///     .with_store(Arc::new(InMemoryCounterStore::new()))
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn with_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set a custom clock (mainly for testing).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_catalog(mut self, catalog: QuotaCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Share an accounting handle with other components (e.g. a stats route).
    pub fn with_accounting(mut self, accounting: DecisionAccounting) -> Self {
        self.accounting = Some(accounting);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit = config;
        self
    }

    /// Namespace all store keys under `prefix` instead of `ratelimit`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Bound every store round trip. On expiry the check is served by the
    /// fallback path; the store call is not retried.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Number of active users per organization the org limits are scaled by.
    ///
    /// With the default of 10 and a tier multiplier of 1.5, an organization
    /// may issue 15 times a single user's per-minute limit.
    pub fn with_estimated_active_users(mut self, users: u64) -> Self {
        self.estimated_active_users = users;
        self
    }

    /// Minimum time between inline sweeps of the fallback limiter.
    pub fn with_fallback_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// # Errors
    /// Returns `BuildError` if any setting is zero or the key prefix is empty.
    pub fn build(self) -> Result<AdmissionEngine, BuildError> {
        if self.store_timeout.is_zero() {
            return Err(BuildError::ZeroStoreTimeout);
        }
        if self.estimated_active_users == 0 {
            return Err(BuildError::ZeroEstimatedActiveUsers);
        }
        if self.circuit.failure_threshold == 0 {
            return Err(BuildError::ZeroFailureThreshold);
        }
        if self.sweep_interval.is_zero() {
            return Err(BuildError::ZeroSweepInterval);
        }
        if self.key_prefix.is_empty() {
            return Err(BuildError::EmptyKeyPrefix);
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryCounterStore::with_clock(Arc::clone(&clock))));
        let fallback = Arc::new(FallbackLimiter::with_sweep_interval(
            Arc::clone(&clock),
            self.sweep_interval,
        ));

        Ok(AdmissionEngine {
            store,
            clock,
            catalog: self.catalog,
            accounting: self.accounting.unwrap_or_default(),
            circuit: CircuitBreaker::with_config(self.circuit),
            fallback,
            keys: KeySpace::new(self.key_prefix),
            store_timeout: self.store_timeout,
            estimated_active_users: self.estimated_active_users,
            marker_seq: AtomicU64::new(0),
        })
    }
}

/// Decides whether requests are admitted.
///
/// Share one engine per process behind an `Arc`.
#[derive(Debug)]
pub struct AdmissionEngine {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    catalog: QuotaCatalog,
    accounting: DecisionAccounting,
    circuit: CircuitBreaker,
    fallback: Arc<FallbackLimiter>,
    keys: KeySpace,
    store_timeout: Duration,
    estimated_active_users: u64,
    marker_seq: AtomicU64,
}

impl AdmissionEngine {
    /// Create a builder for configuring the engine.
    ///
    /// Defaults:
    /// - Store: in-memory (process-local)
    /// - Catalog: built-in standard and premium tiers
    /// - Store timeout: 100 ms
    /// - Estimated active users: 10
    /// - Circuit breaker: opens after 5 failures, retries the store after 30 s
    /// - Key prefix: `ratelimit`
    pub fn builder() -> AdmissionEngineBuilder {
        AdmissionEngineBuilder {
            store: None,
            clock: None,
            catalog: QuotaCatalog::default(),
            accounting: None,
            circuit: CircuitBreakerConfig::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            estimated_active_users: DEFAULT_ESTIMATED_ACTIVE_USERS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Decide whether to admit one request, counting it if admitted.
    ///
    /// Never fails: store problems are absorbed by the fallback path.
    pub async fn check(&self, identity: &CallerIdentity, category: Category) -> Decision {
        let started = Instant::now();
        let decision = self.decide(identity, category).await;
        self.accounting
            .record(identity, category, &decision, started.elapsed());

        tracing::debug!(
            user_id = %identity.user_id,
            org_id = %identity.org_id,
            category = %category,
            allowed = decision.allowed,
            remaining = decision.requests_remaining,
            source = ?decision.source,
            "Admission decision"
        );
        decision
    }

    /// What [`check`](Self::check) would answer right now, without counting
    /// anything or recording accounting.
    pub async fn preview(&self, identity: &CallerIdentity, category: Category) -> Decision {
        let now = self.clock.now();
        let tier = identity.tier();
        let rule = self.catalog.lookup(tier, category);
        let limits = self.limits(tier, &rule);

        if self.circuit.state() != CircuitState::Open {
            let plan = self.plan(identity, category, tier, &limits, now);
            let counter_keys: Vec<String> =
                plan.counters.iter().map(|slot| slot.key.clone()).collect();
            let has_global = limits.global_per_second.is_some();
            let peeked = self
                .bounded(self.store.peek(&counter_keys, &plan.queue.key))
                .await
                .and_then(|p| observed(&p.counters, p.queue_len, has_global));
            match peeked {
                Ok(current) => {
                    return match limits.evaluate(&current) {
                        Verdict::Admit => {
                            admitted(&limits, &current, current.queue_depth + 1, now)
                        }
                        Verdict::Deny(_) => denied(&limits, &current, now),
                    };
                }
                Err(err) => {
                    tracing::debug!(error = %err, "Counter store unavailable for preview");
                }
            }
        }

        if rule.graceful_degradation {
            self.fallback.preview(&identity.user_id, category, &rule)
        } else {
            strict_denial(&rule, now)
        }
    }

    /// Mark one admitted request of the caller's organization as finished.
    ///
    /// Pops the oldest in-flight marker for the organization and category;
    /// markers are not correlated with requests, so call this only for
    /// decisions that [hold a marker](Decision::holds_marker). Errors are
    /// logged and swallowed, and markers that are never popped expire with
    /// the queue.
    pub async fn complete(&self, identity: &CallerIdentity, category: Category) {
        if self.circuit.state() == CircuitState::Open {
            return;
        }
        let queue_key = self.keys.queue(&identity.org_id, category);
        if let Err(err) = self.bounded(self.store.pop_marker(&queue_key)).await {
            tracing::warn!(
                error = %err,
                org_id = %identity.org_id,
                category = %category,
                "Failed to release in-flight marker"
            );
        }
    }

    async fn decide(&self, identity: &CallerIdentity, category: Category) -> Decision {
        let now = self.clock.now();
        let tier = identity.tier();
        let rule = self.catalog.lookup(tier, category);
        let limits = self.limits(tier, &rule);

        if !self.circuit.allow_store_call() {
            return self.degraded(identity, category, &rule, now);
        }

        let reservation = self.plan(identity, category, tier, &limits, now);
        let has_global = limits.global_per_second.is_some();
        let reserved = self
            .bounded(self.store.reserve(&reservation))
            .await
            .and_then(|r| {
                observed(&r.counters, r.queue_len, has_global).map(|s| (s, r.admitted))
            });

        let (snapshot, admitted_by_store) = match reserved {
            Ok(observed) => {
                self.circuit.record_success();
                observed
            }
            Err(err) => {
                self.store_failed(&err, identity, category);
                return self.degraded(identity, category, &rule, now);
            }
        };

        if admitted_by_store {
            return admitted(&limits, &snapshot, snapshot.queue_depth.saturating_add(1), now);
        }
        tracing::debug!(
            user_id = %identity.user_id,
            category = %category,
            violations = ?limits.violations(&snapshot),
            "Request exceeds admission limits"
        );
        denied(&limits, &snapshot, now)
    }

    fn limits(&self, tier: Tier, rule: &Rule) -> AdmissionLimits {
        AdmissionLimits::derive(
            rule,
            self.catalog.lookup_quota(tier),
            self.estimated_active_users,
        )
    }

    /// Keys and marker one check touches, in the order `observed` expects.
    fn plan(
        &self,
        identity: &CallerIdentity,
        category: Category,
        tier: Tier,
        limits: &AdmissionLimits,
        now: SystemTime,
    ) -> Reservation {
        let secs = unix_secs(now);
        let window = |scope: Scope, id: &str, kind: WindowKind| CounterSlot {
            key: self.keys.counter(scope, id, category, kind, secs),
            ttl: kind.ttl(),
        };

        let mut counters = vec![
            window(Scope::User, &identity.user_id, WindowKind::Minute),
            window(Scope::User, &identity.user_id, WindowKind::Hour),
            window(Scope::Org, &identity.org_id, WindowKind::Minute),
            window(Scope::Org, &identity.org_id, WindowKind::Hour),
        ];
        if limits.global_per_second.is_some() {
            counters.push(CounterSlot {
                key: self.keys.global(tier, secs),
                ttl: WindowKind::Second.ttl(),
            });
        }

        Reservation {
            counters,
            queue: QueueSlot {
                key: self.keys.queue(&identity.org_id, category),
                token: self.marker_token(identity, now),
                max_len: limits.queue_depth.saturating_add(1),
                ttl: QUEUE_TTL,
            },
            limits: *limits,
        }
    }

    fn marker_token(&self, identity: &CallerIdentity, now: SystemTime) -> String {
        let millis = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
        let seq = self.marker_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}:{}", identity.user_id, millis, seq)
    }

    fn store_failed(&self, err: &StoreError, identity: &CallerIdentity, category: Category) {
        self.circuit.record_failure();
        self.accounting.record_store_error();
        tracing::warn!(
            error = %err,
            user_id = %identity.user_id,
            category = %category,
            "Counter store unavailable, using fallback limiter"
        );
    }

    fn degraded(
        &self,
        identity: &CallerIdentity,
        category: Category,
        rule: &Rule,
        now: SystemTime,
    ) -> Decision {
        if rule.graceful_degradation {
            self.fallback.check(&identity.user_id, category, rule)
        } else {
            strict_denial(rule, now)
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }

    pub fn accounting(&self) -> &DecisionAccounting {
        &self.accounting
    }

    pub fn catalog(&self) -> &QuotaCatalog {
        &self.catalog
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    pub fn fallback(&self) -> &Arc<FallbackLimiter> {
        &self.fallback
    }

    /// A background sweeper for this engine's fallback limiter.
    ///
    /// # Errors
    /// Returns `SweeperConfigError::ZeroInterval` if `interval` is zero.
    pub fn sweeper(&self, interval: Duration) -> Result<FallbackSweeper, SweeperConfigError> {
        FallbackSweeper::new(Arc::clone(&self.fallback), interval)
    }
}

/// Map store values back onto the counters `plan` laid out.
fn observed(
    counters: &[u64],
    queue_len: u64,
    has_global: bool,
) -> Result<CounterSnapshot, StoreError> {
    CounterSnapshot::from_counts(counters, queue_len, has_global).ok_or_else(|| {
        let expected = if has_global { 5 } else { 4 };
        StoreError::Protocol(format!(
            "expected {expected} counters, got {}",
            counters.len()
        ))
    })
}

fn admitted(
    limits: &AdmissionLimits,
    before: &CounterSnapshot,
    queue_len: u64,
    now: SystemTime,
) -> Decision {
    Decision {
        allowed: true,
        limit: limits.per_minute,
        requests_remaining: limits
            .per_minute
            .saturating_sub(before.user_minute.saturating_add(1)),
        reset_time: WindowKind::Minute.next_start(unix_secs(now)),
        retry_after: None,
        queue_depth: queue_len.min(limits.queue_depth),
        source: DecisionSource::Shared,
    }
}

fn denied(limits: &AdmissionLimits, before: &CounterSnapshot, now: SystemTime) -> Decision {
    Decision {
        allowed: false,
        limit: limits.per_minute,
        requests_remaining: limits.per_minute.saturating_sub(before.user_minute),
        reset_time: WindowKind::Minute.next_start(unix_secs(now)),
        retry_after: Some(secs_until_next_minute(now)),
        queue_depth: before.queue_depth.min(limits.queue_depth),
        source: DecisionSource::Shared,
    }
}

fn strict_denial(rule: &Rule, now: SystemTime) -> Decision {
    Decision {
        allowed: false,
        limit: rule.requests_per_minute,
        requests_remaining: 0,
        reset_time: WindowKind::Minute.next_start(unix_secs(now)),
        retry_after: Some(secs_until_next_minute(now)),
        queue_depth: 0,
        source: DecisionSource::Strict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{PeekedCounts, ReservedCounts};
    use crate::domain::rule::Quota;
    use crate::infrastructure::mocks::{MockClock, UnavailableStore};
    use async_trait::async_trait;

    fn clock() -> MockClock {
        // 10 seconds into a minute window
        MockClock::new(UNIX_EPOCH + Duration::from_secs(1_700_000_010))
    }

    fn engine_with(store: Arc<dyn CounterStore>, clock: &MockClock) -> AdmissionEngine {
        AdmissionEngine::builder()
            .with_store(store)
            .with_clock(Arc::new(clock.clone()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_rejects_zero_settings() {
        assert_eq!(
            AdmissionEngine::builder()
                .with_store_timeout(Duration::ZERO)
                .build()
                .unwrap_err(),
            BuildError::ZeroStoreTimeout
        );
        assert_eq!(
            AdmissionEngine::builder()
                .with_estimated_active_users(0)
                .build()
                .unwrap_err(),
            BuildError::ZeroEstimatedActiveUsers
        );
        assert_eq!(
            AdmissionEngine::builder()
                .with_key_prefix("")
                .build()
                .unwrap_err(),
            BuildError::EmptyKeyPrefix
        );
        assert_eq!(
            AdmissionEngine::builder()
                .with_circuit_breaker(CircuitBreakerConfig {
                    failure_threshold: 0,
                    recovery_timeout: Duration::from_secs(1),
                })
                .build()
                .unwrap_err(),
            BuildError::ZeroFailureThreshold
        );
    }

    #[test]
    fn test_plan_layout() {
        let clock = clock();
        let engine = engine_with(Arc::new(InMemoryCounterStore::new()), &clock);
        let id = CallerIdentity::new("u1", "acme", false);
        let rule = engine.catalog().lookup(Tier::Standard, Category::Write);
        let limits = engine.limits(Tier::Standard, &rule);

        let plan = engine.plan(&id, Category::Write, Tier::Standard, &limits, clock.now());
        let keys: Vec<&str> = plan.counters.iter().map(|c| c.key.as_str()).collect();
        let minute = 1_700_000_010 / 60;
        let hour = 1_700_000_010 / 3_600;
        assert_eq!(
            keys,
            vec![
                format!("ratelimit:user:u1:write:minute:{minute}"),
                format!("ratelimit:user:u1:write:hour:{hour}"),
                format!("ratelimit:org:acme:write:minute:{minute}"),
                format!("ratelimit:org:acme:write:hour:{hour}"),
                "ratelimit:global:standard:second:1700000010".to_string(),
            ]
        );
        assert_eq!(plan.queue.key, "ratelimit:queue:acme:write");
        assert_eq!(plan.queue.max_len, rule.queue_depth_limit + 1);
        assert_eq!(plan.limits, limits);
        assert_eq!(plan.counters[0].ttl, Duration::from_secs(120));
        assert_eq!(plan.counters[1].ttl, Duration::from_secs(7_200));
    }

    #[test]
    fn test_marker_tokens_are_unique() {
        let clock = clock();
        let engine = engine_with(Arc::new(InMemoryCounterStore::new()), &clock);
        let id = CallerIdentity::new("u1", "acme", false);
        let a = engine.marker_token(&id, clock.now());
        let b = engine.marker_token(&id, clock.now());
        assert_ne!(a, b);
        assert!(a.starts_with("u1:1700000010000:"));
    }

    #[derive(Debug)]
    struct ShortReplyStore;

    #[async_trait]
    impl CounterStore for ShortReplyStore {
        async fn reserve(&self, _: &Reservation) -> Result<ReservedCounts, StoreError> {
            Ok(ReservedCounts {
                admitted: true,
                counters: vec![1, 1],
                queue_len: 1,
            })
        }
        async fn pop_marker(&self, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn peek(&self, _: &[String], _: &str) -> Result<PeekedCounts, StoreError> {
            Ok(PeekedCounts {
                counters: vec![],
                queue_len: 0,
            })
        }
    }

    #[tokio::test]
    async fn test_malformed_reply_uses_fallback() {
        let clock = clock();
        let engine = engine_with(Arc::new(ShortReplyStore), &clock);
        let id = CallerIdentity::new("u1", "acme", false);

        let decision = engine.check(&id, Category::Read).await;
        assert!(decision.allowed);
        assert_eq!(decision.source, DecisionSource::Fallback);
        assert_eq!(engine.accounting().store_errors(), 1);
    }

    #[tokio::test]
    async fn test_strict_rule_fails_closed() {
        let clock = clock();
        let standard = Quota::standard().with_rule(
            Category::Admin,
            Rule::new(30, 300, 5, 10).with_graceful_degradation(false),
        );
        let catalog = QuotaCatalog::new(standard, Quota::premium()).unwrap();
        let engine = AdmissionEngine::builder()
            .with_store(Arc::new(UnavailableStore::new()))
            .with_clock(Arc::new(clock.clone()))
            .with_catalog(catalog)
            .build()
            .unwrap();
        let id = CallerIdentity::new("u1", "acme", false);

        let decision = engine.check(&id, Category::Admin).await;
        assert!(!decision.allowed);
        assert_eq!(decision.source, DecisionSource::Strict);
        assert_eq!(decision.retry_after, Some(50));

        // Other categories still degrade to the fallback limiter
        let decision = engine.check(&id, Category::Read).await;
        assert!(decision.allowed);
        assert_eq!(decision.source, DecisionSource::Fallback);
    }

    #[tokio::test]
    async fn test_circuit_opens_and_skips_store() {
        let clock = clock();
        let store = Arc::new(UnavailableStore::new());
        let engine = AdmissionEngine::builder()
            .with_store(store.clone())
            .with_clock(Arc::new(clock.clone()))
            .with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
            })
            .build()
            .unwrap();
        let id = CallerIdentity::new("u1", "acme", false);

        for _ in 0..5 {
            assert!(engine.check(&id, Category::Read).await.allowed);
        }
        assert_eq!(engine.circuit_state(), CircuitState::Open);
        assert_eq!(store.calls(), 2);
        assert_eq!(engine.accounting().fallback_decisions(), 5);
    }
}
