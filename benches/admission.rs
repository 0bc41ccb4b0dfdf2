use admission_gate::{
    AdmissionEngine, AdmissionLimits, CallerIdentity, Category, CounterSnapshot, FallbackLimiter,
    InMemoryCounterStore, Quota, QuotaCatalog, RequestClassifier, Rule, SystemClock,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Limits high enough that benchmarks measure the admit path.
fn roomy_catalog() -> QuotaCatalog {
    let rule = Rule::new(1_000_000, 100_000_000, 0, 1_000_000);
    let quota = |m: f64| {
        Category::ALL
            .iter()
            .fold(Quota::new(m), |q, c| q.with_rule(*c, rule))
    };
    QuotaCatalog::new(quota(1.5), quota(2.0)).unwrap()
}

fn engine() -> Arc<AdmissionEngine> {
    Arc::new(
        AdmissionEngine::builder()
            .with_catalog(roomy_catalog())
            .build()
            .unwrap(),
    )
}

/// Benchmark the pure admission predicate
fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");
    let rule = Rule::new(60, 1_000, 10, 10);
    let limits = AdmissionLimits::derive(&rule, &Quota::standard(), 10);

    let under = CounterSnapshot {
        user_minute: 5,
        user_hour: 50,
        org_minute: 50,
        org_hour: 500,
        queue_depth: 2,
        global_second: None,
    };
    let bursting = CounterSnapshot {
        user_minute: 65,
        ..under
    };

    group.bench_function("under_limits", |b| {
        b.iter(|| limits.evaluate(black_box(&under)))
    });
    group.bench_function("burst_headroom", |b| {
        b.iter(|| limits.evaluate(black_box(&bursting)))
    });

    group.finish();
}

/// Benchmark request classification
fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");
    let classifier = RequestClassifier::new();

    for (method, path) in [
        ("GET", "/api/v1/documents/42"),
        ("POST", "/api/v1/auth/login"),
        ("GET", "/api/v1/reports/monthly/download"),
    ] {
        group.bench_with_input(BenchmarkId::new(method, path), &path, |b, path| {
            b.iter(|| classifier.classify(black_box(method), black_box(path)))
        });
    }
    group.bench_function("exempt", |b| {
        b.iter(|| classifier.is_exempt(black_box("/health")))
    });

    group.finish();
}

/// Benchmark full checks against the in-process store
fn bench_engine_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_check");
    let rt = Runtime::new().unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("single_user", |b| {
        let engine = engine();
        let (engine, caller) = (&*engine, &CallerIdentity::new("alice", "acme", false));
        b.to_async(&rt)
            .iter(move || async move { black_box(engine.check(caller, Category::Read).await) })
    });

    group.bench_function("many_users", |b| {
        let engine = engine();
        let callers: Vec<CallerIdentity> = (0..1_000)
            .map(|i| CallerIdentity::new(format!("user-{i}"), format!("org-{}", i % 10), false))
            .collect();
        let (engine, callers) = (&*engine, &callers);
        let mut next = 0;
        b.to_async(&rt).iter(move || {
            let caller = &callers[next % callers.len()];
            next += 1;
            async move { black_box(engine.check(caller, Category::Write).await) }
        })
    });

    group.bench_function("preview", |b| {
        let engine = engine();
        let (engine, caller) = (&*engine, &CallerIdentity::new("alice", "acme", false));
        b.to_async(&rt)
            .iter(move || async move { black_box(engine.preview(caller, Category::Read).await) })
    });

    group.finish();
}

/// Benchmark concurrent checks from many tasks
fn bench_concurrent_checks(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_checks");
    let rt = Runtime::new().unwrap();

    for tasks in [4usize, 16, 64] {
        group.throughput(Throughput::Elements((tasks * 100) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            let engine = engine();
            b.to_async(&rt).iter(|| {
                let engine = Arc::clone(&engine);
                async move {
                    let handles: Vec<_> = (0..tasks)
                        .map(|t| {
                            let engine = Arc::clone(&engine);
                            tokio::spawn(async move {
                                let caller = CallerIdentity::new(format!("user-{t}"), "acme", false);
                                for _ in 0..100 {
                                    black_box(engine.check(&caller, Category::Read).await);
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        let _ = handle.await;
                    }
                }
            })
        });
    }

    group.finish();
}

/// Benchmark the in-process fallback limiter
fn bench_fallback(c: &mut Criterion) {
    let mut group = c.benchmark_group("fallback");
    let rule = Rule::new(1_000_000, 100_000_000, 0, 10);

    group.throughput(Throughput::Elements(1000));
    group.bench_function("check_1000_users", |b| {
        let limiter = FallbackLimiter::new(Arc::new(SystemClock::new()));
        let users: Vec<String> = (0..1_000).map(|i| format!("user-{i}")).collect();
        b.iter(|| {
            for user in &users {
                black_box(limiter.check(user, Category::Read, &rule));
            }
        })
    });

    group.bench_function("sweep", |b| {
        let limiter = FallbackLimiter::new(Arc::new(SystemClock::new()));
        for i in 0..1_000 {
            limiter.check(&format!("user-{i}"), Category::Read, &rule);
        }
        b.iter(|| black_box(limiter.sweep()))
    });

    group.finish();
}

/// Benchmark raw store reservations
fn bench_memory_store(c: &mut Criterion) {
    use admission_gate::application::ports::{CounterSlot, CounterStore, QueueSlot, Reservation};
    use admission_gate::AdmissionLimits;
    use std::time::Duration;

    let mut group = c.benchmark_group("memory_store");
    let rt = Runtime::new().unwrap();
    let store = InMemoryCounterStore::new();
    let reservation = |per_minute: u64| Reservation {
        counters: (0..4)
            .map(|i| CounterSlot {
                key: format!("bench:counter:{i}"),
                ttl: Duration::from_secs(120),
            })
            .collect(),
        queue: QueueSlot {
            key: "bench:queue".to_string(),
            token: "marker".to_string(),
            max_len: 11,
            ttl: Duration::from_secs(300),
        },
        limits: AdmissionLimits {
            per_minute,
            per_hour: u64::MAX,
            burst_allowance: 0,
            org_per_minute: u64::MAX,
            org_per_hour: u64::MAX,
            queue_depth: u64::MAX,
            global_per_second: None,
        },
    };
    let admitted = reservation(u64::MAX);
    let denied = reservation(0);

    let (store, admitted, denied) = (&store, &admitted, &denied);
    group.bench_function("reserve_admitted", |b| {
        b.to_async(&rt)
            .iter(move || async move { black_box(store.reserve(admitted).await.unwrap()) })
    });
    group.bench_function("reserve_denied", |b| {
        b.to_async(&rt)
            .iter(move || async move { black_box(store.reserve(denied).await.unwrap()) })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_evaluate,
    bench_classify,
    bench_engine_check,
    bench_concurrent_checks,
    bench_fallback,
    bench_memory_store
);
criterion_main!(benches);
