// Service registry benchmarks: ranked registration and filtered lookup,
// the two operations on the hot path of every bind/rebind cycle.

use std::any::Any;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusty_ipopo::ldap::{Filter, Properties, PropertyValue};
use rusty_ipopo::registry::{EventDispatcher, Provider, ServiceRegistry};

fn registry_with(n: usize) -> ServiceRegistry {
    let registry = ServiceRegistry::new(Arc::new(EventDispatcher::new()));
    for i in 0..n {
        let mut props = Properties::new();
        props.insert("service.ranking".to_string(), PropertyValue::Int((i % 50) as i64));
        props.insert("kind".to_string(), PropertyValue::Str(if i % 3 == 0 { "red".to_string() } else { "blue".to_string() }));
        registry
            .register(1, vec!["bench.spec".to_string()], props, Provider::Instance(Arc::new(i) as Arc<dyn Any + Send + Sync>))
            .unwrap();
    }
    registry
}

fn bench_register(c: &mut Criterion) {
    let mut group = c.benchmark_group("register");
    for n in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("ranked_insert", n), &n, |b, &n| {
            b.iter(|| {
                let registry = registry_with(black_box(n));
                black_box(&registry);
            });
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");
    for n in [10usize, 100, 1000] {
        let registry = registry_with(n);
        let filter = Filter::parse("(kind=red)").unwrap();
        group.bench_with_input(BenchmarkId::new("filtered_find", n), &n, |_b, _n| {
            _b.iter(|| {
                let found = registry.find_service_references(Some("bench.spec"), Some(&filter), false).unwrap();
                black_box(found.len());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_register, bench_lookup);
criterion_main!(benches);
