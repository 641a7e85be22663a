use criterion::{black_box, criterion_group, criterion_main, Criterion};
use portero::config::{Config, PoolingMode, RouteSchemeConfig};
use portero::core::RoutePool;
use std::sync::Arc;
use std::time::Duration;

fn route_configs(count: usize) -> Vec<RouteSchemeConfig> {
    (0..count)
        .map(|i| RouteSchemeConfig {
            database: format!("app{}", i),
            forced_database: None,
            forced_user: None,
            server_addr: "127.0.0.1:5432".to_string(),
            pooling_mode: PoolingMode::Session,
            pool_size: 20,
            default: false,
        })
        .collect()
}

fn bench_scheme_matching(c: &mut Criterion) {
    let config = Config {
        routes: route_configs(32),
        ..Default::default()
    };
    let schemes = config.scheme_set().unwrap();

    c.bench_function("scheme_match_hit", |b| {
        b.iter(|| black_box(schemes.match_database(black_box("app17"))))
    });

    c.bench_function("scheme_match_miss", |b| {
        b.iter(|| black_box(schemes.match_database(black_box("unknown"))))
    });
}

fn bench_route_resolution(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let config = Config {
        routes: route_configs(32),
        ..Default::default()
    };
    let routes = RoutePool::new(
        Arc::new(config.scheme_set().unwrap()),
        Duration::from_secs(1),
    );

    // Materialize the route so the benchmark measures the hot lookup path.
    runtime.block_on(async {
        routes.resolve("app17", "alice").await.unwrap();
    });

    c.bench_function("resolve_existing_route", |b| {
        b.iter(|| {
            runtime.block_on(async {
                black_box(routes.resolve(black_box("app17"), black_box("alice")).await)
            })
        })
    });
}

criterion_group!(benches, bench_scheme_matching, bench_route_resolution);
criterion_main!(benches);
