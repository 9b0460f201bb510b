//! Connection pool and relay hot-path benchmarks
//!
//! Benchmarks for:
//! - Checkout/release on a warm pool
//! - Concurrent checkouts sharing a few connections
//! - Download URL rewriting

use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use grpc_relay::config::PoolConfig;
use grpc_relay::grpc::pool::{ConnectionPool, Connector};
use grpc_relay::{PoolError, UrlRewriter};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::Runtime;

/// Connector that never touches the network
#[derive(Default)]
struct InstantConnector {
    dials: AtomicUsize,
}

#[async_trait]
impl Connector for InstantConnector {
    type Conn = usize;

    async fn connect(&self) -> Result<usize, PoolError> {
        Ok(self.dials.fetch_add(1, Ordering::Relaxed))
    }
}

fn warm_pool(rt: &Runtime, max_active: usize) -> Arc<ConnectionPool<InstantConnector>> {
    let config = PoolConfig {
        max_active,
        max_idle: max_active,
        max_concurrent_streams: 100,
        ..Default::default()
    };
    let pool = Arc::new(ConnectionPool::new(InstantConnector::default(), config));
    rt.block_on(pool.warm_up()).unwrap();
    pool
}

/// Benchmark a single checkout and release on a warm pool
fn bench_acquire_release(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("pool_acquire_release");

    for connections in [1, 4, 16] {
        let pool = warm_pool(&rt, connections);
        group.bench_with_input(
            BenchmarkId::new("connections", connections),
            &pool,
            |b, pool| {
                b.to_async(&rt).iter(|| async {
                    let conn = pool.acquire().await.unwrap();
                    black_box(conn.value());
                });
            },
        );
    }
    group.finish();
}

/// Benchmark bursts of concurrent checkouts held across a yield
fn bench_concurrent_acquire(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("pool_concurrent_acquire");
    let pool = warm_pool(&rt, 4);

    for callers in [8, 64, 256] {
        group.bench_with_input(BenchmarkId::new("callers", callers), &callers, |b, &n| {
            b.to_async(&rt).iter(|| {
                let pool = pool.clone();
                async move {
                    let mut tasks = tokio::task::JoinSet::new();
                    for _ in 0..n {
                        let pool = pool.clone();
                        tasks.spawn(async move {
                            let conn = pool.acquire().await.unwrap();
                            tokio::task::yield_now().await;
                            drop(conn);
                        });
                    }
                    while tasks.join_next().await.is_some() {}
                }
            });
        });
    }
    group.finish();
}

/// Benchmark download URL rewriting
fn bench_url_rewrite(c: &mut Criterion) {
    let rewriter = UrlRewriter::new("https", "proxy.example.com:8443", "/download-proxy").unwrap();
    let mut group = c.benchmark_group("url_rewrite");

    for (name, url) in [
        ("plain", "http://backend-host/download/file.bin"),
        (
            "query",
            "http://backend-host:9000/download/a/b/c/file.bin?token=abcdef&expires=1700000000",
        ),
        ("malformed", "http://exa mple/%%"),
    ] {
        group.bench_with_input(BenchmarkId::new("url", name), url, |b, url| {
            b.iter(|| black_box(rewriter.rewrite(black_box(url))));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_acquire_release,
    bench_concurrent_acquire,
    bench_url_rewrite
);
criterion_main!(benches);
