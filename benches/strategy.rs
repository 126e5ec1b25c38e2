//! SwKit worker benchmarks
//!
//! Run with: cargo bench -p swkit-sw

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use http::StatusCode;
use swkit_net::{Request, Response, UrlPattern};
use swkit_sw::{classify, format_bytes, BucketName, CacheStorage, MatchScope, RequestKey};
use url::Url;

fn classify_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");
    let origin = Url::parse("http://localhost:8000/").unwrap();
    let game = vec![UrlPattern::prefix("https://slopeunblocked.bitbucket.io/file/")];

    let requests = [
        ("navigation", Request::navigate(Url::parse("http://localhost:8000/").unwrap())),
        ("same_origin", Request::get(Url::parse("http://localhost:8000/app.js").unwrap())),
        (
            "game_asset",
            Request::get(Url::parse("https://slopeunblocked.bitbucket.io/file/Build/slope.wasm").unwrap()),
        ),
        ("other", Request::get(Url::parse("https://fonts.example/inter.woff2").unwrap())),
    ];

    for (name, request) in &requests {
        group.bench_with_input(BenchmarkId::new("route", name), request, |b, request| {
            b.iter(|| classify(request, &origin, &game))
        });
    }

    group.finish();
}

fn storage_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage");
    let bucket = BucketName::new("core", "v1");

    for count in [10usize, 100, 1000] {
        let keys = generate_keys(count);
        let body = "x".repeat(1024);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("put", count), &keys, |b, keys| {
            b.iter(|| {
                let mut storage = CacheStorage::new();
                for key in keys {
                    storage
                        .put(&bucket, key.clone(), Response::synthetic(StatusCode::OK, &body))
                        .unwrap();
                }
                storage
            })
        });

        let mut storage = CacheStorage::new();
        for key in &keys {
            storage
                .put(&bucket, key.clone(), Response::synthetic(StatusCode::OK, &body))
                .unwrap();
        }
        group.bench_with_input(BenchmarkId::new("match_all", count), &keys, |b, keys| {
            b.iter(|| keys.iter().filter(|k| storage.match_request(MatchScope::All, k).is_some()).count())
        });
        group.bench_function(BenchmarkId::new("stats", count), |b| b.iter(|| storage.stats()));
    }

    group.finish();
}

fn format_benchmarks(c: &mut Criterion) {
    c.bench_function("format_bytes", |b| {
        b.iter(|| [0u64, 350, 1536, 1_048_576, 5_368_709_120].map(format_bytes))
    });
}

fn generate_keys(count: usize) -> Vec<RequestKey> {
    (0..count)
        .map(|i| {
            let url = Url::parse(&format!("http://localhost:8000/assets/{}.js", i)).unwrap();
            RequestKey::get(&url)
        })
        .collect()
}

criterion_group!(benches, classify_benchmarks, storage_benchmarks, format_benchmarks);
criterion_main!(benches);
