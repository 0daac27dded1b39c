use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::StatusCode;
use tlsgate::cache::{self, ResponseCache};
use tlsgate::compression::CompressionHandler;
use tlsgate::config::Config;
use tlsgate::routing::Route;

fn config_with_hosts(count: usize) -> Config {
    let mut config = Config::default();
    for i in 0..count {
        config.routes.insert(
            format!("app{}.example.com", i),
            format!("http://10.0.{}.{}:8080", i / 250, i % 250),
        );
    }
    config
}

fn bench_route_exact(c: &mut Criterion) {
    let config = config_with_hosts(100);

    c.bench_function("route_exact_100_hosts", |b| {
        b.iter(|| {
            let route = Route::resolve(&config, black_box("app42.example.com"));
            black_box(route)
        })
    });
}

fn bench_route_wildcard(c: &mut Criterion) {
    let config = config_with_hosts(100);

    c.bench_function("route_wildcard_fallback", |b| {
        b.iter(|| {
            let route = Route::resolve(&config, black_box("unknown.example.com:8443"));
            black_box(route)
        })
    });
}

fn bench_cache_lookup(c: &mut Criterion) {
    let cache = ResponseCache::new();
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));

    for i in 0..1000 {
        cache.store(
            cache::cache_key("https", "app.example.com", &format!("/page/{}", i)),
            StatusCode::OK,
            &headers,
            Bytes::from(vec![b'x'; 2048]),
        );
    }
    let key = cache::cache_key("https", "app.example.com", "/page/500");

    c.bench_function("cache_lookup_1000_entries", |b| {
        b.iter(|| black_box(cache.get(black_box(&key))))
    });
}

fn bench_etag(c: &mut Criterion) {
    let headers = HeaderMap::new();
    let body = vec![b'a'; 64 * 1024];

    c.bench_function("etag_sha256_64k", |b| {
        b.iter(|| black_box(cache::etag_for(&headers, black_box(&body))))
    });
}

fn bench_gzip(c: &mut Criterion) {
    let handler = CompressionHandler::default();
    let body = "<p>tlsgate benchmark payload</p>\n".repeat(1000);

    c.bench_function("gzip_33k_html", |b| {
        b.iter(|| black_box(handler.compress_gzip(black_box(body.as_bytes()))))
    });
}

criterion_group!(
    benches,
    bench_route_exact,
    bench_route_wildcard,
    bench_cache_lookup,
    bench_etag,
    bench_gzip
);
criterion_main!(benches);
