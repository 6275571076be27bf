use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tower::ServiceExt;

use relay_gateway::cache::{MemoryCache, fingerprint};
use relay_gateway::config::{ApiType, GatewayConfig, Provider, Settings};
use relay_gateway::events::BroadcastPublisher;
use relay_gateway::gateway::Gateway;
use relay_gateway::logging::{RequestLog, RequestRecorder};
use relay_gateway::providers::HttpUpstream;
use relay_gateway::routing::ProviderRegistry;
use relay_gateway::server::admin_app;
use relay_gateway::stats::StatsAggregator;

fn build_bench_gateway() -> Arc<Gateway> {
    let settings = Settings::default();
    let providers: Vec<Provider> = (0..8)
        .map(|i| {
            serde_json::from_value(serde_json::json!({
                "id": format!("p{}", i),
                "name": format!("Provider {}", i),
                "base_url": format!("http://127.0.0.1:{}/v1", 20000 + i),
                "api_key": "sk-bench-0000000000",
            }))
            .unwrap()
        })
        .collect();
    let events = Arc::new(BroadcastPublisher::default());
    let registry = Arc::new(
        ProviderRegistry::new(
            GatewayConfig {
                providers,
                ..Default::default()
            },
            events.clone(),
        )
        .unwrap(),
    );
    let stats = Arc::new(StatsAggregator::new(settings.stats.clone()));
    let recorder = RequestRecorder::new(stats);
    for i in 0..2_000u32 {
        let mut log = RequestLog::new(ApiType::OpenaiChat, "POST", "/v1/chat/completions", "bench");
        log.provider_id = Some(format!("p{}", i % 8));
        log.status = if i % 10 == 0 { 502 } else { 200 };
        log.duration_ms = u64::from(i % 700);
        log.input_tokens = 120;
        log.output_tokens = 40;
        recorder.record(log);
    }
    let upstream = Arc::new(HttpUpstream::new(Duration::from_secs(1)).unwrap());
    let cache = Arc::new(MemoryCache::from_config(&settings.cache));
    Arc::new(Gateway::new(registry, upstream, cache, recorder, events, settings))
}

fn bench_endpoints(c: &mut Criterion) {
    let gateway = build_bench_gateway();
    let app = admin_app(gateway);
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("endpoints");
    group.measurement_time(Duration::from_secs(5));

    for uri in ["/api/stats", "/api/stats/hourly?hours=24", "/api/health"] {
        group.bench_function(BenchmarkId::new("GET", uri), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
                    let resp = app.clone().oneshot(req).await.unwrap();
                    assert_eq!(resp.status(), StatusCode::OK);
                    black_box(resp);
                })
            })
        });
    }
    group.finish();

    let body = serde_json::json!({
        "model": "gpt-4o",
        "temperature": 0.7,
        "stream": false,
        "messages": [
            {"role": "system", "content": "You are terse."},
            {"role": "user", "content": "Summarise the plot of Hamlet in one sentence."}
        ]
    });
    c.bench_function("fingerprint/chat", |b| {
        b.iter(|| black_box(fingerprint(ApiType::OpenaiChat, "gpt-4o", &[], black_box(&body))))
    });
}

criterion_group!(benches, bench_endpoints);
criterion_main!(benches);
