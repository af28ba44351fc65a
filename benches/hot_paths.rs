use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use apm_ingest::cache::EventCache;
use apm_ingest::model::{ErrorPropagation, ErrorReport, RelationNode, SpanTrace};
use apm_ingest::signal::SignalCache;
use apm_ingest::store::rows::encode_all;
use apm_ingest::tenant::TenantKey;

fn span(i: u64) -> SpanTrace {
    let mut labels = BTreeMap::new();
    labels.insert("content_key".to_string(), "GET /orders/{id}".to_string());
    labels.insert("threshold_type".to_string(), "p90".to_string());

    SpanTrace {
        timestamp_ns: 1_700_000_000_000_000_000 + i,
        trace_id: format!("trace-{i}"),
        apm_span_id: format!("span-{i}"),
        service_name: "orders".to_string(),
        url: "GET /orders/{id}".to_string(),
        pid: 4242,
        tid: 4243,
        container_id: "c0ffee".to_string(),
        node_name: "node-1".to_string(),
        node_ip: "10.0.0.1".to_string(),
        start_time_ns: 1_000,
        end_time_ns: 2_000_000,
        duration_ns: 1_999_000,
        is_slow: i % 3 == 0,
        labels,
        ..Default::default()
    }
}

fn error_report() -> ErrorReport {
    let leaf = |name: &str| RelationNode {
        service_name: name.to_string(),
        url: format!("/{name}"),
        is_traced: true,
        is_error: true,
        error_types: vec!["java.io.IOException".to_string()],
        error_msgs: vec!["connection reset".to_string()],
        ..Default::default()
    };

    ErrorReport {
        trace_id: "trace-err".to_string(),
        relation_tree: Some(RelationNode {
            service_name: "gateway".to_string(),
            url: "/checkout".to_string(),
            span_id: "root".to_string(),
            children: vec![
                RelationNode {
                    children: vec![leaf("payments"), leaf("ledger")],
                    ..leaf("orders")
                },
                leaf("inventory"),
            ],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn bench_append_drain(c: &mut Criterion) {
    let cache = EventCache::new();
    let spans: Vec<SpanTrace> = (0..256).map(span).collect();

    c.bench_function("cache/append_drain_256_spans", |b| {
        b.iter(|| {
            cache.span_traces.extend(black_box(spans.iter().cloned()));
            black_box(cache.span_traces.drain().len())
        })
    });
}

fn bench_encode(c: &mut Criterion) {
    let spans: Vec<SpanTrace> = (0..256).map(span).collect();
    let report = error_report();

    c.bench_function("rows/encode_256_spans", |b| {
        b.iter(|| black_box(encode_all(black_box(&spans)).len()))
    });

    c.bench_function("rows/error_propagation", |b| {
        b.iter(|| {
            let propagation = ErrorPropagation::from_report(black_box(&report));
            black_box(propagation.map(|p| encode_all(&[p]).len()))
        })
    });
}

fn bench_signals(c: &mut Criterion) {
    let signals = SignalCache::default();
    let tenant = TenantKey::none();
    let spans: Vec<SpanTrace> = (0..64).map(span).collect();

    c.bench_function("signal/add_query_collect_64", |b| {
        b.iter(|| {
            for span in &spans {
                signals.add_signal(&tenant, "gateway", "/checkout", black_box(span), false);
            }
            let switches = signals.query_silent_switches(&tenant, "10.0.0.1");
            black_box(switches.close.len());
            black_box(signals.collect_once(0).len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_append_drain(c);
    bench_encode(c);
    bench_signals(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
