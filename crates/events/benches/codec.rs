use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use herald_events::DomainEvent;
use serde_json::{Value as JsonValue, json};

fn payload(fields: usize) -> JsonValue {
    let map: serde_json::Map<String, JsonValue> = (0..fields)
        .map(|i| (format!("field_{i}"), json!({"n": i, "label": format!("value-{i}")})))
        .collect();
    JsonValue::Object(map)
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_codec");

    for fields in [1usize, 16, 256] {
        let event = DomainEvent::new("user.registered", payload(fields)).with_domain_object_id("42");
        let bytes = event.to_json_bytes().unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", fields), &event, |b, event| {
            b.iter(|| black_box(event.to_json_bytes().unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("decode", fields), &bytes, |b, bytes| {
            b.iter(|| black_box(DomainEvent::from_slice(bytes).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
