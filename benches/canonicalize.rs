use criterion::{criterion_group, criterion_main, Criterion};
use genome_anchor::genome::{Binding, GenomeCodec, GenomeModel, HashEngine, Unit, UnitKind};
use serde_json::json;

fn wide_genome(units: usize) -> GenomeModel {
    let mut genome = GenomeModel::minimal("bench-instance", "0".repeat(64));
    for i in 0..units {
        genome.units.push(
            Unit::new(format!("unit_{}", i), UnitKind::Relay)
                .with_param("binding", json!(format!("b_{}", i % 8)))
                .with_param("limits", json!({"max": i, "lang": "en", "tags": ["a", "b"]}))
                .with_cost(0.5),
        );
    }
    for i in 0..8 {
        genome.bindings.push(Binding::new(
            format!("b_{}", i),
            format!("mcp:tool-{}", i),
            format!("https://tools.example.org/{}", i),
        ));
    }
    genome
}

fn bench_canonicalize(c: &mut Criterion) {
    let small = wide_genome(4);
    let large = wide_genome(256);

    c.bench_function("canonicalize_4_units", |b| {
        b.iter(|| HashEngine::canonicalize(&small))
    });

    c.bench_function("digest_256_units", |b| {
        b.iter(|| HashEngine::genome_digest(&large))
    });

    let wire = GenomeCodec::encode(&large).map(|e| e.wire.into_bytes()).unwrap_or_default();
    c.bench_function("decode_256_units", |b| {
        b.iter(|| GenomeCodec::decode(&wire))
    });
}

criterion_group!(benches, bench_canonicalize);
criterion_main!(benches);
