use criterion::{criterion_group, criterion_main, Criterion};
use crabpot_core::scanner::scan;

fn bench_scan_clean_payload(c: &mut Criterion) {
    let payload = "GET /v1/chat HTTP/1.1\nHost: api.example.com\n".repeat(50);
    c.bench_function("scan_clean_payload", |b| {
        b.iter(|| scan(&payload));
    });
}

fn bench_scan_with_obfuscated_secret(c: &mut Criterion) {
    use base64::Engine;
    let secret = base64::engine::general_purpose::STANDARD
        .encode("sk-abcdefghijklmnopqrstuvwxyz1234567890");
    let payload = format!("POST /upload HTTP/1.1\nX-Data: {secret}\n");
    c.bench_function("scan_with_obfuscated_secret", |b| {
        b.iter(|| scan(&payload));
    });
}

criterion_group!(benches, bench_scan_clean_payload, bench_scan_with_obfuscated_secret);
criterion_main!(benches);
