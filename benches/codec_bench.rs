//! Benchmarks for wire-level framing and the DNSCrypt crypto box.
//!
//! Run with: cargo bench

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use dnscrypt_relay::codec;
use dnscrypt_relay::crypto::{self, Aead2, Keypair, SharedBox};

fn sample_query(id: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(32);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]);
    packet.extend_from_slice(&[0x00, 0x01]);
    packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in "example.com".split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0x00);
    packet.extend_from_slice(&[0x00, 0x01]);
    packet.extend_from_slice(&[0x00, 0x01]);
    packet
}

fn bench_header_accessors(c: &mut Criterion) {
    let query = sample_query(0x1234);

    let mut group = c.benchmark_group("codec");
    group.bench_function("tid", |b| b.iter(|| codec::tid(black_box(&query))));
    group.bench_function("has_tc", |b| b.iter(|| codec::has_tc(black_box(&query))));
    group.bench_function("truncated_response", |b| {
        b.iter(|| codec::truncated_response(black_box(&query)))
    });
    group.bench_function("servfail_response", |b| {
        b.iter(|| codec::servfail_response(black_box(&query)))
    });
    group.finish();
}

fn bench_padding(c: &mut Criterion) {
    let query = sample_query(0x1234);

    let mut group = c.benchmark_group("padding");
    group.throughput(Throughput::Bytes(query.len() as u64));
    group.bench_function(BenchmarkId::new("pad", "512"), |b| {
        b.iter(|| crypto::pad(black_box(&query), 512))
    });

    let padded = crypto::pad(&query, 512);
    group.bench_function(BenchmarkId::new("unpad", "512"), |b| {
        b.iter(|| crypto::unpad(black_box(&padded)).unwrap())
    });
    group.finish();
}

fn bench_crypto_box(c: &mut Criterion) {
    let client = Keypair::generate();
    let server = Keypair::generate();
    let shared = SharedBox::derive(&client, &server.public_bytes(), Aead2::XChaCha20Poly1305);
    let query = sample_query(0x1234);
    let client_magic = *b"q6fnvWj8";
    let client_nonce = crypto::fresh_client_nonce();

    let mut group = c.benchmark_group("crypto_box");
    group.bench_function("encrypt_query", |b| {
        b.iter(|| {
            crypto::encrypt_query(
                black_box(&shared),
                &client_magic,
                &client.public_bytes(),
                &client_nonce,
                &query,
                512,
            )
            .unwrap()
        })
    });

    group.bench_function("derive_shared_box", |b| {
        b.iter(|| SharedBox::derive(black_box(&client), &server.public_bytes(), Aead2::XChaCha20Poly1305))
    });
    group.finish();
}

criterion_group!(benches, bench_header_accessors, bench_padding, bench_crypto_box);
criterion_main!(benches);
