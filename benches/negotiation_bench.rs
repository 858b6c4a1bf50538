//! Benchmarks for the upgrade handshake path
//!
//! Run with: cargo bench

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use sockudo_negotiator::extension::ExtensionConfig;
use sockudo_negotiator::handshake::{build_response, generate_accept_key, parse_request};
use sockudo_negotiator::negotiator;
use sockudo_negotiator::prelude::*;

struct NullHandler;

impl FrameHandler for NullHandler {
    fn on_frame(&mut self, _frame: Frame) -> Result<()> {
        Ok(())
    }
}

fn request(extra_headers: usize) -> Vec<u8> {
    let mut req = String::from(
        "GET /chat HTTP/1.1\r\n\
         Host: server.example.com\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: chat, superchat\r\n\
         Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits, x-custom\r\n",
    );
    for i in 0..extra_headers {
        req.push_str(&format!("X-Header-{}: value-{}\r\n", i, i));
    }
    req.push_str("\r\n");
    req.into_bytes()
}

/// Benchmark request parsing
fn bench_parse_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_request");

    for extra in [0, 8, 32] {
        let req = request(extra);
        group.throughput(Throughput::Bytes(req.len() as u64));

        group.bench_with_input(BenchmarkId::new("headers", extra), &req, |b, req| {
            b.iter(|| parse_request(black_box(req)));
        });
    }

    group.finish();
}

/// Benchmark the negotiator driver plus response building
fn bench_negotiate(c: &mut Criterion) {
    let mut group = c.benchmark_group("negotiate");
    let (req, _) = parse_request(&request(0)).unwrap().unwrap();

    let default = DefaultNegotiator::new(|_: &Negotiation| NullHandler).subprotocols(["chat"]);
    group.bench_function("default_negotiator", |b| {
        b.iter(|| {
            let mut negotiation = Negotiation::new(&req.path, req.headers.clone()).unwrap();
            let outcome = negotiator::negotiate(&default, &mut negotiation).unwrap();
            black_box(outcome.is_accepted())
        });
    });

    group.bench_function("accept_and_respond", |b| {
        b.iter(|| {
            let mut negotiation = Negotiation::new(&req.path, req.headers.clone()).unwrap();
            match negotiator::negotiate(&default, &mut negotiation).unwrap() {
                negotiator::Outcome::Accepted { extensions, .. } => {
                    let accept = generate_accept_key(&req.key);
                    black_box(build_response(&accept, &negotiation, &extensions))
                }
                negotiator::Outcome::Rejected(_) => unreachable!(),
            }
        });
    });

    group.finish();
}

/// Benchmark extension header parsing
fn bench_extension_parse(c: &mut Criterion) {
    let value = "permessage-deflate; client_max_window_bits; server_max_window_bits=10, \
                 permessage-deflate; client_max_window_bits, x-custom; mode=\"a,b\"";

    c.bench_function("extension_parse_list", |b| {
        b.iter(|| ExtensionConfig::parse_list(black_box(value)));
    });
}

criterion_group!(
    benches,
    bench_parse_request,
    bench_negotiate,
    bench_extension_parse,
);

criterion_main!(benches);
