//! Codec benchmarks for parley-protocol.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use parley_protocol::{codec, Delivery, DeliveryEvent, Frame, Request, Response};
use uuid::Uuid;

fn send_frame(size: usize) -> Frame {
    Frame::request(
        1,
        Request::SendMessage {
            sender: "alice".into(),
            conversation_id: Uuid::new_v4(),
            payload: vec![0u8; size],
        },
    )
}

fn bench_send_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("send_message");
    for size in [64usize, 1024, 16 * 1024] {
        let frame = send_frame(size);
        let encoded = codec::encode(&frame).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &frame, |b, frame| {
            b.iter(|| codec::encode(black_box(frame)))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| codec::decode(black_box(encoded)))
        });
    }
    group.finish();
}

fn bench_fetch_batch(c: &mut Criterion) {
    let conversation_id = Uuid::new_v4();
    let deliveries = (1..=100)
        .map(|cursor| Delivery {
            cursor,
            event: DeliveryEvent::Message {
                conversation_id,
                message_id: Uuid::new_v4(),
                sender: "bob".into(),
                payload: vec![7u8; 128],
                sequence: cursor,
                timestamp: 0,
            },
        })
        .collect();
    let frame = Frame::response(1, Response::Deliveries { deliveries });
    let encoded = codec::encode(&frame).unwrap();

    c.bench_function("decode_fetch_100", |b| {
        b.iter(|| codec::decode(black_box(&encoded)).unwrap())
    });
}

criterion_group!(benches, bench_send_message, bench_fetch_batch);
criterion_main!(benches);
