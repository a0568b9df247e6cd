// Criterion benchmarks for the muxrpc-common frame codec
//
// Run benchmarks with:
//   cargo bench -p muxrpc-common
//
// For detailed output with plots:
//   cargo bench -p muxrpc-common -- --save-baseline main

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use muxrpc_common::transport::FrameCodec;
use muxrpc_common::{CallKind, Frame, Metadata, OpenHeader, Status};
use tokio_util::codec::{Decoder, Encoder};

fn open_frame() -> Frame {
    let mut metadata = Metadata::new();
    metadata.append("authorization", "Bearer 0123456789abcdef");
    metadata.append("x-request-id", "b7a1f6f0-8d8e-4a6c-9a83-0a9e1a2b3c4d");
    Frame::Open {
        call_id: 42,
        header: OpenHeader::new("inventory.Lookup", CallKind::Unary)
            .with_metadata(metadata)
            .with_timeout_ms(5000),
    }
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    group.bench_function("open", |b| {
        let frame = open_frame();
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::with_capacity(512);
        b.iter(|| {
            buf.clear();
            codec.encode(black_box(frame.clone()), &mut buf).unwrap();
        });
    });

    group.bench_function("status", |b| {
        let frame = Frame::Status {
            call_id: 42,
            status: Status::unavailable("backend restarting"),
        };
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::with_capacity(128);
        b.iter(|| {
            buf.clear();
            codec.encode(black_box(frame.clone()), &mut buf).unwrap();
        });
    });

    for size in [64usize, 4 * 1024, 256 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("data", size), &size, |b, &size| {
            let payload = Bytes::from(vec![0xABu8; size]);
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::with_capacity(size + 16);
            b.iter(|| {
                buf.clear();
                let frame = Frame::Data {
                    call_id: 7,
                    payload: payload.clone(),
                };
                codec.encode(black_box(frame), &mut buf).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    group.bench_function("open", |b| {
        let mut encoded = BytesMut::new();
        FrameCodec::new().encode(open_frame(), &mut encoded).unwrap();
        let mut codec = FrameCodec::new();
        b.iter(|| {
            let mut buf = encoded.clone();
            black_box(codec.decode(&mut buf).unwrap());
        });
    });

    group.bench_function("batch_of_64_data_frames", |b| {
        let mut encoded = BytesMut::new();
        let mut codec = FrameCodec::new();
        for call_id in 0..64 {
            codec
                .encode(
                    Frame::Data {
                        call_id,
                        payload: Bytes::from_static(b"small message body"),
                    },
                    &mut encoded,
                )
                .unwrap();
        }
        b.iter(|| {
            let mut buf = encoded.clone();
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                black_box(frame);
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
