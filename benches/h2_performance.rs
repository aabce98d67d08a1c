//! HTTP/2 session engine benchmarks
//!
//! This benchmark suite measures:
//! - Frame header and frame encoding
//! - Incremental frame decoding
//! - HPACK header compression and decompression
//! - Flow control window bookkeeping
//! - Write queue and priority tree operations
//! - Full request/response exchanges over an in-memory transport
//!
//! Run with: cargo bench --bench h2_performance

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use h2mux::http::h2::codec::{FrameCodec, FrameDecoder, HeaderEncoder};
use h2mux::http::h2::flow_control::{RecvWindow, SendWindow};
use h2mux::http::h2::frames::{DataFrame, FrameEvent, HeadersFrame, PrioritySpec, SettingsFrame};
use h2mux::http::h2::priority::legacy::to_spdy_priority;
use h2mux::http::h2::priority::PriorityTree;
use h2mux::http::h2::settings::SettingsBuilder;
use h2mux::http::h2::write_queue::{FrameProducer, WriteQueue};
use h2mux::http::h2::{
    FrameFlags, FrameType, ManualClock, RequestPriority, Session, SessionBuilder, SessionKey, CONNECTION_PREFACE,
    DEFAULT_MAX_FRAME_SIZE,
};
use h2mux::http::{MemoryTransport, MemoryTransportHandle};
use std::time::Duration;

fn request_headers() -> Vec<(String, String)> {
    [
        (":method", "GET"),
        (":authority", "www.example.org"),
        (":scheme", "https"),
        (":path", "/index.html"),
        ("user-agent", "h2mux-bench"),
        ("accept", "*/*"),
    ]
    .iter()
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect()
}

// ========== Frame Encoding ==========

fn bench_frame_header_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_header_encode");

    group.bench_function("encode_data_header", |b| {
        b.iter(|| {
            FrameCodec::encode_header(
                black_box(FrameType::Data),
                black_box(FrameFlags::from_u8(FrameFlags::END_STREAM)),
                black_box(1),
                black_box(1024),
            )
        });
    });

    group.bench_function("encode_headers_header", |b| {
        b.iter(|| {
            FrameCodec::encode_header(
                black_box(FrameType::Headers),
                black_box(FrameFlags::from_u8(FrameFlags::END_HEADERS | FrameFlags::PRIORITY)),
                black_box(3),
                black_box(4096),
            )
        });
    });

    group.finish();
}

fn bench_data_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_frame_encode");

    for size in [64usize, 1024, 16375] {
        let payload = Bytes::from(vec![0x42u8; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                let frame = DataFrame::new(1, payload.clone(), false);
                FrameCodec::encode_data_frame(black_box(&frame))
            });
        });
    }

    group.finish();
}

fn bench_headers_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("headers_frame_encode");
    let mut encoder = HeaderEncoder::new();
    let block = encoder.encode(&request_headers()).unwrap_or_default();

    group.bench_function("with_priority", |b| {
        b.iter(|| {
            let frame = HeadersFrame::new(1, block.clone(), true).with_priority(PrioritySpec::new(0, true, 256));
            FrameCodec::encode_headers_frame(black_box(&frame), DEFAULT_MAX_FRAME_SIZE as usize)
        });
    });

    group.bench_function("settings", |b| {
        let settings = SettingsBuilder::new()
            .enable_push(false)
            .initial_window_size(6 * 1024 * 1024)
            .max_header_list_size(256 * 1024)
            .build()
            .unwrap_or_default();
        b.iter(|| FrameCodec::encode_settings_frame(black_box(&SettingsFrame::new(settings.clone()))));
    });

    group.finish();
}

// ========== Frame Decoding ==========

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    let mut wire = Vec::new();
    for stream_id in (1..200).step_by(2) {
        let frame = DataFrame::new(stream_id, Bytes::from(vec![0u8; 1024]), stream_id % 4 == 1);
        wire.extend_from_slice(&FrameCodec::encode_data_frame(&frame));
    }
    group.throughput(Throughput::Bytes(wire.len() as u64));

    group.bench_function("data_frames_single_push", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE as usize, 64 * 1024);
            decoder.push(black_box(&wire));
            let mut count = 0;
            while let Ok(Some(_)) = decoder.next_event() {
                count += 1;
            }
            count
        });
    });

    group.bench_function("data_frames_small_reads", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE as usize, 64 * 1024);
            let mut count = 0;
            for chunk in wire.chunks(1500) {
                decoder.push(black_box(chunk));
                while let Ok(Some(_)) = decoder.next_event() {
                    count += 1;
                }
            }
            count
        });
    });

    group.finish();
}

// ========== HPACK ==========

fn bench_hpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("hpack");
    let headers = request_headers();

    group.bench_function("encode_request_headers", |b| {
        let mut encoder = HeaderEncoder::new();
        b.iter(|| encoder.encode(black_box(&headers)));
    });

    let block = HeaderEncoder::new().encode(&headers).unwrap_or_default();
    group.bench_function("decode_request_headers", |b| {
        b.iter(|| {
            let mut decoder = hpack::Decoder::new();
            decoder.decode(black_box(&block)).map(|list| list.len())
        });
    });

    group.finish();
}

// ========== Flow Control ==========

fn bench_flow_control(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow_control");

    group.bench_function("send_window_consume_and_replenish", |b| {
        b.iter(|| {
            let mut window = SendWindow::new(65535);
            for _ in 0..4 {
                let _ = window.decrease(black_box(16375));
            }
            let _ = window.increase(black_box(65500));
            window.size()
        });
    });

    group.bench_function("recv_window_read_cycle", |b| {
        b.iter(|| {
            let mut window = RecvWindow::new(6 * 1024 * 1024);
            let mut updates = 0;
            for _ in 0..512 {
                if window.decrease(black_box(16384)).is_ok() {
                    if let Ok(Some(_)) = window.increase(16384) {
                        updates += 1;
                    }
                }
            }
            updates
        });
    });

    group.finish();
}

// ========== Scheduling ==========

fn bench_write_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_queue");
    let frame = Bytes::from_static(&[0u8; 9]);

    group.bench_function("enqueue_dequeue_mixed_priorities", |b| {
        b.iter(|| {
            let mut queue = WriteQueue::new();
            for i in 0..100u8 {
                let priority = RequestPriority::from_u8(i % 5).unwrap_or(RequestPriority::Lowest);
                queue.enqueue(priority, FrameType::Data, FrameProducer::Serialized(frame.clone()), None);
            }
            let mut drained = 0;
            while queue.dequeue().is_some() {
                drained += 1;
            }
            drained
        });
    });

    group.finish();
}

fn bench_priority_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("priority_tree");

    for count in [10u32, 100] {
        group.bench_with_input(BenchmarkId::new("create_update_destroy", count), &count, |b, &count| {
            b.iter(|| {
                let mut tree = PriorityTree::new();
                for i in 0..count {
                    let priority = RequestPriority::from_u8((i % 5) as u8).unwrap_or(RequestPriority::Lowest);
                    tree.on_stream_creation(i * 2 + 1, to_spdy_priority(priority));
                }
                for i in (0..count).step_by(3) {
                    tree.on_stream_update(i * 2 + 1, to_spdy_priority(RequestPriority::Highest));
                }
                for i in 0..count {
                    tree.on_stream_destruction(i * 2 + 1);
                }
                tree.len()
            });
        });
    }

    group.finish();
}

// ========== Session ==========

fn connected_session() -> (Session, MemoryTransportHandle) {
    let (transport, peer) = MemoryTransport::new();
    let session = SessionBuilder::new(SessionKey::new("www.example.org", 443))
        .clock(ManualClock::new())
        .build(transport)
        .unwrap_or_else(|e| panic!("session: {}", e));
    let _ = session.run_until_idle();
    peer.take_outbound();
    (session, peer)
}

/// Answer every request HEADERS in `outbound` with a 200 and `body`
fn respond_all(outbound: &[u8], body: &Bytes, decoder: &mut FrameDecoder, encoder: &mut HeaderEncoder) -> Vec<u8> {
    decoder.push(outbound);
    let status = vec![(":status".to_string(), "200".to_string())];
    let mut reply = Vec::new();
    while let Ok(Some(event)) = decoder.next_event() {
        if let FrameEvent::Headers { stream_id, .. } = event {
            let block = encoder.encode(&status).unwrap_or_default();
            reply.extend_from_slice(&FrameCodec::encode_headers_frame(
                &HeadersFrame::new(stream_id, block, false),
                DEFAULT_MAX_FRAME_SIZE as usize,
            ));
            reply.extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(stream_id, body.clone(), true)));
        }
    }
    reply
}

fn bench_session_exchange(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_exchange");
    group.sample_size(50);
    let body = Bytes::from(vec![0x61u8; 4096]);

    for streams in [1usize, 10, 50] {
        group.throughput(Throughput::Elements(streams as u64));
        group.bench_with_input(BenchmarkId::new("get_requests", streams), &streams, |b, &streams| {
            b.iter(|| {
                let (session, peer) = connected_session();
                let mut decoder = FrameDecoder::new(16 * 1024 * 1024, 1024 * 1024);
                let mut encoder = HeaderEncoder::new();

                let handles: Vec<_> = (0..streams)
                    .filter_map(|i| {
                        let mut request = session
                            .request_stream(&format!("https://www.example.org/{}", i), RequestPriority::Medium)
                            .ok()?;
                        let stream = request.try_take()?.ok()?;
                        stream.send_request("GET", &[], true).ok()?;
                        Some(stream)
                    })
                    .collect();
                let _ = session.run_until_idle();

                let outbound = peer.take_outbound();
                let reply = respond_all(&outbound, &body, &mut decoder, &mut encoder);
                peer.push_inbound(&reply);
                let _ = session.on_transport_readable();

                let received: usize = handles
                    .iter()
                    .filter_map(|stream| stream.read_to_bytes().ok())
                    .map(|bytes| bytes.len())
                    .sum();
                black_box(received)
            });
        });
    }

    group.bench_function("connection_setup", |b| {
        b.iter(|| {
            let (transport, peer) = MemoryTransport::new();
            let session = SessionBuilder::new(SessionKey::new("www.example.org", 443))
                .clock(ManualClock::new())
                .build(transport);
            if let Ok(session) = &session {
                let _ = session.run_until_idle();
            }
            let outbound = peer.take_outbound();
            debug_assert!(outbound.starts_with(CONNECTION_PREFACE));
            black_box(outbound.len())
        });
    });

    group.finish();
}

// ========== Benchmark Groups ==========

criterion_group! {
    name = framing;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5));
    targets =
        bench_frame_header_encode,
        bench_data_frame_encode,
        bench_headers_frame_encode,
        bench_frame_decode,
        bench_hpack
}

criterion_group! {
    name = bookkeeping;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5));
    targets =
        bench_flow_control,
        bench_write_queue,
        bench_priority_tree
}

criterion_group! {
    name = session;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10));
    targets = bench_session_exchange
}

criterion_main!(framing, bookkeeping, session);
