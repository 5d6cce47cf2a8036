//! HTTP/2 engine benchmarks
//!
//! This benchmark suite measures:
//! - Frame encoding/decoding
//! - DATA splitting at the peer's MAX_FRAME_SIZE
//! - HPACK header compression/decompression
//! - Request/response exchanges through the connection engine
//! - Large responses paced by WINDOW_UPDATE
//!
//! Run with: cargo bench --bench h2_performance

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use h2engine::http::h2::frames::WindowUpdateFrame;
use h2engine::http::h2::{
    Connection, DataFrame, EngineConfig, Event, Frame, FrameCodec, H2Response, HeaderCodec,
    HeaderList, HeadersFrame, Negotiation, Settings, SettingsFrame, CONNECTION_PREFACE,
    DEFAULT_MAX_FRAME_SIZE, MAX_ALLOWED_FRAME_SIZE,
};
use std::time::Duration;

fn request_headers(path: &str) -> HeaderList {
    HeaderList::new()
        .with(":method", "GET")
        .with(":scheme", "https")
        .with(":authority", "bench.example.com")
        .with(":path", path)
        .with("user-agent", "h2engine-bench/1.0")
        .with("accept", "text/html,application/xhtml+xml")
        .with("accept-encoding", "gzip, deflate, br")
        .with("cookie", "session=0123456789abcdef; theme=dark")
}

/// Preface, SETTINGS and the ACK of the server's SETTINGS
fn client_preface() -> Vec<u8> {
    let mut wire = CONNECTION_PREFACE.to_vec();
    wire.extend_from_slice(&FrameCodec::encode_frame(&Frame::Settings(SettingsFrame::new(
        Settings::new(),
    ))));
    wire.extend_from_slice(&FrameCodec::encode_frame(&Frame::Settings(SettingsFrame::ack())));
    wire
}

// ========== Frame Encoding/Decoding Benchmarks ==========

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    for size in [64usize, 1024, 16384] {
        let frame = Frame::Data(DataFrame::new(1, Bytes::from(vec![0xab; size]), false));
        let wire = FrameCodec::encode_frame(&frame);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode_data", size), &frame, |b, frame| {
            b.iter(|| black_box(FrameCodec::encode_frame(black_box(frame))));
        });

        group.bench_with_input(BenchmarkId::new("decode_data", size), &wire, |b, wire| {
            b.iter(|| {
                let mut codec = FrameCodec::new();
                codec.feed(black_box(wire));
                black_box(codec.read_frame().ok())
            });
        });
    }

    let settings = Frame::Settings(SettingsFrame::new(EngineConfig::default().settings));
    group.bench_function("encode_settings", |b| {
        b.iter(|| black_box(FrameCodec::encode_frame(black_box(&settings))));
    });

    group.finish();
}

fn bench_data_splitting(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_splitting");

    for size in [64 * 1024usize, 1024 * 1024] {
        let frame = Frame::Data(DataFrame::new(1, Bytes::from(vec![0u8; size]), true));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| {
                let mut out = BytesMut::with_capacity(size + size / 1000);
                FrameCodec::write_frame(frame, DEFAULT_MAX_FRAME_SIZE as usize, &mut out);
                black_box(out.len())
            });
        });
    }

    group.finish();
}

// ========== HPACK Benchmarks ==========

fn bench_hpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("hpack");
    let headers = request_headers("/index.html");

    group.bench_function("encode_first_request", |b| {
        b.iter(|| {
            let mut codec = HeaderCodec::new();
            black_box(codec.encode(black_box(&headers)).ok())
        });
    });

    // Dynamic table already holds the repeated fields
    group.bench_function("encode_repeated_request", |b| {
        let mut codec = HeaderCodec::new();
        let _ = codec.encode(&headers);
        b.iter(|| black_box(codec.encode(black_box(&headers)).ok()));
    });

    let block = HeaderCodec::new().encode(&headers).unwrap_or_default();
    group.bench_function("decode_first_request", |b| {
        b.iter(|| {
            let mut codec = HeaderCodec::new();
            black_box(codec.decode(black_box(&block)).ok())
        });
    });

    group.finish();
}

// ========== Engine Benchmarks ==========

fn bench_request_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_response");
    let preface = client_preface();

    for streams in [1u32, 10, 50] {
        group.throughput(Throughput::Elements(streams as u64));
        group.bench_with_input(BenchmarkId::new("get_1k", streams), &streams, |b, &streams| {
            b.iter(|| {
                let mut connection =
                    Connection::new(EngineConfig::default(), Negotiation::Direct).unwrap();
                let mut client = HeaderCodec::new();
                connection.recv(&preface).unwrap();

                let mut wire = Vec::new();
                for i in 0..streams {
                    let block = client.encode(&request_headers("/item")).unwrap();
                    wire.extend_from_slice(&FrameCodec::encode_frame(&Frame::Headers(
                        HeadersFrame::new(2 * i + 1, block, true, true),
                    )));
                }
                connection.recv(&wire).unwrap();

                let mut answered = 0;
                while let Some(event) = connection.poll_event() {
                    if let Event::RequestReceived(request) = event {
                        let response = H2Response::new(200)
                            .header("content-type", "application/octet-stream")
                            .body(vec![b'r'; 1024]);
                        connection.send_response(request.stream_id, response).unwrap();
                        answered += 1;
                    }
                }
                assert_eq!(answered, streams);
                black_box(connection.take_pending_send().len())
            });
        });
    }

    group.finish();
}

fn bench_large_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("large_response");
    let preface = client_preface();
    let size = 1024 * 1024usize;
    group.throughput(Throughput::Bytes(size as u64));

    group.bench_function("1mb_paced_by_window_updates", |b| {
        b.iter(|| {
            let mut connection =
                Connection::new(EngineConfig::default(), Negotiation::Direct).unwrap();
            let mut peer_codec = FrameCodec::with_max_frame_size(MAX_ALLOWED_FRAME_SIZE);
            let mut client = HeaderCodec::new();
            connection.recv(&preface).unwrap();

            let block = client.encode(&request_headers("/large")).unwrap();
            connection
                .recv(&FrameCodec::encode_frame(&Frame::Headers(HeadersFrame::new(
                    1, block, true, true,
                ))))
                .unwrap();
            connection
                .send_response(1, H2Response::new(200).body(vec![0u8; size]))
                .unwrap();

            let mut received = 0usize;
            let mut finished = false;
            while !finished {
                peer_codec.feed(&connection.take_pending_send());
                let mut credit = 0u32;
                while let Ok(frame) = peer_codec.read_frame() {
                    if let Frame::Data(data) = frame {
                        received += data.data.len();
                        credit += data.data.len() as u32;
                        finished |= data.end_stream;
                    }
                }
                if finished {
                    break;
                }
                let mut wire = Vec::new();
                for stream_id in [0, 1] {
                    wire.extend_from_slice(&FrameCodec::encode_frame(&Frame::WindowUpdate(
                        WindowUpdateFrame::new(stream_id, credit),
                    )));
                }
                connection.recv(&wire).unwrap();
            }
            assert_eq!(received, size);
            black_box(received)
        });
    });

    group.finish();
}

criterion_group! {
    name = codec_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(500);
    targets =
        bench_frame_codec,
        bench_data_splitting,
        bench_hpack
}

criterion_group! {
    name = engine_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(15))
        .sample_size(100);
    targets =
        bench_request_response,
        bench_large_response
}

criterion_main!(codec_benches, engine_benches);
