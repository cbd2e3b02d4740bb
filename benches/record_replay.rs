use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

use onirec::codec::DefaultCodecFactory;
use onirec::config::RecorderConfig;
use onirec::properties::{PixelFormat, StreamProperty, VideoMode};
use onirec::recording::{Frame, Recorder, StreamDescriptor};
use onirec::replay::{NullNotifications, Player, SeekOrigin};
use onirec::storage::{MemoryInputStream, NodeType};

const FRAMES: u32 = 60;

fn mode() -> VideoMode {
    VideoMode {
        pixel_format: PixelFormat::Depth1Mm,
        x_resolution: 320,
        y_resolution: 240,
        fps: 30,
    }
}

fn frame(seed: u32) -> Vec<u8> {
    (0..320 * 240u32)
        .flat_map(|i| (((i + seed) % 4000) as u16).to_le_bytes())
        .collect()
}

fn record(path: &std::path::Path) {
    let recorder = Recorder::initialize(path, RecorderConfig::default()).unwrap();
    let node = recorder
        .attach(Arc::new(StreamDescriptor::new(NodeType::Depth, mode())), false)
        .unwrap();
    recorder.start();
    for i in 1..=FRAMES {
        if i % 20 == 0 {
            recorder
                .record_property(node, StreamProperty::Mirroring(i % 40 == 0))
                .unwrap();
        }
        recorder
            .record(node, Frame::new(u64::from(i) * 33_333, frame(i)))
            .unwrap();
    }
    recorder.terminate().unwrap();
}

fn open(bytes: &[u8]) -> Player<NullNotifications> {
    Player::open(
        Box::new(MemoryInputStream::new(bytes.to_vec())),
        Box::new(DefaultCodecFactory),
        NullNotifications,
    )
    .unwrap()
}

fn bench_record(c: &mut Criterion) {
    c.bench_function("record_60_depth_frames", |b| {
        b.iter(|| {
            let dir = TempDir::new().unwrap();
            record(&dir.path().join("bench.oni"));
        });
    });
}

fn bench_playback(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bench.oni");
    record(&path);
    let bytes = std::fs::read(&path).unwrap();

    c.bench_function("play_60_depth_frames", |b| {
        b.iter(|| {
            let mut player = open(&bytes);
            player.set_repeat(false);
            while !player.is_eof() {
                player.read_next().unwrap();
            }
        });
    });

    c.bench_function("seek_backward_and_forward", |b| {
        let mut player = open(&bytes);
        b.iter(|| {
            player
                .seek_to_frame("Depth", black_box(55), SeekOrigin::Set)
                .unwrap();
            player
                .seek_to_frame("Depth", black_box(5), SeekOrigin::Set)
                .unwrap();
        });
    });
}

criterion_group!(benches, bench_record, bench_playback);
criterion_main!(benches);
