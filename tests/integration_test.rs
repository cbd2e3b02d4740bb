//! Integration tests for the record-playback cycle

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tempfile::TempDir;

use onirec::codec::{CodecId, DefaultCodecFactory};
use onirec::config::{Config, PlaybackConfig, RecorderConfig};
use onirec::properties::{names, PixelFormat, StreamProperty, VideoMode};
use onirec::recording::{
    Frame, Priority, PriorityQueue, RecordableStream, Recorder, StreamDescriptor,
};
use onirec::replay::{
    NodeNotifications, PlaybackController, PlaybackState, Player, SeekOrigin, SPEED_FASTEST,
};
use onirec::storage::{
    decode_fields, DataIndexEntry, FileHeader, MemoryInputStream, NodeType, RecordBody,
    RecordHeader, RecordType, FILE_HEADER_SIZE,
};
use onirec::OniError;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
enum Note {
    Added(String, NodeType),
    Removed(String),
    Int(String, String, u64),
    Data(String, u64, u32, Vec<u8>),
    Eof,
}

/// Collects notifications, optionally reporting frames and EOF on channels
#[derive(Default)]
struct Collector {
    notes: Vec<Note>,
    arrivals: Vec<Instant>,
    eof_tx: Option<Sender<()>>,
}

impl Collector {
    fn with_eof_channel() -> (Self, Receiver<()>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Self {
                eof_tx: Some(tx),
                ..Self::default()
            },
            rx,
        )
    }

    fn frames(&self) -> Vec<(String, u32)> {
        self.notes
            .iter()
            .filter_map(|n| match n {
                Note::Data(name, _, frame, _) => Some((name.clone(), *frame)),
                _ => None,
            })
            .collect()
    }

    fn last_data(&self) -> Option<&Note> {
        self.notes.iter().rev().find(|n| matches!(n, Note::Data(..)))
    }

    fn last_int(&self, property: &str) -> Option<u64> {
        self.notes.iter().rev().find_map(|n| match n {
            Note::Int(_, name, value) if name == property => Some(*value),
            _ => None,
        })
    }
}

impl NodeNotifications for Collector {
    fn on_node_added(&mut self, name: &str, node_type: NodeType, _: CodecId, _: u32) {
        self.notes.push(Note::Added(name.to_string(), node_type));
    }

    fn on_node_removed(&mut self, name: &str) {
        self.notes.push(Note::Removed(name.to_string()));
    }

    fn on_node_int_prop_changed(&mut self, name: &str, property: &str, value: u64) {
        self.notes
            .push(Note::Int(name.to_string(), property.to_string(), value));
    }

    fn on_node_new_data(&mut self, name: &str, timestamp: u64, frame: u32, data: &[u8]) {
        self.arrivals.push(Instant::now());
        self.notes
            .push(Note::Data(name.to_string(), timestamp, frame, data.to_vec()));
    }

    fn on_end_of_file_reached(&mut self) {
        self.notes.push(Note::Eof);
        if let Some(tx) = &self.eof_tx {
            tx.send(()).ok();
        }
    }
}

struct RawRecord {
    pos: u64,
    header: RecordHeader,
    body: RecordBody,
    payload: Vec<u8>,
}

/// Walk every record of a current-version recording
fn scan(bytes: &[u8]) -> Vec<RawRecord> {
    let header = FileHeader::decode(bytes).unwrap();
    assert!(!header.version.uses_32bit_offsets());

    let header_size = RecordHeader::size(false);
    let mut records = Vec::new();
    let mut pos = FILE_HEADER_SIZE;
    while pos < bytes.len() {
        let header = RecordHeader::decode(&bytes[pos..], false, pos as u64).unwrap();
        let fields_end = pos + header.fields_size as usize;
        let body = decode_fields(&header, &bytes[pos + header_size..fields_end], pos as u64).unwrap();
        let payload_end = fields_end + header.payload_size as usize;
        records.push(RawRecord {
            pos: pos as u64,
            header,
            body,
            payload: bytes[fields_end..payload_end].to_vec(),
        });
        pos = payload_end;
    }
    records
}

fn depth_mode(x: u32, y: u32) -> VideoMode {
    VideoMode {
        pixel_format: PixelFormat::Depth1Mm,
        x_resolution: x,
        y_resolution: y,
        fps: 30,
    }
}

fn depth_frame(mode: &VideoMode, seed: u32) -> Vec<u8> {
    let pixels = mode.x_resolution * mode.y_resolution;
    (0..pixels)
        .flat_map(|i| (((i + seed * 7) % 4000) as u16).to_le_bytes())
        .collect()
}

/// Record `count` depth frames `interval` microseconds apart, toggling
/// mirroring on at frame 4 and off at frame 7
fn record_mirrored_depth(dir: &TempDir, count: u32, interval: u64) -> (std::path::PathBuf, Vec<Vec<u8>>) {
    let path = dir.path().join("depth.oni");
    let mode = depth_mode(16, 8);
    let recorder = Recorder::initialize(&path, RecorderConfig::default()).unwrap();
    let stream = StreamDescriptor::new(NodeType::Depth, mode).with_property(StreamProperty::Mirroring(false));
    let node = recorder.attach(Arc::new(stream), false).unwrap();
    recorder.start();

    let mut frames = Vec::new();
    for i in 1..=count {
        match i {
            4 => recorder.record_property(node, StreamProperty::Mirroring(true)).unwrap(),
            7 => recorder.record_property(node, StreamProperty::Mirroring(false)).unwrap(),
            _ => {}
        }
        let data = depth_frame(&mode, i);
        recorder
            .record(node, Frame::new(u64::from(i - 1) * interval, data.clone()))
            .unwrap();
        frames.push(data);
    }
    recorder.terminate().unwrap();
    (path, frames)
}

fn open_player(path: &std::path::Path) -> Player<Collector> {
    let bytes = std::fs::read(path).unwrap();
    Player::open(
        Box::new(MemoryInputStream::new(bytes)),
        Box::new(DefaultCodecFactory),
        Collector::default(),
    )
    .unwrap()
}

#[test]
fn test_uncompressed_depth_scenario() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scenario.oni");
    // The recorder picks the codec from the pixel format and always
    // compresses depth pixel formats, so a depth node carrying 16-bit
    // samples in the Gray16 layout is what gets stored uncompressed.
    let mode = VideoMode {
        pixel_format: PixelFormat::Gray16,
        ..depth_mode(640, 480)
    };
    let recorder = Recorder::initialize(&path, RecorderConfig::default()).unwrap();
    let node = recorder
        .attach(Arc::new(StreamDescriptor::new(NodeType::Depth, mode)), false)
        .unwrap();
    recorder.start();
    for (i, timestamp) in [0u64, 33_000, 66_000].into_iter().enumerate() {
        recorder
            .record(node, Frame::new(timestamp, depth_frame(&mode, i as u32)))
            .unwrap();
    }
    recorder.detach(node).unwrap();
    recorder.terminate().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let header = FileHeader::decode(&bytes).unwrap();
    assert_eq!(header.max_timestamp, 66_000);
    assert_eq!(header.max_node_id, node);

    let records = scan(&bytes);
    let added = records
        .iter()
        .find_map(|r| match &r.body {
            RecordBody::NodeAdded(added) => Some(added.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(added.node_type, NodeType::Depth);
    assert_eq!(added.codec, CodecId::NONE);

    let data: Vec<&RawRecord> = records
        .iter()
        .filter(|r| r.header.record_type == RecordType::NewData && r.header.node_id == node)
        .collect();
    let timestamps: Vec<u64> = data
        .iter()
        .map(|r| match r.body {
            RecordBody::NewData { timestamp, .. } => timestamp,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(timestamps, vec![0, 33_000, 66_000]);
    for (i, record) in data.iter().enumerate() {
        assert_eq!(record.payload, depth_frame(&mode, i as u32));
    }

    let table = records
        .iter()
        .find(|r| r.header.record_type == RecordType::SeekTable)
        .unwrap();
    let entries = DataIndexEntry::decode_table(&table.payload, false, table.pos).unwrap();
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[0], DataIndexEntry::default());
    for (entry, record) in entries[1..].iter().zip(&data) {
        assert_eq!(entry.seek_pos, record.pos);
    }
    assert_eq!(
        entries.iter().map(|e| e.timestamp).collect::<Vec<_>>(),
        vec![0, 0, 33_000, 66_000]
    );
    assert_eq!(records.last().unwrap().header.record_type, RecordType::End);
}

#[test]
fn test_round_trip_preserves_frames() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (path, frames) = record_mirrored_depth(&dir, 8, 33_333);

    let mut player = open_player(&path);
    player.set_repeat(false);
    while !player.is_eof() {
        player.read_next().unwrap();
    }

    let collector = player.close().unwrap();
    let delivered: Vec<&Vec<u8>> = collector
        .notes
        .iter()
        .filter_map(|n| match n {
            Note::Data(_, _, _, data) => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(delivered.len(), frames.len());
    for (got, want) in delivered.iter().zip(&frames) {
        assert_eq!(*got, want);
    }
    assert_eq!(collector.notes.last(), Some(&Note::Eof));
    assert!(collector.notes.contains(&Note::Removed("Depth".to_string())));
}

#[test]
fn test_multiple_streams_interleave() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("multi.oni");
    let depth = depth_mode(32, 24);
    let color = VideoMode {
        pixel_format: PixelFormat::Rgb888,
        ..depth
    };

    let recorder = Recorder::initialize(&path, RecorderConfig::default()).unwrap();
    let depth_node = recorder
        .attach(Arc::new(StreamDescriptor::new(NodeType::Depth, depth)), false)
        .unwrap();
    let image_node = recorder
        .attach(Arc::new(StreamDescriptor::new(NodeType::Image, color)), true)
        .unwrap();
    recorder.start();
    for i in 0..4u32 {
        let ts = u64::from(i) * 33_000;
        recorder.record(depth_node, Frame::new(ts, depth_frame(&depth, i))).unwrap();
        recorder
            .record(image_node, Frame::new(ts + 1, vec![(i * 40) as u8; color.frame_size()]))
            .unwrap();
    }
    recorder.terminate().unwrap();

    let mut player = open_player(&path);
    assert_eq!(player.num_frames("Depth").unwrap(), 4);
    assert_eq!(player.num_frames("Image").unwrap(), 4);
    player.set_repeat(false);
    while !player.is_eof() {
        player.read_next().unwrap();
    }

    let collector = player.close().unwrap();
    let frames = collector.frames();
    assert_eq!(frames.iter().filter(|(n, _)| n == "Depth").count(), 4);
    assert_eq!(frames.iter().filter(|(n, _)| n == "Image").count(), 4);
    for note in &collector.notes {
        if let Note::Data(name, _, _, data) = note {
            if name == "Image" {
                assert_eq!(data.len(), color.frame_size());
            }
        }
    }
}

#[test]
fn test_seek_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (path, frames) = record_mirrored_depth(&dir, 10, 33_333);
    let mut player = open_player(&path);

    player.seek_to_frame("Depth", 8, SeekOrigin::Set).unwrap();
    let first = player.notifications().last_data().cloned().unwrap();
    assert!(matches!(&first, Note::Data(_, _, 8, data) if *data == frames[7]));
    player.read_next().unwrap();
    let next = player.notifications().last_data().cloned().unwrap();

    player.seek_to_frame("Depth", 8, SeekOrigin::Set).unwrap();
    assert_eq!(player.notifications().last_data(), Some(&first));
    assert_eq!(player.tell_frame("Depth").unwrap(), 8);
    player.read_next().unwrap();
    assert_eq!(player.notifications().last_data(), Some(&next));
}

#[test]
fn test_backward_seek_restores_properties() {
    let dir = TempDir::new().unwrap();
    let (path, _) = record_mirrored_depth(&dir, 10, 33_333);
    let mut player = open_player(&path);

    player.seek_to_frame("Depth", 9, SeekOrigin::Set).unwrap();
    assert_eq!(player.notifications().last_int(names::MIRROR), Some(0));

    player.seek_to_frame("Depth", 5, SeekOrigin::Set).unwrap();
    assert_eq!(player.notifications().last_int(names::MIRROR), Some(1));
    assert_eq!(player.tell_frame("Depth").unwrap(), 5);

    player.seek_to_frame("Depth", -3, SeekOrigin::Current).unwrap();
    assert_eq!(player.notifications().last_int(names::MIRROR), Some(0));
    assert_eq!(player.tell_frame("Depth").unwrap(), 2);
}

#[test]
fn test_seek_table_points_at_frames() {
    let dir = TempDir::new().unwrap();
    let (path, _) = record_mirrored_depth(&dir, 10, 1000);
    let bytes = std::fs::read(&path).unwrap();
    let records = scan(&bytes);

    let table = records
        .iter()
        .find(|r| r.header.record_type == RecordType::SeekTable)
        .unwrap();
    let entries = DataIndexEntry::decode_table(&table.payload, false, table.pos).unwrap();
    assert_eq!(entries.len(), 11);

    let mut last_config = 0;
    for (frame, entry) in entries.iter().enumerate().skip(1) {
        let record = records.iter().find(|r| r.pos == entry.seek_pos).unwrap();
        match record.body {
            RecordBody::NewData {
                timestamp,
                frame_id,
            } => {
                assert_eq!(frame_id as usize, frame);
                assert_eq!(timestamp, entry.timestamp);
            }
            _ => panic!("seek table entry {frame} does not point at data"),
        }
        assert!(entry.configuration_id >= last_config);
        last_config = entry.configuration_id;
    }
    // Mirroring changed twice mid-recording.
    assert_eq!(entries[10].configuration_id - entries[1].configuration_id, 2);

    let added = records
        .iter()
        .find_map(|r| match &r.body {
            RecordBody::NodeAdded(added) => Some(added.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(added.seek_table_pos, table.pos);
    assert_eq!(added.frames, 10);
    assert_eq!(added.min_timestamp, 0);
    assert_eq!(added.max_timestamp, 9000);
}

#[test]
fn test_undo_chains_point_backwards_to_same_value() {
    let dir = TempDir::new().unwrap();
    let (path, _) = record_mirrored_depth(&dir, 10, 1000);
    let bytes = std::fs::read(&path).unwrap();
    let records = scan(&bytes);
    let at = |pos: u64| records.iter().find(|r| r.pos == pos).unwrap();

    let mut checked = 0;
    for record in &records {
        let undo = record.header.undo_record_pos;
        if undo == 0 {
            continue;
        }
        assert!(undo < record.pos);
        let previous = at(undo);
        assert_eq!(previous.header.node_id, record.header.node_id);
        match (&record.body, &previous.body) {
            (RecordBody::Property(now), RecordBody::Property(before)) => {
                assert_eq!(now.name, before.name);
            }
            (RecordBody::NewData { frame_id, .. }, RecordBody::NewData { frame_id: before, .. }) => {
                assert_eq!(*before + 1, *frame_id);
            }
            (RecordBody::NodeRemoved, RecordBody::NodeAdded(_)) => {}
            (now, before) => panic!("undo from {now:?} lands on {before:?}"),
        }
        checked += 1;
    }
    // Nine data links, two mirror links, one removal.
    assert_eq!(checked, 12);
}

#[test]
fn test_priority_queue_orders_by_tier() {
    let queue = PriorityQueue::new();
    queue.push(Priority::Low, "terminate").unwrap();
    queue.push(Priority::Normal, "frame 1").unwrap();
    queue.push(Priority::High, "attach").unwrap();
    queue.push(Priority::Normal, "frame 2").unwrap();
    queue.close();

    let order: Vec<&str> = std::iter::from_fn(|| queue.pop()).collect();
    assert_eq!(order, vec!["attach", "frame 1", "frame 2", "terminate"]);
}

/// A stream that holds the writer thread inside attach until released
struct GatedStream {
    mode: VideoMode,
    release: Receiver<()>,
}

impl RecordableStream for GatedStream {
    fn node_type(&self) -> NodeType {
        NodeType::Depth
    }

    fn video_mode(&self) -> VideoMode {
        self.release.recv_timeout(Duration::from_secs(10)).ok();
        self.mode
    }
}

#[test]
fn test_high_priority_property_overtakes_queued_frame() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("priority.oni");
    let mode = depth_mode(16, 8);
    let config = RecorderConfig {
        property_priority: Priority::High,
        ..RecorderConfig::default()
    };
    let recorder = Recorder::initialize(&path, config).unwrap();
    let (release_tx, release) = crossbeam_channel::bounded(0);
    let node = recorder
        .attach(Arc::new(GatedStream { mode, release }), false)
        .unwrap();
    recorder.start();

    // Both messages queue up while the writer is stuck in attach.
    recorder.record(node, Frame::new(0, depth_frame(&mode, 1))).unwrap();
    recorder
        .record_property(node, StreamProperty::Mirroring(true))
        .unwrap();
    drop(release_tx);
    recorder.terminate().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let records = scan(&bytes);
    let position = |wanted: &dyn Fn(&RecordBody) -> bool| {
        records.iter().position(|r| wanted(&r.body)).unwrap()
    };
    let mirror = position(&|body| {
        matches!(body, RecordBody::Property(p) if p.name == names::MIRROR)
    });
    let frame = position(&|body| matches!(body, RecordBody::NewData { .. }));
    let ready = position(&|body| matches!(body, RecordBody::NodeStateReady));
    assert!(ready < mirror);
    assert!(mirror < frame);
}

#[test]
fn test_controller_paces_frames() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (path, _) = record_mirrored_depth(&dir, 3, 50_000);
    let (collector, eof_rx) = Collector::with_eof_channel();
    let config = PlaybackConfig {
        speed: 1.0,
        repeat: false,
        ..PlaybackConfig::default()
    };

    let controller = PlaybackController::open(&path, &config, collector).unwrap();
    controller.start();
    eof_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let collector = controller.close().unwrap();

    assert_eq!(collector.frames().len(), 3);
    let span = collector.arrivals[2] - collector.arrivals[0];
    assert!(span >= Duration::from_millis(90), "frames arrived {span:?} apart");
}

#[test]
fn test_controller_seek_after_eof_resumes() {
    let dir = TempDir::new().unwrap();
    let (path, _) = record_mirrored_depth(&dir, 3, 1000);
    let (collector, eof_rx) = Collector::with_eof_channel();
    let config = PlaybackConfig {
        speed: SPEED_FASTEST,
        repeat: false,
        ..PlaybackConfig::default()
    };

    let controller = PlaybackController::open(&path, &config, collector).unwrap();
    controller.seek_to_frame("Depth", 2).unwrap();
    controller.start();
    eof_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    controller.seek_to_frame("Depth", 1).unwrap();
    eof_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let start = Instant::now();
    while controller.state() != PlaybackState::Idle {
        assert!(start.elapsed() < Duration::from_secs(5));
        std::thread::sleep(Duration::from_millis(5));
    }
    let collector = controller.close().unwrap();
    let frames: Vec<u32> = collector.frames().into_iter().map(|(_, f)| f).collect();
    assert_eq!(frames, vec![2, 3, 1, 2, 3]);
}

/// Blocks inside every frame delivery until released
struct Blocking {
    entered: Sender<()>,
    release: Receiver<()>,
}

impl NodeNotifications for Blocking {
    fn on_node_new_data(&mut self, _: &str, _: u64, _: u32, _: &[u8]) {
        self.entered.send(()).ok();
        self.release.recv().ok();
    }
}

#[test]
fn test_concurrent_seek_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (path, _) = record_mirrored_depth(&dir, 3, 1000);
    let (entered, entered_rx) = crossbeam_channel::unbounded();
    let (release_tx, release) = crossbeam_channel::unbounded();
    let controller =
        PlaybackController::open(&path, &PlaybackConfig::default(), Blocking { entered, release }).unwrap();

    std::thread::scope(|s| {
        let first = s.spawn(|| controller.seek_to_frame("Depth", 2));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(matches!(
            controller.seek_to_frame("Depth", 1),
            Err(OniError::ResourceLocked(_))
        ));

        release_tx.send(()).unwrap();
        first.join().unwrap().unwrap();
    });

    drop(release_tx);
    controller.close().unwrap();
}

#[test]
fn test_config_file_drives_playback_settings() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("onirec.toml");
    std::fs::write(
        &path,
        r#"
[recorder]
property_priority = "high"

[playback]
speed = -1.0
repeat = false
"#,
    )
    .unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.recorder.property_priority, Priority::High);
    assert_eq!(config.playback.speed, -1.0);
    assert!(!config.playback.repeat);
}
