//! Sequential decoder that replays a recording as notifications

mod seek;

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::{Codec, CodecFactory, CodecId};
use crate::config::PlaybackConfig;
use crate::properties::PropertyValue;
use crate::storage::{
    decode_fields, validate_header, DataIndexEntry, FileHeader, InputStream, NodeAdded, NodeId,
    NodeType, RecordBody, RecordHeader, RecordType, FILE_HEADER_SIZE, RECORD_HEADER_SIZE,
};
use crate::{OniError, Result};

use super::notifications::NodeNotifications;

pub use seek::SeekOrigin;

/// Position of a property record and of the record it superseded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RecordUndo {
    record_pos: u64,
    undo_pos: u64,
}

/// The part of a node's state that moves with the read position
#[derive(Debug, Clone, Default)]
struct NodeCursor {
    cur_frame: u32,
    timestamp: u64,
    last_data_pos: u64,
    data_undo_pos: u64,
    props: HashMap<String, RecordUndo>,
    removed_pos: Option<u64>,
    state_ready: bool,
}

struct PlayerNode {
    name: String,
    node_type: NodeType,
    codec_id: CodecId,
    codec: Option<Codec>,
    frames: u32,
    max_timestamp: u64,
    seek_table: Option<Arc<[DataIndexEntry]>>,
    cursor: NodeCursor,
    re_added: bool,
}

impl PlayerNode {
    fn is_valid(&self) -> bool {
        self.cursor.removed_pos.is_none()
    }
}

/// One record with its header and fields read; the stream is positioned
/// at the start of its payload
struct RawRecord {
    pos: u64,
    header: RecordHeader,
    body: RecordBody,
}

/// Outcome of processing one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Data(NodeId),
    End,
}

/// Plays back a recording, one data frame per [`Player::read_next`]
pub struct Player<N: NodeNotifications> {
    stream: Box<dyn InputStream>,
    factory: Box<dyn CodecFactory>,
    notifications: N,
    header: FileHeader,
    legacy_32bit: bool,
    nodes: BTreeMap<NodeId, PlayerNode>,
    timestamp: u64,
    last_data_node: Option<NodeId>,
    repeat: bool,
    eof: bool,
    fields: Vec<u8>,
    payload: Vec<u8>,
    decoded: Vec<u8>,
}

impl<N: NodeNotifications> Player<N> {
    /// Open a recording with the default playback settings
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be opened, the header is invalid,
    /// or the records before the first frame cannot be processed
    pub fn open(
        stream: Box<dyn InputStream>,
        factory: Box<dyn CodecFactory>,
        notifications: N,
    ) -> Result<Self> {
        Self::open_with_config(stream, factory, notifications, &PlaybackConfig::default())
    }

    /// Open a recording
    ///
    /// Nodes and properties preceding the first data frame are announced
    /// through `notifications` before this returns.
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be opened, the header is invalid,
    /// or the records before the first frame cannot be processed
    pub fn open_with_config(
        mut stream: Box<dyn InputStream>,
        factory: Box<dyn CodecFactory>,
        notifications: N,
        config: &PlaybackConfig,
    ) -> Result<Self> {
        stream.open()?;
        let header = read_file_header(stream.as_mut())?;

        let mut player = Self {
            stream,
            factory,
            notifications,
            header,
            legacy_32bit: header.version.uses_32bit_offsets(),
            nodes: BTreeMap::new(),
            timestamp: 0,
            last_data_node: None,
            repeat: config.repeat,
            eof: false,
            fields: Vec::new(),
            payload: Vec::new(),
            decoded: vec![0u8; config.decode_buffer_size],
        };
        player.process_until_first_data()?;

        info!(
            "Opened recording version {} with {} nodes",
            header.version,
            player.nodes.len()
        );
        Ok(player)
    }

    /// Check that `stream` holds a playable recording, reading only its header
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be read or the header is invalid
    pub fn validate_stream(stream: &mut dyn InputStream) -> Result<FileHeader> {
        stream.open()?;
        let result = read_file_header(stream);
        stream.close()?;
        result
    }

    /// Deliver the next data frame
    ///
    /// At the end of the recording the player either rewinds (repeat) and
    /// continues with the first frame, or enters the end-of-file state in
    /// which further calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns `CorruptOrTruncated` if a record is cut short, or an I/O error
    pub fn read_next(&mut self) -> Result<()> {
        let mut rewound = false;
        while !self.eof {
            let flow = match self.read_record()? {
                Some(record) => self.process_record(record, true)?,
                None => Flow::End,
            };
            match flow {
                Flow::Data(_) => return Ok(()),
                Flow::Continue => {}
                Flow::End => {
                    // A repeat pass that reaches the end again has no data at all.
                    if !self.repeat || rewound {
                        self.eof = true;
                    } else {
                        self.rewind()?;
                        rewound = true;
                    }
                    self.notifications.on_end_of_file_reached();
                }
            }
        }
        Ok(())
    }

    /// Timestamp of the most recently processed frame
    pub fn tell_timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Current frame of node `name`, 0 before its first frame
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if no such node exists
    pub fn tell_frame(&self, name: &str) -> Result<u32> {
        Ok(self.node_by_name(name)?.1.cursor.cur_frame)
    }

    /// Number of frames recorded for node `name`, 0 if unknown
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if no such node exists
    pub fn num_frames(&self, name: &str) -> Result<u32> {
        Ok(self.node_by_name(name)?.1.frames)
    }

    /// Whether playback stopped at the end of the recording
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Whether the player rewinds at the end of the recording
    pub fn is_repeat(&self) -> bool {
        self.repeat
    }

    /// Enable or disable rewinding at the end of the recording
    pub fn set_repeat(&mut self, repeat: bool) {
        self.repeat = repeat;
    }

    /// Names of the nodes currently present
    pub fn node_names(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| node.is_valid())
            .map(|node| node.name.clone())
            .collect()
    }

    /// File header of the recording
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// The notifications receiver
    pub fn notifications(&self) -> &N {
        &self.notifications
    }

    /// The notifications receiver, mutably
    pub fn notifications_mut(&mut self) -> &mut N {
        &mut self.notifications
    }

    /// Close the input stream and hand back the notifications receiver
    ///
    /// # Errors
    ///
    /// Returns error if closing the stream fails
    pub fn close(mut self) -> Result<N> {
        self.stream.close()?;
        Ok(self.notifications)
    }

    fn node_by_name(&self, name: &str) -> Result<(NodeId, &PlayerNode)> {
        self.nodes
            .iter()
            .find(|(_, node)| node.name == name)
            .map(|(id, node)| (*id, node))
            .ok_or_else(|| OniError::BadParameter(format!("no node named '{name}'")))
    }

    /// Largest timestamp in the recording
    fn max_timestamp(&self) -> u64 {
        self.nodes
            .values()
            .map(|node| node.max_timestamp)
            .fold(self.header.max_timestamp, u64::max)
    }

    /// Read the next record's header and fields, `None` at a clean end of stream
    fn read_record(&mut self) -> Result<Option<RawRecord>> {
        let pos = self.stream.tell64()?;
        let header_size = RecordHeader::size(self.legacy_32bit);
        let mut header_buf = [0u8; RECORD_HEADER_SIZE];
        let n = self.stream.read_fully(&mut header_buf[..header_size])?;
        if n == 0 {
            return Ok(None);
        }
        if n < header_size {
            return Err(OniError::corrupt(pos, "truncated record header"));
        }
        let header = RecordHeader::decode(&header_buf[..header_size], self.legacy_32bit, pos)?;

        let fields_len = header.fields_size as usize - header_size;
        self.fields.resize(fields_len, 0);
        if self.stream.read_fully(&mut self.fields)? < fields_len {
            return Err(OniError::corrupt(pos, "truncated record fields"));
        }
        let body = decode_fields(&header, &self.fields, pos)?;
        Ok(Some(RawRecord { pos, header, body }))
    }

    fn read_record_at(&mut self, pos: u64) -> Result<RawRecord> {
        self.stream.seek64(SeekFrom::Start(pos))?;
        self.read_record()?
            .ok_or_else(|| OniError::corrupt(pos, "record expected past end of stream"))
    }

    fn read_payload(&mut self, record: &RawRecord) -> Result<()> {
        let size = record.header.payload_size as usize;
        self.payload.resize(size, 0);
        if self.stream.read_fully(&mut self.payload)? < size {
            return Err(OniError::corrupt(record.pos, "truncated record payload"));
        }
        Ok(())
    }

    fn skip_payload(&mut self, record: &RawRecord) -> Result<()> {
        if record.header.payload_size > 0 {
            self.stream
                .seek64(SeekFrom::Current(i64::from(record.header.payload_size)))?;
        }
        Ok(())
    }

    /// Apply one record; with `deliver` unset data frames only move the
    /// node's position and their payload is skipped
    fn process_record(&mut self, record: RawRecord, deliver: bool) -> Result<Flow> {
        let node_id = record.header.node_id;
        match &record.body {
            RecordBody::NewData {
                timestamp,
                frame_id,
            } => return self.handle_new_data(&record, *timestamp, *frame_id, deliver),
            RecordBody::End => {
                self.stream.seek64(SeekFrom::Start(record.pos))?;
                return Ok(Flow::End);
            }
            _ => self.skip_payload(&record)?,
        }

        match record.body {
            RecordBody::NodeAdded(added) => self.handle_node_added(node_id, added)?,
            RecordBody::Property(property) => {
                let Some(node) = self.nodes.get_mut(&node_id) else {
                    warn!("Property '{}' for unknown node {}", property.name, node_id);
                    return Ok(Flow::Continue);
                };
                node.cursor.props.insert(
                    property.name.clone(),
                    RecordUndo {
                        record_pos: record.pos,
                        undo_pos: record.header.undo_record_pos,
                    },
                );
                let name = node.name.as_str();
                let n = &mut self.notifications;
                match &property.value {
                    PropertyValue::Int(v) => n.on_node_int_prop_changed(name, &property.name, *v),
                    PropertyValue::Real(v) => n.on_node_real_prop_changed(name, &property.name, *v),
                    PropertyValue::String(v) => {
                        n.on_node_string_prop_changed(name, &property.name, v);
                    }
                    PropertyValue::General(v) => {
                        n.on_node_general_prop_changed(name, &property.name, v);
                    }
                }
            }
            RecordBody::NodeRemoved => {
                if let Some(node) = self.nodes.get_mut(&node_id) {
                    if node.cursor.removed_pos.is_none() {
                        node.cursor.removed_pos = Some(record.pos);
                        self.notifications.on_node_removed(&node.name);
                    }
                }
            }
            RecordBody::NodeDataBegin {
                frames,
                max_timestamp,
            } => {
                if let Some(node) = self.nodes.get_mut(&node_id) {
                    if node.frames == 0 {
                        node.frames = frames;
                        node.max_timestamp = max_timestamp;
                    }
                }
            }
            RecordBody::NodeStateReady => {
                if let Some(node) = self.nodes.get_mut(&node_id) {
                    node.cursor.state_ready = true;
                    self.notifications.on_node_state_ready(&node.name);
                }
            }
            RecordBody::SeekTable | RecordBody::NewData { .. } | RecordBody::End => {}
        }
        Ok(Flow::Continue)
    }

    fn handle_node_added(&mut self, node_id: NodeId, added: NodeAdded) -> Result<()> {
        let seek_table = if added.seek_table_pos == 0 {
            None
        } else {
            self.load_seek_table(added.seek_table_pos)?
        };

        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.re_added = true;
            node.frames = added.frames;
            node.max_timestamp = added.max_timestamp;
            if seek_table.is_some() {
                node.seek_table = seek_table;
            }
            if node.cursor.removed_pos.take().is_some() {
                self.notifications
                    .on_node_added(&node.name, node.node_type, node.codec_id, node.frames);
            }
            return Ok(());
        }

        let codec = if added.node_type.is_generator() {
            Some(self.factory.create(&added.name, added.codec)?)
        } else {
            None
        };
        debug!(
            "Node {} '{}' added ({:?}, codec {}, {} frames)",
            node_id, added.name, added.node_type, added.codec, added.frames
        );
        self.notifications
            .on_node_added(&added.name, added.node_type, added.codec, added.frames);
        self.nodes.insert(
            node_id,
            PlayerNode {
                name: added.name,
                node_type: added.node_type,
                codec_id: added.codec,
                codec,
                frames: added.frames,
                max_timestamp: added.max_timestamp,
                seek_table,
                cursor: NodeCursor::default(),
                re_added: true,
            },
        );
        Ok(())
    }

    /// Read the SEEK_TABLE record at `pos` without moving the read position
    fn load_seek_table(&mut self, pos: u64) -> Result<Option<Arc<[DataIndexEntry]>>> {
        let resume = self.stream.tell64()?;
        let table = self.read_seek_table(pos);
        self.stream.seek64(SeekFrom::Start(resume))?;

        match table {
            Ok(table) => Ok(Some(table.into())),
            Err(OniError::Io(e)) => Err(OniError::Io(e)),
            Err(e) => {
                warn!("Ignoring seek table at {}: {}", pos, e);
                Ok(None)
            }
        }
    }

    fn read_seek_table(&mut self, pos: u64) -> Result<Vec<DataIndexEntry>> {
        let record = self.read_record_at(pos)?;
        if record.header.record_type != RecordType::SeekTable {
            return Err(OniError::corrupt(
                pos,
                format!("expected seek table, found {:?}", record.header.record_type),
            ));
        }
        self.read_payload(&record)?;
        DataIndexEntry::decode_table(&self.payload, self.legacy_32bit, pos)
    }

    fn handle_new_data(
        &mut self,
        record: &RawRecord,
        timestamp: u64,
        frame_id: u32,
        deliver: bool,
    ) -> Result<Flow> {
        let node_id = record.header.node_id;
        if !self.nodes.contains_key(&node_id) {
            warn!("Data for unknown node {} at {}", node_id, record.pos);
            self.skip_payload(record)?;
            return Ok(Flow::Continue);
        }

        if deliver {
            self.read_payload(record)?;
        } else {
            self.skip_payload(record)?;
        }

        let Some(node) = self.nodes.get_mut(&node_id) else {
            return Ok(Flow::Continue);
        };
        node.cursor.cur_frame = frame_id;
        node.cursor.timestamp = timestamp;
        node.cursor.last_data_pos = record.pos;
        node.cursor.data_undo_pos = record.header.undo_record_pos;
        self.timestamp = timestamp;
        self.last_data_node = Some(node_id);

        if !deliver {
            return Ok(Flow::Data(node_id));
        }

        let Some(codec) = node.codec.as_mut() else {
            warn!("Node '{}' has no codec, frame {} skipped", node.name, frame_id);
            return Ok(Flow::Continue);
        };
        match codec.decompress(&self.payload, &mut self.decoded) {
            Ok(size) => {
                self.notifications.on_node_new_data(
                    &node.name,
                    timestamp,
                    frame_id,
                    &self.decoded[..size],
                );
                Ok(Flow::Data(node_id))
            }
            Err(e) => {
                warn!("Frame {} of '{}' not decoded: {}", frame_id, node.name, e);
                Ok(Flow::Continue)
            }
        }
    }

    /// Process records up to the first data frame and stop in front of it
    fn process_until_first_data(&mut self) -> Result<()> {
        loop {
            let Some(record) = self.read_record()? else {
                return Ok(());
            };
            if matches!(record.body, RecordBody::NewData { .. }) {
                self.stream.seek64(SeekFrom::Start(record.pos))?;
                return Ok(());
            }
            if self.process_record(record, true)? == Flow::End {
                return Ok(());
            }
        }
    }

    /// Restart from the first record, dropping nodes that are not added again
    fn rewind(&mut self) -> Result<()> {
        self.stream.seek64(SeekFrom::Start(FILE_HEADER_SIZE as u64))?;
        for node in self.nodes.values_mut() {
            node.re_added = false;
            let removed_pos = node.cursor.removed_pos;
            node.cursor = NodeCursor {
                removed_pos,
                ..NodeCursor::default()
            };
        }
        self.timestamp = 0;
        self.last_data_node = None;

        self.process_until_first_data()?;

        let gone: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, node)| !node.re_added)
            .map(|(id, _)| *id)
            .collect();
        for id in gone {
            if let Some(node) = self.nodes.remove(&id) {
                if node.is_valid() {
                    self.notifications.on_node_removed(&node.name);
                }
            }
        }
        debug!("Rewound to the first frame");
        Ok(())
    }
}

fn read_file_header(stream: &mut dyn InputStream) -> Result<FileHeader> {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    if stream.read_fully(&mut buf)? < FILE_HEADER_SIZE {
        return Err(OniError::corrupt(0, "file shorter than its header"));
    }
    let header = FileHeader::decode(&buf)?;
    validate_header(&header)?;
    Ok(header)
}
