//! The recorder's writer thread: codecs, record assembly and file I/O

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::config::RecorderConfig;
use crate::properties::{names, Property, StreamProperty};
use crate::storage::{
    DataIndexEntry, FileHeader, NodeAdded, NodeId, NodeType, RecordAssembler, FILE_HEADER_SIZE,
};
use crate::{OniError, Result};

use super::queue::PriorityQueue;
use super::stream::{Frame, RecordableStream};

/// Work item handed from producer threads to the writer thread
pub(crate) enum Message {
    Attach {
        node_id: NodeId,
        stream: Arc<dyn RecordableStream>,
        allow_lossy: bool,
    },
    Detach {
        node_id: NodeId,
    },
    Record {
        node_id: NodeId,
        frame: Frame,
    },
    RecordProperty {
        node_id: NodeId,
        property: StreamProperty,
    },
    Terminate,
}

/// Writer-side state of one attached node
struct AttachedStreamInfo {
    name: String,
    node_type: NodeType,
    codec: Codec,
    frames: u32,
    last_input_timestamp: u64,
    last_output_timestamp: u64,
    min_timestamp: u64,
    max_timestamp: u64,
    node_added_pos: u64,
    last_data_pos: u64,
    property_positions: HashMap<String, u64>,
    seek_table: Vec<DataIndexEntry>,
}

impl AttachedStreamInfo {
    /// Map an input timestamp so that output timestamps never go backwards
    fn output_timestamp(&self, input: u64) -> u64 {
        if self.frames == 0 {
            input
        } else if input > self.last_input_timestamp {
            self.last_output_timestamp + (input - self.last_input_timestamp)
        } else {
            self.last_output_timestamp + 1
        }
    }

    fn node_added(&self, seek_table_pos: u64) -> NodeAdded {
        NodeAdded {
            name: self.name.clone(),
            node_type: self.node_type,
            codec: self.codec.id(),
            frames: self.frames,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            seek_table_pos,
        }
    }
}

pub(crate) struct Writer {
    file: BufWriter<File>,
    position: u64,
    header: FileHeader,
    assembler: RecordAssembler,
    nodes: BTreeMap<NodeId, AttachedStreamInfo>,
    name_counts: HashMap<&'static str, u32>,
    configuration_id: u32,
    config: RecorderConfig,
    dropped: Arc<AtomicU64>,
}

impl Writer {
    /// Create the output file and write the provisional header
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or written
    pub(crate) fn create(path: &Path, config: RecorderConfig, dropped: Arc<AtomicU64>) -> Result<Self> {
        let mut file = BufWriter::new(File::create(path)?);
        let header = FileHeader::default();
        file.write_all(&header.encode())?;
        file.flush()?;

        Ok(Self {
            file,
            position: FILE_HEADER_SIZE as u64,
            header,
            assembler: RecordAssembler::new(RecordAssembler::capacity_for_frame(config.max_frame_size)),
            nodes: BTreeMap::new(),
            name_counts: HashMap::new(),
            configuration_id: 0,
            config,
            dropped,
        })
    }

    /// Process messages until TERMINATE, or until the queue is closed
    ///
    /// Messages that fail for any reason other than I/O are dropped and
    /// counted. An I/O failure stops the writer and closes the queue.
    pub(crate) fn run(mut self, queue: &PriorityQueue<Message>) -> Result<()> {
        while let Some(message) = queue.pop() {
            if matches!(message, Message::Terminate) {
                break;
            }
            match self.handle(message) {
                Ok(()) => {}
                Err(OniError::Io(e)) => {
                    queue.close();
                    return Err(OniError::Io(e));
                }
                Err(e) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropped recorder message: {}", e);
                }
            }
        }
        queue.close();
        self.finish()
    }

    fn handle(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Attach {
                node_id,
                stream,
                allow_lossy,
            } => self.attach(node_id, stream.as_ref(), allow_lossy),
            Message::Detach { node_id } => self.detach(node_id),
            Message::Record { node_id, frame } => self.record(node_id, &frame),
            Message::RecordProperty { node_id, property } => {
                for property in property.to_properties() {
                    self.record_property(node_id, &property)?;
                }
                Ok(())
            }
            Message::Terminate => Ok(()),
        }
    }

    /// Append the assembled record, returning its file offset
    fn write_record(&mut self) -> Result<u64> {
        let pos = self.position;
        self.position += self.assembler.serialize(&mut self.file)?;
        Ok(pos)
    }

    /// Overwrite the record at `pos` with the assembled record
    fn patch_record(&mut self, pos: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.assembler.serialize(&mut self.file)?;
        self.file.seek(SeekFrom::Start(self.position))?;
        Ok(())
    }

    fn node_name(&mut self, node_type: NodeType) -> String {
        let base = node_type.name();
        let count = self.name_counts.entry(base).or_insert(0);
        let name = if *count == 0 {
            base.to_string()
        } else {
            format!("{base}{count}")
        };
        *count += 1;
        name
    }

    fn attach(&mut self, node_id: NodeId, stream: &dyn RecordableStream, allow_lossy: bool) -> Result<()> {
        let mode = stream.video_mode();
        let node_type = stream.node_type();
        let max_depth = stream.max_depth();

        let mut codec = Codec::for_stream(&mode, allow_lossy, max_depth, self.config.jpeg_quality);
        codec.init()?;

        let name = self.node_name(node_type);
        let mut node = AttachedStreamInfo {
            name,
            node_type,
            codec,
            frames: 0,
            last_input_timestamp: 0,
            last_output_timestamp: 0,
            min_timestamp: 0,
            max_timestamp: 0,
            node_added_pos: 0,
            last_data_pos: 0,
            property_positions: HashMap::new(),
            seek_table: Vec::new(),
        };

        self.assembler.emit_node_added(node_id, 0, &node.node_added(0))?;
        node.node_added_pos = self.write_record()?;
        info!(
            "Attached node {} as '{}' (codec {})",
            node_id,
            node.name,
            node.codec.id()
        );
        self.nodes.insert(node_id, node);
        self.header.max_node_id = self.header.max_node_id.max(node_id);

        let mut built_in = StreamProperty::VideoMode(mode).to_properties();
        if mode.pixel_format.is_depth() {
            built_in.push(Property::int(names::DEVICE_MAX_DEPTH, u64::from(max_depth)));
        }
        for property in &built_in {
            self.record_property(node_id, property)?;
        }

        self.assembler.emit_node_state_ready(node_id)?;
        self.write_record()?;
        Ok(())
    }

    fn record(&mut self, node_id: NodeId, frame: &Frame) -> Result<()> {
        if frame.data.len() > self.config.max_frame_size {
            return Err(OniError::BadParameter(format!(
                "frame of {} bytes exceeds max_frame_size {}",
                frame.data.len(),
                self.config.max_frame_size
            )));
        }
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| OniError::BadParameter(format!("node {node_id} is not attached")))?;

        let timestamp = node.output_timestamp(frame.timestamp);
        let frame_id = node.frames + 1;
        let codec = &mut node.codec;
        self.assembler
            .emit_new_data(node_id, node.last_data_pos, timestamp, frame_id, |out| {
                codec.compress(&frame.data, out)
            })?;

        let pos = self.position;
        self.position += self.assembler.serialize(&mut self.file)?;

        if node.frames == 0 {
            node.min_timestamp = timestamp;
        }
        node.frames = frame_id;
        node.max_timestamp = timestamp;
        node.last_input_timestamp = frame.timestamp;
        node.last_output_timestamp = timestamp;
        node.last_data_pos = pos;
        node.seek_table.push(DataIndexEntry {
            timestamp,
            configuration_id: self.configuration_id,
            seek_pos: pos,
        });
        self.header.max_timestamp = self.header.max_timestamp.max(timestamp);
        Ok(())
    }

    fn record_property(&mut self, node_id: NodeId, property: &Property) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| OniError::BadParameter(format!("node {node_id} is not attached")))?;

        let undo = node.property_positions.get(&property.name).copied().unwrap_or(0);
        self.assembler.emit_property(node_id, undo, property)?;
        let pos = self.position;
        self.position += self.assembler.serialize(&mut self.file)?;

        node.property_positions.insert(property.name.clone(), pos);
        self.configuration_id += 1;
        debug!("Recorded property '{}' on node {}", property.name, node_id);
        Ok(())
    }

    fn detach(&mut self, node_id: NodeId) -> Result<()> {
        let node = self
            .nodes
            .remove(&node_id)
            .ok_or_else(|| OniError::BadParameter(format!("node {node_id} is not attached")))?;

        let seek_table_pos = match self.assembler.emit_seek_table(node_id, &node.seek_table) {
            Ok(()) => self.write_record()?,
            Err(e) => {
                warn!("Seek table for '{}' not written: {}", node.name, e);
                0
            }
        };

        self.assembler.emit_node_added(node_id, 0, &node.node_added(seek_table_pos))?;
        self.patch_record(node.node_added_pos)?;

        self.assembler.emit_node_removed(node_id, node.node_added_pos)?;
        self.write_record()?;

        info!("Detached '{}' after {} frames", node.name, node.frames);
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        let remaining: Vec<NodeId> = self.nodes.keys().copied().collect();
        for node_id in remaining {
            match self.detach(node_id) {
                Ok(()) => {}
                Err(OniError::Io(e)) => return Err(OniError::Io(e)),
                Err(e) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Failed to detach node {} at shutdown: {}", node_id, e);
                }
            }
        }

        self.assembler.emit_end()?;
        self.write_record()?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        info!(
            "Recording finished: {} bytes, max timestamp {}",
            self.position, self.header.max_timestamp
        );
        Ok(())
    }
}
