//! Live streams the recorder can attach to

use bytes::Bytes;

use crate::properties::{StreamProperty, VideoMode};
use crate::storage::NodeType;

/// A live sensor stream as seen by the recorder
///
/// The recorder queries the stream once at attach time; frames and
/// property changes are pushed to it by the caller through
/// [`super::Recorder::record`] and [`super::Recorder::record_property`].
pub trait RecordableStream: Send + Sync {
    /// Kind of node the stream is recorded as
    fn node_type(&self) -> NodeType;

    /// Current resolution, frame rate and pixel format
    fn video_mode(&self) -> VideoMode;

    /// Largest depth value the device can report
    fn max_depth(&self) -> u16 {
        10_000
    }

    /// Properties recorded right after the node is added
    fn initial_properties(&self) -> Vec<StreamProperty> {
        Vec::new()
    }
}

/// One captured frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Capture timestamp in microseconds
    pub timestamp: u64,
    /// Raw frame bytes, shared with the producer without copying
    pub data: Bytes,
}

impl Frame {
    /// Create a frame
    pub fn new(timestamp: u64, data: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            data: data.into(),
        }
    }
}

/// Fixed description of a stream, for sources without a live device
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    /// Node type
    pub node_type: NodeType,
    /// Video mode
    pub video_mode: VideoMode,
    /// Largest depth value
    pub max_depth: u16,
    /// Properties recorded at attach time
    pub properties: Vec<StreamProperty>,
}

impl StreamDescriptor {
    /// Describe a stream with no extra properties
    pub fn new(node_type: NodeType, video_mode: VideoMode) -> Self {
        Self {
            node_type,
            video_mode,
            max_depth: 10_000,
            properties: Vec::new(),
        }
    }

    /// Add a property recorded at attach time
    #[must_use]
    pub fn with_property(mut self, property: StreamProperty) -> Self {
        self.properties.push(property);
        self
    }
}

impl RecordableStream for StreamDescriptor {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn video_mode(&self) -> VideoMode {
        self.video_mode
    }

    fn max_depth(&self) -> u16 {
        self.max_depth
    }

    fn initial_properties(&self) -> Vec<StreamProperty> {
        self.properties.clone()
    }
}
