//! Callbacks through which a player reports what it reads

use crate::codec::CodecId;
use crate::storage::NodeType;

/// Receiver of playback events
///
/// Every method defaults to doing nothing, so consumers implement only
/// the events they care about.
#[allow(unused_variables)]
pub trait NodeNotifications {
    /// A node appeared, or reappeared after being removed
    fn on_node_added(&mut self, name: &str, node_type: NodeType, codec: CodecId, frames: u32) {}

    /// A node was removed
    fn on_node_removed(&mut self, name: &str) {}

    /// An integer property changed
    fn on_node_int_prop_changed(&mut self, name: &str, property: &str, value: u64) {}

    /// A real property changed
    fn on_node_real_prop_changed(&mut self, name: &str, property: &str, value: f64) {}

    /// A string property changed
    fn on_node_string_prop_changed(&mut self, name: &str, property: &str, value: &str) {}

    /// An opaque property changed
    fn on_node_general_prop_changed(&mut self, name: &str, property: &str, value: &[u8]) {}

    /// A node finished announcing its initial state
    fn on_node_state_ready(&mut self, name: &str) {}

    /// A decompressed data frame is available
    fn on_node_new_data(&mut self, name: &str, timestamp: u64, frame: u32, data: &[u8]) {}

    /// The end of the recording was reached
    fn on_end_of_file_reached(&mut self) {}
}

/// Notifications that discard every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifications;

impl NodeNotifications for NullNotifications {}
