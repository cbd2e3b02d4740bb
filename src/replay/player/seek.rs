//! Frame and timestamp seeking
//!
//! A seek picks one of three strategies. When every data node has a seek
//! table and no property changed between the current and the target
//! position, the nodes are positioned straight from the tables. Otherwise
//! a backward seek walks the undo chains and re-applies the properties
//! that were in effect at the target, and a forward seek scans records
//! without decoding frames. All of them finish by re-delivering each
//! node's last frame, the target node's last.

use std::io::SeekFrom;

use tracing::debug;

use crate::storage::{DataIndexEntry, NodeId, RecordBody};
use crate::{OniError, Result};

use super::{Flow, NodeCursor, NodeNotifications, Player};

/// Reference point of a relative seek
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    /// From the first frame (frames) or timestamp 0
    Set,
    /// From the current frame or timestamp
    Current,
    /// From the last frame or the largest timestamp
    End,
}

struct Snapshot {
    pos: u64,
    timestamp: u64,
    last_data_node: Option<NodeId>,
    eof: bool,
    cursors: Vec<(NodeId, NodeCursor)>,
}

impl<N: NodeNotifications> Player<N> {
    /// Seek node `name` to a frame and deliver it, along with the frame
    /// every other node shows at that point
    ///
    /// Frames are numbered from 1. After the seek, [`Player::read_next`]
    /// continues with whatever follows the target frame.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` for an unknown node or a target frame below 1,
    /// and `SeekOutOfRange` past the last frame. On failure the player's
    /// position and node state are restored, but notifications already sent
    /// while the seek ran (re-applied properties, re-added nodes) are not
    /// retracted
    pub fn seek_to_frame(&mut self, name: &str, offset: i64, origin: SeekOrigin) -> Result<()> {
        let (node_id, node) = self.node_by_name(name)?;
        if node.codec.is_none() {
            return Err(OniError::BadParameter(format!(
                "node '{name}' has no data to seek in"
            )));
        }

        let base = match origin {
            SeekOrigin::Set => 0,
            SeekOrigin::Current => i64::from(node.cursor.cur_frame),
            SeekOrigin::End => i64::from(node.frames),
        };
        let target = base.saturating_add(offset);
        if target < 1 {
            return Err(OniError::BadParameter(format!(
                "frame {target} of '{name}' is before the first frame"
            )));
        }
        if node.frames > 0 && target > i64::from(node.frames) {
            return Err(OniError::SeekOutOfRange(format!(
                "frame {target} of '{name}', which has {} frames",
                node.frames
            )));
        }
        let frame = u32::try_from(target)
            .map_err(|_| OniError::SeekOutOfRange(format!("frame {target} of '{name}'")))?;

        let snapshot = self.snapshot()?;
        match self.seek_to_frame_absolute(node_id, frame) {
            Ok(()) => {
                self.eof = false;
                debug!("Seeked '{}' to frame {}", name, frame);
                Ok(())
            }
            Err(e) => {
                self.restore(snapshot)?;
                Err(e)
            }
        }
    }

    /// Seek every node to the given timestamp
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` for a negative target and `SeekOutOfRange`
    /// past the largest recorded timestamp. A failure part way through
    /// behaves as for [`Player::seek_to_frame`]
    pub fn seek_to_timestamp(&mut self, offset: i64, origin: SeekOrigin) -> Result<()> {
        let max = self.max_timestamp();
        let base = match origin {
            SeekOrigin::Set => 0,
            SeekOrigin::Current => self.timestamp,
            SeekOrigin::End => max,
        };
        let target = i64::try_from(base)
            .unwrap_or(i64::MAX)
            .saturating_add(offset);
        let target = u64::try_from(target).map_err(|_| {
            OniError::BadParameter(format!("timestamp {target} is before the recording"))
        })?;
        if target > max {
            return Err(OniError::SeekOutOfRange(format!(
                "timestamp {target} is past the last one, {max}"
            )));
        }

        let snapshot = self.snapshot()?;
        let result = if target >= self.timestamp {
            self.seek_timestamp_forward(target)
        } else {
            self.seek_timestamp_backward(target)
        };
        match result {
            Ok(()) => {
                self.eof = false;
                debug!("Seeked to timestamp {}", target);
                Ok(())
            }
            Err(e) => {
                self.restore(snapshot)?;
                Err(e)
            }
        }
    }

    fn snapshot(&mut self) -> Result<Snapshot> {
        Ok(Snapshot {
            pos: self.stream.tell64()?,
            timestamp: self.timestamp,
            last_data_node: self.last_data_node,
            eof: self.eof,
            cursors: self
                .nodes
                .iter()
                .map(|(id, node)| (*id, node.cursor.clone()))
                .collect(),
        })
    }

    fn restore(&mut self, snapshot: Snapshot) -> Result<()> {
        self.stream.seek64(SeekFrom::Start(snapshot.pos))?;
        self.timestamp = snapshot.timestamp;
        self.last_data_node = snapshot.last_data_node;
        self.eof = snapshot.eof;
        for (id, cursor) in snapshot.cursors {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.cursor = cursor;
            }
        }
        Ok(())
    }

    fn seek_to_frame_absolute(&mut self, node_id: NodeId, frame: u32) -> Result<()> {
        if let Some(locations) = self.seek_locations(node_id, frame) {
            debug!("Seeking through seek tables");
            let dest = locations
                .iter()
                .find(|(id, _, _)| *id == node_id)
                .map_or(0, |(_, _, entry)| entry.seek_pos);
            for (id, frame, entry) in locations {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.cursor.cur_frame = frame;
                    node.cursor.timestamp = entry.timestamp;
                    node.cursor.last_data_pos = entry.seek_pos;
                }
            }
            self.restore_removed(dest);
            return self.process_each_node_last_data(node_id);
        }

        let current = self.nodes.get(&node_id).map_or(0, |node| node.cursor.cur_frame);
        if frame <= current {
            let dest = self.find_frame_pos(node_id, frame)?;
            self.undo_to(dest)?;
        } else {
            self.scan_to_frame(node_id, frame)?;
        }
        self.process_each_node_last_data(node_id)
    }

    /// Positions of every data node for `frame` of `target`, if the seek
    /// tables alone can serve the seek
    ///
    /// That requires every data node to have a table, a current frame, and
    /// an entry at or before the target, and all those entries and the
    /// current ones to share one property configuration.
    fn seek_locations(&self, target: NodeId, frame: u32) -> Option<Vec<(NodeId, u32, DataIndexEntry)>> {
        let dest = *self
            .nodes
            .get(&target)?
            .seek_table
            .as_ref()?
            .get(frame as usize)?;
        let configuration = dest.configuration_id;

        let mut locations = Vec::new();
        for (id, node) in &self.nodes {
            if node.codec.is_none() {
                continue;
            }
            let table = node.seek_table.as_ref()?;
            if node.cursor.cur_frame == 0 {
                return None;
            }
            let current = table.get(node.cursor.cur_frame as usize)?;
            if current.configuration_id != configuration {
                return None;
            }

            let (chosen_frame, chosen) = if *id == target {
                (frame, dest)
            } else {
                let rows = &table[1..];
                let n = rows.partition_point(|e| e.seek_pos <= dest.seek_pos);
                if n == 0 {
                    return None;
                }
                (n as u32, rows[n - 1])
            };
            if chosen.configuration_id != configuration {
                return None;
            }
            locations.push((*id, chosen_frame, chosen));
        }
        Some(locations)
    }

    /// File offset of `frame` of `node_id`, found by walking its data chain back
    fn find_frame_pos(&mut self, node_id: NodeId, frame: u32) -> Result<u64> {
        let mut pos = self.nodes.get(&node_id).map_or(0, |node| node.cursor.last_data_pos);
        while pos != 0 {
            let record = self.read_record_at(pos)?;
            match record.body {
                RecordBody::NewData { frame_id, .. } if frame_id == frame => return Ok(pos),
                RecordBody::NewData { frame_id, .. } if frame_id < frame => break,
                _ => pos = record.header.undo_record_pos,
            }
        }
        Err(OniError::SeekOutOfRange(format!(
            "frame {frame} of node {node_id} not found"
        )))
    }

    /// Follow an undo chain from `pos` to the newest record at or before `dest`
    fn undo_chain_to(&mut self, mut pos: u64, dest: u64) -> Result<u64> {
        while pos > dest {
            pos = self.read_record_at(pos)?.header.undo_record_pos;
        }
        Ok(pos)
    }

    /// Bring every node's properties and data position back to file offset `dest`
    fn undo_to(&mut self, dest: u64) -> Result<()> {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            let stale: Vec<(String, u64)> = self.nodes[&id]
                .cursor
                .props
                .iter()
                .filter(|(_, undo)| undo.record_pos > dest)
                .map(|(name, undo)| (name.clone(), undo.undo_pos))
                .collect();
            for (name, undo_pos) in stale {
                let pos = self.undo_chain_to(undo_pos, dest)?;
                if pos == 0 {
                    if let Some(node) = self.nodes.get_mut(&id) {
                        node.cursor.props.remove(&name);
                    }
                } else {
                    let record = self.read_record_at(pos)?;
                    self.process_record(record, true)?;
                }
            }

            let (last_data_pos, data_undo_pos) = {
                let cursor = &self.nodes[&id].cursor;
                (cursor.last_data_pos, cursor.data_undo_pos)
            };
            if last_data_pos > dest {
                let pos = self.undo_chain_to(data_undo_pos, dest)?;
                if pos == 0 {
                    if let Some(node) = self.nodes.get_mut(&id) {
                        node.cursor.cur_frame = 0;
                        node.cursor.timestamp = 0;
                        node.cursor.last_data_pos = 0;
                        node.cursor.data_undo_pos = 0;
                    }
                } else {
                    let record = self.read_record_at(pos)?;
                    if let (RecordBody::NewData { timestamp, frame_id }, Some(node)) =
                        (&record.body, self.nodes.get_mut(&id))
                    {
                        node.cursor.cur_frame = *frame_id;
                        node.cursor.timestamp = *timestamp;
                        node.cursor.last_data_pos = pos;
                        node.cursor.data_undo_pos = record.header.undo_record_pos;
                    }
                }
            }
        }
        self.restore_removed(dest);
        Ok(())
    }

    /// Bring back nodes whose removal lies after `dest`
    fn restore_removed(&mut self, dest: u64) {
        for node in self.nodes.values_mut() {
            if node.cursor.removed_pos.is_some_and(|pos| pos > dest) {
                node.cursor.removed_pos = None;
                self.notifications
                    .on_node_added(&node.name, node.node_type, node.codec_id, node.frames);
            }
        }
    }

    /// Scan forward without decoding until `node_id` reaches `frame`
    fn scan_to_frame(&mut self, node_id: NodeId, frame: u32) -> Result<()> {
        loop {
            let Some(record) = self.read_record()? else {
                break;
            };
            match self.process_record(record, false)? {
                Flow::Data(id) if id == node_id => {
                    let current = self.nodes.get(&id).map_or(0, |node| node.cursor.cur_frame);
                    if current == frame {
                        return Ok(());
                    }
                }
                Flow::End => break,
                Flow::Data(_) | Flow::Continue => {}
            }
        }
        Err(OniError::SeekOutOfRange(format!(
            "recording ends before frame {frame} of node {node_id}"
        )))
    }

    /// Scan forward without decoding to the last frame at or before `target`
    fn seek_timestamp_forward(&mut self, target: u64) -> Result<()> {
        loop {
            let pos = self.stream.tell64()?;
            let Some(record) = self.read_record()? else {
                break;
            };
            match record.body {
                RecordBody::NewData { timestamp, .. } if timestamp > target => {
                    self.stream.seek64(SeekFrom::Start(pos))?;
                    break;
                }
                _ => {
                    if self.process_record(record, false)? == Flow::End {
                        break;
                    }
                }
            }
        }

        let stop = self.stream.tell64()?;
        if let Some(last) = self.last_data_node {
            self.process_each_node_last_data(last)?;
            self.stream.seek64(SeekFrom::Start(stop))?;
        }
        Ok(())
    }

    /// Undo back to the newest frame at or before `target` across all nodes
    fn seek_timestamp_backward(&mut self, target: u64) -> Result<()> {
        let starts: Vec<(NodeId, u64)> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.cursor.last_data_pos != 0)
            .map(|(id, node)| (*id, node.cursor.last_data_pos))
            .collect();

        let mut dest: Option<(u64, NodeId)> = None;
        for (id, mut pos) in starts {
            while pos != 0 {
                let record = self.read_record_at(pos)?;
                match record.body {
                    RecordBody::NewData { timestamp, .. } if timestamp <= target => {
                        if dest.map_or(true, |(best, _)| pos > best) {
                            dest = Some((pos, id));
                        }
                        break;
                    }
                    _ => pos = record.header.undo_record_pos,
                }
            }
        }

        match dest {
            Some((pos, id)) => {
                self.undo_to(pos)?;
                self.process_each_node_last_data(id)
            }
            None => self.rewind(),
        }
    }

    /// Re-deliver every node's current frame, `last` after all others,
    /// leaving the stream right after `last`'s frame record
    fn process_each_node_last_data(&mut self, last: NodeId) -> Result<()> {
        let mut positions: Vec<(NodeId, u64)> = self
            .nodes
            .iter()
            .filter(|(id, node)| **id != last && node.is_valid() && node.cursor.last_data_pos != 0)
            .map(|(id, node)| (*id, node.cursor.last_data_pos))
            .collect();
        if let Some(node) = self.nodes.get(&last) {
            if node.cursor.last_data_pos != 0 {
                positions.push((last, node.cursor.last_data_pos));
            }
        }

        for (id, pos) in positions {
            let record = self.read_record_at(pos)?;
            if !matches!(record.body, RecordBody::NewData { .. }) || record.header.node_id != id {
                return Err(OniError::corrupt(pos, "seek position is not a frame of the node"));
            }
            self.process_record(record, true)?;
        }
        Ok(())
    }
}
