//! Record assembly into a pre-sized scratch buffer

use std::io::Write;

use crate::cursor::SliceWriter;
use crate::properties::Property;
use crate::{OniError, Result};

use super::format::{
    DataIndexEntry, NodeId, RecordHeader, RecordType, Version, CURRENT_FILE_FORMAT_VERSION,
    MAX_STRING_LENGTH, RECORD_HEADER_SIZE,
};
use super::record::{encode_property, property_record_type, NodeAdded};

/// Room reserved for the fields of any record type
const MAX_FIELDS_SIZE: usize = RECORD_HEADER_SIZE + 4 + MAX_STRING_LENGTH + 64;

/// Serializes one record at a time
///
/// Each `emit_*` call replaces the previously assembled record. A failed
/// emit leaves the assembler empty, so a following [`RecordAssembler::serialize`]
/// writes nothing.
pub struct RecordAssembler {
    buffer: Vec<u8>,
    header: Option<RecordHeader>,
    legacy_32bit: bool,
}

impl RecordAssembler {
    /// Create an assembler whose records may be up to `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self::for_version(capacity, CURRENT_FILE_FORMAT_VERSION)
    }

    /// Create an assembler producing records for a specific format version
    pub fn for_version(capacity: usize, version: Version) -> Self {
        Self {
            buffer: vec![0u8; capacity.max(MAX_FIELDS_SIZE)],
            header: None,
            legacy_32bit: version.uses_32bit_offsets(),
        }
    }

    /// Capacity needed to hold a NEW_DATA record of a compressed frame of
    /// at most `max_frame_size` raw bytes, under any codec
    pub fn capacity_for_frame(max_frame_size: usize) -> usize {
        MAX_FIELDS_SIZE + max_frame_size * 3 / 2 + 2 + 2 * 0x1_0000 + 2048
    }

    /// Size of the scratch buffer
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Header of the assembled record, if any
    pub fn header(&self) -> Option<&RecordHeader> {
        self.header.as_ref()
    }

    /// Bytes of the assembled record
    pub fn as_bytes(&self) -> &[u8] {
        match &self.header {
            Some(h) => &self.buffer[..h.record_size() as usize],
            None => &[],
        }
    }

    /// Write the assembled record to `out`, returning the number of bytes written
    ///
    /// # Errors
    ///
    /// Returns error if writing fails
    pub fn serialize<W: Write>(&self, out: &mut W) -> Result<u64> {
        let bytes = self.as_bytes();
        out.write_all(bytes)?;
        Ok(bytes.len() as u64)
    }

    fn emit<F, P>(
        &mut self,
        record_type: RecordType,
        node_id: NodeId,
        undo_record_pos: u64,
        fields: F,
        payload: P,
    ) -> Result<()>
    where
        F: FnOnce(&mut SliceWriter<'_>) -> Result<()>,
        P: FnOnce(&mut [u8]) -> Result<usize>,
    {
        self.header = None;
        let header_size = RecordHeader::size(self.legacy_32bit);

        let fields_size = {
            let mut w = SliceWriter::new(&mut self.buffer);
            w.put_bytes(&[0u8; RECORD_HEADER_SIZE][..header_size])?;
            fields(&mut w)?;
            w.position()
        };
        let payload_size = payload(&mut self.buffer[fields_size..])?;

        let header = RecordHeader {
            record_type,
            node_id,
            fields_size: to_u32(fields_size)?,
            payload_size: to_u32(payload_size)?,
            undo_record_pos,
        };
        header.encode_into(
            &mut SliceWriter::new(&mut self.buffer[..header_size]),
            self.legacy_32bit,
        )?;
        self.header = Some(header);
        Ok(())
    }

    fn emit_fields<F>(
        &mut self,
        record_type: RecordType,
        node_id: NodeId,
        undo_record_pos: u64,
        fields: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut SliceWriter<'_>) -> Result<()>,
    {
        self.emit(record_type, node_id, undo_record_pos, fields, |_| Ok(0))
    }

    /// Assemble a NODE_ADDED record in the current shape
    ///
    /// # Errors
    ///
    /// Returns `OutputBufferOverflow` if the record does not fit
    pub fn emit_node_added(&mut self, node_id: NodeId, undo_record_pos: u64, node: &NodeAdded) -> Result<()> {
        self.emit_node_added_as(RecordType::NodeAdded, node_id, undo_record_pos, node)
    }

    /// Assemble a NODE_ADDED record in one of the historical shapes, for
    /// files meant to be read by older players
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if `shape` is not a node-added record type, or
    /// `OutputBufferOverflow` if the record does not fit
    pub fn emit_node_added_as(
        &mut self,
        shape: RecordType,
        node_id: NodeId,
        undo_record_pos: u64,
        node: &NodeAdded,
    ) -> Result<()> {
        if !shape.is_node_added() {
            return Err(OniError::BadParameter(format!(
                "{shape:?} is not a node-added record"
            )));
        }
        self.emit_fields(shape, node_id, undo_record_pos, |w| node.encode_fields(shape, w))
    }

    /// Assemble a property record typed after the property's value
    ///
    /// # Errors
    ///
    /// Returns `OutputBufferOverflow` if the record does not fit
    pub fn emit_property(&mut self, node_id: NodeId, undo_record_pos: u64, property: &Property) -> Result<()> {
        let record_type = property_record_type(&property.value);
        self.emit_fields(record_type, node_id, undo_record_pos, |w| encode_property(property, w))
    }

    /// Assemble a NODE_REMOVED record, undo-linked to the node's NODE_ADDED
    ///
    /// # Errors
    ///
    /// Returns `OutputBufferOverflow` if the record does not fit
    pub fn emit_node_removed(&mut self, node_id: NodeId, node_added_pos: u64) -> Result<()> {
        self.emit_fields(RecordType::NodeRemoved, node_id, node_added_pos, |_| Ok(()))
    }

    /// Assemble a NODE_STATE_READY record
    ///
    /// # Errors
    ///
    /// Returns `OutputBufferOverflow` if the record does not fit
    pub fn emit_node_state_ready(&mut self, node_id: NodeId) -> Result<()> {
        self.emit_fields(RecordType::NodeStateReady, node_id, 0, |_| Ok(()))
    }

    /// Assemble a NODE_DATA_BEGIN record
    ///
    /// # Errors
    ///
    /// Returns `OutputBufferOverflow` if the record does not fit
    pub fn emit_node_data_begin(&mut self, node_id: NodeId, frames: u32, max_timestamp: u64) -> Result<()> {
        self.emit_fields(RecordType::NodeDataBegin, node_id, 0, |w| {
            w.put_u32(frames)?;
            w.put_u64(max_timestamp)
        })
    }

    /// Assemble a NEW_DATA record whose payload is produced by `compress`
    ///
    /// `compress` receives the remaining scratch capacity and returns how
    /// many bytes it wrote.
    ///
    /// # Errors
    ///
    /// Returns `OutputBufferOverflow` if the record does not fit, or any
    /// error returned by `compress`
    pub fn emit_new_data<C>(
        &mut self,
        node_id: NodeId,
        undo_record_pos: u64,
        timestamp: u64,
        frame_id: u32,
        compress: C,
    ) -> Result<()>
    where
        C: FnOnce(&mut [u8]) -> Result<usize>,
    {
        self.emit(
            RecordType::NewData,
            node_id,
            undo_record_pos,
            |w| {
                w.put_u64(timestamp)?;
                w.put_u32(frame_id)
            },
            compress,
        )
    }

    /// Assemble a SEEK_TABLE record: a zeroed sentinel row followed by one
    /// row per frame
    ///
    /// # Errors
    ///
    /// Returns `OutputBufferOverflow` if the table does not fit
    pub fn emit_seek_table(&mut self, node_id: NodeId, entries: &[DataIndexEntry]) -> Result<()> {
        let legacy = self.legacy_32bit;
        self.emit(
            RecordType::SeekTable,
            node_id,
            0,
            |_| Ok(()),
            |out| {
                let mut w = SliceWriter::new(out);
                DataIndexEntry::default().encode_into(&mut w, legacy)?;
                for entry in entries {
                    entry.encode_into(&mut w, legacy)?;
                }
                Ok(w.position())
            },
        )
    }

    /// Assemble the END record
    ///
    /// # Errors
    ///
    /// Returns `OutputBufferOverflow` if the record does not fit
    pub fn emit_end(&mut self) -> Result<()> {
        self.emit_fields(RecordType::End, 0, 0, |_| Ok(()))
    }
}

fn to_u32(size: usize) -> Result<u32> {
    u32::try_from(size).map_err(|_| OniError::OutputBufferOverflow {
        needed: size,
        capacity: u32::MAX as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecId;
    use crate::storage::format::{NodeType, RECORD_HEADER_SIZE_32};
    use crate::storage::record::{decode_fields, RecordBody};

    #[test]
    fn test_new_data_layout() {
        let mut assembler = RecordAssembler::new(1024);
        assembler
            .emit_new_data(2, 500, 33_000, 2, |out| {
                out[..4].copy_from_slice(b"DATA");
                Ok(4)
            })
            .unwrap();

        let bytes = assembler.as_bytes();
        assert_eq!(bytes.len(), RECORD_HEADER_SIZE + 12 + 4);

        let header = RecordHeader::decode(bytes, false, 0).unwrap();
        assert_eq!(header.record_type, RecordType::NewData);
        assert_eq!(header.node_id, 2);
        assert_eq!(header.fields_size as usize, RECORD_HEADER_SIZE + 12);
        assert_eq!(header.payload_size, 4);
        assert_eq!(header.undo_record_pos, 500);

        let body = decode_fields(&header, &bytes[RECORD_HEADER_SIZE..40], 0).unwrap();
        assert_eq!(
            body,
            RecordBody::NewData {
                timestamp: 33_000,
                frame_id: 2
            }
        );
        assert_eq!(&bytes[40..], b"DATA");
    }

    #[test]
    fn test_overflow_leaves_assembler_empty() {
        let mut assembler = RecordAssembler::new(0);
        let capacity = assembler.capacity();
        assembler.emit_node_state_ready(1).unwrap();
        assert!(!assembler.as_bytes().is_empty());

        let err = assembler
            .emit_new_data(1, 0, 0, 1, |out| {
                let mut w = SliceWriter::new(out);
                w.put_bytes(&vec![0u8; capacity])?;
                Ok(w.position())
            })
            .unwrap_err();
        assert!(matches!(err, OniError::OutputBufferOverflow { .. }));
        assert!(assembler.header().is_none());

        let mut sink = Vec::new();
        assert_eq!(assembler.serialize(&mut sink).unwrap(), 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_seek_table_has_sentinel() {
        let mut assembler = RecordAssembler::new(1024);
        let entries = [
            DataIndexEntry {
                timestamp: 0,
                configuration_id: 1,
                seek_pos: 100,
            },
            DataIndexEntry {
                timestamp: 33_000,
                configuration_id: 1,
                seek_pos: 200,
            },
        ];
        assembler.emit_seek_table(4, &entries).unwrap();

        let bytes = assembler.as_bytes();
        let header = RecordHeader::decode(bytes, false, 0).unwrap();
        assert_eq!(header.fields_size as usize, RECORD_HEADER_SIZE);
        let table = DataIndexEntry::decode_table(&bytes[RECORD_HEADER_SIZE..], false, 0).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table[0], DataIndexEntry::default());
        assert_eq!(&table[1..], &entries);
    }

    #[test]
    fn test_legacy_assembler_writes_32bit_headers() {
        let mut assembler = RecordAssembler::for_version(1024, Version::new(1, 0, 0, 5));
        let node = NodeAdded {
            name: "Image".to_string(),
            node_type: NodeType::Image,
            codec: CodecId::NONE,
            frames: 0,
            min_timestamp: 0,
            max_timestamp: 0,
            seek_table_pos: 0,
        };
        assembler
            .emit_node_added_as(RecordType::NodeAdded1_0_0_5, 1, 0, &node)
            .unwrap();

        let header = RecordHeader::decode(assembler.as_bytes(), true, 0).unwrap();
        assert_eq!(header.record_type, RecordType::NodeAdded1_0_0_5);
        assert_eq!(header.fields_size as usize, RECORD_HEADER_SIZE_32 + 10 + 8 + 20);
    }

    #[test]
    fn test_rejects_non_node_added_shape() {
        let mut assembler = RecordAssembler::new(1024);
        let node = NodeAdded {
            name: String::new(),
            node_type: NodeType::Depth,
            codec: CodecId::NONE,
            frames: 0,
            min_timestamp: 0,
            max_timestamp: 0,
            seek_table_pos: 0,
        };
        assert!(assembler
            .emit_node_added_as(RecordType::End, 1, 0, &node)
            .is_err());
    }
}
