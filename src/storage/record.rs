//! Typed record bodies and their field encodings

use crate::codec::CodecId;
use crate::cursor::{SliceReader, SliceWriter};
use crate::properties::{Property, PropertyValue};
use crate::{OniError, Result};

use super::format::{NodeType, RecordHeader, RecordType, MAX_STRING_LENGTH};

/// Fields of a NODE_ADDED record
///
/// The 1.0.0.4 shape carries only the name, type and codec; the frame
/// statistics read back as zero. The seek-table position only exists in
/// the current shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAdded {
    /// Node name
    pub name: String,
    /// Node type
    pub node_type: NodeType,
    /// Codec of the node's data
    pub codec: CodecId,
    /// Number of frames recorded for the node
    pub frames: u32,
    /// Timestamp of the first frame
    pub min_timestamp: u64,
    /// Timestamp of the last frame
    pub max_timestamp: u64,
    /// File offset of the node's SEEK_TABLE record, 0 if none
    pub seek_table_pos: u64,
}

/// Decoded record fields, one variant per record kind
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    /// Any of the node-added shapes
    NodeAdded(NodeAdded),
    /// Any of the typed property records
    Property(Property),
    /// Node removed
    NodeRemoved,
    /// Legacy data-begin marker
    NodeDataBegin {
        /// Frame count announced for the node
        frames: u32,
        /// Largest timestamp announced for the node
        max_timestamp: u64,
    },
    /// Node finished its initial state
    NodeStateReady,
    /// Data frame; the compressed frame is the payload
    NewData {
        /// Frame timestamp
        timestamp: u64,
        /// 1-based frame number
        frame_id: u32,
    },
    /// End of recording
    End,
    /// Seek table; the rows are the payload
    SeekTable,
}

pub(crate) fn put_string(w: &mut SliceWriter<'_>, value: &str) -> Result<()> {
    let mut end = value.len().min(MAX_STRING_LENGTH - 1);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let bytes = &value.as_bytes()[..end];
    w.put_u32(bytes.len() as u32 + 1)?;
    w.put_bytes(bytes)?;
    w.put_u8(0)
}

fn get_string(r: &mut SliceReader<'_>) -> Result<String> {
    let len = r.get_u32()? as usize;
    Ok(c_string(r.take(len)?))
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl NodeAdded {
    pub(crate) fn encode_fields(&self, shape: RecordType, w: &mut SliceWriter<'_>) -> Result<()> {
        put_string(w, &self.name)?;
        w.put_u32(self.node_type.as_u32())?;
        w.put_u32(self.codec.0)?;
        if shape == RecordType::NodeAdded1_0_0_4 {
            return Ok(());
        }
        w.put_u32(self.frames)?;
        w.put_u64(self.min_timestamp)?;
        w.put_u64(self.max_timestamp)?;
        if shape == RecordType::NodeAdded {
            w.put_u64(self.seek_table_pos)?;
        }
        Ok(())
    }

    fn decode_fields(shape: RecordType, r: &mut SliceReader<'_>) -> Result<Self> {
        let name = get_string(r)?;
        let node_type = NodeType::from(r.get_u32()?);
        let codec = CodecId(r.get_u32()?);
        let mut node = Self {
            name,
            node_type,
            codec,
            frames: 0,
            min_timestamp: 0,
            max_timestamp: 0,
            seek_table_pos: 0,
        };
        if shape != RecordType::NodeAdded1_0_0_4 {
            node.frames = r.get_u32()?;
            node.min_timestamp = r.get_u64()?;
            node.max_timestamp = r.get_u64()?;
        }
        if shape == RecordType::NodeAdded {
            node.seek_table_pos = r.get_u64()?;
        }
        Ok(node)
    }
}

/// Record type used to store `value`
pub(crate) fn property_record_type(value: &PropertyValue) -> RecordType {
    match value {
        PropertyValue::Int(_) => RecordType::IntProperty,
        PropertyValue::Real(_) => RecordType::RealProperty,
        PropertyValue::String(_) => RecordType::StringProperty,
        PropertyValue::General(_) => RecordType::GeneralProperty,
    }
}

pub(crate) fn encode_property(property: &Property, w: &mut SliceWriter<'_>) -> Result<()> {
    put_string(w, &property.name)?;
    match &property.value {
        PropertyValue::Int(v) => {
            w.put_u32(8)?;
            w.put_u64(*v)
        }
        PropertyValue::Real(v) => {
            w.put_u32(8)?;
            w.put_f64(*v)
        }
        PropertyValue::String(s) => {
            w.put_u32(s.len() as u32 + 1)?;
            w.put_bytes(s.as_bytes())?;
            w.put_u8(0)
        }
        PropertyValue::General(data) => {
            w.put_u32(data.len() as u32)?;
            w.put_bytes(data)
        }
    }
}

fn decode_property(kind: RecordType, r: &mut SliceReader<'_>, offset: u64) -> Result<Property> {
    let name = get_string(r)?;
    let size = r.get_u32()? as usize;
    let data = r.take(size)?;
    let fixed = |data: &[u8]| -> Result<[u8; 8]> {
        data.try_into().map_err(|_| {
            OniError::corrupt(offset, format!("property '{name}' has {} bytes, expected 8", data.len()))
        })
    };
    let value = match kind {
        RecordType::IntProperty => PropertyValue::Int(u64::from_le_bytes(fixed(data)?)),
        RecordType::RealProperty => PropertyValue::Real(f64::from_le_bytes(fixed(data)?)),
        RecordType::StringProperty => PropertyValue::String(c_string(data)),
        _ => PropertyValue::General(data.to_vec()),
    };
    Ok(Property { name, value })
}

/// Decode the fields following a record header
///
/// `fields` holds exactly `fields_size - header size` bytes; `offset` is the
/// record's file offset.
///
/// # Errors
///
/// Returns `CorruptOrTruncated` if the fields are shorter than the record
/// type requires
pub fn decode_fields(header: &RecordHeader, fields: &[u8], offset: u64) -> Result<RecordBody> {
    let mut r = SliceReader::new(fields, offset);
    Ok(match header.record_type {
        shape @ (RecordType::NodeAdded1_0_0_4
        | RecordType::NodeAdded1_0_0_5
        | RecordType::NodeAdded) => RecordBody::NodeAdded(NodeAdded::decode_fields(shape, &mut r)?),
        kind @ (RecordType::IntProperty
        | RecordType::RealProperty
        | RecordType::StringProperty
        | RecordType::GeneralProperty) => RecordBody::Property(decode_property(kind, &mut r, offset)?),
        RecordType::NodeRemoved => RecordBody::NodeRemoved,
        RecordType::NodeDataBegin => RecordBody::NodeDataBegin {
            frames: r.get_u32()?,
            max_timestamp: r.get_u64()?,
        },
        RecordType::NodeStateReady => RecordBody::NodeStateReady,
        RecordType::NewData => RecordBody::NewData {
            timestamp: r.get_u64()?,
            frame_id: r.get_u32()?,
        },
        RecordType::End => RecordBody::End,
        RecordType::SeekTable => RecordBody::SeekTable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::format::RECORD_HEADER_SIZE;

    fn header(record_type: RecordType, fields_len: usize) -> RecordHeader {
        RecordHeader {
            record_type,
            node_id: 1,
            fields_size: (RECORD_HEADER_SIZE + fields_len) as u32,
            payload_size: 0,
            undo_record_pos: 0,
        }
    }

    fn node() -> NodeAdded {
        NodeAdded {
            name: "Depth".to_string(),
            node_type: NodeType::Depth,
            codec: CodecId::DEPTH_16Z_EMB_TABLES,
            frames: 3,
            min_timestamp: 10,
            max_timestamp: 30,
            seek_table_pos: 4096,
        }
    }

    fn encode_node(shape: RecordType) -> Vec<u8> {
        let mut buf = vec![0u8; 128];
        let mut w = SliceWriter::new(&mut buf);
        node().encode_fields(shape, &mut w).unwrap();
        let n = w.position();
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_node_added_shapes() {
        let current = encode_node(RecordType::NodeAdded);
        let v5 = encode_node(RecordType::NodeAdded1_0_0_5);
        let v4 = encode_node(RecordType::NodeAdded1_0_0_4);
        // name: 4 + "Depth\0"
        assert_eq!(v4.len(), 10 + 8);
        assert_eq!(v5.len(), v4.len() + 20);
        assert_eq!(current.len(), v5.len() + 8);

        let decoded = decode_fields(&header(RecordType::NodeAdded, current.len()), &current, 0).unwrap();
        assert_eq!(decoded, RecordBody::NodeAdded(node()));

        let RecordBody::NodeAdded(old) =
            decode_fields(&header(RecordType::NodeAdded1_0_0_4, v4.len()), &v4, 0).unwrap()
        else {
            panic!("expected node added");
        };
        assert_eq!(old.name, "Depth");
        assert_eq!(old.codec, CodecId::DEPTH_16Z_EMB_TABLES);
        assert_eq!(old.frames, 0);
        assert_eq!(old.seek_table_pos, 0);

        let RecordBody::NodeAdded(mid) =
            decode_fields(&header(RecordType::NodeAdded1_0_0_5, v5.len()), &v5, 0).unwrap()
        else {
            panic!("expected node added");
        };
        assert_eq!(mid.frames, 3);
        assert_eq!(mid.seek_table_pos, 0);
    }

    #[test]
    fn test_long_names_truncated() {
        let long = "x".repeat(400);
        let mut buf = vec![0u8; 512];
        let mut w = SliceWriter::new(&mut buf);
        put_string(&mut w, &long).unwrap();
        assert_eq!(w.position(), 4 + MAX_STRING_LENGTH);
        assert_eq!(&buf[..4], &256u32.to_le_bytes());
    }

    #[test]
    fn test_property_layouts() {
        let cases = [
            Property::int("xnMirror", 1),
            Property::real("xnZPD", 120.5),
            Property::string("xnSerial", "A00123"),
            Property::general("xnCropping", vec![1, 2, 3]),
        ];
        for property in cases {
            let mut buf = vec![0u8; 128];
            let mut w = SliceWriter::new(&mut buf);
            encode_property(&property, &mut w).unwrap();
            let n = w.position();

            let kind = property_record_type(&property.value);
            let body = decode_fields(&header(kind, n), &buf[..n], 0).unwrap();
            assert_eq!(body, RecordBody::Property(property));
        }
    }

    #[test]
    fn test_int_property_with_wrong_size_is_corrupt() {
        let mut buf = vec![0u8; 64];
        let mut w = SliceWriter::new(&mut buf);
        put_string(&mut w, "xnMirror").unwrap();
        w.put_u32(4).unwrap();
        w.put_u32(1).unwrap();
        let n = w.position();

        let err = decode_fields(&header(RecordType::IntProperty, n), &buf[..n], 0).unwrap_err();
        assert!(matches!(err, OniError::CorruptOrTruncated { .. }));
    }

    #[test]
    fn test_truncated_new_data_fields() {
        let fields = 5u64.to_le_bytes();
        assert!(decode_fields(&header(RecordType::NewData, 8), &fields, 0).is_err());
    }
}
