//! Binary format structures
//!
//! Every structure is packed and little-endian on disk. Encoding and
//! decoding go through explicit byte-slice functions rather than memory
//! reinterpretation.

use std::fmt;

use crate::cursor::{SliceReader, SliceWriter};
use crate::{OniError, Result};

/// Numeric node identifier within a recording
pub type NodeId = u32;

/// File identity bytes: "NI10"
pub const FILE_MAGIC: [u8; 4] = *b"NI10";

/// Record magic: "NIR\0"
pub const RECORD_MAGIC: u32 = 0x0052_494E;

/// Size of the file header on disk
pub const FILE_HEADER_SIZE: usize = 24;

/// Size of a record header on disk
pub const RECORD_HEADER_SIZE: usize = 28;

/// Size of a record header in files with 32-bit file offsets
pub const RECORD_HEADER_SIZE_32: usize = 24;

/// Size of one seek-table row on disk
pub const DATA_INDEX_ENTRY_SIZE: usize = 20;

/// Size of one seek-table row in files with 32-bit file offsets
pub const DATA_INDEX_ENTRY_SIZE_32: usize = 16;

/// Maximum length of a recorded string, including the terminating NUL
pub const MAX_STRING_LENGTH: usize = 256;

/// Oldest file format this crate can play back
pub const OLDEST_SUPPORTED_FILE_FORMAT_VERSION: Version = Version::new(1, 0, 0, 4);

/// First file format using 64-bit file offsets
pub const FIRST_FILESIZE64BIT_FILE_FORMAT_VERSION: Version = Version::new(1, 0, 1, 0);

/// Format version written by the recorder
pub const CURRENT_FILE_FORMAT_VERSION: Version = FIRST_FILESIZE64BIT_FILE_FORMAT_VERSION;

static_assertions::const_assert_eq!(Version::SIZE, 8);
static_assertions::const_assert_eq!(FILE_HEADER_SIZE, FILE_MAGIC.len() + Version::SIZE + 8 + 4);
static_assertions::const_assert_eq!(RECORD_HEADER_SIZE, 5 * 4 + 8);
static_assertions::const_assert_eq!(RECORD_HEADER_SIZE_32, 6 * 4);
static_assertions::const_assert_eq!(DATA_INDEX_ENTRY_SIZE, 8 + 4 + 8);
static_assertions::const_assert_eq!(DATA_INDEX_ENTRY_SIZE_32, 8 + 4 + 4);

/// File format version, ordered field by field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
    /// Maintenance version
    pub maintenance: u16,
    /// Build number
    pub build: u32,
}

impl Version {
    /// Encoded size in bytes
    pub const SIZE: usize = 8;

    /// Create a version
    pub const fn new(major: u8, minor: u8, maintenance: u16, build: u32) -> Self {
        Self {
            major,
            minor,
            maintenance,
            build,
        }
    }

    /// Whether records in this version use 32-bit file offsets
    pub fn uses_32bit_offsets(self) -> bool {
        self < FIRST_FILESIZE64BIT_FILE_FORMAT_VERSION
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.maintenance, self.build
        )
    }
}

/// Fail with `UnsupportedFormatVersion` below the oldest playable format
///
/// # Errors
///
/// Returns error if `version` is too old
pub fn ensure_supported_version(version: Version) -> Result<()> {
    if version < OLDEST_SUPPORTED_FILE_FORMAT_VERSION {
        return Err(OniError::UnsupportedFormatVersion {
            found: version,
            oldest: OLDEST_SUPPORTED_FILE_FORMAT_VERSION,
        });
    }
    Ok(())
}

fn narrow_offset(offset: u64) -> Result<u32> {
    u32::try_from(offset).map_err(|_| {
        OniError::BadParameter(format!("offset {offset} does not fit a 32-bit file"))
    })
}

/// File header, written at offset 0 and patched when recording ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Identity bytes, always [`FILE_MAGIC`] in valid files
    pub identity: [u8; 4],
    /// Format version
    pub version: Version,
    /// Largest frame timestamp in the file
    pub max_timestamp: u64,
    /// Largest node id in the file
    pub max_node_id: NodeId,
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            identity: FILE_MAGIC,
            version: CURRENT_FILE_FORMAT_VERSION,
            max_timestamp: 0,
            max_node_id: 0,
        }
    }
}

impl FileHeader {
    /// Serialize to the on-disk representation
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut out = [0u8; FILE_HEADER_SIZE];
        out[..4].copy_from_slice(&self.identity);
        out[4] = self.version.major;
        out[5] = self.version.minor;
        out[6..8].copy_from_slice(&self.version.maintenance.to_le_bytes());
        out[8..12].copy_from_slice(&self.version.build.to_le_bytes());
        out[12..20].copy_from_slice(&self.max_timestamp.to_le_bytes());
        out[20..24].copy_from_slice(&self.max_node_id.to_le_bytes());
        out
    }

    /// Parse from the first [`FILE_HEADER_SIZE`] bytes of `buf`
    ///
    /// # Errors
    ///
    /// Returns error if `buf` is too short
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = SliceReader::new(buf, 0);
        let mut identity = [0u8; 4];
        identity.copy_from_slice(r.take(4)?);
        let version = Version {
            major: r.get_u8()?,
            minor: r.get_u8()?,
            maintenance: r.get_u16()?,
            build: r.get_u32()?,
        };
        Ok(Self {
            identity,
            version,
            max_timestamp: r.get_u64()?,
            max_node_id: r.get_u32()?,
        })
    }
}

/// Record type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RecordType {
    /// Node added, 1.0.0.4 shape
    NodeAdded1_0_0_4 = 0x02,
    /// Integer property changed
    IntProperty = 0x03,
    /// Real property changed
    RealProperty = 0x04,
    /// String property changed
    StringProperty = 0x05,
    /// Opaque property changed
    GeneralProperty = 0x06,
    /// Node removed
    NodeRemoved = 0x07,
    /// Start of a node's data (legacy)
    NodeDataBegin = 0x08,
    /// Node finished announcing its initial state
    NodeStateReady = 0x09,
    /// Compressed data frame
    NewData = 0x0A,
    /// End of recording
    End = 0x0B,
    /// Node added, 1.0.0.5 shape
    NodeAdded1_0_0_5 = 0x0C,
    /// Node added, current shape
    NodeAdded = 0x0D,
    /// Per-node seek table
    SeekTable = 0x0E,
}

impl RecordType {
    /// Whether this is any of the node-added shapes
    pub fn is_node_added(self) -> bool {
        matches!(
            self,
            Self::NodeAdded1_0_0_4 | Self::NodeAdded1_0_0_5 | Self::NodeAdded
        )
    }

    /// Whether this is any of the property records
    pub fn is_property(self) -> bool {
        matches!(
            self,
            Self::IntProperty | Self::RealProperty | Self::StringProperty | Self::GeneralProperty
        )
    }
}

impl TryFrom<u32> for RecordType {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, u32> {
        Ok(match value {
            0x02 => Self::NodeAdded1_0_0_4,
            0x03 => Self::IntProperty,
            0x04 => Self::RealProperty,
            0x05 => Self::StringProperty,
            0x06 => Self::GeneralProperty,
            0x07 => Self::NodeRemoved,
            0x08 => Self::NodeDataBegin,
            0x09 => Self::NodeStateReady,
            0x0A => Self::NewData,
            0x0B => Self::End,
            0x0C => Self::NodeAdded1_0_0_5,
            0x0D => Self::NodeAdded,
            0x0E => Self::SeekTable,
            other => return Err(other),
        })
    }
}

/// Kind of recorded node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// The device itself
    Device,
    /// Depth map generator
    Depth,
    /// Colour image generator
    Image,
    /// Audio generator
    Audio,
    /// Infra-red image generator
    Ir,
    /// Any other node type, preserved as-is
    Other(u32),
}

impl NodeType {
    /// On-disk numeric value
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Device => 1,
            Self::Depth => 2,
            Self::Image => 3,
            Self::Audio => 4,
            Self::Ir => 5,
            Self::Other(v) => v,
        }
    }

    /// Whether nodes of this type produce data frames
    pub fn is_generator(self) -> bool {
        matches!(self, Self::Depth | Self::Image | Self::Audio | Self::Ir)
    }

    /// Default node name for this type
    pub fn name(self) -> &'static str {
        match self {
            Self::Device => "Device",
            Self::Depth => "Depth",
            Self::Image => "Image",
            Self::Audio => "Audio",
            Self::Ir => "IR",
            Self::Other(_) => "Node",
        }
    }
}

impl From<u32> for NodeType {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Device,
            2 => Self::Depth,
            3 => Self::Image,
            4 => Self::Audio,
            5 => Self::Ir,
            other => Self::Other(other),
        }
    }
}

/// Common record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Record type
    pub record_type: RecordType,
    /// Node the record belongs to (0 for END)
    pub node_id: NodeId,
    /// Size of header plus fields
    pub fields_size: u32,
    /// Size of the opaque payload following the fields
    pub payload_size: u32,
    /// Offset of the previous record setting the same value, 0 if none
    pub undo_record_pos: u64,
}

impl RecordHeader {
    /// Header size for the given offset width
    pub fn size(legacy_32bit: bool) -> usize {
        if legacy_32bit {
            RECORD_HEADER_SIZE_32
        } else {
            RECORD_HEADER_SIZE
        }
    }

    /// Total size of the record on disk
    pub fn record_size(&self) -> u64 {
        u64::from(self.fields_size) + u64::from(self.payload_size)
    }

    pub(crate) fn encode_into(&self, w: &mut SliceWriter<'_>, legacy_32bit: bool) -> Result<()> {
        w.put_u32(RECORD_MAGIC)?;
        w.put_u32(self.record_type as u32)?;
        w.put_u32(self.node_id)?;
        w.put_u32(self.fields_size)?;
        w.put_u32(self.payload_size)?;
        if legacy_32bit {
            w.put_u32(narrow_offset(self.undo_record_pos)?)
        } else {
            w.put_u64(self.undo_record_pos)
        }
    }

    /// Parse a header located at file offset `offset`
    ///
    /// # Errors
    ///
    /// Returns `CorruptOrTruncated` on short input, bad magic, an unknown
    /// record type, or a `fields_size` smaller than the header itself
    pub fn decode(buf: &[u8], legacy_32bit: bool, offset: u64) -> Result<Self> {
        let mut r = SliceReader::new(buf, offset);
        let magic = r.get_u32()?;
        if magic != RECORD_MAGIC {
            return Err(OniError::corrupt(
                offset,
                format!("bad record magic {magic:#010x}"),
            ));
        }
        let raw_type = r.get_u32()?;
        let record_type = RecordType::try_from(raw_type)
            .map_err(|t| OniError::corrupt(offset, format!("unknown record type {t:#x}")))?;
        let node_id = r.get_u32()?;
        let fields_size = r.get_u32()?;
        let payload_size = r.get_u32()?;
        let undo_record_pos = if legacy_32bit {
            u64::from(r.get_u32()?)
        } else {
            r.get_u64()?
        };

        if (fields_size as usize) < Self::size(legacy_32bit) {
            return Err(OniError::corrupt(
                offset,
                format!("fields size {fields_size} smaller than header"),
            ));
        }

        Ok(Self {
            record_type,
            node_id,
            fields_size,
            payload_size,
            undo_record_pos,
        })
    }
}

/// One seek-table row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataIndexEntry {
    /// Frame timestamp
    pub timestamp: u64,
    /// Property configuration in effect when the frame was written
    pub configuration_id: u32,
    /// File offset of the frame's NEW_DATA record
    pub seek_pos: u64,
}

impl DataIndexEntry {
    pub(crate) fn encode_into(&self, w: &mut SliceWriter<'_>, legacy_32bit: bool) -> Result<()> {
        w.put_u64(self.timestamp)?;
        w.put_u32(self.configuration_id)?;
        if legacy_32bit {
            w.put_u32(narrow_offset(self.seek_pos)?)
        } else {
            w.put_u64(self.seek_pos)
        }
    }

    /// Encoded size for the given offset width
    pub fn size(legacy_32bit: bool) -> usize {
        if legacy_32bit {
            DATA_INDEX_ENTRY_SIZE_32
        } else {
            DATA_INDEX_ENTRY_SIZE
        }
    }

    /// Decode a packed table, upgrading 32-bit rows when `legacy_32bit` is set
    ///
    /// # Errors
    ///
    /// Returns `CorruptOrTruncated` if `buf` is not a whole number of rows
    pub fn decode_table(buf: &[u8], legacy_32bit: bool, offset: u64) -> Result<Vec<Self>> {
        let entry_size = Self::size(legacy_32bit);
        if buf.len() % entry_size != 0 {
            return Err(OniError::corrupt(
                offset,
                format!("seek table size {} not a multiple of {entry_size}", buf.len()),
            ));
        }

        let mut r = SliceReader::new(buf, offset);
        let mut entries = Vec::with_capacity(buf.len() / entry_size);
        while !r.is_empty() {
            let timestamp = r.get_u64()?;
            let configuration_id = r.get_u32()?;
            let seek_pos = if legacy_32bit {
                u64::from(r.get_u32()?)
            } else {
                r.get_u64()?
            };
            entries.push(Self {
                timestamp,
                configuration_id,
                seek_pos,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_header_layout() {
        let header = FileHeader {
            max_timestamp: 0x1122_3344_5566_7788,
            max_node_id: 7,
            ..FileHeader::default()
        };
        let bytes = header.encode();

        assert_eq!(&bytes[..4], b"NI10");
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], 0);
        assert_eq!(&bytes[6..8], &1u16.to_le_bytes());
        assert_eq!(&bytes[8..12], &0u32.to_le_bytes());
        assert_eq!(&bytes[12..20], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[20..24], &7u32.to_le_bytes());
        assert_eq!(FileHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_version_ordering() {
        assert!(Version::new(1, 0, 0, 4) < Version::new(1, 0, 0, 5));
        assert!(Version::new(1, 0, 0, 99) < Version::new(1, 0, 1, 0));
        assert!(Version::new(1, 0, 0, 5).uses_32bit_offsets());
        assert!(!CURRENT_FILE_FORMAT_VERSION.uses_32bit_offsets());
        assert_eq!(Version::new(1, 0, 1, 0).to_string(), "1.0.1.0");
    }

    #[test]
    fn test_too_old_version_rejected() {
        let err = ensure_supported_version(Version::new(1, 0, 0, 3)).unwrap_err();
        assert!(matches!(err, OniError::UnsupportedFormatVersion { .. }));
        ensure_supported_version(OLDEST_SUPPORTED_FILE_FORMAT_VERSION).unwrap();
    }

    #[test]
    fn test_legacy_record_header() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf.extend_from_slice(&(RecordType::NewData as u32).to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&36u32.to_le_bytes());
        buf.extend_from_slice(&100u32.to_le_bytes());
        buf.extend_from_slice(&0x1234u32.to_le_bytes());

        let header = RecordHeader::decode(&buf, true, 0).unwrap();
        assert_eq!(header.record_type, RecordType::NewData);
        assert_eq!(header.node_id, 3);
        assert_eq!(header.undo_record_pos, 0x1234);
        assert_eq!(header.record_size(), 136);
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let buf = [0u8; RECORD_HEADER_SIZE];
        let err = RecordHeader::decode(&buf, false, 42).unwrap_err();
        assert!(matches!(err, OniError::CorruptOrTruncated { offset: 42, .. }));
    }

    #[test]
    fn test_unknown_record_type_is_corrupt() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf.extend_from_slice(&0x55u32.to_le_bytes());
        buf.resize(RECORD_HEADER_SIZE, 0);
        assert!(RecordHeader::decode(&buf, false, 0).is_err());
    }

    #[test]
    fn test_legacy_seek_table_upgrade() {
        let mut buf = Vec::new();
        for (ts, pos) in [(0u64, 0u32), (33_000, 0x40), (66_000, 0x80)] {
            buf.extend_from_slice(&ts.to_le_bytes());
            buf.extend_from_slice(&5u32.to_le_bytes());
            buf.extend_from_slice(&pos.to_le_bytes());
        }

        let table = DataIndexEntry::decode_table(&buf, true, 0).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table[2],
            DataIndexEntry {
                timestamp: 66_000,
                configuration_id: 5,
                seek_pos: 0x80
            }
        );
        assert!(DataIndexEntry::decode_table(&buf[..20], true, 0).is_err());
    }

    #[test]
    fn test_node_type_mapping() {
        assert_eq!(NodeType::from(2), NodeType::Depth);
        assert_eq!(NodeType::from(77), NodeType::Other(77));
        assert_eq!(NodeType::Ir.as_u32(), 5);
        assert!(NodeType::Image.is_generator());
        assert!(!NodeType::Device.is_generator());
    }
}
