//! Binary storage format for recordings

mod assembler;
mod format;
mod input;
mod record;

pub use assembler::RecordAssembler;
pub use format::{
    ensure_supported_version, DataIndexEntry, FileHeader, NodeId, NodeType, RecordHeader,
    RecordType, Version, CURRENT_FILE_FORMAT_VERSION, DATA_INDEX_ENTRY_SIZE,
    DATA_INDEX_ENTRY_SIZE_32, FILE_HEADER_SIZE, FILE_MAGIC, FIRST_FILESIZE64BIT_FILE_FORMAT_VERSION,
    MAX_STRING_LENGTH, OLDEST_SUPPORTED_FILE_FORMAT_VERSION, RECORD_HEADER_SIZE,
    RECORD_HEADER_SIZE_32, RECORD_MAGIC,
};
pub use input::{FileInputStream, InputStream, MemoryInputStream, MmapInputStream};
pub use record::{decode_fields, NodeAdded, RecordBody};

use crate::Result;

/// Validate recording file magic and version
///
/// # Errors
///
/// Returns error if magic or version is invalid
pub fn validate_header(header: &FileHeader) -> Result<()> {
    if header.identity != FILE_MAGIC {
        return Err(crate::OniError::BadParameter(format!(
            "Invalid magic bytes: expected {:?}, got {:?}",
            FILE_MAGIC, header.identity
        )));
    }

    ensure_supported_version(header.version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_header() {
        validate_header(&FileHeader::default()).unwrap();

        let bad_magic = FileHeader {
            identity: *b"NI09",
            ..FileHeader::default()
        };
        assert!(validate_header(&bad_magic).is_err());

        let too_old = FileHeader {
            version: Version::new(1, 0, 0, 2),
            ..FileHeader::default()
        };
        assert!(matches!(
            validate_header(&too_old),
            Err(crate::OniError::UnsupportedFormatVersion { .. })
        ));
    }
}
