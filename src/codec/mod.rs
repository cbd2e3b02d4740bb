//! Frame payload codecs
//!
//! A [`Codec`] compresses one frame into a caller-supplied buffer and
//! decompresses it back. Compression is refused up front when the codec's
//! worst case cannot fit the output, and every encoder and decoder writes
//! through a bounded cursor, so no bytes land past the supplied capacity.

mod depth16z;
mod factory;
mod image8z;
mod jpeg;

use std::fmt;

pub use factory::{CodecFactory, DefaultCodecFactory};
pub use jpeg::{JpegCodec, DEFAULT_JPEG_QUALITY};

use crate::cursor::{SliceReader, SliceWriter};
use crate::properties::{PixelFormat, VideoMode};
use crate::{OniError, Result};

/// Four-character codec identifier as stored in NODE_ADDED records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodecId(pub u32);

impl CodecId {
    /// Uncompressed pass-through
    pub const NONE: Self = Self::from_fourcc(*b"NONE");
    /// 16-bit delta + RLE
    pub const DEPTH_16Z: Self = Self::from_fourcc(*b"16zP");
    /// 16-bit delta + RLE over an embedded value table
    pub const DEPTH_16Z_EMB_TABLES: Self = Self::from_fourcc(*b"16zT");
    /// 8-bit delta + RLE
    pub const IMAGE_8Z: Self = Self::from_fourcc(*b"Im8z");
    /// JPEG
    pub const JPEG: Self = Self::from_fourcc(*b"JPEG");

    /// Build an id from its four characters, first character in the low byte
    pub const fn from_fourcc(c: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(c))
    }

    /// The four characters of this id
    pub fn fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.fourcc() {
            if c.is_ascii_graphic() {
                write!(f, "{}", c as char)?;
            } else {
                write!(f, "\\x{c:02x}")?;
            }
        }
        Ok(())
    }
}

/// Pluggable frame compressor/decompressor
#[derive(Debug, Clone)]
pub enum Codec {
    /// Pass-through copy
    Uncompressed,
    /// 16-bit delta + RLE
    Depth16z,
    /// 16-bit delta + RLE over dense indices into an embedded table of the
    /// distinct sample values; samples must be below `max_value`
    Depth16zEmbTables {
        /// Exclusive upper bound of sample values
        max_value: u32,
    },
    /// 8-bit delta + RLE
    Image8z,
    /// JPEG through the `image` crate
    Jpeg(JpegCodec),
}

impl Codec {
    /// Pick the codec the recorder uses for a stream
    ///
    /// Depth goes through the table-based 16-bit codec sized for
    /// `max_depth`; 8-bit colour and grayscale use JPEG when lossy
    /// compression is allowed; everything else is stored uncompressed.
    pub fn for_stream(mode: &VideoMode, allow_lossy: bool, max_depth: u16, jpeg_quality: u8) -> Self {
        match mode.pixel_format {
            format if format.is_depth() => Self::Depth16zEmbTables {
                max_value: u32::from(max_depth) + 1,
            },
            PixelFormat::Rgb888 | PixelFormat::Gray8 if allow_lossy => Self::Jpeg(JpegCodec::new(
                mode.pixel_format == PixelFormat::Rgb888,
                mode.x_resolution,
                mode.y_resolution,
                jpeg_quality,
            )),
            _ => Self::Uncompressed,
        }
    }

    /// Identifier written to the recording
    pub fn id(&self) -> CodecId {
        match self {
            Self::Uncompressed => CodecId::NONE,
            Self::Depth16z => CodecId::DEPTH_16Z,
            Self::Depth16zEmbTables { .. } => CodecId::DEPTH_16Z_EMB_TABLES,
            Self::Image8z => CodecId::IMAGE_8Z,
            Self::Jpeg(_) => CodecId::JPEG,
        }
    }

    /// Worst-case output/input size ratio of [`Codec::compress`]
    pub fn worst_case_ratio(&self) -> f64 {
        match self {
            Self::Uncompressed => 1.0,
            Self::Depth16z | Self::Depth16zEmbTables { .. } | Self::Image8z => 1.5,
            Self::Jpeg(_) => 1.2,
        }
    }

    /// Fixed number of bytes [`Codec::compress`] may add on top of the ratio
    pub fn overhead_size(&self) -> usize {
        match self {
            Self::Uncompressed => 0,
            Self::Depth16z | Self::Image8z => 2,
            Self::Depth16zEmbTables { max_value } => 2 + 2 * *max_value as usize,
            Self::Jpeg(_) => 2048,
        }
    }

    /// Worst-case compressed size of `input_size` bytes
    pub fn max_compressed_size(&self, input_size: usize) -> usize {
        (input_size as f64 * self.worst_case_ratio()).ceil() as usize + self.overhead_size()
    }

    /// Prepare the codec for use
    ///
    /// # Errors
    ///
    /// Returns error if the codec parameters are invalid
    pub fn init(&mut self) -> Result<()> {
        match self {
            Self::Jpeg(jpeg) => jpeg.init(),
            Self::Depth16zEmbTables { max_value } if *max_value == 0 || *max_value > 0x1_0000 => {
                Err(OniError::BadParameter(format!(
                    "embedded table size {max_value} out of range"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Compress `input` into `output`, returning the compressed size
    ///
    /// # Errors
    ///
    /// Returns `OutputBufferOverflow` if the worst case cannot fit `output`,
    /// or `BadParameter` if the input does not suit the codec
    pub fn compress(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let needed = self.max_compressed_size(input.len());
        if needed > output.len() {
            return Err(OniError::OutputBufferOverflow {
                needed,
                capacity: output.len(),
            });
        }

        let mut w = SliceWriter::new(output);
        match self {
            Self::Uncompressed => w.put_bytes(input)?,
            Self::Depth16z => depth16z::compress(input, &mut w)?,
            Self::Depth16zEmbTables { max_value } => {
                depth16z::compress_with_table(input, *max_value, &mut w)?;
            }
            Self::Image8z => image8z::compress(input, &mut w)?,
            Self::Jpeg(jpeg) => return jpeg.compress(input, output),
        }
        Ok(w.position())
    }

    /// Decompress `input` into `output`, returning the decompressed size
    ///
    /// # Errors
    ///
    /// Returns `OutputBufferOverflow` if `output` is too small, or
    /// `CorruptOrTruncated` if `input` is malformed
    pub fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let mut r = SliceReader::new(input, 0);
        let mut w = SliceWriter::new(output);
        match self {
            Self::Uncompressed => w.put_bytes(input)?,
            Self::Depth16z => depth16z::decompress(&mut r, &mut w)?,
            Self::Depth16zEmbTables { .. } => depth16z::decompress_with_table(&mut r, &mut w)?,
            Self::Image8z => image8z::decompress(&mut r, &mut w)?,
            Self::Jpeg(jpeg) => return jpeg.decompress(input, output),
        }
        Ok(w.position())
    }
}

/// Run-length state shared by the nibble-packed delta codecs
///
/// Zero-delta pairs (`0x66`) are counted and emitted as `0xE0 + n`.
pub(crate) struct ZeroRun {
    count: u8,
}

impl ZeroRun {
    pub(crate) const PAIR: u8 = 0x66;
    const MAX: u8 = 15;

    pub(crate) fn new() -> Self {
        Self { count: 0 }
    }

    pub(crate) fn push(&mut self, w: &mut SliceWriter<'_>) -> Result<()> {
        self.count += 1;
        if self.count == Self::MAX {
            self.flush(w)?;
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self, w: &mut SliceWriter<'_>) -> Result<()> {
        if self.count > 0 {
            w.put_u8(0xE0 + self.count)?;
            self.count = 0;
        }
        Ok(())
    }
}
