//! JPEG codec backed by the `image` crate

use std::io::Cursor;

use image::codecs::jpeg::{JpegDecoder, JpegEncoder};
use image::{ExtendedColorType, ImageDecoder};

use crate::{OniError, Result};

/// Quality used when none is configured
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// JPEG compressor/decompressor
///
/// Encoding needs the frame geometry; a decode-only instance can be built
/// with [`JpegCodec::decoder`]. The encode scratch buffer is allocated by
/// [`JpegCodec::init`] and reused for every frame.
#[derive(Debug, Clone)]
pub struct JpegCodec {
    rgb: bool,
    width: u32,
    height: u32,
    quality: u8,
    scratch: Option<Vec<u8>>,
}

impl JpegCodec {
    /// Create an encoder for `width` x `height` frames
    pub fn new(rgb: bool, width: u32, height: u32, quality: u8) -> Self {
        Self {
            rgb,
            width,
            height,
            quality,
            scratch: None,
        }
    }

    /// Create a decode-only instance
    pub fn decoder() -> Self {
        Self::new(true, 0, 0, DEFAULT_JPEG_QUALITY)
    }

    fn color_type(&self) -> ExtendedColorType {
        if self.rgb {
            ExtendedColorType::Rgb8
        } else {
            ExtendedColorType::L8
        }
    }

    fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * if self.rgb { 3 } else { 1 }
    }

    pub(super) fn init(&mut self) -> Result<()> {
        if !(1..=100).contains(&self.quality) {
            return Err(OniError::BadParameter(format!(
                "JPEG quality {} outside 1..=100",
                self.quality
            )));
        }
        self.scratch = Some(Vec::with_capacity(self.frame_size()));
        Ok(())
    }

    pub(super) fn compress(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        if self.width == 0 || self.height == 0 {
            return Err(OniError::BadParameter(
                "JPEG encoder needs a frame geometry".to_string(),
            ));
        }
        if input.len() != self.frame_size() {
            return Err(OniError::BadParameter(format!(
                "JPEG input is {} bytes, expected {} for {}x{}",
                input.len(),
                self.frame_size(),
                self.width,
                self.height
            )));
        }
        let color_type = self.color_type();
        let (width, height, quality) = (self.width, self.height, self.quality);
        let scratch = self
            .scratch
            .as_mut()
            .ok_or_else(|| OniError::BadParameter("JPEG codec used before init".to_string()))?;

        scratch.clear();
        JpegEncoder::new_with_quality(&mut *scratch, quality)
            .encode(input, width, height, color_type)
            .map_err(|e| OniError::Other(format!("JPEG encode failed: {e}")))?;

        if scratch.len() > output.len() {
            return Err(OniError::OutputBufferOverflow {
                needed: scratch.len(),
                capacity: output.len(),
            });
        }
        output[..scratch.len()].copy_from_slice(scratch);
        Ok(scratch.len())
    }

    pub(super) fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let decoder = JpegDecoder::new(Cursor::new(input))
            .map_err(|e| OniError::corrupt(0, format!("JPEG header: {e}")))?;
        let size = usize::try_from(decoder.total_bytes()).unwrap_or(usize::MAX);
        if size > output.len() {
            return Err(OniError::OutputBufferOverflow {
                needed: size,
                capacity: output.len(),
            });
        }
        decoder
            .read_image(&mut output[..size])
            .map_err(|e| OniError::corrupt(0, format!("JPEG data: {e}")))?;
        Ok(size)
    }
}
