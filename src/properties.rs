//! Stream properties and video modes shared by the recorder and the player

use crate::cursor::SliceReader;
use crate::{OniError, Result};

/// Names under which well-known stream properties are recorded
pub mod names {
    /// Resolution and frame rate, general property `{u32 x, u32 y, u32 fps}`
    pub const MAP_OUTPUT_MODE: &str = "xnMapOutputMode";
    /// Pixel format, integer property holding a [`super::PixelFormat`] code
    pub const PIXEL_FORMAT: &str = "oniPixelFormat";
    /// Bytes per pixel, integer property
    pub const BYTES_PER_PIXEL: &str = "xnBytesPerPixel";
    /// Largest depth value the device reports, integer property
    pub const DEVICE_MAX_DEPTH: &str = "xnDeviceMaxDepth";
    /// Mirroring flag, integer property
    pub const MIRROR: &str = "xnMirror";
    /// Cropping window, general property
    pub const CROPPING: &str = "xnCropping";
    /// Field of view, general property `{f64 horizontal, f64 vertical}`
    pub const FIELD_OF_VIEW: &str = "xnFOV";
}

/// Pixel layout of a stream's frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 16-bit depth in millimetres
    Depth1Mm,
    /// 16-bit depth in 100 micrometre units
    Depth100Um,
    /// Packed 9.2 disparity shift
    Shift9_2,
    /// Packed 9.3 disparity shift
    Shift9_3,
    /// 24-bit RGB
    Rgb888,
    /// YUV 4:2:2
    Yuv422,
    /// 8-bit grayscale
    Gray8,
    /// 16-bit grayscale
    Gray16,
    /// JPEG-compressed frames
    Jpeg,
    /// YUYV
    Yuyv,
}

impl PixelFormat {
    /// Numeric code recorded in the pixel-format property
    pub fn code(self) -> u64 {
        match self {
            Self::Depth1Mm => 100,
            Self::Depth100Um => 101,
            Self::Shift9_2 => 102,
            Self::Shift9_3 => 103,
            Self::Rgb888 => 200,
            Self::Yuv422 => 201,
            Self::Gray8 => 202,
            Self::Gray16 => 203,
            Self::Jpeg => 204,
            Self::Yuyv => 205,
        }
    }

    /// Bytes used by a single pixel
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Depth1Mm
            | Self::Depth100Um
            | Self::Shift9_2
            | Self::Shift9_3
            | Self::Gray16
            | Self::Yuv422
            | Self::Yuyv => 2,
            Self::Rgb888 => 3,
            Self::Gray8 | Self::Jpeg => 1,
        }
    }

    /// Whether frames hold 16-bit depth samples
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Self::Depth1Mm | Self::Depth100Um | Self::Shift9_2 | Self::Shift9_3
        )
    }
}

impl TryFrom<u64> for PixelFormat {
    type Error = OniError;

    fn try_from(code: u64) -> Result<Self> {
        Ok(match code {
            100 => Self::Depth1Mm,
            101 => Self::Depth100Um,
            102 => Self::Shift9_2,
            103 => Self::Shift9_3,
            200 => Self::Rgb888,
            201 => Self::Yuv422,
            202 => Self::Gray8,
            203 => Self::Gray16,
            204 => Self::Jpeg,
            205 => Self::Yuyv,
            other => {
                return Err(OniError::BadParameter(format!(
                    "unknown pixel format code {other}"
                )))
            }
        })
    }
}

/// Resolution, frame rate and pixel format of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoMode {
    /// Pixel format
    pub pixel_format: PixelFormat,
    /// Width in pixels
    pub x_resolution: u32,
    /// Height in pixels
    pub y_resolution: u32,
    /// Frames per second
    pub fps: u32,
}

impl VideoMode {
    /// Size in bytes of one uncompressed frame
    pub fn frame_size(&self) -> usize {
        self.x_resolution as usize * self.y_resolution as usize * self.pixel_format.bytes_per_pixel()
    }

    /// Encode the `{x, y, fps}` triple stored under [`names::MAP_OUTPUT_MODE`]
    pub fn map_output_mode_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; 12];
        out[..4].copy_from_slice(&self.x_resolution.to_le_bytes());
        out[4..8].copy_from_slice(&self.y_resolution.to_le_bytes());
        out[8..].copy_from_slice(&self.fps.to_le_bytes());
        out
    }

    /// Decode a `{x, y, fps}` triple, returning `(x, y, fps)`
    ///
    /// # Errors
    ///
    /// Returns error if `data` is shorter than 12 bytes
    pub fn parse_map_output_mode(data: &[u8]) -> Result<(u32, u32, u32)> {
        let mut r = SliceReader::new(data, 0);
        Ok((r.get_u32()?, r.get_u32()?, r.get_u32()?))
    }
}

/// Cropping window applied by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cropping {
    /// Whether cropping is active
    pub enabled: bool,
    /// Left edge
    pub origin_x: u16,
    /// Top edge
    pub origin_y: u16,
    /// Window width
    pub width: u16,
    /// Window height
    pub height: u16,
}

impl Cropping {
    fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        out.extend_from_slice(&u32::from(self.enabled).to_le_bytes());
        for field in [self.origin_x, self.origin_y, self.width, self.height] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out
    }
}

/// Value carried by a property record
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Integer property
    Int(u64),
    /// Floating-point property
    Real(f64),
    /// String property
    String(String),
    /// Opaque property bytes
    General(Vec<u8>),
}

/// A named property value as it appears in a recording
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    /// Property name, unique within a node
    pub name: String,
    /// Property value
    pub value: PropertyValue,
}

impl Property {
    /// Create an integer property
    pub fn int(name: impl Into<String>, value: u64) -> Self {
        Self {
            name: name.into(),
            value: PropertyValue::Int(value),
        }
    }

    /// Create a real property
    pub fn real(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: PropertyValue::Real(value),
        }
    }

    /// Create a string property
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: PropertyValue::String(value.into()),
        }
    }

    /// Create a general (opaque bytes) property
    pub fn general(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: PropertyValue::General(value.into()),
        }
    }
}

/// A change to a live stream's configuration that gets recorded
#[derive(Debug, Clone, PartialEq)]
pub enum StreamProperty {
    /// Resolution, fps or pixel format changed
    VideoMode(VideoMode),
    /// Mirroring toggled
    Mirroring(bool),
    /// Cropping window changed
    Cropping(Cropping),
    /// Largest depth value changed
    MaxValue(u64),
    /// Field of view in radians
    FieldOfView {
        /// Horizontal field of view
        horizontal: f64,
        /// Vertical field of view
        vertical: f64,
    },
    /// Any other property, recorded verbatim
    Custom(Property),
}

impl StreamProperty {
    /// Expand into the property records that represent this change
    pub fn to_properties(&self) -> Vec<Property> {
        match self {
            Self::VideoMode(mode) => vec![
                Property::general(names::MAP_OUTPUT_MODE, mode.map_output_mode_bytes()),
                Property::int(names::PIXEL_FORMAT, mode.pixel_format.code()),
                Property::int(
                    names::BYTES_PER_PIXEL,
                    mode.pixel_format.bytes_per_pixel() as u64,
                ),
            ],
            Self::Mirroring(on) => vec![Property::int(names::MIRROR, u64::from(*on))],
            Self::Cropping(cropping) => {
                vec![Property::general(names::CROPPING, cropping.to_bytes())]
            }
            Self::MaxValue(max) => vec![Property::int(names::DEVICE_MAX_DEPTH, *max)],
            Self::FieldOfView {
                horizontal,
                vertical,
            } => {
                let mut data = Vec::with_capacity(16);
                data.extend_from_slice(&horizontal.to_le_bytes());
                data.extend_from_slice(&vertical.to_le_bytes());
                vec![Property::general(names::FIELD_OF_VIEW, data)]
            }
            Self::Custom(property) => vec![property.clone()],
        }
    }
}
