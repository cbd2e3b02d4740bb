//! Codec construction for playback

use crate::{OniError, Result};

use super::{Codec, CodecId, JpegCodec};

/// Creates the codec that decodes a node's data
pub trait CodecFactory: Send {
    /// Build an initialised codec for `codec_id` on node `node_name`
    ///
    /// # Errors
    ///
    /// Returns error if the codec is unknown or fails to initialise
    fn create(&self, node_name: &str, codec_id: CodecId) -> Result<Codec>;
}

/// Factory for every codec this crate implements
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCodecFactory;

impl CodecFactory for DefaultCodecFactory {
    fn create(&self, node_name: &str, codec_id: CodecId) -> Result<Codec> {
        let mut codec = match codec_id {
            CodecId::NONE => Codec::Uncompressed,
            CodecId::DEPTH_16Z => Codec::Depth16z,
            // Decoding reads the table from the stream itself.
            CodecId::DEPTH_16Z_EMB_TABLES => Codec::Depth16zEmbTables {
                max_value: 0x1_0000,
            },
            CodecId::IMAGE_8Z => Codec::Image8z,
            CodecId::JPEG => Codec::Jpeg(JpegCodec::decoder()),
            other => {
                return Err(OniError::BadParameter(format!(
                    "node '{node_name}' uses unsupported codec {other}"
                )))
            }
        };
        codec.init()?;
        Ok(codec)
    }
}
