//! Configuration types for Onirec

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_JPEG_QUALITY;
use crate::recording::Priority;
use crate::{OniError, Result};

/// Largest raw frame the defaults are sized for: 1600x1200 RGB
const DEFAULT_MAX_FRAME_SIZE: usize = 1600 * 1200 * 3;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Recorder settings
    pub recorder: RecorderConfig,
    /// Playback settings
    pub playback: PlaybackConfig,
}

/// Recorder settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Largest raw frame the recorder accepts, in bytes
    pub max_frame_size: usize,
    /// Let colour streams be stored as JPEG
    pub allow_lossy_compression: bool,
    /// Queue priority of property changes
    pub property_priority: Priority,
    /// JPEG quality, 1 to 100
    pub jpeg_quality: u8,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            allow_lossy_compression: false,
            property_priority: Priority::Normal,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Playback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Playback speed; 1.0 is real time, 0.0 as fast as possible, -1.0 manual
    pub speed: f64,
    /// Restart from the first frame at end of file
    pub repeat: bool,
    /// Size of the buffer frames are decompressed into, in bytes
    pub decode_buffer_size: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            repeat: true,
            decode_buffer_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OniError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| OniError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        self.recorder.validate()?;
        self.playback.validate()
    }
}

impl RecorderConfig {
    /// Validate recorder settings
    ///
    /// # Errors
    ///
    /// Returns error if a setting is out of range
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(OniError::ConfigError(
                "recorder.max_frame_size must be > 0".to_string(),
            ));
        }

        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(OniError::ConfigError(format!(
                "recorder.jpeg_quality must be within 1..=100, got {}",
                self.jpeg_quality
            )));
        }

        Ok(())
    }
}

impl PlaybackConfig {
    /// Validate playback settings
    ///
    /// # Errors
    ///
    /// Returns error if a setting is out of range
    pub fn validate(&self) -> Result<()> {
        // Negative speeds other than manual mode have no meaning.
        if !self.speed.is_finite() || (self.speed < 0.0 && self.speed != -1.0) {
            return Err(OniError::ConfigError(format!(
                "playback.speed must be >= 0 or -1 (manual), got {}",
                self.speed
            )));
        }

        if self.decode_buffer_size == 0 {
            return Err(OniError::ConfigError(
                "playback.decode_buffer_size must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parse() {
        let config_toml = r#"
            [recorder]
            allow_lossy_compression = true
            property_priority = "high"

            [playback]
            speed = 2.0
            repeat = false
        "#;

        let config: Config = toml::from_str(config_toml).unwrap();
        assert!(config.recorder.allow_lossy_compression);
        assert_eq!(config.recorder.property_priority, Priority::High);
        assert_eq!(config.recorder.jpeg_quality, DEFAULT_JPEG_QUALITY);
        assert_eq!(config.playback.speed, 2.0);
        assert!(!config.playback.repeat);
        assert_eq!(config.playback.decode_buffer_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        let config_toml = r"
            [playback]
            speed = -1.0
        ";
        file.write_all(config_toml.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.playback.speed, -1.0);
    }

    #[test]
    fn test_invalid_speed() {
        let mut config = Config::default();
        config.playback.speed = -0.5;
        assert!(matches!(config.validate(), Err(OniError::ConfigError(_))));
    }

    #[test]
    fn test_invalid_jpeg_quality() {
        let mut config = Config::default();
        config.recorder.jpeg_quality = 0;
        assert!(config.validate().is_err());
    }
}
