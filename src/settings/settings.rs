// Engine settings and persistence
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};

/// Envelope extraction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeSettings {
    pub hop_length: usize,
    pub smoothing_window: usize,
    /// Clip-added at onset frames, in normalized units. None disables onset detection.
    pub onset_boost: Option<f32>,
    /// Integer scale used when presenters want pixel-style openness (0..=scale)
    pub openness_scale: u16,
}

impl Default for EnvelopeSettings {
    fn default() -> Self {
        Self {
            hop_length: 512,
            smoothing_window: 5,
            onset_boost: Some(5.0 / 30.0),
            openness_scale: 30,
        }
    }
}

/// Decoding settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeSettings {
    /// None keeps the file's native rate
    pub target_sample_rate: Option<u32>,
}

/// Playback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    pub audio_enabled: bool,
    pub volume: f32,
    pub device_open_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub device_stall_timeout_ms: u64,
    pub dispatch_flush_timeout_ms: u64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            volume: 1.0,
            device_open_timeout_ms: 2000,
            stop_timeout_ms: 1000,
            device_stall_timeout_ms: 500,
            dispatch_flush_timeout_ms: 500,
        }
    }
}

impl PlaybackSettings {
    pub fn device_open_timeout(&self) -> Duration {
        Duration::from_millis(self.device_open_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn device_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.device_stall_timeout_ms)
    }

    pub fn dispatch_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_flush_timeout_ms)
    }
}

/// Main engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub version: i32, // Settings schema version for future migrations
    pub envelope: EnvelopeSettings,
    pub decode: DecodeSettings,
    pub playback: PlaybackSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: 1,
            envelope: EnvelopeSettings::default(),
            decode: DecodeSettings::default(),
            playback: PlaybackSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Get the settings file path
    pub fn get_settings_path(dir: &Path) -> PathBuf {
        dir.join("lipsync.json")
    }

    /// Load settings from file, or return defaults if file doesn't exist
    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::get_settings_path(dir);

        if !path.exists() {
            info!("No settings file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)?;

        let settings: EngineSettings = serde_json::from_str(&content)
            .map_err(|e| Error::Settings(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;

        info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Save settings to file
    pub fn save(&self, dir: &Path) -> Result<()> {
        // Ensure directory exists
        fs::create_dir_all(dir)?;

        let path = Self::get_settings_path(dir);
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Settings(format!("Failed to serialize settings: {}", e)))?;

        fs::write(&path, content)?;

        info!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.envelope.hop_length == 0 {
            return Err(Error::Settings("hop_length must be greater than zero".into()));
        }
        if !self.playback.volume.is_finite() {
            return Err(Error::Settings("volume must be a finite number".into()));
        }
        if let Some(boost) = self.envelope.onset_boost {
            if !boost.is_finite() || boost < 0.0 {
                return Err(Error::Settings("onset_boost must be a non-negative number".into()));
            }
        }
        if self.decode.target_sample_rate == Some(0) {
            return Err(Error::Settings("target_sample_rate must be greater than zero".into()));
        }
        Ok(())
    }
}
