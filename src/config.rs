use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CallError, Result};

/// Timings of the automated phone menu
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IvrTimings {
    pub ring_duration_ms: u64,
    pub language_timeout_ms: u64,
    pub menu_timeout_ms: u64,
    pub routing_delay_ms: u64,
    /// Re-prompts allowed after a silent timeout before the call is dropped
    pub no_input_retries: u32,
}

impl Default for IvrTimings {
    fn default() -> Self {
        Self {
            ring_duration_ms: 8000,
            language_timeout_ms: 7000,
            menu_timeout_ms: 10000,
            routing_delay_ms: 1000,
            no_input_retries: 0,
        }
    }
}

impl IvrTimings {
    pub fn ring_duration(&self) -> Duration {
        Duration::from_millis(self.ring_duration_ms)
    }

    pub fn language_timeout(&self) -> Duration {
        Duration::from_millis(self.language_timeout_ms)
    }

    pub fn menu_timeout(&self) -> Duration {
        Duration::from_millis(self.menu_timeout_ms)
    }

    pub fn routing_delay(&self) -> Duration {
        Duration::from_millis(self.routing_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Microphone capture rate sent to the voice service
    pub input_sample_rate: u32,
    /// Playback rate of the output context
    pub output_sample_rate: u32,
    /// Samples per outbound microphone block
    pub capture_block_size: usize,
    /// Output render quantum for the headless backend
    pub render_frame_ms: u32,
    pub master_volume: f32,
    pub ringback_volume: f32,
    pub hold_music_volume: f32,
    pub ambience_volume: f32,
    pub tone_volume: f32,
    pub ambience_on_start: bool,
    /// Microphone name, default device when unset
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    /// Directory of recorded prompt clips (`<clip name>.wav`)
    pub prompt_clip_dir: Option<PathBuf>,
    /// Longest recording kept per call
    pub max_recording_secs: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_sample_rate: crate::audio::INPUT_SAMPLE_RATE,
            output_sample_rate: crate::audio::OUTPUT_SAMPLE_RATE,
            capture_block_size: crate::audio::CAPTURE_BLOCK_SIZE,
            render_frame_ms: 20,
            master_volume: 1.0,
            ringback_volume: 0.35,
            hold_music_volume: 0.3,
            ambience_volume: 0.08,
            tone_volume: 0.4,
            ambience_on_start: false,
            input_device: None,
            output_device: None,
            prompt_clip_dir: None,
            max_recording_secs: 1800,
        }
    }
}

impl AudioSettings {
    pub fn render_frame_samples(&self) -> usize {
        (self.output_sample_rate as usize * self.render_frame_ms as usize) / 1000
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerSettings {
    pub bars: usize,
    pub fft_size: usize,
    pub interval_ms: u64,
    pub smoothing: f32,
    pub min_db: f32,
    pub max_db: f32,
}

impl Default for VisualizerSettings {
    fn default() -> Self {
        Self {
            bars: 32,
            fft_size: 1024,
            interval_ms: 50,
            smoothing: 0.8,
            min_db: -100.0,
            max_db: -30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceServiceConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is not set
    pub api_key_env: String,
    pub handshake_timeout_ms: u64,
}

impl Default for VoiceServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            api_key: None,
            api_key_env: "GEMINI_API_KEY".to_string(),
            handshake_timeout_ms: 10000,
        }
    }
}

impl VoiceServiceConfig {
    /// Explicit key first, then the configured environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                std::env::var(&self.api_key_env)
                    .ok()
                    .filter(|k| !k.trim().is_empty())
            })
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ivr: IvrTimings,
    pub audio: AudioSettings,
    pub visualizer: VisualizerSettings,
    pub voice: VoiceServiceConfig,
}

/// Path to the config file
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("voicedesk")
        .join("config.json")
}

impl CallConfig {
    /// Load from the default location, falling back to defaults on any problem
    pub fn load() -> Self {
        match Self::load_from(&config_path()) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Using default call config: {}", e);
                Self::default()
            }
        }
    }

    /// Load from a file; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content =
                fs::read_to_string(path).map_err(|e| CallError::Config(e.to_string()))?;
            serde_json::from_str::<CallConfig>(&content)
                .map_err(|e| CallError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| CallError::Config(e.to_string()))?;
        }
        let content =
            serde_json::to_string_pretty(self).map_err(|e| CallError::Config(e.to_string()))?;
        fs::write(path, content).map_err(|e| CallError::Config(e.to_string()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(CallError::Config("sample rates must be non-zero".into()));
        }
        if self.audio.capture_block_size == 0 {
            return Err(CallError::Config("capture_block_size must be non-zero".into()));
        }
        if self.audio.max_recording_secs == 0 {
            return Err(CallError::Config("max_recording_secs must be non-zero".into()));
        }
        if self.audio.render_frame_samples() == 0 {
            return Err(CallError::Config("render_frame_ms is too small".into()));
        }
        if !self.visualizer.fft_size.is_power_of_two() || self.visualizer.fft_size < 32 {
            return Err(CallError::Config(format!(
                "fft_size must be a power of two >= 32, got {}",
                self.visualizer.fft_size
            )));
        }
        if self.visualizer.bars == 0 || self.visualizer.bars > self.visualizer.fft_size / 2 {
            return Err(CallError::Config("bars must be between 1 and fft_size / 2".into()));
        }
        if self.visualizer.max_db <= self.visualizer.min_db {
            return Err(CallError::Config("max_db must exceed min_db".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("voicedesk-config-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn test_defaults_match_call_timings() {
        let config = CallConfig::default();
        assert_eq!(config.ivr.ring_duration_ms, 8000);
        assert_eq!(config.ivr.language_timeout_ms, 7000);
        assert_eq!(config.ivr.menu_timeout_ms, 10000);
        assert_eq!(config.ivr.routing_delay_ms, 1000);
        assert_eq!(config.audio.input_sample_rate, 16000);
        assert_eq!(config.audio.output_sample_rate, 24000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = CallConfig::load_from(&temp_path("absent.json")).unwrap();
        assert_eq!(config, CallConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let path = temp_path("config.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"ivr": {"ring_duration_ms": 3000}}"#).unwrap();

        let config = CallConfig::load_from(&path).unwrap();
        assert_eq!(config.ivr.ring_duration_ms, 3000);
        assert_eq!(config.ivr.menu_timeout_ms, 10000);
        assert_eq!(config.visualizer.bars, 32);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let path = temp_path("config.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            CallConfig::load_from(&path),
            Err(CallError::Config(_))
        ));
    }

    #[test]
    fn test_save_never_writes_api_key() {
        let path = temp_path("config.json");
        let mut config = CallConfig::default();
        config.voice.api_key = Some("secret-key".into());
        config.save_to(&path).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(!written.contains("secret-key"));
        let reloaded = CallConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.voice.api_key, None);
    }

    #[test]
    fn test_validate_rejects_bad_fft_size() {
        let mut config = CallConfig::default();
        config.visualizer.fft_size = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let voice = VoiceServiceConfig {
            api_key: Some("abc".into()),
            api_key_env: "VOICEDESK_TEST_UNSET_KEY".into(),
            ..Default::default()
        };
        assert_eq!(voice.resolve_api_key().as_deref(), Some("abc"));

        let blank = VoiceServiceConfig {
            api_key: Some("  ".into()),
            api_key_env: "VOICEDESK_TEST_UNSET_KEY".into(),
            ..Default::default()
        };
        assert_eq!(blank.resolve_api_key(), None);
    }
}
