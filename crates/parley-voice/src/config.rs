//! Layered configuration: built-in defaults, an optional TOML file, then
//! `PARLEY__SECTION__FIELD` environment overrides.

use crate::asr::AsrConfig;
use crate::audio::AudioFormat;
use crate::echo::EchoConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::llm::LlmConfig;
use crate::pool::PoolConfig;
use crate::reconnect::BackoffConfig;
use crate::transport::FlowControlConfig;
use crate::vad::VadConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Per-session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Message history cap; past it only the newest half is kept (default: 100)
    pub max_history: usize,
    /// How long owned tasks get to stop on close (default: 2000ms)
    pub shutdown_grace_ms: u64,
    /// Microphone format, used to size the echo window
    pub input_sample_rate: u32,
    pub input_channels: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_history: 100,
            shutdown_grace_ms: 2_000,
            input_sample_rate: 16_000,
            input_channels: 1,
        }
    }
}

impl SessionConfig {
    pub fn input_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.input_sample_rate,
            channels: self.input_channels,
            bit_depth: 16,
        }
    }
}

/// TTS playback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Codec frame duration (default: 60ms)
    pub frame_ms: u32,
    /// Noise frames sent after the last real frame (default: 5)
    pub padding_frames: usize,
    /// Wait after the last frame so the client can drain (default: 300ms)
    pub drain_delay_ms: u64,
    /// Appended to the reply text shown to the client
    pub reply_suffix: String,
    pub flow: FlowControlConfig,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            frame_ms: 60,
            padding_frames: 5,
            drain_delay_ms: 300,
            reply_suffix: String::new(),
            flow: FlowControlConfig::default(),
        }
    }
}

/// Filler-word filter settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// One word per line; built-in words are used when unset or missing
    pub dictionary_path: Option<PathBuf>,
}

/// Complete configuration of the voice core
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub session: SessionConfig,
    pub echo: EchoConfig,
    pub vad: VadConfig,
    pub asr: AsrConfig,
    pub reconnect: BackoffConfig,
    pub pool: PoolConfig,
    pub playback: PlaybackConfig,
    pub llm: LlmConfig,
    pub filter: FilterConfig,
}

impl VoiceConfig {
    /// Load from `PARLEY_CONFIG` (default `config/voice`) and the environment.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var("PARLEY_CONFIG").unwrap_or_else(|_| "config/voice".to_string());
        Self::load_from(&path)
    }

    /// Load from a TOML file (extension optional, file optional) plus environment overrides.
    pub fn load_from(path: &str) -> VoiceResult<Self> {
        let built = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("PARLEY").separator("__"))
            .build()?;

        let config: Self = built.try_deserialize()?;
        config.validate()?;
        info!(path, "⚙️ Voice configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> VoiceResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| VoiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.session.input_sample_rate == 0 || self.session.input_channels == 0 {
            return Err(VoiceError::Config(
                "input sample rate and channels must be positive".to_string(),
            ));
        }
        if self.session.max_history < 2 {
            return Err(VoiceError::Config(format!(
                "max_history must be at least 2, got {}",
                self.session.max_history
            )));
        }
        if self.playback.frame_ms == 0 {
            return Err(VoiceError::Config("frame_ms must be positive".to_string()));
        }
        if self.pool.max_concurrent == 0 {
            return Err(VoiceError::Config(
                "pool.max_concurrent must be positive".to_string(),
            ));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(VoiceError::Config(format!(
                "reconnect.multiplier must be >= 1.0, got {}",
                self.reconnect.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.echo.similarity_threshold) {
            return Err(VoiceError::Config(format!(
                "echo.similarity_threshold must be within [0, 1], got {}",
                self.echo.similarity_threshold
            )));
        }
        Ok(())
    }
}
