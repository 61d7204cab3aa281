//! Barge-in detection using an adaptive RMS threshold and WebRTC VAD
//!
//! While a reply is playing, loud microphone input may mean the user is
//! talking over it. The loudness threshold adapts to the ambient noise level
//! measured from quiet frames, so a noisy room does not trigger constant
//! interruptions. Frames that pass the loudness gate must then be confirmed as
//! speech by WebRTC VAD, which keeps door slams and music from stopping a reply.

use crate::audio::{rms, samples};
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Configuration for barge-in detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub enabled: bool,

    /// Absolute RMS threshold, also the ceiling for the adaptive one (default: 500)
    pub threshold: f64,

    /// Lower bound for the adaptive threshold (default: 50)
    pub min_threshold: f64,

    /// Frames quieter than this count as ambient noise (default: 200)
    pub noise_ceiling: f64,

    /// Adaptive threshold = noise level × this factor (default: 3.0)
    pub noise_multiplier: f64,

    /// Noise samples kept for the moving average (default: 20)
    pub noise_window: usize,

    /// Consecutive loud frames required to fire (default: 1)
    pub consecutive_frames: u32,

    /// Confirm loud frames with WebRTC VAD (default: true)
    pub speech_check: bool,

    /// WebRTC VAD mode (0-3, where 3 is most aggressive)
    pub mode: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 500.0,
            min_threshold: 50.0,
            noise_ceiling: 200.0,
            noise_multiplier: 3.0,
            noise_window: 20,
            consecutive_frames: 1,
            speech_check: true,
            mode: 3,
        }
    }
}

/// Decides whether a frame of 16-bit samples contains speech
pub trait SpeechClassifier: Send + Sync {
    fn is_speech(&self, samples: &[i16]) -> bool;
}

/// Speech confirmation backed by WebRTC VAD
#[derive(Debug, Clone)]
pub struct WebRtcSpeech {
    sample_rate: u32,
    mode: u8,
}

impl WebRtcSpeech {
    pub fn new(sample_rate: u32, mode: u8) -> VoiceResult<Self> {
        if !matches!(sample_rate, 8000 | 16000 | 32000 | 48000) {
            return Err(VoiceError::Config(format!(
                "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                sample_rate
            )));
        }

        if mode > 3 {
            return Err(VoiceError::Config(format!("VAD mode must be 0-3, got {}", mode)));
        }

        Ok(Self { sample_rate, mode })
    }

    /// Largest 30/20/10 ms window that fits in `available` samples.
    fn chunk_len(&self, available: usize) -> Option<usize> {
        [30, 20, 10]
            .into_iter()
            .map(|ms| (self.sample_rate * ms / 1000) as usize)
            .find(|&len| len <= available)
    }

    fn detector(&self) -> Vad {
        let mode = match self.mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        };
        let rate = match self.sample_rate {
            8000 => SampleRate::Rate8kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            _ => SampleRate::Rate16kHz,
        };

        let mut vad = Vad::new();
        vad.set_mode(mode);
        vad.set_sample_rate(rate);
        vad
    }
}

impl SpeechClassifier for WebRtcSpeech {
    /// True when any full window of the frame is voiced.
    fn is_speech(&self, samples: &[i16]) -> bool {
        let Some(len) = self.chunk_len(samples.len()) else {
            debug!(samples = samples.len(), "Frame too short for speech check");
            return false;
        };

        // Vad wraps a raw handle and is not Send, so each frame gets its own.
        let mut vad = self.detector();
        samples.chunks_exact(len).any(|chunk| match vad.is_voice_segment(chunk) {
            Ok(voiced) => voiced,
            Err(()) => {
                debug!(len = chunk.len(), "VAD rejected frame length");
                false
            }
        })
    }
}

#[derive(Debug, Default)]
struct VadState {
    noise_samples: VecDeque<f64>,
    adaptive_threshold: Option<f64>,
    frame_counter: u32,
}

/// Adaptive voice-activity detector for interrupting playback
pub struct BargeInDetector {
    config: VadConfig,
    speech: Option<Arc<dyn SpeechClassifier>>,
    enabled: Mutex<bool>,
    state: Mutex<VadState>,
}

impl BargeInDetector {
    /// Create a new detector for input sampled at `sample_rate`
    pub fn new(config: VadConfig, sample_rate: u32) -> VoiceResult<Self> {
        if config.threshold <= 0.0 {
            return Err(VoiceError::Config(format!(
                "VAD threshold must be positive, got {}",
                config.threshold
            )));
        }

        if config.consecutive_frames == 0 {
            return Err(VoiceError::Config(
                "VAD consecutive_frames must be at least 1".to_string(),
            ));
        }

        if config.noise_window == 0 {
            return Err(VoiceError::Config(
                "VAD noise_window must be at least 1".to_string(),
            ));
        }

        let speech: Option<Arc<dyn SpeechClassifier>> = if config.speech_check {
            Some(Arc::new(WebRtcSpeech::new(sample_rate, config.mode)?))
        } else {
            None
        };

        info!(
            "🎙️ Barge-in detector ready (threshold: {}, frames: {}, speech check: {})",
            config.threshold, config.consecutive_frames, config.speech_check
        );

        let enabled = config.enabled;
        Ok(Self {
            config,
            speech,
            enabled: Mutex::new(enabled),
            state: Mutex::new(VadState::default()),
        })
    }

    /// Replace the speech confirmation step.
    pub fn with_classifier(mut self, speech: Arc<dyn SpeechClassifier>) -> Self {
        self.speech = Some(speech);
        self
    }

    /// Returns true when `pcm` looks like the user speaking over playback.
    pub fn check_barge_in(&self, pcm: &[u8], tts_playing: bool) -> bool {
        if pcm.len() < 2 {
            return false;
        }

        let enabled = *self.enabled.lock().unwrap_or_else(|p| p.into_inner());
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        if !enabled || !tts_playing {
            state.frame_counter = 0;
            return false;
        }

        let level = rms(pcm);

        if level < self.config.noise_ceiling {
            state.noise_samples.push_back(level);
            while state.noise_samples.len() > self.config.noise_window {
                state.noise_samples.pop_front();
            }
            let noise = state.noise_samples.iter().sum::<f64>() / state.noise_samples.len() as f64;
            let adaptive = (noise * self.config.noise_multiplier)
                .max(self.config.min_threshold)
                .min(self.config.threshold);
            state.adaptive_threshold = Some(adaptive);
        }

        let effective = state.adaptive_threshold.unwrap_or(self.config.threshold);

        if level <= effective {
            state.frame_counter = 0;
            return false;
        }

        if let Some(speech) = &self.speech {
            let frame: Vec<i16> = samples(pcm).collect();
            if !speech.is_speech(&frame) {
                debug!(rms = level, effective, "Loud input is not speech");
                state.frame_counter = 0;
                return false;
            }
        }

        state.frame_counter += 1;
        debug!(rms = level, effective, frames = state.frame_counter, "Speech above barge-in threshold");
        if state.frame_counter >= self.config.consecutive_frames {
            info!(rms = level, effective, "⚡ Barge-in detected");
            state.frame_counter = 0;
            return true;
        }

        false
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock().unwrap_or_else(|p| p.into_inner()) = enabled;
        if !enabled {
            self.state.lock().unwrap_or_else(|p| p.into_inner()).frame_counter = 0;
        }
    }

    /// Threshold currently in effect
    pub fn effective_threshold(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .adaptive_threshold
            .unwrap_or(self.config.threshold)
    }
}
