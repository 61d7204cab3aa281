//! TTS self-echo suppression
//!
//! Keeps a short ring of recently sent TTS frames and drops microphone input
//! that looks like one of them arriving back after a plausible acoustic delay.
//! The match is a cheap energy and amplitude heuristic. Letting an occasional
//! echo through is acceptable; dropping real speech is not, so the windows are
//! kept loose.

use crate::audio::{mean_square_energy, samples, AudioFormat};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Configuration for echo suppression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    pub enabled: bool,

    /// Audio duration kept in the ring (default: 2000ms)
    pub window_ms: u64,

    /// Hard cap on buffered frames (default: 100)
    pub max_frames: usize,

    /// Input below this mean-square energy is dropped as silence
    pub energy_floor: f64,

    /// How many of the newest frames are compared (default: 10)
    pub check_frames: usize,

    /// Plausible echo delay range
    pub min_echo_delay_ms: u64,
    pub max_echo_delay_ms: u64,

    /// Amplitude similarity above which input counts as echo
    pub similarity_threshold: f64,

    /// Sample pairs compared per frame (default: 100)
    pub compare_samples: usize,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 2000,
            max_frames: 100,
            energy_floor: 1000.0,
            check_frames: 10,
            min_echo_delay_ms: 200,
            max_echo_delay_ms: 2000,
            similarity_threshold: 0.7,
            compare_samples: 100,
        }
    }
}

/// One sent chunk of synthesized audio
#[derive(Debug, Clone)]
pub struct TtsFrame {
    pub data: Vec<u8>,
    pub sent_at: Instant,
    pub energy: f64,
}

struct EchoState {
    frames: VecDeque<TtsFrame>,
    enabled: bool,
}

/// Per-session echo filter
pub struct EchoSuppressor {
    config: EchoConfig,
    window_samples: usize,
    format: AudioFormat,
    state: Mutex<EchoState>,
}

impl EchoSuppressor {
    pub fn new(config: EchoConfig, format: AudioFormat) -> Self {
        let window_samples = format.samples_for(config.window_ms);
        let enabled = config.enabled;
        Self {
            config,
            window_samples,
            format,
            state: Mutex::new(EchoState {
                frames: VecDeque::with_capacity(100),
                enabled,
            }),
        }
    }

    /// Remember a frame that is about to be sent to the client.
    pub fn record_tts_output(&self, pcm: &[u8]) {
        if pcm.is_empty() {
            return;
        }

        let frame = TtsFrame {
            data: pcm.to_vec(),
            sent_at: Instant::now(),
            energy: mean_square_energy(pcm),
        };

        let mut state = self.lock();
        state.frames.push_back(frame);

        let mut total = 0usize;
        let mut keep = 0usize;
        for frame in state.frames.iter().rev() {
            total += frame.data.len() / 2;
            if total > self.window_samples {
                break;
            }
            keep += 1;
        }
        let keep = keep.max(1).min(self.config.max_frames);
        while state.frames.len() > keep {
            state.frames.pop_front();
        }
    }

    /// Decide whether captured input should reach the recognizer.
    ///
    /// Returns the data to forward and `true`, or `None` and `false` when the
    /// input is silence or echo.
    pub fn process_input_audio(&self, pcm: &[u8], tts_playing: bool) -> (Option<Vec<u8>>, bool) {
        if pcm.is_empty() {
            return (None, false);
        }

        let state = self.lock();
        if !tts_playing || !state.enabled {
            return (Some(pcm.to_vec()), true);
        }

        let energy = mean_square_energy(pcm);
        if energy < self.config.energy_floor {
            debug!(energy, "Input energy below floor during playback, dropping");
            return (None, false);
        }

        if self.is_echo(&state.frames, pcm, energy) {
            debug!(energy, "🔇 TTS echo detected, dropping input");
            return (None, false);
        }

        (Some(pcm.to_vec()), true)
    }

    fn is_echo(&self, frames: &VecDeque<TtsFrame>, input: &[u8], energy: f64) -> bool {
        let min_age = Duration::from_millis(self.config.min_echo_delay_ms);
        let max_age = Duration::from_millis(self.config.max_echo_delay_ms);
        let now = Instant::now();

        frames
            .iter()
            .rev()
            .take(self.config.check_frames)
            .filter(|f| (energy - f.energy).abs() <= energy / 2.0)
            .filter(|f| {
                let age = now.saturating_duration_since(f.sent_at);
                age >= min_age && age <= max_age
            })
            .filter(|f| input.len().abs_diff(f.data.len()) < f.data.len() / 4)
            .any(|f| amplitude_similarity(input, &f.data, self.config.compare_samples) > self.config.similarity_threshold)
    }

    pub fn set_echo_suppression(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn clear(&self) {
        self.lock().frames.clear();
    }

    /// Format of the recorded playback audio.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn buffered_frames(&self) -> usize {
        self.lock().frames.len()
    }

    /// Audio duration currently held in the ring.
    pub fn buffered_duration(&self) -> Duration {
        let samples: usize = self.lock().frames.iter().map(|f| f.data.len() / 2).sum();
        let per_second = self.format.sample_rate as u64 * self.format.channels as u64;
        if per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(samples as u64 * 1000 / per_second)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EchoState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// `1 - Σ|a-b| / (65536·n)` over the first `max_samples` sample pairs.
pub fn amplitude_similarity(a: &[u8], b: &[u8], max_samples: usize) -> f64 {
    let n = (a.len().min(b.len()) / 2).min(max_samples);
    if n == 0 {
        return 0.0;
    }
    let diff: u64 = samples(a)
        .zip(samples(b))
        .take(n)
        .map(|(x, y)| (x as i64 - y as i64).unsigned_abs())
        .sum();
    (1.0 - diff as f64 / (65536.0 * n as f64)).max(0.0)
}
