//! PCM helpers shared by the echo suppressor, barge-in detector and codec framing.
//!
//! All audio handled by the core is signed 16-bit little-endian PCM.

use serde::{Deserialize, Serialize};

/// Output format announced to the client at the start of a TTS turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Bits per sample (default: 16)
    pub bit_depth: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

impl AudioFormat {
    /// Number of bytes in `frame_ms` of 16-bit audio in this format.
    pub fn frame_bytes(&self, frame_ms: u32) -> usize {
        self.sample_rate as usize * frame_ms as usize / 1000 * self.channels as usize * 2
    }

    /// Number of 16-bit samples covering `window_ms` of audio.
    pub fn samples_for(&self, window_ms: u64) -> usize {
        (self.sample_rate as u64 * self.channels as u64 * window_ms / 1000) as usize
    }
}

/// Iterate the i16 samples of a little-endian PCM buffer. A trailing odd byte is ignored.
pub fn samples(pcm: &[u8]) -> impl Iterator<Item = i16> + '_ {
    pcm.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]]))
}

/// Mean of squared samples. Empty input has zero energy.
pub fn mean_square_energy(pcm: &[u8]) -> f64 {
    let count = pcm.len() / 2;
    if count == 0 {
        return 0.0;
    }
    let sum: f64 = samples(pcm).map(|s| (s as f64) * (s as f64)).sum();
    sum / count as f64
}

/// Root-mean-square amplitude.
pub fn rms(pcm: &[u8]) -> f64 {
    mean_square_energy(pcm).sqrt()
}

fn lcg_step(seed: u64) -> u64 {
    (seed.wrapping_mul(1_103_515_245).wrapping_add(12_345)) & 0x7fff_ffff
}

fn noise_sample(seed: u64) -> i16 {
    (seed % 1001) as i16 - 500
}

/// Replace an exactly silent frame with deterministic ±500 noise.
///
/// Hardware codecs treat true digital silence as end of stream, so a frame
/// with zero energy is swapped for low-level noise. Other frames are returned
/// untouched.
pub fn fill_silent_frame(frame: Vec<u8>) -> Vec<u8> {
    if frame.is_empty() || mean_square_energy(&frame) != 0.0 {
        return frame;
    }

    let mut noisy = vec![0u8; frame.len()];
    let mut seed = (frame.len() as u64) * 7919 + 3571;
    for chunk in noisy.chunks_exact_mut(2) {
        seed = lcg_step(seed);
        chunk.copy_from_slice(&noise_sample(seed).to_le_bytes());
    }
    noisy
}

/// Low-level noise frame sent after the last real frame of a turn.
pub fn padding_frame(frame_bytes: usize, index: usize) -> Vec<u8> {
    let mut frame = vec![0u8; frame_bytes];
    for (j, chunk) in frame.chunks_exact_mut(2).enumerate() {
        let seed = lcg_step((j as u64 * 2) * 7919 + index as u64 * 3571);
        chunk.copy_from_slice(&noise_sample(seed).to_le_bytes());
    }
    frame
}
