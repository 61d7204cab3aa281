//! Fixed-size framing in front of a wire codec encoder.

use crate::audio::{fill_silent_frame, padding_frame, AudioFormat};

/// PCM → wire codec, called once per fixed-size PCM frame
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, pcm: &[u8]) -> anyhow::Result<Vec<Vec<u8>>>;
}

impl<F> FrameEncoder for F
where
    F: Fn(&[u8]) -> anyhow::Result<Vec<Vec<u8>>> + Send + Sync,
{
    fn encode(&self, pcm: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        self(pcm)
    }
}

/// Slices a PCM stream into exact codec frames
#[derive(Debug)]
pub struct FrameAssembler {
    frame_bytes: usize,
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new(format: AudioFormat, frame_ms: u32) -> Self {
        Self {
            frame_bytes: format.frame_bytes(frame_ms).max(2),
            buffer: Vec::new(),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Bytes waiting for a full frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Append PCM and take every complete frame. Silent frames become low-level noise.
    pub fn push(&mut self, pcm: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(pcm);
        let complete = self.buffer.len() / self.frame_bytes;
        if complete == 0 {
            return Vec::new();
        }

        let rest = self.buffer.split_off(complete * self.frame_bytes);
        let ready = std::mem::replace(&mut self.buffer, rest);
        ready
            .chunks_exact(self.frame_bytes)
            .map(|frame| fill_silent_frame(frame.to_vec()))
            .collect()
    }

    /// The leftover partial frame, zero-padded to full size.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut frame = std::mem::take(&mut self.buffer);
        frame.resize(self.frame_bytes, 0);
        Some(fill_silent_frame(frame))
    }

    /// Trailing noise frames that let the client's playback buffer drain.
    pub fn padding(&self, count: usize) -> Vec<Vec<u8>> {
        (0..count).map(|i| padding_frame(self.frame_bytes, i)).collect()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
