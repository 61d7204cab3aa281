//! Channel-based speech synthesis
//!
//! [`TtsService::synthesize`] starts a backend producing PCM into a bounded
//! channel and returns the receiving end. A closed channel means synthesis
//! finished normally; [`TtsChunk::Failed`] is the error sentinel. Cancelling
//! the turn's token stops the producer: the sink refuses further audio.

use crate::audio::AudioFormat;
use crate::classify::{ClassifiedError, ErrorClassifier};
use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const SERVICE: &str = "tts";

/// Channel buffer between producer and frame pump
pub const TTS_CHANNEL_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub enum TtsChunk {
    /// 16-bit PCM in the backend's format
    Audio(Vec<u8>),
    /// Synthesis failed; no more audio will follow
    Failed(ClassifiedError),
}

/// Where a backend pushes synthesized audio
#[derive(Debug, Clone)]
pub struct TtsSink {
    tx: mpsc::Sender<TtsChunk>,
    cancel: CancellationToken,
}

impl TtsSink {
    /// Queue a chunk of PCM. Fails once the turn is cancelled or the reader is gone.
    pub async fn push(&self, pcm: Vec<u8>) -> anyhow::Result<()> {
        if pcm.is_empty() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(anyhow!("synthesis cancelled")),
            sent = self.tx.send(TtsChunk::Audio(pcm)) => {
                sent.map_err(|_| anyhow!("synthesis reader dropped"))
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// Vendor speech synthesizer
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Synthesize `text`, pushing audio into `sink` until done.
    async fn synthesize(&self, text: &str, sink: TtsSink) -> anyhow::Result<()>;

    /// Format of the PCM this backend produces.
    fn format(&self) -> AudioFormat;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Wraps a backend behind a cancellable channel API
pub struct TtsService {
    backend: Arc<dyn TtsBackend>,
    classifier: ErrorClassifier,
    closed: AtomicBool,
}

impl TtsService {
    pub fn new(backend: Arc<dyn TtsBackend>) -> Self {
        Self {
            backend,
            classifier: ErrorClassifier::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.backend.format()
    }

    /// Start synthesizing `text`, returning the audio channel.
    pub fn synthesize(
        &self,
        cancel: CancellationToken,
        text: &str,
    ) -> Result<mpsc::Receiver<TtsChunk>, ClassifiedError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClassifiedError::recoverable(SERVICE, "service closed"));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(ClassifiedError::recoverable(SERVICE, "nothing to synthesize"));
        }

        let (tx, rx) = mpsc::channel(TTS_CHANNEL_CAPACITY);
        let sink = TtsSink {
            tx: tx.clone(),
            cancel: cancel.clone(),
        };
        let backend = Arc::clone(&self.backend);
        let classifier = self.classifier.clone();
        let text = text.to_string();

        tokio::spawn(async move {
            debug!(chars = text.chars().count(), "🗣️ Synthesis started");
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Synthesis cancelled");
                    return;
                }
                result = backend.synthesize(&text, sink) => result,
            };

            if let Err(err) = result {
                if cancel.is_cancelled() {
                    return;
                }
                let classified = classifier.handle(&err, SERVICE);
                if tx.send(TtsChunk::Failed(classified)).await.is_err() {
                    debug!("Synthesis failure had no reader");
                }
            }
        });

        Ok(rx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("🛑 Closing TTS service");
        self.backend.close().await
    }
}
