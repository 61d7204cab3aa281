//! Client-facing message writer
//!
//! All output to a client goes through one [`MessageWriter`] per session,
//! which owns the only task that touches the [`Transport`]. Text messages and
//! audio frames share one queue, so a `tts_end` can never overtake the frames
//! it follows. Audio frames can be paced to real-time playback speed.

use crate::audio::AudioFormat;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Duplex connection to one client. Not required to support concurrent writers.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, text: String) -> anyhow::Result<()>;
    async fn send_binary(&self, data: Vec<u8>) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// Messages sent to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        message: String,
    },
    AsrResult {
        text: String,
    },
    LlmResponse {
        text: String,
    },
    TtsStart {
        #[serde(flatten)]
        format: AudioFormat,
    },
    TtsEnd,
    Error {
        message: String,
        fatal: bool,
    },
    SessionCleared,
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

/// Messages received from the client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    NewSession,
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

/// Audio pacing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlConfig {
    /// Frames sent without delay at the start of a turn (default: 5)
    pub pre_buffer_frames: u32,
    /// Minimum gap between paced frames (default: 60ms)
    pub frame_delay_ms: u64,
    /// Outbound queue length (default: 100)
    pub queue_size: usize,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            pre_buffer_frames: 5,
            frame_delay_ms: 60,
            queue_size: 100,
        }
    }
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy)]
struct FlowState {
    packets: u32,
    last_send: Instant,
}

/// Serialized, flow-controlled writer to one client
pub struct MessageWriter {
    tx: mpsc::Sender<Outbound>,
    config: FlowControlConfig,
    flow: Mutex<Option<FlowState>>,
    /// Stops intake; the loop flushes the queue and exits.
    closing: CancellationToken,
    /// Stops the loop without flushing.
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageWriter {
    pub fn new(transport: Arc<dyn Transport>, config: FlowControlConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let closing = CancellationToken::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(write_loop(transport, rx, closing.clone(), cancel.clone()));

        Self {
            tx,
            config,
            flow: Mutex::new(None),
            closing,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    async fn enqueue(&self, item: Outbound) -> VoiceResult<()> {
        if self.closing.is_cancelled() {
            return Err(VoiceError::SessionClosed);
        }
        tokio::select! {
            _ = self.closing.cancelled() => Err(VoiceError::SessionClosed),
            sent = self.tx.send(item) => sent.map_err(|_| VoiceError::SessionClosed),
        }
    }

    pub async fn send(&self, message: &ServerMessage) -> VoiceResult<()> {
        let text = serde_json::to_string(message)?;
        self.enqueue(Outbound::Text(text)).await
    }

    pub async fn send_connected(&self) -> VoiceResult<()> {
        self.send(&ServerMessage::Connected {
            message: "voice connection established".to_string(),
        })
        .await
    }

    pub async fn send_asr_result(&self, text: &str) -> VoiceResult<()> {
        self.send(&ServerMessage::AsrResult { text: text.to_string() }).await
    }

    pub async fn send_llm_response(&self, text: &str) -> VoiceResult<()> {
        self.send(&ServerMessage::LlmResponse { text: text.to_string() }).await
    }

    pub async fn send_tts_start(&self, format: AudioFormat) -> VoiceResult<()> {
        self.send(&ServerMessage::TtsStart { format }).await
    }

    pub async fn send_tts_end(&self) -> VoiceResult<()> {
        self.send(&ServerMessage::TtsEnd).await
    }

    pub async fn send_error(&self, message: &str, fatal: bool) -> VoiceResult<()> {
        self.send(&ServerMessage::Error {
            message: message.to_string(),
            fatal,
        })
        .await
    }

    /// Queue an audio frame without pacing.
    pub async fn send_audio(&self, frame: Vec<u8>) -> VoiceResult<()> {
        self.enqueue(Outbound::Binary(frame)).await
    }

    /// Queue an audio frame, waiting so frames leave at playback speed.
    ///
    /// The first frames of a turn go out immediately to fill the client's
    /// buffer; after that each frame waits until the fixed delay has passed
    /// since the previous one.
    pub async fn send_audio_paced(&self, frame: Vec<u8>) -> VoiceResult<()> {
        let now = Instant::now();
        let (packets, last_send) = {
            let mut flow = self.flow.lock().unwrap_or_else(|p| p.into_inner());
            let state = flow.get_or_insert(FlowState {
                packets: 0,
                last_send: now,
            });
            let snapshot = (state.packets, state.last_send);
            state.packets += 1;
            snapshot
        };

        if packets >= self.config.pre_buffer_frames {
            let delay = Duration::from_millis(self.config.frame_delay_ms);
            let elapsed = now.saturating_duration_since(last_send);
            if elapsed < delay {
                tokio::select! {
                    _ = self.closing.cancelled() => return Err(VoiceError::SessionClosed),
                    _ = tokio::time::sleep(delay - elapsed) => {}
                }
            }
        }

        self.enqueue(Outbound::Binary(frame)).await?;

        if let Some(state) = self.flow.lock().unwrap_or_else(|p| p.into_inner()).as_mut() {
            state.last_send = Instant::now();
        }
        Ok(())
    }

    /// Start pacing from scratch for a new turn.
    pub fn reset_flow_control(&self) {
        *self.flow.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Flush queued output for up to `grace`, then close the transport.
    pub async fn close(&self, grace: Duration) {
        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(mut handle) = handle else {
            return;
        };

        self.closing.cancel();
        if tokio::time::timeout(grace, &mut handle).await.is_ok() {
            return;
        }

        warn!("Writer queue not drained before close");
        self.cancel.cancel();
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!("Writer task did not stop in time, aborting");
            handle.abort();
        }
    }
}

async fn write_loop(
    transport: Arc<dyn Transport>,
    mut rx: mpsc::Receiver<Outbound>,
    closing: CancellationToken,
    cancel: CancellationToken,
) {
    debug!("✍️ Writer loop started");
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            // Only reached with an empty queue; a closed channel yields None next.
            _ = closing.cancelled() => {
                rx.close();
                continue;
            }
        };

        let result = match item {
            Outbound::Text(text) => transport.send_text(text).await,
            Outbound::Binary(data) => transport.send_binary(data).await,
        };
        if let Err(err) = result {
            error!(error = %err, "Failed to write to client");
        }
    }

    if let Err(err) = transport.close().await {
        warn!(error = %err, "Error closing transport");
    }
    info!("✍️ Writer loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(Instant, Result<String, usize>)>>,
        closed: std::sync::atomic::AtomicBool,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for Recording {
        async fn send_text(&self, text: String) -> anyhow::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.sent.lock().unwrap().push((Instant::now(), Ok(text)));
            Ok(())
        }

        async fn send_binary(&self, data: Vec<u8>) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((Instant::now(), Err(data.len())));
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_message_json() {
        let start = ServerMessage::TtsStart {
            format: AudioFormat::default(),
        };
        assert_eq!(
            serde_json::to_string(&start).unwrap(),
            r#"{"type":"tts_start","sampleRate":16000,"channels":1,"bitDepth":16}"#
        );
        assert_eq!(serde_json::to_string(&ServerMessage::TtsEnd).unwrap(), r#"{"type":"tts_end"}"#);
        assert_eq!(
            serde_json::to_string(&ServerMessage::Error {
                message: "llm failed".into(),
                fatal: true
            })
            .unwrap(),
            r#"{"type":"error","message":"llm failed","fatal":true}"#
        );

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientMessage::Ping { timestamp: None });
        let reset: ClientMessage = serde_json::from_str(r#"{"type":"new_session"}"#).unwrap();
        assert_eq!(reset, ClientMessage::NewSession);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_after_prebuffer() {
        let transport = Arc::new(Recording::default());
        let writer = MessageWriter::new(transport.clone(), FlowControlConfig::default());
        let start = Instant::now();

        writer.send_tts_start(AudioFormat::default()).await.unwrap();
        for _ in 0..8 {
            writer.send_audio_paced(vec![0; 10]).await.unwrap();
        }
        writer.send_tts_end().await.unwrap();
        writer.close(Duration::from_secs(1)).await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 10);
        assert!(matches!(&sent[0].1, Ok(t) if t.contains("tts_start")));
        assert!(matches!(&sent[9].1, Ok(t) if t.contains("tts_end")));
        // frames 0..5 immediate, then one every 60ms
        assert!(sent[5].0 - start < Duration::from_millis(10));
        assert!(sent[8].0 - start >= Duration::from_millis(180));
        assert!(transport.closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restores_prebuffer() {
        let transport = Arc::new(Recording::default());
        let writer = MessageWriter::new(transport.clone(), FlowControlConfig::default());

        for _ in 0..6 {
            writer.send_audio_paced(vec![1]).await.unwrap();
        }
        writer.reset_flow_control();
        let before = Instant::now();
        for _ in 0..5 {
            writer.send_audio_paced(vec![1]).await.unwrap();
        }
        assert!(Instant::now() - before < Duration::from_millis(10));
        writer.close(Duration::from_secs(1)).await;
        assert!(writer.send_tts_end().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_queued_messages() {
        let transport = Arc::new(Recording {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let writer = MessageWriter::new(transport.clone(), FlowControlConfig::default());

        for i in 0..5 {
            writer.send_asr_result(&format!("第{}句。", i)).await.unwrap();
        }
        let start = Instant::now();
        writer.close(Duration::from_secs(1)).await;

        assert_eq!(transport.sent.lock().unwrap().len(), 5);
        assert!(transport.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(writer.is_closed());
        // returns once the queue is flushed, not at the grace deadline
        assert!(Instant::now() - start < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_gives_up_after_grace() {
        let transport = Arc::new(Recording {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let writer = MessageWriter::new(transport.clone(), FlowControlConfig::default());

        for i in 0..5 {
            writer.send_asr_result(&format!("第{}句。", i)).await.unwrap();
        }
        writer.close(Duration::from_millis(250)).await;

        assert!(transport.sent.lock().unwrap().len() < 5);
        assert!(transport.closed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
