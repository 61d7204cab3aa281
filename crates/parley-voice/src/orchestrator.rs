//! Conversation orchestrator - the per-session turn pipeline
//!
//! ```text
//! ASR increment ─→ caption ─→ filter ─→ LLM ─→ reply text ─→ TTS ─→ frames ─→ client
//!                                  ↑                                  │
//!                                  └──── new increment cancels ───────┘
//! ```
//!
//! Each turn owns a cancellation token, a child of the session token, that is
//! installed in [`ConversationState`] as soon as the turn starts. A new
//! complete utterance cancels it, which abandons a pending LLM reply or stops
//! the frame pump of a reply being spoken. Only one pump may write audio at a
//! time: a turn waits for the speaking slot, which the previous pump releases
//! only after it has sent `tts_end`.

use crate::audio::AudioFormat;
use crate::classify::ClassifiedError;
use crate::codec::{FrameAssembler, FrameEncoder};
use crate::config::PlaybackConfig;
use crate::echo::EchoSuppressor;
use crate::error::{VoiceError, VoiceResult};
use crate::filter::FilterWords;
use crate::llm::{ChatMessage, LlmService, MessageHistory, Role};
use crate::state::{ConversationState, TurnId};
use crate::transport::{MessageWriter, ServerMessage};
use crate::tts::{TtsChunk, TtsService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

/// Everything a session hands to its orchestrator
pub struct OrchestratorParts {
    pub session_id: String,
    pub state: Arc<ConversationState>,
    pub echo: Arc<EchoSuppressor>,
    pub filter: Arc<FilterWords>,
    pub llm: Arc<LlmService>,
    pub tts: Arc<TtsService>,
    pub writer: Arc<MessageWriter>,
    /// Wire codec; without one, PCM chunks are sent as produced
    pub encoder: Option<Arc<dyn FrameEncoder>>,
}

/// How a frame pump stopped
#[derive(Debug)]
enum PumpEnd {
    Completed { frames: usize },
    Cancelled,
    Failed(ClassifiedError),
    WriterClosed,
}

struct Inner {
    session_id: String,
    state: Arc<ConversationState>,
    echo: Arc<EchoSuppressor>,
    filter: Arc<FilterWords>,
    llm: Arc<LlmService>,
    tts: Arc<TtsService>,
    writer: Arc<MessageWriter>,
    encoder: Option<Arc<dyn FrameEncoder>>,
    history: MessageHistory,
    playback: PlaybackConfig,
    speaking: Mutex<()>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Drives ASR → LLM → TTS turns for one session
#[derive(Clone)]
pub struct ConversationOrchestrator {
    inner: Arc<Inner>,
}

impl ConversationOrchestrator {
    pub fn new(
        parts: OrchestratorParts,
        max_history: usize,
        playback: PlaybackConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session_id: parts.session_id,
                state: parts.state,
                echo: parts.echo,
                filter: parts.filter,
                llm: parts.llm,
                tts: parts.tts,
                writer: parts.writer,
                encoder: parts.encoder,
                history: MessageHistory::new(max_history),
                playback,
                speaking: Mutex::new(()),
                cancel,
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Handle a new transcript increment.
    ///
    /// The text is always captioned to the client. Filler words stop there.
    /// Anything else interrupts the active turn and starts a new one.
    pub async fn on_asr_result(&self, text: &str) {
        let inner = &self.inner;
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let gate = inner.state.can_process();
        if gate.is_fatal {
            debug!("Session blocked by fatal error, ignoring transcript");
            return;
        }

        if let Err(err) = inner.writer.send_asr_result(text).await {
            warn!(error = %err, "Failed to forward transcript");
        }

        if inner.filter.is_filtered(text) {
            inner.filter.record_filtered(text);
            debug!(
                text,
                count = inner.filter.filtered_count(text),
                "🚫 Filler transcript not sent to LLM"
            );
            return;
        }

        if gate.is_processing {
            info!(text, "⚡ New utterance, interrupting current turn");
            inner.state.cancel_tts();
            inner.state.interrupt();
        }

        let Some(turn) = inner.state.begin_turn() else {
            return;
        };
        let token = inner.cancel.child_token();
        inner.state.set_tts_token(token.clone());

        let this = self.clone();
        let text = text.to_string();
        let span = tracing::info_span!("turn", session_id = %inner.session_id, turn);
        inner
            .tasks
            .spawn(async move { this.process_text(turn, token, text).await }.instrument(span));
    }

    async fn process_text(&self, turn: TurnId, token: CancellationToken, text: String) {
        let inner = &self.inner;
        inner.history.push(ChatMessage::new(Role::User, text.as_str()));

        let reply = tokio::select! {
            _ = token.cancelled() => {
                debug!("Turn cancelled while waiting for LLM");
                return;
            }
            reply = inner.llm.query(inner.history.snapshot(), &text) => reply,
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                self.handle_service_error(&err).await;
                inner.state.finish_turn(turn);
                return;
            }
        };

        if reply.is_empty() {
            warn!("LLM returned an empty reply");
            inner.state.finish_turn(turn);
            return;
        }

        if token.is_cancelled() || inner.state.current_turn() != Some(turn) {
            debug!("Turn superseded, dropping LLM reply");
            return;
        }

        inner.history.push(ChatMessage::new(Role::Assistant, reply.as_str()));
        let shown = format!("{}{}", reply, inner.playback.reply_suffix);
        if let Err(err) = inner.writer.send_llm_response(&shown).await {
            warn!(error = %err, "Failed to forward LLM reply");
        }

        let this = self.clone();
        inner.tasks.spawn(
            async move { this.synthesize_tts(turn, token, reply).await }.in_current_span(),
        );
    }

    async fn synthesize_tts(&self, turn: TurnId, token: CancellationToken, text: String) {
        let inner = &self.inner;
        let _slot = inner.speaking.lock().await;

        if token.is_cancelled() {
            return;
        }

        let format = inner.tts.format();
        let mut rx = match inner.tts.synthesize(token.clone(), &text) {
            Ok(rx) => rx,
            Err(err) => {
                self.handle_service_error(&err).await;
                inner.state.finish_turn(turn);
                return;
            }
        };

        if !inner.state.begin_speaking(turn) {
            debug!("Turn no longer current, skipping synthesis");
            token.cancel();
            return;
        }

        if let Err(err) = inner.writer.send_tts_start(format).await {
            warn!(error = %err, "Failed to announce TTS start");
        }
        inner.writer.reset_flow_control();

        let end = self.pump_frames(&token, &mut rx, format).await;
        drop(rx);

        inner.state.finish_turn(turn);
        if let Err(err) = inner.writer.send_tts_end().await {
            debug!(error = %err, "Failed to send TTS end");
        }

        match end {
            PumpEnd::Completed { frames } => info!(frames, "🔊 Reply finished"),
            PumpEnd::Cancelled => info!("🔇 Reply interrupted"),
            PumpEnd::Failed(err) => self.handle_service_error(&err).await,
            PumpEnd::WriterClosed => debug!("Client writer closed during reply"),
        }
    }

    async fn pump_frames(
        &self,
        token: &CancellationToken,
        rx: &mut mpsc::Receiver<TtsChunk>,
        format: AudioFormat,
    ) -> PumpEnd {
        let inner = &self.inner;
        let mut assembler = inner
            .encoder
            .as_ref()
            .map(|_| FrameAssembler::new(format, inner.playback.frame_ms));
        let mut frames = 0usize;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => return PumpEnd::Cancelled,
                chunk = rx.recv() => chunk,
            };

            match chunk {
                Some(TtsChunk::Audio(pcm)) => {
                    let ready = match assembler.as_mut() {
                        Some(assembler) => assembler.push(&pcm),
                        None => vec![pcm],
                    };
                    for frame in ready {
                        if let Err(end) = self.send_frame(token, frame, &mut frames).await {
                            return end;
                        }
                    }
                }
                Some(TtsChunk::Failed(err)) => return PumpEnd::Failed(err),
                None => break,
            }
        }

        if let Some(assembler) = assembler.as_mut() {
            let tail = assembler
                .flush()
                .into_iter()
                .chain(assembler.padding(inner.playback.padding_frames));
            for frame in tail {
                if let Err(end) = self.send_frame(token, frame, &mut frames).await {
                    return end;
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => PumpEnd::Cancelled,
            _ = tokio::time::sleep(Duration::from_millis(inner.playback.drain_delay_ms)) => {
                PumpEnd::Completed { frames }
            }
        }
    }

    /// Record one PCM frame for echo suppression, encode it and send it paced.
    async fn send_frame(
        &self,
        token: &CancellationToken,
        pcm: Vec<u8>,
        frames: &mut usize,
    ) -> Result<(), PumpEnd> {
        let inner = &self.inner;
        if token.is_cancelled() {
            return Err(PumpEnd::Cancelled);
        }

        if *frames == 0 {
            if let Some(started) = inner.state.asr_complete_time() {
                info!(latency = ?started.elapsed(), "First reply audio");
            }
        }

        inner.echo.record_tts_output(&pcm);

        let packets = match &inner.encoder {
            Some(encoder) => match encoder.encode(&pcm) {
                Ok(packets) => packets,
                Err(err) => {
                    error!(error = %err, "Frame encoding failed, skipping frame");
                    return Ok(());
                }
            },
            None => vec![pcm],
        };

        for packet in packets {
            match inner.writer.send_audio_paced(packet).await {
                Ok(()) => *frames += 1,
                Err(VoiceError::SessionClosed) => return Err(PumpEnd::WriterClosed),
                Err(err) => {
                    warn!(error = %err, "Failed to send audio frame");
                    return Err(PumpEnd::WriterClosed);
                }
            }
        }
        Ok(())
    }

    /// Report a classified failure; fatal ones block the session.
    async fn handle_service_error(&self, err: &ClassifiedError) {
        let inner = &self.inner;
        if err.is_fatal() {
            error!(error = %err, "💀 Fatal error, session stops accepting turns");
            inner.state.set_fatal_error(true);
            inner.state.cancel_tts();
        }
        if let Err(send_err) = inner.writer.send_error(&err.to_string(), err.is_fatal()).await {
            debug!(error = %send_err, "Failed to report error to client");
        }
    }

    /// Start over: forget history, transcripts and buffered echo.
    pub async fn reset_conversation(&self) -> VoiceResult<()> {
        let inner = &self.inner;
        inner.state.clear();
        inner.history.clear();
        inner.echo.clear();
        info!("🧹 Conversation reset");
        inner.writer.send(&ServerMessage::SessionCleared).await
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.inner.history.snapshot()
    }

    pub fn state(&self) -> &Arc<ConversationState> {
        &self.inner.state
    }

    /// Cancel every turn and wait up to `grace` for their tasks.
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        inner.state.cancel_tts();
        inner.cancel.cancel();
        inner.tasks.close();
        if tokio::time::timeout(grace, inner.tasks.wait()).await.is_err() {
            warn!(pending = inner.tasks.len(), "Turn tasks still running after grace period");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::EchoConfig;
    use crate::llm::{LlmBackend, LlmConfig, LlmRequest};
    use crate::transport::{FlowControlConfig, Transport};
    use crate::tts::{TtsBackend, TtsSink};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Wire {
        texts: StdMutex<Vec<String>>,
        frames: StdMutex<usize>,
    }

    #[async_trait]
    impl Transport for Wire {
        async fn send_text(&self, text: String) -> anyhow::Result<()> {
            self.texts.lock().unwrap().push(text);
            Ok(())
        }
        async fn send_binary(&self, _data: Vec<u8>) -> anyhow::Result<()> {
            *self.frames.lock().unwrap() += 1;
            Ok(())
        }
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FixedLlm(&'static str);

    #[async_trait]
    impl LlmBackend for FixedLlm {
        async fn query(&self, _request: &LlmRequest) -> anyhow::Result<String> {
            if self.0.is_empty() {
                return Err(anyhow!("insufficient quota"));
            }
            Ok(self.0.to_string())
        }
    }

    struct SilentTts;

    #[async_trait]
    impl TtsBackend for SilentTts {
        async fn synthesize(&self, _text: &str, sink: TtsSink) -> anyhow::Result<()> {
            sink.push(vec![0u8; 1000]).await?;
            sink.push(vec![0u8; 3000]).await
        }
        fn format(&self) -> AudioFormat {
            AudioFormat::default()
        }
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn orchestrator(reply: &'static str, encoder: bool) -> (ConversationOrchestrator, Arc<Wire>) {
        let wire = Arc::new(Wire::default());
        let writer = Arc::new(MessageWriter::new(wire.clone(), FlowControlConfig::default()));
        let encoder: Option<Arc<dyn FrameEncoder>> = if encoder {
            Some(Arc::new(|pcm: &[u8]| -> anyhow::Result<Vec<Vec<u8>>> {
                Ok(vec![pcm[..8].to_vec()])
            }))
        } else {
            None
        };
        let parts = OrchestratorParts {
            session_id: "test".into(),
            state: Arc::new(ConversationState::new()),
            echo: Arc::new(EchoSuppressor::new(EchoConfig::default(), AudioFormat::default())),
            filter: Arc::new(FilterWords::default()),
            llm: Arc::new(LlmService::new(Arc::new(FixedLlm(reply)), LlmConfig::default())),
            tts: Arc::new(TtsService::new(Arc::new(SilentTts))),
            writer,
            encoder,
        };
        (
            ConversationOrchestrator::new(parts, 100, PlaybackConfig::default(), CancellationToken::new()),
            wire,
        )
    }

    async fn settle(orchestrator: &ConversationOrchestrator) {
        orchestrator.shutdown(Duration::from_secs(10)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_with_encoder_sends_frames_and_padding() {
        let (orchestrator, wire) = orchestrator("好的，马上。", true);
        orchestrator.on_asr_result("帮我开灯。").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle(&orchestrator).await;

        let texts = wire.texts.lock().unwrap().clone();
        assert!(texts[0].contains("asr_result"));
        assert!(texts[1].contains("llm_response"));
        assert!(texts[2].contains("tts_start"));
        assert!(texts[3].contains("tts_end"));
        // 4000 bytes: two full frames, one padded remainder, five padding frames
        assert_eq!(*wire.frames.lock().unwrap(), 8);
        assert_eq!(orchestrator.history().len(), 2);
        assert!(!orchestrator.state().is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_filtered_text_is_only_captioned() {
        let (orchestrator, wire) = orchestrator("不该出现", false);
        orchestrator.on_asr_result("嗯。").await;
        settle(&orchestrator).await;

        let texts = wire.texts.lock().unwrap().clone();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("asr_result"));
        assert!(orchestrator.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_llm_error_blocks_session() {
        let (orchestrator, wire) = orchestrator("", false);
        orchestrator.on_asr_result("你好。").await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(orchestrator.state().is_fatal_error());
        orchestrator.on_asr_result("还在吗？").await;
        settle(&orchestrator).await;

        let texts = wire.texts.lock().unwrap().clone();
        assert_eq!(texts.len(), 2);
        assert!(texts[1].contains(r#""fatal":true"#));
        assert!(texts[1].contains("llm failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_history_and_block() {
        let (orchestrator, wire) = orchestrator("", false);
        orchestrator.on_asr_result("你好。").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(orchestrator.state().is_fatal_error());

        orchestrator.reset_conversation().await.unwrap();
        assert!(!orchestrator.state().is_fatal_error());
        assert!(orchestrator.history().is_empty());
        settle(&orchestrator).await;
        assert!(wire.texts.lock().unwrap().last().unwrap().contains("session_cleared"));
    }
}
