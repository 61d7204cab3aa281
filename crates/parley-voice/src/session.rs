//! One client conversation
//!
//! A [`Session`] owns every per-connection component: the ASR connection,
//! turn state, echo suppressor, barge-in detector, orchestrator and the
//! client writer. The embedding server feeds it microphone frames and text
//! control messages; everything else happens on tasks the session owns and
//! stops in [`Session::stop`].

use crate::asr::{AsrBackend, AsrEvent, AsrService};
use crate::classify::{ClassifiedError, ErrorKind};
use crate::codec::FrameEncoder;
use crate::config::VoiceConfig;
use crate::echo::EchoSuppressor;
use crate::error::VoiceResult;
use crate::filter::FilterWords;
use crate::llm::{LlmBackend, LlmService};
use crate::orchestrator::{ConversationOrchestrator, OrchestratorParts};
use crate::pool::AsrConnectionPool;
use crate::state::ConversationState;
use crate::transport::{ClientMessage, MessageWriter, ServerMessage, Transport};
use crate::tts::{TtsBackend, TtsService};
use crate::vad::{BargeInDetector, SpeechClassifier};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Vendor backends and plumbing a session is built from
pub struct SessionServices {
    pub asr: Arc<dyn AsrBackend>,
    pub llm: Arc<dyn LlmBackend>,
    pub tts: Arc<dyn TtsBackend>,
    pub transport: Arc<dyn Transport>,
    pub encoder: Option<Arc<dyn FrameEncoder>>,
    /// Shared limit on concurrent ASR connections, if any
    pub pool: Option<Arc<AsrConnectionPool>>,
    /// Replaces WebRTC VAD as the barge-in speech check
    pub speech: Option<Arc<dyn SpeechClassifier>>,
}

pub struct Session {
    id: String,
    grace: Duration,
    state: Arc<ConversationState>,
    echo: Arc<EchoSuppressor>,
    vad: BargeInDetector,
    asr: AsrService,
    llm: Arc<LlmService>,
    tts: Arc<TtsService>,
    writer: Arc<MessageWriter>,
    orchestrator: ConversationOrchestrator,
    cancel: CancellationToken,
    events: Mutex<Option<mpsc::Receiver<AsrEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Session {
    /// Build a session. Must be called inside a tokio runtime.
    pub fn new(id: impl Into<String>, config: &VoiceConfig, services: SessionServices) -> VoiceResult<Self> {
        config.validate()?;
        let id = id.into();

        let filter = match &config.filter.dictionary_path {
            Some(path) => FilterWords::from_file(path)?,
            None => FilterWords::default(),
        };

        let state = Arc::new(ConversationState::new());
        let tts = Arc::new(TtsService::new(services.tts));
        // The echo ring holds playback audio, so it is sized in the TTS format.
        let echo = Arc::new(EchoSuppressor::new(config.echo.clone(), tts.format()));
        let mut vad = BargeInDetector::new(config.vad.clone(), config.session.input_sample_rate)?;
        if let Some(speech) = services.speech {
            vad = vad.with_classifier(speech);
        }
        let writer = Arc::new(MessageWriter::new(
            services.transport,
            config.playback.flow.clone(),
        ));
        let llm = Arc::new(LlmService::new(services.llm, config.llm.clone()));
        let (asr, events) = AsrService::new(
            services.asr,
            config.asr.clone(),
            config.reconnect.clone(),
            services.pool,
        );

        let cancel = CancellationToken::new();
        let orchestrator = ConversationOrchestrator::new(
            OrchestratorParts {
                session_id: id.clone(),
                state: Arc::clone(&state),
                echo: Arc::clone(&echo),
                filter: Arc::new(filter),
                llm: Arc::clone(&llm),
                tts: Arc::clone(&tts),
                writer: Arc::clone(&writer),
                encoder: services.encoder,
            },
            config.session.max_history,
            config.playback.clone(),
            cancel.child_token(),
        );

        Ok(Self {
            id,
            grace: Duration::from_millis(config.session.shutdown_grace_ms),
            state,
            echo,
            vad,
            asr,
            llm,
            tts,
            writer,
            orchestrator,
            cancel,
            events: Mutex::new(Some(events)),
            pump: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &Arc<ConversationState> {
        &self.state
    }

    pub fn orchestrator(&self) -> &ConversationOrchestrator {
        &self.orchestrator
    }

    pub fn asr(&self) -> &AsrService {
        &self.asr
    }

    pub fn echo(&self) -> &Arc<EchoSuppressor> {
        &self.echo
    }

    /// Greet the client, connect ASR and start consuming recognition events.
    pub async fn start(&self) -> VoiceResult<()> {
        let span = tracing::info_span!("session", session_id = %self.id);
        let Some(events) = self.events.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            debug!(session_id = %self.id, "Session already started");
            return Ok(());
        };

        async {
            info!("🎙️ Session starting");
            self.writer.send_connected().await?;
            self.asr.connect();
            Ok::<_, crate::error::VoiceError>(())
        }
        .instrument(span.clone())
        .await?;

        let pump = tokio::spawn(
            pump_asr_events(
                events,
                Arc::clone(&self.state),
                self.orchestrator.clone(),
                Arc::clone(&self.writer),
                self.cancel.clone(),
            )
            .instrument(span),
        );
        *self.pump.lock().unwrap_or_else(|p| p.into_inner()) = Some(pump);
        Ok(())
    }

    /// Handle one microphone frame.
    ///
    /// Loud speech during playback interrupts the reply. Otherwise, while a
    /// reply plays, frames matching recent output are dropped as echo.
    pub async fn handle_audio(&self, pcm: &[u8]) -> VoiceResult<()> {
        if self.stopped.load(Ordering::SeqCst) || self.state.is_fatal_error() {
            return Ok(());
        }

        if self.state.is_tts_playing() && self.vad.check_barge_in(pcm, true) {
            info!(session_id = %self.id, "🗣️ Barge-in detected, stopping reply");
            self.state.cancel_tts();
            self.state.set_tts_playing(false);
        }

        let (audio, forward) = self.echo.process_input_audio(pcm, self.state.is_tts_playing());
        let Some(audio) = audio.filter(|_| forward) else {
            return Ok(());
        };

        match self.asr.send_audio(&audio).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_transient() => {
                debug!(error = %err, "Audio frame not delivered to ASR");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Handle a text control message from the client.
    pub async fn handle_text(&self, text: &str) -> VoiceResult<()> {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "Ignoring unknown client message");
                return Ok(());
            }
        };

        match message {
            ClientMessage::NewSession => self.orchestrator.reset_conversation().await,
            ClientMessage::Ping { timestamp } => {
                self.writer.send(&ServerMessage::Pong { timestamp }).await
            }
        }
    }

    /// Stop every task the session owns, then close the client connection.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.id, "🛑 Session stopping");

        self.orchestrator.shutdown(self.grace).await;
        self.cancel.cancel();

        if let Err(err) = self.asr.disconnect(self.grace).await {
            warn!(session_id = %self.id, error = %err, "ASR ended with error");
        }

        let pump = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(self.grace, &mut pump).await.is_err() {
                warn!(session_id = %self.id, "ASR event pump did not stop in time, aborting");
                pump.abort();
            }
        }

        if let Err(err) = self.tts.close().await {
            warn!(session_id = %self.id, error = %err, "Error closing TTS");
        }
        self.llm.close();
        self.echo.clear();
        self.writer.close(self.grace).await;
        info!(session_id = %self.id, "👋 Session stopped");
    }
}

async fn pump_asr_events(
    mut events: mpsc::Receiver<AsrEvent>,
    state: Arc<ConversationState>,
    orchestrator: ConversationOrchestrator,
    writer: Arc<MessageWriter>,
    cancel: CancellationToken,
) {
    debug!("ASR event pump started");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            AsrEvent::Transcript(transcript) => {
                debug!(
                    text = %transcript.text,
                    is_final = transcript.is_final,
                    utterance = %transcript.utterance_id,
                    "ASR transcript"
                );
                let incremental = state.update_asr_text(&transcript.text, transcript.is_final);
                if !incremental.is_empty() {
                    orchestrator.on_asr_result(&incremental).await;
                }
            }
            AsrEvent::Error(err) => report_asr_error(&state, &writer, &err).await,
        }
    }
    debug!("ASR event pump stopped");
}

async fn report_asr_error(state: &ConversationState, writer: &MessageWriter, err: &ClassifiedError) {
    match err.kind {
        ErrorKind::Fatal => {
            error!(error = %err, "💀 ASR failed fatally, session blocked");
            state.set_fatal_error(true);
            state.cancel_tts();
        }
        ErrorKind::Recoverable => warn!(error = %err, "ASR error"),
        ErrorKind::Transient => {
            debug!(error = %err, "Transient ASR error");
            return;
        }
    }
    if let Err(send_err) = writer.send_error(&err.to_string(), err.is_fatal()).await {
        debug!(error = %send_err, "Failed to report ASR error");
    }
}
