//! # Parley Voice - Real-Time Conversational Voice Core
//!
//! This crate runs spoken conversations between a client and a chain of
//! vendor services: streaming speech recognition, a chat model and speech
//! synthesis. Vendors and the client connection plug in through traits; the
//! crate owns turn-taking, interruption, echo suppression, reconnection and
//! paced audio delivery.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Session                               │
//! │  mic PCM ─→ ┌──────────┐  ┌──────────┐  ┌──────────────────┐     │
//! │             │ Barge-in │→ │   Echo   │→ │ ASR (supervised, │     │
//! │             │   VAD    │  │ Suppress │  │  reconnecting)   │     │
//! │             └──────────┘  └──────────┘  └──────────────────┘     │
//! │                                                  ↓ transcripts   │
//! │  ┌──────────────┐   ┌──────────────────────────────────────┐     │
//! │  │ Conversation │ ← │ Orchestrator: filter → LLM → TTS →    │     │
//! │  │    State     │   │ frames (cancelled by newer speech)   │     │
//! │  └──────────────┘   └──────────────────────────────────────┘     │
//! │                                                  ↓               │
//! │                          MessageWriter (paced) ─→ client         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod asr;
pub mod audio;
pub mod classify;
pub mod codec;
pub mod config;
pub mod echo;
pub mod error;
pub mod filter;
pub mod llm;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod reconnect;
pub mod session;
pub mod state;
pub mod transcript;
pub mod transport;
pub mod tts;
pub mod vad;

pub use asr::{AsrBackend, AsrConfig, AsrEvent, AsrEventSink, AsrService, AsrTranscript, ConnectionState};
pub use audio::AudioFormat;
pub use classify::{ClassifiedError, ErrorClassifier, ErrorKind};
pub use codec::{FrameAssembler, FrameEncoder};
pub use config::{FilterConfig, PlaybackConfig, SessionConfig, VoiceConfig};
pub use echo::{EchoConfig, EchoSuppressor};
pub use error::{VoiceError, VoiceResult};
pub use filter::FilterWords;
pub use llm::{ChatMessage, LlmBackend, LlmConfig, LlmRequest, LlmService, MessageHistory, Role};
pub use logging::init_tracing;
pub use orchestrator::{ConversationOrchestrator, OrchestratorParts};
pub use pool::{AsrConnectionPool, AsrPermit, PoolConfig};
pub use reconnect::{
    BackoffConfig, BackoffStrategy, ExponentialBackoff, ReconnectManager, ReconnectOutcome,
};
pub use session::{Session, SessionServices};
pub use state::{ConversationState, ProcessGate, TurnId, TurnPhase};
pub use transport::{ClientMessage, FlowControlConfig, MessageWriter, ServerMessage, Transport};
pub use tts::{TtsBackend, TtsChunk, TtsService, TtsSink};
pub use vad::{BargeInDetector, SpeechClassifier, VadConfig, WebRtcSpeech};
