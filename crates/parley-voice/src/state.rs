//! Per-session conversation state.
//!
//! The turn lifecycle is a single [`TurnPhase`] value driven by the pure
//! [`next_phase`] function. The `processing`, `tts_playing` and `fatal_error`
//! flags are views over it, so a blocked session can never also be
//! processing. Every active phase carries the id of its turn; transitions for
//! any other turn are ignored, which keeps a cancelled turn that finishes late
//! from touching the turn that replaced it.

use crate::transcript::{
    is_complete_sentence, normalize, similarity, split_last_sentence, SIMILARITY_THRESHOLD,
};
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Monotonic per-session turn identifier
pub type TurnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    /// Waiting on the LLM
    Processing { turn: TurnId },
    /// Streaming synthesized audio
    Synthesizing { turn: TurnId },
    /// A fatal error occurred; no turn may start until reset
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Start(TurnId),
    Speak(TurnId),
    StopSpeaking(TurnId),
    Finish(TurnId),
    Interrupt,
    Fatal,
    ClearFatal,
    Reset,
}

/// The only place turn phases change.
pub fn next_phase(current: TurnPhase, event: PhaseEvent) -> TurnPhase {
    use PhaseEvent::*;
    use TurnPhase::*;

    match (current, event) {
        (_, Reset) => Idle,
        (Blocked, ClearFatal) => Idle,
        (Blocked, _) => Blocked,
        (_, Fatal) => Blocked,
        (_, Interrupt) => Idle,
        (_, Start(turn)) => Processing { turn },
        (Processing { turn }, Speak(t)) if turn == t => Synthesizing { turn },
        (Synthesizing { turn }, StopSpeaking(t)) if turn == t => Processing { turn },
        (Processing { turn } | Synthesizing { turn }, Finish(t)) if turn == t => Idle,
        (phase, _) => phase,
    }
}

/// Result of [`ConversationState::can_process`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGate {
    pub can_process: bool,
    pub is_fatal: bool,
    pub is_processing: bool,
}

#[derive(Debug)]
struct Inner {
    phase: TurnPhase,
    next_turn: TurnId,
    last_asr_text: String,
    last_processed_text: String,
    last_processed_cumulative_text: String,
    asr_complete_time: Option<Instant>,
    tts_token: Option<CancellationToken>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            phase: TurnPhase::Idle,
            next_turn: 1,
            last_asr_text: String::new(),
            last_processed_text: String::new(),
            last_processed_cumulative_text: String::new(),
            asr_complete_time: None,
            tts_token: None,
        }
    }
}

impl Inner {
    fn apply(&mut self, event: PhaseEvent) -> TurnPhase {
        let next = next_phase(self.phase, event);
        if next != self.phase {
            debug!(from = ?self.phase, to = ?next, ?event, "Turn phase changed");
        }
        self.phase = next;
        next
    }

    fn active_turn(&self) -> Option<TurnId> {
        match self.phase {
            TurnPhase::Processing { turn } | TurnPhase::Synthesizing { turn } => Some(turn),
            _ => None,
        }
    }
}

/// Turn phase, TTS cancellation handle and incremental transcript tracking
#[derive(Debug, Default)]
pub struct ConversationState {
    inner: Mutex<Inner>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn phase(&self) -> TurnPhase {
        self.lock().phase
    }

    pub fn current_turn(&self) -> Option<TurnId> {
        self.lock().active_turn()
    }

    /// Start a new turn, preempting any active one. `None` when blocked.
    pub fn begin_turn(&self) -> Option<TurnId> {
        let mut inner = self.lock();
        if inner.phase == TurnPhase::Blocked {
            return None;
        }
        let turn = inner.next_turn;
        inner.next_turn += 1;
        inner.asr_complete_time = Some(Instant::now());
        inner.apply(PhaseEvent::Start(turn));
        Some(turn)
    }

    /// Move `turn` into synthesis. False if the turn is no longer current.
    pub fn begin_speaking(&self, turn: TurnId) -> bool {
        self.lock().apply(PhaseEvent::Speak(turn)) == TurnPhase::Synthesizing { turn }
    }

    pub fn finish_turn(&self, turn: TurnId) {
        self.lock().apply(PhaseEvent::Finish(turn));
    }

    /// Drop whatever turn is active back to idle.
    pub fn interrupt(&self) {
        self.lock().apply(PhaseEvent::Interrupt);
    }

    pub fn set_processing(&self, processing: bool) {
        if processing {
            self.begin_turn();
        } else {
            let mut inner = self.lock();
            if let Some(turn) = inner.active_turn() {
                inner.apply(PhaseEvent::Finish(turn));
            }
        }
    }

    pub fn is_processing(&self) -> bool {
        self.lock().active_turn().is_some()
    }

    pub fn set_tts_playing(&self, playing: bool) {
        let mut inner = self.lock();
        if let Some(turn) = inner.active_turn() {
            let event = if playing {
                PhaseEvent::Speak(turn)
            } else {
                PhaseEvent::StopSpeaking(turn)
            };
            inner.apply(event);
        }
    }

    pub fn is_tts_playing(&self) -> bool {
        matches!(self.lock().phase, TurnPhase::Synthesizing { .. })
    }

    pub fn set_fatal_error(&self, fatal: bool) {
        let event = if fatal {
            PhaseEvent::Fatal
        } else {
            PhaseEvent::ClearFatal
        };
        self.lock().apply(event);
    }

    pub fn is_fatal_error(&self) -> bool {
        self.lock().phase == TurnPhase::Blocked
    }

    /// All three gate facts read under one lock.
    pub fn can_process(&self) -> ProcessGate {
        let inner = self.lock();
        let is_fatal = inner.phase == TurnPhase::Blocked;
        let is_processing = inner.active_turn().is_some();
        ProcessGate {
            can_process: !is_fatal && !is_processing,
            is_fatal,
            is_processing,
        }
    }

    /// Install the cancellation token of a new synthesis, cancelling the old one.
    pub fn set_tts_token(&self, token: CancellationToken) {
        if let Some(previous) = self.lock().tts_token.replace(token) {
            previous.cancel();
        }
    }

    pub fn tts_token(&self) -> Option<CancellationToken> {
        self.lock().tts_token.clone()
    }

    pub fn cancel_tts(&self) {
        if let Some(token) = self.lock().tts_token.take() {
            token.cancel();
        }
    }

    /// When the latest turn started.
    pub fn asr_complete_time(&self) -> Option<Instant> {
        self.lock().asr_complete_time
    }

    pub fn last_asr_text(&self) -> String {
        self.lock().last_asr_text.clone()
    }

    /// Reset phase, transcripts and any pending synthesis.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.apply(PhaseEvent::Reset);
        inner.last_asr_text.clear();
        inner.last_processed_text.clear();
        inner.last_processed_cumulative_text.clear();
        inner.asr_complete_time = None;
        if let Some(token) = inner.tts_token.take() {
            token.cancel();
        }
    }

    /// Return only the newly meaningful part of a streaming transcript.
    ///
    /// Partial results are ignored until they end a sentence. Repeats and
    /// re-transcriptions of already processed text return an empty string.
    pub fn update_asr_text(&self, text: &str, is_final: bool) -> String {
        if text.is_empty() {
            return String::new();
        }

        let mut inner = self.lock();
        inner.last_asr_text = text.to_string();

        if is_final && text == inner.last_processed_text {
            return String::new();
        }

        if !is_final && !is_complete_sentence(text) {
            return String::new();
        }

        let incremental = extract_incremental(&inner.last_processed_cumulative_text, text);

        if is_final {
            inner.last_processed_text = text.to_string();
        }
        inner.last_processed_cumulative_text = text.to_string();

        incremental
    }
}

fn is_similar(a: &str, b: &str) -> bool {
    similarity(a, b) > SIMILARITY_THRESHOLD
}

fn extract_incremental(previous: &str, current: &str) -> String {
    let current_trimmed = current.trim();
    if previous.is_empty() {
        return current_trimmed.to_string();
    }

    let norm_previous = normalize(previous);
    let norm_current = normalize(current);
    if norm_current == norm_previous {
        return String::new();
    }

    if let Some(suffix) = current.strip_prefix(previous) {
        let suffix = suffix.trim();
        let norm_suffix = normalize(suffix);
        if norm_suffix.is_empty() {
            return String::new();
        }
        let short = norm_suffix.chars().count() < norm_previous.chars().count() / 2;
        if short && is_similar(&norm_suffix, &norm_previous) {
            return String::new();
        }
        return suffix.to_string();
    }

    if is_similar(&norm_current, &norm_previous) {
        return String::new();
    }

    // The transcript was revised as a whole.
    let (head, last) = split_last_sentence(current);
    let norm_last = normalize(last);
    if !norm_last.is_empty() && !is_similar(&norm_last, &norm_previous) {
        return last.to_string();
    }

    // The tail repeats what was processed; anything new sits before it.
    let norm_head = normalize(head);
    if !norm_head.is_empty() && !is_similar(&norm_head, &norm_previous) {
        return head.to_string();
    }

    // Both parts repeat processed text.
    if !norm_last.is_empty() || !norm_head.is_empty() {
        return String::new();
    }
    current_trimmed.to_string()
}
