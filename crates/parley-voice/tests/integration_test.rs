//! End-to-end tests of a session against scripted vendor backends
//!
//! All tests run on a paused clock, so playback pacing and drain delays
//! complete instantly.

use anyhow::anyhow;
use async_trait::async_trait;
use parley_voice::{
    AsrBackend, AsrEventSink, AudioFormat, FrameEncoder, LlmBackend, LlmRequest, Session,
    SessionServices, SpeechClassifier, Transport, TtsBackend, TtsSink, VoiceConfig,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Text(serde_json::Value),
    Audio(usize),
}

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<Sent>>,
    closed: AtomicBool,
}

impl RecordingTransport {
    fn types(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| match s {
                Sent::Text(v) => v["type"].as_str().unwrap_or_default().to_string(),
                Sent::Audio(_) => "audio".to_string(),
            })
            .collect()
    }

    fn count(&self, kind: &str) -> usize {
        self.types().iter().filter(|t| t.as_str() == kind).count()
    }

    fn texts_of(&self, kind: &str) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| match s {
                Sent::Text(v) if v["type"] == kind => Some(v.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_text(&self, text: String) -> anyhow::Result<()> {
        let value = serde_json::from_str(&text)?;
        self.sent.lock().unwrap().push(Sent::Text(value));
        Ok(())
    }

    async fn send_binary(&self, data: Vec<u8>) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(Sent::Audio(data.len()));
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Recognizer whose results are pushed by the test
#[derive(Default)]
struct ScriptedAsr {
    sink: Mutex<Option<AsrEventSink>>,
    fail_with: Mutex<Option<String>>,
    audio_frames: AtomicUsize,
}

impl ScriptedAsr {
    async fn say(&self, text: &str, is_final: bool) {
        let sink = self.sink.lock().unwrap().clone().expect("ASR not connected");
        sink.transcript(text, is_final, Duration::from_millis(500), "utt-1")
            .await
            .unwrap();
    }
}

#[async_trait]
impl AsrBackend for ScriptedAsr {
    async fn connect(&self, events: AsrEventSink) -> anyhow::Result<()> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(anyhow!(message));
        }
        *self.sink.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn send_audio(&self, _pcm: &[u8]) -> anyhow::Result<()> {
        self.audio_frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    async fn stop(&self) {
        self.sink.lock().unwrap().take();
    }
}

#[derive(Default)]
struct ScriptedLlm {
    calls: AtomicUsize,
    fail_next: Mutex<Option<String>>,
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    async fn query(&self, request: &LlmRequest) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.text.clone());
        if let Some(message) = self.fail_next.lock().unwrap().take() {
            return Err(anyhow!(message));
        }
        Ok(format!("  回复：{}  ", request.text))
    }
}

/// Synthesizer emitting `chunks` frames of PCM, one every 100ms
struct ScriptedTts {
    chunks: usize,
    format: AudioFormat,
    sinks: Mutex<Vec<TtsSink>>,
    previous_cancelled_at_start: Mutex<Vec<bool>>,
}

impl ScriptedTts {
    fn new(chunks: usize, format: AudioFormat) -> Self {
        Self {
            chunks,
            format,
            sinks: Mutex::new(Vec::new()),
            previous_cancelled_at_start: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TtsBackend for ScriptedTts {
    async fn synthesize(&self, _text: &str, sink: TtsSink) -> anyhow::Result<()> {
        {
            let mut sinks = self.sinks.lock().unwrap();
            if let Some(previous) = sinks.last() {
                self.previous_cancelled_at_start
                    .lock()
                    .unwrap()
                    .push(previous.is_cancelled());
            }
            sinks.push(sink.clone());
        }

        for _ in 0..self.chunks {
            sink.push(loud_pcm(1920, 3000)).await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn loud_pcm(bytes: usize, amplitude: i16) -> Vec<u8> {
    (0..bytes / 2)
        .flat_map(|i| {
            let sample = if i % 2 == 0 { amplitude } else { -amplitude };
            sample.to_le_bytes()
        })
        .collect()
}

fn constant_pcm(bytes: usize, amplitude: i16) -> Vec<u8> {
    (0..bytes / 2).flat_map(|_| amplitude.to_le_bytes()).collect()
}

/// Treats any frame whose samples vary as speech
struct VaryingIsSpeech;

impl SpeechClassifier for VaryingIsSpeech {
    fn is_speech(&self, samples: &[i16]) -> bool {
        samples.windows(2).any(|w| w[0] != w[1])
    }
}

struct Harness {
    session: Session,
    transport: Arc<RecordingTransport>,
    asr: Arc<ScriptedAsr>,
    llm: Arc<ScriptedLlm>,
    tts: Arc<ScriptedTts>,
}

fn harness(tts_chunks: usize) -> Harness {
    harness_with(tts_chunks, AudioFormat::default(), None)
}

fn harness_with(
    tts_chunks: usize,
    tts_format: AudioFormat,
    speech: Option<Arc<dyn SpeechClassifier>>,
) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let transport = Arc::new(RecordingTransport::default());
    let asr = Arc::new(ScriptedAsr::default());
    let llm = Arc::new(ScriptedLlm::default());
    let tts = Arc::new(ScriptedTts::new(tts_chunks, tts_format));
    let encoder: Arc<dyn FrameEncoder> =
        Arc::new(|pcm: &[u8]| -> anyhow::Result<Vec<Vec<u8>>> { Ok(vec![pcm[..16].to_vec()]) });

    let session = Session::new(
        "session-1",
        &VoiceConfig::default(),
        SessionServices {
            asr: asr.clone(),
            llm: llm.clone(),
            tts: tts.clone(),
            transport: transport.clone(),
            encoder: Some(encoder),
            pool: None,
            speech,
        },
    )
    .expect("session builds");

    Harness {
        session,
        transport,
        asr,
        llm,
        tts,
    }
}

async fn settle(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[tokio::test(start_paused = true)]
async fn test_partials_then_final_trigger_one_turn() {
    let h = harness(3);
    h.session.start().await.unwrap();
    settle(50).await;
    assert!(h.session.asr().is_connected());

    h.asr.say("你好", false).await;
    h.asr.say("你好，", false).await;
    h.asr.say("你好，今天", false).await;
    h.asr.say("你好，今天天气怎么样？", true).await;
    settle(5_000).await;

    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.llm.prompts.lock().unwrap()[0], "你好，今天天气怎么样？");

    let captions = h.transport.texts_of("asr_result");
    assert_eq!(captions.len(), 1);
    assert_eq!(captions[0]["text"], "你好，今天天气怎么样？");

    let replies = h.transport.texts_of("llm_response");
    assert_eq!(replies[0]["text"], "回复：你好，今天天气怎么样？");

    let types = h.transport.types();
    let start = types.iter().position(|t| t == "tts_start").unwrap();
    let end = types.iter().position(|t| t == "tts_end").unwrap();
    let audio: Vec<_> = types
        .iter()
        .enumerate()
        .filter(|(_, t)| t.as_str() == "audio")
        .map(|(i, _)| i)
        .collect();
    // three real frames plus five padding frames
    assert_eq!(audio.len(), 8);
    assert!(audio.iter().all(|&i| i > start && i < end));

    let tts_start = &h.transport.texts_of("tts_start")[0];
    assert_eq!(tts_start["sampleRate"], 16000);
    assert!(!h.session.state().is_processing());
    assert_eq!(h.session.orchestrator().history().len(), 2);

    h.session.stop().await;
    assert!(h.transport.closed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_filler_is_captioned_but_not_answered() {
    let h = harness(1);
    h.session.start().await.unwrap();
    settle(50).await;

    h.asr.say("嗯。", true).await;
    settle(1_000).await;

    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.transport.count("asr_result"), 1);
    assert_eq!(h.transport.count("tts_start"), 0);

    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_new_utterance_interrupts_reply() {
    let h = harness(30);
    h.session.start().await.unwrap();
    settle(50).await;

    h.asr.say("讲个长故事吧。", true).await;
    settle(800).await;
    assert!(h.session.state().is_tts_playing());

    h.asr.say("算了，换个话题。", true).await;
    settle(10_000).await;

    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 2);
    assert_eq!(*h.tts.previous_cancelled_at_start.lock().unwrap(), vec![true]);

    let types = h.transport.types();
    let starts: Vec<_> = types.iter().enumerate().filter(|(_, t)| *t == "tts_start").map(|(i, _)| i).collect();
    let ends: Vec<_> = types.iter().enumerate().filter(|(_, t)| *t == "tts_end").map(|(i, _)| i).collect();
    assert_eq!(starts.len(), 2);
    assert_eq!(ends.len(), 2);
    assert!(ends[0] < starts[1]);

    // the interrupted reply never finished all 30 frames
    let first_reply_audio = types[starts[0]..ends[0]].iter().filter(|t| *t == "audio").count();
    assert!(first_reply_audio < 30);

    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_stops_playback_and_forwards_audio() {
    let h = harness_with(30, AudioFormat::default(), Some(Arc::new(VaryingIsSpeech)));
    h.session.start().await.unwrap();
    settle(50).await;

    h.asr.say("给我读一首诗。", true).await;
    settle(800).await;
    assert!(h.session.state().is_tts_playing());

    let before = h.asr.audio_frames.load(Ordering::SeqCst);

    // Loud but not speech: playback continues, the frame still reaches ASR.
    h.session.handle_audio(&constant_pcm(640, 8000)).await.unwrap();
    assert!(h.session.state().is_tts_playing());
    assert_eq!(h.asr.audio_frames.load(Ordering::SeqCst), before + 1);

    h.session.handle_audio(&loud_pcm(640, 8000)).await.unwrap();
    assert!(!h.session.state().is_tts_playing());
    assert_eq!(h.asr.audio_frames.load(Ordering::SeqCst), before + 2);

    settle(2_000).await;
    assert_eq!(h.transport.count("tts_end"), 1);
    assert!(!h.session.state().is_processing());

    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_fatal_llm_error_blocks_until_new_session() {
    let h = harness(1);
    *h.llm.fail_next.lock().unwrap() = Some("insufficient quota for this account".into());
    h.session.start().await.unwrap();
    settle(50).await;

    h.asr.say("你好。", true).await;
    settle(500).await;

    let errors = h.transport.texts_of("error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["fatal"], true);
    assert!(errors[0]["message"].as_str().unwrap().starts_with("llm failed"));
    assert!(h.session.state().is_fatal_error());

    h.asr.say("还在吗？", true).await;
    h.session.handle_audio(&loud_pcm(640, 8000)).await.unwrap();
    settle(500).await;
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.asr.audio_frames.load(Ordering::SeqCst), 0);

    h.session.handle_text(r#"{"type":"new_session"}"#).await.unwrap();
    settle(50).await;
    assert_eq!(h.transport.count("session_cleared"), 1);
    assert!(!h.session.state().is_fatal_error());

    h.asr.say("现在好了吗？", true).await;
    settle(5_000).await;
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.transport.count("tts_end"), 1);

    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_ping_and_unknown_messages() {
    let h = harness(1);
    tokio_test::assert_ok!(h.session.start().await);

    tokio_test::assert_ok!(
        h.session
            .handle_text(r#"{"type":"ping","timestamp":1700000000}"#)
            .await
    );
    tokio_test::assert_ok!(h.session.handle_text(r#"{"type":"dance"}"#).await);
    settle(50).await;

    let pongs = h.transport.texts_of("pong");
    assert_eq!(pongs.len(), 1);
    assert_eq!(pongs[0]["timestamp"], 1700000000);
    assert_eq!(h.transport.types()[0], "connected");

    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_fatal_asr_connect_blocks_session() {
    let h = harness(1);
    *h.asr.fail_with.lock().unwrap() = Some("401 unauthorized".into());
    h.session.start().await.unwrap();
    settle(500).await;

    assert!(h.session.state().is_fatal_error());
    let errors = h.transport.texts_of("error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["fatal"], true);

    h.session.stop().await;
    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_echo_ring_uses_playback_format() {
    let playback = AudioFormat {
        sample_rate: 24000,
        ..Default::default()
    };
    let h = harness_with(1, playback, None);
    assert_eq!(h.session.echo().format(), playback);
    assert_ne!(h.session.echo().format(), VoiceConfig::default().session.input_format());

    h.session.start().await.unwrap();
    settle(50).await;
    h.asr.say("你好。", true).await;
    settle(2_000).await;

    let tts_start = &h.transport.texts_of("tts_start")[0];
    assert_eq!(tts_start["sampleRate"], 24000);

    h.session.stop().await;
}
