//! Supervised streaming ASR connection
//!
//! [`AsrService`] keeps one vendor streaming session alive for a conversation.
//! A supervisor task connects, watches the backend's liveness flag once per
//! second, and hands failures to the [`ReconnectManager`]. Only a fatal error
//! or shutdown ends the supervisor. Recognition results arrive as
//! [`AsrEvent`]s on a bounded channel instead of through callbacks.

use crate::classify::{ClassifiedError, ErrorClassifier, ErrorKind};
use crate::error::{VoiceError, VoiceResult};
use crate::pool::{AsrConnectionPool, AsrPermit};
use crate::reconnect::{BackoffConfig, ExponentialBackoff, ReconnectFn, ReconnectManager, ReconnectOutcome};
use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SERVICE: &str = "asr";

/// A recognition result
#[derive(Debug, Clone, PartialEq)]
pub struct AsrTranscript {
    pub text: String,
    pub is_final: bool,
    pub duration: Duration,
    pub utterance_id: String,
}

/// Events delivered from the recognizer to the session
#[derive(Debug, Clone, PartialEq)]
pub enum AsrEvent {
    Transcript(AsrTranscript),
    Error(ClassifiedError),
}

/// Where a backend pushes results once streaming is established
#[derive(Debug, Clone)]
pub struct AsrEventSink {
    tx: mpsc::Sender<AsrEvent>,
    classifier: ErrorClassifier,
}

impl AsrEventSink {
    pub async fn transcript(
        &self,
        text: impl Into<String>,
        is_final: bool,
        duration: Duration,
        utterance_id: impl Into<String>,
    ) -> anyhow::Result<()> {
        self.tx
            .send(AsrEvent::Transcript(AsrTranscript {
                text: text.into(),
                is_final,
                duration,
                utterance_id: utterance_id.into(),
            }))
            .await
            .map_err(|_| anyhow!("ASR event channel closed"))
    }

    /// Report a mid-stream failure.
    pub async fn error(&self, err: &anyhow::Error) -> anyhow::Result<()> {
        let classified = self.classifier.classify(err, SERVICE);
        self.tx
            .send(AsrEvent::Error(classified))
            .await
            .map_err(|_| anyhow!("ASR event channel closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Vendor streaming recognizer
#[async_trait]
pub trait AsrBackend: Send + Sync {
    /// Open a streaming session. Returns once audio can be sent; results are
    /// pushed into `events` until the stream ends.
    async fn connect(&self, events: AsrEventSink) -> anyhow::Result<()>;

    async fn send_audio(&self, pcm: &[u8]) -> anyhow::Result<()>;

    /// Whether the vendor stream is still alive.
    fn is_active(&self) -> bool;

    async fn stop(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// ASR connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    pub write_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Pause after a failed connect before the reconnect engine takes over
    pub retry_delay_ms: u64,
    /// Pause after the stream goes inactive before reconnecting
    pub inactive_retry_delay_ms: u64,
    pub activity_poll_ms: u64,
    /// Report an exhausted reconnect cycle as fatal instead of recoverable
    pub escalate_exhausted_as_fatal: bool,
    pub event_buffer: usize,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
            retry_delay_ms: 3_000,
            inactive_retry_delay_ms: 2_000,
            activity_poll_ms: 1_000,
            escalate_exhausted_as_fatal: false,
            event_buffer: 64,
        }
    }
}

struct Connection {
    state: ConnectionState,
    permit: Option<AsrPermit>,
}

struct AsrInner {
    backend: Arc<dyn AsrBackend>,
    config: AsrConfig,
    classifier: ErrorClassifier,
    pool: Option<Arc<AsrConnectionPool>>,
    connection: Mutex<Connection>,
    sink: AsrEventSink,
    reconnect: ReconnectManager,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<VoiceResult<()>>>>,
}

/// One supervised ASR connection
#[derive(Clone)]
pub struct AsrService {
    inner: Arc<AsrInner>,
}

impl AsrService {
    pub fn new(
        backend: Arc<dyn AsrBackend>,
        config: AsrConfig,
        backoff: BackoffConfig,
        pool: Option<Arc<AsrConnectionPool>>,
    ) -> (Self, mpsc::Receiver<AsrEvent>) {
        let (tx, rx) = mpsc::channel(config.event_buffer.max(1));
        let classifier = ErrorClassifier::default();

        let inner = Arc::new_cyclic(|weak: &Weak<AsrInner>| {
            let weak = weak.clone();
            let on_reconnect: ReconnectFn = Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => inner.connect_once().await,
                        None => Err(anyhow!("ASR service dropped")),
                    }
                })
            });

            let reconnect = ReconnectManager::new(
                SERVICE,
                ExponentialBackoff::new(backoff).with_classifier(classifier.clone()),
                on_reconnect,
            )
            .with_disconnect_callback(Arc::new(|err| {
                warn!(error = %err, "🔌 ASR connection lost");
            }));

            AsrInner {
                backend,
                config,
                classifier: classifier.clone(),
                pool,
                connection: Mutex::new(Connection {
                    state: ConnectionState::Disconnected,
                    permit: None,
                }),
                sink: AsrEventSink { tx, classifier },
                reconnect,
                cancel: CancellationToken::new(),
                supervisor: Mutex::new(None),
            }
        });

        (Self { inner }, rx)
    }

    /// Start the supervisor. Calling it again while it runs does nothing.
    pub fn connect(&self) {
        let mut supervisor = self.inner.supervisor.lock().unwrap_or_else(|p| p.into_inner());
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        if self.inner.cancel.is_cancelled() {
            warn!("ASR service already shut down, not reconnecting");
            return;
        }
        let inner = Arc::clone(&self.inner);
        *supervisor = Some(tokio::spawn(async move { inner.supervise().await }));
    }

    /// Stop the supervisor, the reconnect engine and the vendor stream.
    pub async fn disconnect(&self, grace: Duration) -> VoiceResult<()> {
        info!("🛑 Disconnecting ASR");
        self.inner.cancel.cancel();
        self.inner.reconnect.stop();
        self.inner.backend.stop().await;
        self.inner.set_state(ConnectionState::Disconnected, true);

        let handle = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(mut handle) = handle else {
            return Ok(());
        };

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => {
                warn!(error = %join, "ASR supervisor ended abnormally");
                Ok(())
            }
            Err(_) => {
                warn!("ASR supervisor did not stop in time, aborting");
                handle.abort();
                Ok(())
            }
        }
    }

    /// Forward captured audio to the recognizer.
    pub async fn send_audio(&self, pcm: &[u8]) -> Result<(), ClassifiedError> {
        let inner = &self.inner;
        if inner.state() != ConnectionState::Connected {
            return Err(ClassifiedError::transient(SERVICE, "service not connected"));
        }

        let timeout = Duration::from_millis(inner.config.write_timeout_ms);
        let result = match tokio::time::timeout(timeout, inner.backend.send_audio(pcm)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("audio write timeout")),
        };

        result.map_err(|err| {
            if !inner.backend.is_active() {
                debug!("ASR stream inactive after failed write");
                inner.set_state(ConnectionState::Disconnected, false);
            }
            ClassifiedError::transient(SERVICE, format!("send audio failed: {:#}", err))
        })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state() == ConnectionState::Connected
    }

    /// Connected and the vendor stream reports itself alive.
    pub fn activity(&self) -> bool {
        self.is_connected() && self.inner.backend.is_active()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn reconnect_manager(&self) -> &ReconnectManager {
        &self.inner.reconnect
    }
}

impl AsrInner {
    fn state(&self) -> ConnectionState {
        self.connection.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    fn set_state(&self, state: ConnectionState, release_slot: bool) {
        let mut connection = self.connection.lock().unwrap_or_else(|p| p.into_inner());
        connection.state = state;
        if release_slot {
            connection.permit = None;
        }
    }

    async fn connect_once(&self) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(anyhow!("ASR service shutting down"));
        }
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting, false);

        let needs_slot = self
            .connection
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .permit
            .is_none();
        let permit = match (&self.pool, needs_slot) {
            (Some(pool), true) => match pool.acquire_default().await {
                Ok(permit) => Some(permit),
                Err(err) => {
                    self.set_state(ConnectionState::Disconnected, false);
                    return Err(err.into());
                }
            },
            _ => None,
        };

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let result = match tokio::time::timeout(timeout, self.backend.connect(self.sink.clone())).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("ASR connect timeout after {:?}", timeout)),
        };

        let mut connection = self.connection.lock().unwrap_or_else(|p| p.into_inner());
        match result {
            Ok(()) => {
                connection.state = ConnectionState::Connected;
                if permit.is_some() {
                    connection.permit = permit;
                }
                Ok(())
            }
            Err(err) => {
                connection.state = ConnectionState::Disconnected;
                connection.permit = None;
                Err(err)
            }
        }
    }

    async fn sleep_or_cancel(&self, millis: u64) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_millis(millis)) => true,
        }
    }

    async fn report(&self, err: ClassifiedError) {
        if self.sink.tx.send(AsrEvent::Error(err)).await.is_err() {
            debug!("ASR event receiver gone");
        }
    }

    async fn supervise(self: Arc<Self>) -> VoiceResult<()> {
        info!("🎧 ASR supervisor started");

        'supervisor: while !self.cancel.is_cancelled() {
            if self.state() != ConnectionState::Connected {
                if let Err(err) = self.connect_once().await {
                    if let Some(fatal) = self.recover(err).await? {
                        return Err(VoiceError::Service(fatal));
                    }
                    continue;
                }
            }

            info!("✅ ASR connected");
            self.reconnect.reset();

            let mut ticker = tokio::time::interval(Duration::from_millis(self.config.activity_poll_ms.max(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'supervisor,
                    _ = ticker.tick() => {
                        if self.state() != ConnectionState::Connected || !self.backend.is_active() {
                            info!("ASR stream went inactive");
                            self.set_state(ConnectionState::Disconnected, false);
                            break;
                        }
                    }
                }
            }

            if !self.sleep_or_cancel(self.config.inactive_retry_delay_ms).await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected, true);
        info!("🛑 ASR supervisor stopped");
        Ok(())
    }

    /// Handle a failed connect. Returns the error when it is fatal.
    async fn recover(&self, err: anyhow::Error) -> VoiceResult<Option<ClassifiedError>> {
        let classified = self.classifier.handle(&err, SERVICE);
        if classified.is_fatal() {
            error!(error = %classified, "ASR connection failed fatally");
            self.report(classified.clone()).await;
            return Ok(Some(classified));
        }

        if !self.sleep_or_cancel(self.config.retry_delay_ms).await {
            return Ok(None);
        }

        let Some(handle) = self.reconnect.notify_disconnect(err) else {
            return Ok(None);
        };

        match handle.await {
            Ok(ReconnectOutcome::Reconnected { attempts }) => {
                debug!(attempts, "ASR reconnect cycle succeeded");
                Ok(None)
            }
            Ok(ReconnectOutcome::Exhausted { attempts, error }) => {
                let mut last = self.classifier.classify(&error, SERVICE);
                if !last.is_fatal() {
                    last.kind = if self.config.escalate_exhausted_as_fatal {
                        ErrorKind::Fatal
                    } else {
                        ErrorKind::Recoverable
                    };
                    last.message = format!("reconnect gave up after {} attempts: {}", attempts, last.message);
                }
                self.report(last.clone()).await;
                if last.is_fatal() {
                    return Ok(Some(last));
                }
                self.reconnect.reset();
                Ok(None)
            }
            Ok(ReconnectOutcome::Cancelled) => Ok(None),
            Err(join) => {
                warn!(error = %join, "ASR reconnect task failed");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct ScriptedAsr {
        connects: Mutex<VecDeque<anyhow::Result<()>>>,
        attempts: AtomicU32,
        active: AtomicBool,
        sent: Mutex<Vec<usize>>,
    }

    impl ScriptedAsr {
        fn new(script: Vec<anyhow::Result<()>>) -> Arc<Self> {
            Arc::new(Self {
                connects: Mutex::new(script.into()),
                attempts: AtomicU32::new(0),
                active: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AsrBackend for ScriptedAsr {
        async fn connect(&self, events: AsrEventSink) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let next = self.connects.lock().unwrap().pop_front().unwrap_or(Ok(()));
            if next.is_ok() {
                self.active.store(true, Ordering::SeqCst);
                events.transcript("ready", false, Duration::ZERO, "0").await?;
            }
            next
        }

        async fn send_audio(&self, pcm: &[u8]) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(pcm.len());
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        async fn stop(&self) {
            self.active.store(false, Ordering::SeqCst);
        }
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 400,
            multiplier: 2.0,
            max_attempts: 2,
            rate_limit_delay_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_send_before_connect_is_transient() {
        let backend = ScriptedAsr::new(vec![]);
        let (service, _rx) = AsrService::new(backend, AsrConfig::default(), fast_backoff(), None);
        let err = service.send_audio(&[0, 0]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
        assert!(!service.activity());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_after_transient_failure() {
        let backend = ScriptedAsr::new(vec![Err(anyhow!("connection refused"))]);
        let (service, mut rx) = AsrService::new(backend.clone(), AsrConfig::default(), fast_backoff(), None);

        service.connect();
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, AsrEvent::Transcript(ref t) if t.text == "ready"));
        assert_eq!(backend.attempts.load(Ordering::SeqCst), 2);
        assert!(service.is_connected());

        service.send_audio(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(*backend.sent.lock().unwrap(), vec![4]);

        service.disconnect(Duration::from_secs(2)).await.unwrap();
        assert_eq!(service.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_supervisor() {
        let backend = ScriptedAsr::new(vec![Err(anyhow!("api key invalid"))]);
        let (service, mut rx) = AsrService::new(backend, AsrConfig::default(), fast_backoff(), None);

        service.connect();
        match rx.recv().await.unwrap() {
            AsrEvent::Error(err) => assert!(err.is_fatal()),
            other => panic!("unexpected event: {:?}", other),
        }
        let result = service.disconnect(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ref e) if e.is_fatal()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reconnect_is_reported_and_retried() {
        let backend = ScriptedAsr::new(vec![
            Err(anyhow!("timeout")),
            Err(anyhow!("timeout")),
            Err(anyhow!("timeout")),
        ]);
        let (service, mut rx) = AsrService::new(backend.clone(), AsrConfig::default(), fast_backoff(), None);

        service.connect();
        match rx.recv().await.unwrap() {
            AsrEvent::Error(err) => {
                assert_eq!(err.kind, ErrorKind::Recoverable);
                assert!(err.message.contains("gave up"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), AsrEvent::Transcript(_)));
        assert!(service.is_connected());
        service.disconnect(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_stream_is_reconnected() {
        let backend = ScriptedAsr::new(vec![]);
        let (service, mut rx) = AsrService::new(backend.clone(), AsrConfig::default(), fast_backoff(), None);

        service.connect();
        rx.recv().await.unwrap();
        backend.active.store(false, Ordering::SeqCst);

        rx.recv().await.unwrap();
        assert_eq!(backend.attempts.load(Ordering::SeqCst), 2);
        service.disconnect(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_slot_held_while_connected() {
        let pool = AsrConnectionPool::new(crate::pool::PoolConfig {
            max_concurrent: 1,
            ..Default::default()
        });
        let backend = ScriptedAsr::new(vec![]);
        let (service, mut rx) =
            AsrService::new(backend, AsrConfig::default(), fast_backoff(), Some(Arc::clone(&pool)));

        service.connect();
        rx.recv().await.unwrap();
        assert_eq!(pool.current_count(), 1);

        service.disconnect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.current_count(), 0);
    }
}
