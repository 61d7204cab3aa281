//! Reconnect engine with pluggable backoff.
//!
//! [`ReconnectManager`] owns the attempt counter and the "is reconnecting"
//! flag for one connection. A disconnect notification starts a background
//! task that waits the strategy's delay, invokes the reconnect callback and
//! repeats until the callback succeeds, the strategy gives up, or the manager
//! is stopped.

use crate::classify::{ErrorClassifier, ErrorKind};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Decides how long to wait before the next attempt, and whether to try at all
pub trait BackoffStrategy: Send + Sync {
    /// Delay before attempt number `attempt` (0-based), given the last error.
    fn next_delay(&self, attempt: u32, err: &anyhow::Error) -> Duration;

    /// Whether attempt number `attempt` should be made at all.
    fn should_retry(&self, attempt: u32, err: &anyhow::Error) -> bool;
}

/// Settings for [`ExponentialBackoff`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// 0 means unlimited
    pub max_attempts: u32,
    /// Fixed extra delay for rate-limit errors
    pub rate_limit_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 10,
            rate_limit_delay_ms: 10_000,
        }
    }
}

/// Exponential backoff that waits longer on rate-limit errors
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    classifier: ErrorClassifier,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            classifier: ErrorClassifier::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    fn exponential(&self, attempt: u32) -> Duration {
        let factor = self.config.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = self.config.initial_delay_ms as f64 * factor;
        Duration::from_millis(millis.min(u64::MAX as f64) as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32, err: &anyhow::Error) -> Duration {
        let max = Duration::from_millis(self.config.max_delay_ms);
        let base = self.exponential(attempt);

        if self.classifier.is_rate_limit(err) {
            let delay = Duration::from_millis(self.config.rate_limit_delay_ms) + base;
            return delay.min(max * 2);
        }

        base.min(max)
    }

    fn should_retry(&self, attempt: u32, err: &anyhow::Error) -> bool {
        if self.classifier.classify(err, "").kind == ErrorKind::Fatal {
            return false;
        }
        self.config.max_attempts == 0 || attempt < self.config.max_attempts
    }
}

/// Callback that performs one reconnection attempt
pub type ReconnectFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Callback invoked once when a disconnect is first reported
pub type DisconnectFn = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// How a reconnect cycle ended
#[derive(Debug)]
pub enum ReconnectOutcome {
    /// The callback succeeded after `attempts` tries
    Reconnected { attempts: u32 },
    /// The strategy gave up; `error` is the last failure
    Exhausted { attempts: u32, error: anyhow::Error },
    /// The manager was stopped mid-cycle
    Cancelled,
}

#[derive(Debug, Default)]
struct AttemptState {
    attempts: u32,
    reconnecting: bool,
    last_error: Option<String>,
}

struct Inner {
    name: String,
    strategy: Box<dyn BackoffStrategy>,
    on_reconnect: ReconnectFn,
    on_disconnect: Option<DisconnectFn>,
    state: Mutex<AttemptState>,
    cancel: CancellationToken,
}

/// Drives reconnection for a single connection
#[derive(Clone)]
pub struct ReconnectManager {
    inner: Arc<Inner>,
}

impl ReconnectManager {
    pub fn new(
        name: impl Into<String>,
        strategy: impl BackoffStrategy + 'static,
        on_reconnect: ReconnectFn,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                strategy: Box::new(strategy),
                on_reconnect,
                on_disconnect: None,
                state: Mutex::new(AttemptState::default()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Attach a disconnect callback. Must be called before the manager is cloned.
    pub fn with_disconnect_callback(mut self, on_disconnect: DisconnectFn) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.on_disconnect = Some(on_disconnect);
        } else {
            warn!(name = %self.inner.name, "Disconnect callback ignored: manager already shared");
        }
        self
    }

    /// Report a lost connection.
    ///
    /// Returns the handle of the reconnect task, or `None` if a cycle is
    /// already running or the manager has been stopped.
    pub fn notify_disconnect(&self, err: anyhow::Error) -> Option<JoinHandle<ReconnectOutcome>> {
        if self.inner.cancel.is_cancelled() {
            return None;
        }

        {
            let mut state = self.lock_state();
            if state.reconnecting {
                debug!(name = %self.inner.name, "Reconnect already in progress");
                return None;
            }
            state.reconnecting = true;
            state.last_error = Some(format!("{:#}", err));
        }

        warn!(name = %self.inner.name, error = %err, "🔌 Connection lost, scheduling reconnect");
        if let Some(on_disconnect) = &self.inner.on_disconnect {
            on_disconnect(&err);
        }

        let manager = self.clone();
        Some(tokio::spawn(async move { manager.run(err).await }))
    }

    async fn run(&self, mut last_error: anyhow::Error) -> ReconnectOutcome {
        let inner = &self.inner;

        loop {
            let attempt = self.lock_state().attempts;

            if !inner.strategy.should_retry(attempt, &last_error) {
                warn!(name = %inner.name, attempts = attempt, "❌ Giving up reconnecting");
                self.lock_state().reconnecting = false;
                return ReconnectOutcome::Exhausted {
                    attempts: attempt,
                    error: last_error,
                };
            }

            let delay = inner.strategy.next_delay(attempt, &last_error);
            debug!(name = %inner.name, attempt, ?delay, "Waiting before reconnect");

            tokio::select! {
                _ = inner.cancel.cancelled() => {
                    self.lock_state().reconnecting = false;
                    return ReconnectOutcome::Cancelled;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.lock_state().attempts = attempt + 1;

            let result = tokio::select! {
                _ = inner.cancel.cancelled() => {
                    self.lock_state().reconnecting = false;
                    return ReconnectOutcome::Cancelled;
                }
                result = (inner.on_reconnect)() => result,
            };

            match result {
                Ok(()) => {
                    info!(name = %inner.name, attempts = attempt + 1, "✅ Reconnected");
                    self.reset();
                    return ReconnectOutcome::Reconnected {
                        attempts: attempt + 1,
                    };
                }
                Err(e) => {
                    warn!(name = %inner.name, attempt = attempt + 1, error = %e, "Reconnect attempt failed");
                    self.lock_state().last_error = Some(format!("{:#}", e));
                    last_error = e;
                }
            }
        }
    }

    /// Clear the attempt counter after a successful connection.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.attempts = 0;
        state.reconnecting = false;
        state.last_error = None;
    }

    /// Cancel any running cycle and refuse future ones.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.lock_state().reconnecting
    }

    pub fn attempts(&self) -> u32 {
        self.lock_state().attempts
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AttemptState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn quick_config(max_attempts: u32) -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            max_attempts,
            rate_limit_delay_ms: 500,
        }
    }

    #[test]
    fn test_delays_grow_to_max() {
        let backoff = ExponentialBackoff::new(quick_config(0));
        let err = anyhow!("connection reset");
        let delays: Vec<_> = (0..8).map(|a| backoff.next_delay(a, &err)).collect();

        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_rate_limit_delay_is_longer_and_capped() {
        let backoff = ExponentialBackoff::new(quick_config(0));
        let limited = anyhow!("429 too many requests");
        assert_eq!(backoff.next_delay(0, &limited), Duration::from_millis(600));
        assert_eq!(backoff.next_delay(10, &limited), Duration::from_millis(2_000));
    }

    #[test]
    fn test_should_retry_ceiling_and_fatal() {
        let backoff = ExponentialBackoff::new(quick_config(3));
        let err = anyhow!("network unreachable");
        assert!(backoff.should_retry(2, &err));
        assert!(!backoff.should_retry(3, &err));
        assert!(!backoff.should_retry(0, &anyhow!("unauthorized")));

        let unlimited = ExponentialBackoff::new(quick_config(0));
        assert!(unlimited.should_retry(10_000, &err));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_failures_and_resets() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let on_reconnect: ReconnectFn = Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow!("connection refused"))
                } else {
                    Ok(())
                }
            })
        });

        let manager = ReconnectManager::new("test", ExponentialBackoff::new(quick_config(0)), on_reconnect);
        let started = Instant::now();
        let handle = manager
            .notify_disconnect(anyhow!("connection reset"))
            .expect("cycle should start");
        assert!(manager.is_reconnecting());
        assert!(manager.notify_disconnect(anyhow!("again")).is_none());

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, ReconnectOutcome::Reconnected { attempts: 3 }));
        // 100 + 200 + 400 ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(700));
        assert_eq!(manager.attempts(), 0);
        assert!(!manager.is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_at_ceiling() {
        let on_reconnect: ReconnectFn =
            Arc::new(|| Box::pin(async { Err(anyhow!("timeout")) }));
        let manager = ReconnectManager::new("test", ExponentialBackoff::new(quick_config(2)), on_reconnect);

        let outcome = manager
            .notify_disconnect(anyhow!("timeout"))
            .unwrap()
            .await
            .unwrap();
        match outcome {
            ReconnectOutcome::Exhausted { attempts, error } => {
                assert_eq!(attempts, 2);
                assert!(error.to_string().contains("timeout"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!manager.is_reconnecting());
        assert_eq!(manager.last_error().as_deref(), Some("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_cycle() {
        let on_reconnect: ReconnectFn = Arc::new(|| Box::pin(async { Ok(()) }));
        let fired = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&fired);
        let manager = ReconnectManager::new("test", ExponentialBackoff::new(quick_config(0)), on_reconnect)
            .with_disconnect_callback(Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }));

        let handle = manager.notify_disconnect(anyhow!("network down")).unwrap();
        manager.stop();
        assert!(matches!(handle.await.unwrap(), ReconnectOutcome::Cancelled));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(manager.notify_disconnect(anyhow!("network down")).is_none());
    }
}
