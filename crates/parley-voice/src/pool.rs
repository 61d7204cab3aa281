//! Admission control for concurrent ASR connections
//!
//! ASR vendors cap concurrent streaming sessions. One pool is created at
//! startup and shared by every session; a connection holds an [`AsrPermit`]
//! for as long as it is open.

use crate::classify::ClassifiedError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

const SERVICE: &str = "asr_pool";

/// Pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_concurrent: usize,
    /// Callers allowed to wait for a slot at once (default: 100)
    pub max_waiters: usize,
    /// How long a connection waits for a slot (default: 5s)
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_waiters: 100,
            acquire_timeout_ms: 5_000,
        }
    }
}

/// Process-wide counting semaphore for ASR connections
#[derive(Debug)]
pub struct AsrConnectionPool {
    semaphore: Arc<Semaphore>,
    config: PoolConfig,
    waiting: AtomicUsize,
}

/// A held connection slot; dropping it frees the slot
#[derive(Debug)]
pub struct AsrPermit {
    _permit: OwnedSemaphorePermit,
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsrConnectionPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            waiting: AtomicUsize::new(0),
        })
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<AsrPermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        debug!(current = self.current_count(), max = self.max_concurrent(), "ASR pool slot acquired");
        Some(AsrPermit { _permit: permit })
    }

    /// Wait in FIFO order until a slot frees.
    pub async fn acquire(&self) -> Result<AsrPermit, ClassifiedError> {
        if let Some(permit) = self.try_acquire() {
            return Ok(permit);
        }
        let _guard = self.enqueue()?;
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ClassifiedError::fatal(SERVICE, "connection pool closed"))?;
        Ok(AsrPermit { _permit: permit })
    }

    /// Wait at most `timeout` for a slot.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<AsrPermit, ClassifiedError> {
        if let Some(permit) = self.try_acquire() {
            return Ok(permit);
        }

        warn!(
            current = self.current_count(),
            max = self.max_concurrent(),
            "⏳ ASR pool full, waiting for a slot"
        );

        let _guard = self.enqueue()?;
        match tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(AsrPermit { _permit: permit }),
            Ok(Err(_)) => Err(ClassifiedError::fatal(SERVICE, "connection pool closed")),
            Err(_) => Err(ClassifiedError::recoverable(
                SERVICE,
                "connection pool is full, try again later",
            )),
        }
    }

    /// Wait for the configured default timeout.
    pub async fn acquire_default(&self) -> Result<AsrPermit, ClassifiedError> {
        self.acquire_timeout(Duration::from_millis(self.config.acquire_timeout_ms))
            .await
    }

    /// Return a slot explicitly.
    pub fn release(&self, permit: AsrPermit) {
        drop(permit);
        debug!(current = self.current_count(), "ASR pool slot released");
    }

    fn enqueue(&self) -> Result<WaitGuard<'_>, ClassifiedError> {
        let waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = WaitGuard(&self.waiting);
        if waiting >= self.config.max_waiters {
            return Err(ClassifiedError::recoverable(
                SERVICE,
                "connection pool and wait queue are full",
            ));
        }
        Ok(guard)
    }

    pub fn current_count(&self) -> usize {
        self.config
            .max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}
