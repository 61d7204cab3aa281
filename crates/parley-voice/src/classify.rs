//! Three-tier error classification for collaborator failures.
//!
//! Every error returned by an ASR, LLM or TTS backend passes through
//! [`ErrorClassifier::classify`] exactly once. Above that boundary the pipeline
//! only looks at [`ErrorKind`], never at vendor error strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Severity tier of a classified failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The session must stop accepting turns
    Fatal,
    /// This call failed; the service is still usable
    Recoverable,
    /// Connection-level hiccup, handled by the reconnect engine
    Transient,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Fatal => write!(f, "fatal"),
            ErrorKind::Recoverable => write!(f, "recoverable"),
            ErrorKind::Transient => write!(f, "transient"),
        }
    }
}

/// A collaborator error tagged with its tier and the service that produced it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{service} failed: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub service: String,
    /// Full cause chain of the original error
    pub message: String,
    /// Set when the cause looks like vendor rate limiting
    pub rate_limited: bool,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            service: service.into(),
            message: message.into(),
            rate_limited: false,
        }
    }

    pub fn fatal(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, service, message)
    }

    pub fn recoverable(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Recoverable, service, message)
    }

    pub fn transient(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, service, message)
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

const FATAL_KEYWORDS: &[&str] = &[
    "quota exceeded",
    "quota exhausted",
    "pkg exhausted",
    "allowance has been exhausted",
    "insufficient quota",
    "quota limit",
    "unauthorized",
    "authentication failed",
    "invalid credentials",
    "api key invalid",
    "api key expired",
    "account suspended",
    "account disabled",
    "protocol version mismatch",
];

const TRANSIENT_KEYWORDS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "broken pipe",
    "network",
    "temporary",
    "retry",
];

const RATE_LIMIT_KEYWORDS: &[&str] = &[
    "并发超限",
    "concurrent",
    "rate limit",
    "too many requests",
    "429",
    "4006",
];

/// Keyword-driven classifier
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    fatal: Vec<String>,
    transient: Vec<String>,
    rate_limit: Vec<String>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        let owned = |words: &[&str]| words.iter().map(|w| w.to_string()).collect();
        Self {
            fatal: owned(FATAL_KEYWORDS),
            transient: owned(TRANSIENT_KEYWORDS),
            rate_limit: owned(RATE_LIMIT_KEYWORDS),
        }
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add vendor-specific keywords that mark an error as fatal.
    pub fn with_fatal_keywords<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fatal
            .extend(words.into_iter().map(|w| w.into().to_lowercase()));
        self
    }

    /// Classify an error coming back from `service`.
    ///
    /// Errors that already carry a [`ClassifiedError`] anywhere in their chain
    /// keep their original tier.
    pub fn classify(&self, err: &anyhow::Error, service: &str) -> ClassifiedError {
        if let Some(existing) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<ClassifiedError>())
        {
            return existing.clone();
        }

        let message = format!("{:#}", err);
        let lower = message.to_lowercase();
        let rate_limited = contains_any(&lower, &self.rate_limit);

        let kind = if contains_any(&lower, &self.fatal) {
            ErrorKind::Fatal
        } else if rate_limited || contains_any(&lower, &self.transient) {
            ErrorKind::Transient
        } else {
            ErrorKind::Recoverable
        };

        ClassifiedError {
            kind,
            service: service.to_string(),
            message,
            rate_limited,
        }
    }

    /// Classify and log at the level matching the tier.
    pub fn handle(&self, err: &anyhow::Error, service: &str) -> ClassifiedError {
        let classified = self.classify(err, service);
        match classified.kind {
            ErrorKind::Fatal => {
                error!(service, error = %classified.message, "💀 Fatal service error")
            }
            ErrorKind::Recoverable => {
                warn!(service, error = %classified.message, "⚠️ Recoverable service error")
            }
            ErrorKind::Transient => {
                debug!(service, error = %classified.message, "🔁 Transient service error")
            }
        }
        classified
    }

    pub fn is_fatal(&self, err: &anyhow::Error) -> bool {
        self.classify(err, "").kind == ErrorKind::Fatal
    }

    pub fn is_transient(&self, err: &anyhow::Error) -> bool {
        self.classify(err, "").kind == ErrorKind::Transient
    }

    /// Rate-limit errors get a longer reconnect delay.
    pub fn is_rate_limit(&self, err: &anyhow::Error) -> bool {
        if let Some(existing) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<ClassifiedError>())
        {
            return existing.rate_limited;
        }
        contains_any(&format!("{:#}", err).to_lowercase(), &self.rate_limit)
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|n| haystack.contains(n.as_str()))
}
