//! Error types for the Parley voice core

use crate::classify::ClassifiedError;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the conversation pipeline
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Channel receive error: {0}")]
    ChannelReceive(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Session closed")]
    SessionClosed,

    #[error(transparent)]
    Service(#[from] ClassifiedError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for VoiceError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        VoiceError::ChannelSend(err.to_string())
    }
}

impl VoiceError {
    /// Whether this error must stop the session from accepting new turns.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VoiceError::Service(e) if e.is_fatal())
    }
}
