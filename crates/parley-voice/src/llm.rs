//! Language-model access and conversation history

use crate::classify::{ClassifiedError, ErrorClassifier};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

const SERVICE: &str = "llm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Bounded message history; past the cap only the newest half is kept.
#[derive(Debug)]
pub struct MessageHistory {
    max: usize,
    messages: Mutex<Vec<ChatMessage>>,
}

impl MessageHistory {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(2),
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, message: ChatMessage) {
        let mut messages = self.messages.lock().unwrap_or_else(|p| p.into_inner());
        messages.push(message);
        if messages.len() > self.max {
            let keep = self.max / 2;
            let drop = messages.len() - keep;
            messages.drain(..drop);
            debug!(kept = keep, "Message history trimmed");
        }
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

/// One completion request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmRequest {
    pub system_prompt: String,
    /// Conversation so far, ending with the user message for `text`
    pub history: Vec<ChatMessage>,
    pub text: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// Vendor language model
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn query(&self, request: &LlmRequest) -> anyhow::Result<String>;
}

/// LLM settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub system_prompt: String,
    pub model: String,
    pub temperature: f32,
    /// Reply token limit; also added to the system prompt as a hint
    pub max_tokens: Option<u32>,
    pub request_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            model: String::new(),
            temperature: 0.7,
            max_tokens: None,
            request_timeout_ms: 60_000,
        }
    }
}

/// Builds requests and classifies failures at the LLM boundary
pub struct LlmService {
    backend: Arc<dyn LlmBackend>,
    config: LlmConfig,
    classifier: ErrorClassifier,
    closed: AtomicBool,
}

impl LlmService {
    pub fn new(backend: Arc<dyn LlmBackend>, config: LlmConfig) -> Self {
        Self {
            backend,
            config,
            classifier: ErrorClassifier::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// System prompt with the reply-length hint appended.
    pub fn system_prompt(&self) -> String {
        let base = self.config.system_prompt.trim();
        match self.config.max_tokens {
            Some(limit) if limit > 0 => {
                let hint = format!(
                    "Keep your reply within {} tokens. Be concise and finish your sentences; \
                     if there is a lot to say, lead with the key points.",
                    limit
                );
                if base.is_empty() {
                    hint
                } else {
                    format!("{}\n\n{}", base, hint)
                }
            }
            _ => base.to_string(),
        }
    }

    pub async fn query(&self, history: Vec<ChatMessage>, text: &str) -> Result<String, ClassifiedError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClassifiedError::recoverable(SERVICE, "service closed"));
        }
        if text.trim().is_empty() {
            return Err(ClassifiedError::recoverable(SERVICE, "empty message"));
        }

        let request = LlmRequest {
            system_prompt: self.system_prompt(),
            history,
            text: text.to_string(),
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let result = match tokio::time::timeout(timeout, self.backend.query(&request)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("LLM request timeout after {:?}", timeout)),
        };

        result
            .map(|reply| reply.trim().to_string())
            .map_err(|err| self.classifier.handle(&err, SERVICE))
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("🛑 LLM service closed");
        }
    }
}
