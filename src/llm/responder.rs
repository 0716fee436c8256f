//! Reply generation: the `ResponseGenerator` trait and its chat-completions
//! implementation.
//!
//! [`ChatCompletionResponder`] calls any OpenAI-compatible
//! `/v1/chat/completions` endpoint.  Connection details come from
//! [`OpenAiConfig`], the fallback reply from [`PersonaConfig`].

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::{OpenAiConfig, PersonaConfig};
use crate::llm::history::ConversationTurn;

// ---------------------------------------------------------------------------
// GenerationError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    /// The provider answered 429.
    #[error("reply service is rate limiting requests")]
    RateLimited,

    /// The provider rejected the credentials (401/403).
    #[error("reply service rejected the API key")]
    Unauthorized,

    #[error("reply request failed: {0}")]
    Unknown(String),
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        GenerationError::Unknown(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// ResponseGenerator trait
// ---------------------------------------------------------------------------

/// Produces the assistant's next reply for an ordered context.
///
/// `history` starts with the system turn and ends with the user turn being
/// answered.  Implementors must be `Send + Sync` so they can live behind an
/// `Arc<dyn ResponseGenerator>`.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn complete(&self, history: &[ConversationTurn]) -> Result<String, GenerationError>;
}

// ---------------------------------------------------------------------------
// ChatCompletionResponder
// ---------------------------------------------------------------------------

pub struct ChatCompletionResponder {
    client: reqwest::Client,
    config: OpenAiConfig,
    fallback_reply: String,
}

impl ChatCompletionResponder {
    pub fn from_config(config: &OpenAiConfig, persona: &PersonaConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            config: config.clone(),
            fallback_reply: persona.fallback_reply.clone(),
        }
    }

    fn request_body(&self, history: &[ConversationTurn]) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = history
            .iter()
            .map(|turn| {
                serde_json::json!({
                    "role":    turn.role().as_str(),
                    "content": turn.text()
                })
            })
            .collect();

        serde_json::json!({
            "model":       self.config.chat_model,
            "messages":    messages,
            "stream":      false,
            "temperature": self.config.temperature,
            "max_tokens":  self.config.max_tokens
        })
    }
}

#[async_trait]
impl ResponseGenerator for ChatCompletionResponder {
    async fn complete(&self, history: &[ConversationTurn]) -> Result<String, GenerationError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url.trim_end_matches('/'));

        let mut req = self.client.post(&url).json(&self.request_body(history));
        if let Some(key) = self.config.resolved_api_key() {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GenerationError::Unknown(format!("malformed response: {e}")))?;

        Ok(reply_text(&json).unwrap_or_else(|| {
            log::warn!("responder: empty completion, using fallback reply");
            self.fallback_reply.clone()
        }))
    }
}

/// Map a non-success HTTP status to the matching error.
fn classify_status(status: StatusCode) -> Option<GenerationError> {
    match status {
        s if s.is_success() => None,
        StatusCode::TOO_MANY_REQUESTS => Some(GenerationError::RateLimited),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(GenerationError::Unauthorized),
        s => Some(GenerationError::Unknown(format!("HTTP {s}"))),
    }
}

/// First choice's trimmed content, `None` when missing or blank.
fn reply_text(json: &serde_json::Value) -> Option<String> {
    json["choices"][0]["message"]["content"]
        .as_str()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// MockResponder  (test-only)
// ---------------------------------------------------------------------------

/// Returns a configured reply after `delay` and records every context it
/// was asked to answer.
#[cfg(test)]
#[derive(Clone)]
pub struct MockResponder {
    response: Result<String, GenerationError>,
    delay: std::time::Duration,
    contexts: std::sync::Arc<std::sync::Mutex<Vec<Vec<ConversationTurn>>>>,
}

#[cfg(test)]
impl MockResponder {
    pub fn ok(reply: impl Into<String>) -> Self {
        Self {
            response: Ok(reply.into()),
            delay: std::time::Duration::ZERO,
            contexts: Default::default(),
        }
    }

    pub fn err(error: GenerationError) -> Self {
        Self {
            response: Err(error),
            ..Self::ok("")
        }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn contexts(&self) -> Vec<Vec<ConversationTurn>> {
        self.contexts.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl ResponseGenerator for MockResponder {
    async fn complete(&self, history: &[ConversationTurn]) -> Result<String, GenerationError> {
        self.contexts.lock().unwrap().push(history.to_vec());
        tokio::time::sleep(self.delay).await;
        self.response.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
