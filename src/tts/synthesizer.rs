//! Text-to-speech for assistant replies.
//!
//! [`OpenAiSynthesizer`] calls an OpenAI-compatible `/v1/audio/speech`
//! endpoint and returns MP3 bytes ready for
//! [`PlaybackManager::speak`](crate::audio::PlaybackManager::speak).

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::OpenAiConfig;

#[derive(Debug, Clone, Error)]
pub enum SynthesisError {
    #[error("speech request failed: {0}")]
    Request(String),

    #[error("speech service returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("speech service returned no audio")]
    EmptyAudio,
}

impl From<reqwest::Error> for SynthesisError {
    fn from(e: reqwest::Error) -> Self {
        SynthesisError::Request(e.to_string())
    }
}

/// Object-safe, thread-safe text-to-speech interface.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` into encoded audio (MP3 for the default output).
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError>;
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiSynthesizer {
    pub fn from_config(config: &OpenAiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            config: config.clone(),
        }
    }

    fn request<'a>(&'a self, text: &'a str) -> SpeechRequest<'a> {
        SpeechRequest {
            model: &self.config.speech_model,
            input: text,
            voice: &self.config.voice,
            response_format: "mp3",
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError> {
        let url = format!("{}/v1/audio/speech", self.config.base_url.trim_end_matches('/'));

        let mut req = self.client.post(&url).json(&self.request(text));
        if let Some(key) = self.config.resolved_api_key() {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("tts: speech API error {status}: {body}");
            return Err(SynthesisError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let audio = response.bytes().await?;
        if audio.is_empty() {
            return Err(SynthesisError::EmptyAudio);
        }
        log::debug!("tts: received {} bytes of audio", audio.len());
        Ok(audio.to_vec())
    }
}

// ---------------------------------------------------------------------------
// MockSynthesizer  (test-only)
// ---------------------------------------------------------------------------

/// Returns fixed bytes (or an error) after `delay`, counting calls.
#[cfg(test)]
#[derive(Clone)]
pub struct MockSynthesizer {
    response: Result<Vec<u8>, SynthesisError>,
    delay: std::time::Duration,
    calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl MockSynthesizer {
    pub fn ok() -> Self {
        Self {
            response: Ok(b"ID3-fake-mp3".to_vec()),
            delay: std::time::Duration::ZERO,
            calls: Default::default(),
        }
    }

    pub fn err(error: SynthesisError) -> Self {
        Self {
            response: Err(error),
            ..Self::ok()
        }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>, SynthesisError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.response.clone()
    }
}
