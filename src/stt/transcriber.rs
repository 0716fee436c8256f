//! Core transcription trait and the hosted Whisper implementation.
//!
//! [`Transcriber`] is what the engine calls once an utterance is complete.
//! It receives the 16 kHz mono WAV bytes produced by the capture session and
//! returns plain text; an empty string means nothing intelligible was said.
//!
//! [`OpenAiTranscriber`] posts the WAV to an OpenAI-compatible
//! `/v1/audio/transcriptions` endpoint.
//!
//! [`MockTranscriber`] (available under `#[cfg(test)]`) returns a configured
//! response after an optional delay and records when it was called.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::config::OpenAiConfig;

// ---------------------------------------------------------------------------
// TranscriptionError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum TranscriptionError {
    #[error("transcription request failed: {0}")]
    Request(String),

    #[error("transcription service returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("failed to parse transcription response: {0}")]
    Parse(String),

    /// The audio could not be read (local engines only).
    #[error("invalid audio: {0}")]
    Audio(String),

    /// The local model failed to load or run.
    #[error("transcription engine error: {0}")]
    Engine(String),
}

impl From<reqwest::Error> for TranscriptionError {
    fn from(e: reqwest::Error) -> Self {
        TranscriptionError::Request(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Transcriber trait
// ---------------------------------------------------------------------------

/// Object-safe, thread-safe speech-to-text interface.
///
/// `audio` is a complete WAV file.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, TranscriptionError>;
}

// ---------------------------------------------------------------------------
// OpenAiTranscriber
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

pub struct OpenAiTranscriber {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiTranscriber {
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

    fn form(&self, audio: &[u8]) -> Result<reqwest::multipart::Form, TranscriptionError> {
        let file = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Request(e.to_string()))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.config.transcription_model.clone());
        if let Some(language) = self.config.language.as_deref().filter(|l| !l.is_empty()) {
            form = form.text("language", language.to_string());
        }
        Ok(form)
    }
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, TranscriptionError> {
        log::debug!("stt: uploading {} bytes", audio.len());

        let url = format!(
            "{}/v1/audio/transcriptions",
            self.config.base_url.trim_end_matches('/')
        );
        let mut req = self.client.post(&url).multipart(self.form(audio)?);
        if let Some(key) = self.config.resolved_api_key() {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("stt: transcription API error {status}: {body}");
            return Err(TranscriptionError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let result: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| TranscriptionError::Parse(e.to_string()))?;

        log::info!("stt: transcript \"{}\"", result.text);
        Ok(result.text)
    }
}

// ---------------------------------------------------------------------------
// MockTranscriber  (test-only)
// ---------------------------------------------------------------------------

/// Returns a configured transcript after `delay` (tokio time).
///
/// # Example
///
/// ```rust,ignore
/// let stt = MockTranscriber::ok("hello");
/// assert_eq!(stt.transcribe(b"wav").await.unwrap(), "hello");
/// assert_eq!(stt.calls().len(), 1);
/// ```
#[cfg(test)]
#[derive(Clone)]
pub struct MockTranscriber {
    response: Result<String, TranscriptionError>,
    delay: std::time::Duration,
    calls: std::sync::Arc<std::sync::Mutex<Vec<tokio::time::Instant>>>,
}

#[cfg(test)]
impl MockTranscriber {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            response: Ok(text.into()),
            delay: std::time::Duration::ZERO,
            calls: Default::default(),
        }
    }

    pub fn err(error: TranscriptionError) -> Self {
        Self {
            response: Err(error),
            ..Self::ok("")
        }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    /// When each call started.
    pub fn calls(&self) -> Vec<tokio::time::Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, _audio: &[u8]) -> Result<String, TranscriptionError> {
        self.calls.lock().unwrap().push(tokio::time::Instant::now());
        tokio::time::sleep(self.delay).await;
        self.response.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_form_without_language() {
        let stt = OpenAiTranscriber::from_config(&OpenAiConfig::default());
        assert!(stt.form(b"RIFF").is_ok());
    }

    #[test]
    fn builds_form_with_language() {
        let config = OpenAiConfig {
            language: Some("en".into()),
            ..OpenAiConfig::default()
        };
        let stt = OpenAiTranscriber::from_config(&config);
        assert!(stt.form(b"RIFF").is_ok());
    }

    #[test]
    fn transcriber_is_object_safe() {
        let stt: Box<dyn Transcriber> = Box::new(OpenAiTranscriber::from_config(&OpenAiConfig::default()));
        drop(stt);
    }

    #[tokio::test(start_paused = true)]
    async fn mock_returns_configured_result_after_delay() {
        let stt = MockTranscriber::ok("hello").with_delay(std::time::Duration::from_secs(1));
        let start = tokio::time::Instant::now();
        assert_eq!(stt.transcribe(b"wav").await.unwrap(), "hello");
        assert_eq!(start.elapsed(), std::time::Duration::from_secs(1));
        assert_eq!(stt.calls(), vec![start]);

        let failing = MockTranscriber::err(TranscriptionError::Request("offline".into()));
        assert!(matches!(
            failing.transcribe(b"wav").await,
            Err(TranscriptionError::Request(_))
        ));
    }
}
