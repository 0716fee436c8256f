//! Engine settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across tasks.
//! Missing keys fall back to their defaults (`#[serde(default)]`), so an
//! older `settings.toml` keeps loading after new fields are added.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// VadConfig
// ---------------------------------------------------------------------------

/// Settings for the voice-activity monitor that decides when a turn ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Input level in dBFS below which a sample counts as silence.
    pub silence_threshold_db: f32,
    /// Continuous silence (ms) required to conclude the user has stopped.
    pub silence_duration_ms: u64,
    /// A turn never ends on silence before it has recorded this long (ms).
    pub min_recording_ms: u64,
    /// Hard cap on a single recording (seconds); reaching it ends the utterance.
    pub max_recording_secs: u64,
    /// Level polling period (ms).
    pub poll_interval_ms: u64,
    /// How long the device may deliver no audio before the turn fails (ms).
    pub no_signal_timeout_ms: u64,
    /// Skip transcription when no tick of the recording was classified as speech.
    pub discard_silent_recordings: bool,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_threshold_db: -40.0,
            silence_duration_ms: 2_000,
            min_recording_ms: 1_000,
            max_recording_secs: 60,
            poll_interval_ms: 100,
            no_signal_timeout_ms: 2_000,
            discard_silent_recordings: true,
        }
    }
}

impl VadConfig {
    pub fn silence_duration(&self) -> Duration {
        Duration::from_millis(self.silence_duration_ms)
    }

    pub fn min_recording(&self) -> Duration {
        Duration::from_millis(self.min_recording_ms)
    }

    pub fn max_recording(&self) -> Duration {
        Duration::from_secs(self.max_recording_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        // A zero period would make `tokio::time::interval` panic.
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn no_signal_timeout(&self) -> Duration {
        Duration::from_millis(self.no_signal_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// HistoryConfig
// ---------------------------------------------------------------------------

/// Settings for the bounded dialogue context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Number of non-system turns kept after the system turn.
    pub max_turns: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_turns: 10 }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Turn-engine behaviour: voice-activity policy, context size and timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub vad: VadConfig,
    pub history: HistoryConfig,
    /// Upper bound for the transcription call (seconds).
    pub transcription_timeout_secs: u64,
    /// Upper bound for the reply-generation call (seconds).
    pub reply_timeout_secs: u64,
    /// Upper bound for the speech-synthesis call (seconds).
    pub synthesis_timeout_secs: u64,
    /// Speak replies aloud unless a turn overrides it.
    pub speak_replies: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            history: HistoryConfig::default(),
            transcription_timeout_secs: 30,
            reply_timeout_secs: 60,
            synthesis_timeout_secs: 30,
            speak_replies: true,
        }
    }
}

impl EngineConfig {
    pub fn transcription_timeout(&self) -> Duration {
        Duration::from_secs(self.transcription_timeout_secs)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// OpenAiConfig
// ---------------------------------------------------------------------------

/// Connection settings for the OpenAI-compatible collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    /// Base URL of the API, without the `/v1/...` suffix.
    pub base_url: String,
    /// API key. `None` falls back to the `OPENAI_API_KEY` environment variable.
    pub api_key: Option<String>,
    /// Chat model used for replies.
    pub chat_model: String,
    /// Sampling temperature for replies.
    pub temperature: f32,
    /// Maximum tokens per reply.
    pub max_tokens: u32,
    /// Transcription model.
    pub transcription_model: String,
    /// Spoken-language hint passed to transcription (ISO-639-1), if any.
    pub language: Option<String>,
    /// Speech synthesis model.
    pub speech_model: String,
    /// Synthesis voice name.
    pub voice: String,
    /// Connect + response timeout for each HTTP request (seconds).
    pub http_timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key: None,
            chat_model: "gpt-4".into(),
            temperature: 0.7,
            max_tokens: 500,
            transcription_model: "whisper-1".into(),
            language: None,
            speech_model: "tts-1".into(),
            voice: "onyx".into(),
            http_timeout_secs: 90,
        }
    }
}

impl OpenAiConfig {
    /// The configured key, or `OPENAI_API_KEY` when the file has none.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.is_empty())
    }
}

// ---------------------------------------------------------------------------
// PersonaConfig
// ---------------------------------------------------------------------------

const DEFAULT_SYSTEM_PROMPT: &str = "You are a trained counselor. Your name is Solomon. \
You're also an expert in the NIV Bible. When somebody talks to you or asks you questions, \
respond as a trained counselor providing guidance and thoughtful insights. When appropriate, \
include a relevant verse from the NIV Bible formatted as \"[Book Chapter:Verse] (NIV): [verse text]\". \
Always maintain a compassionate and understanding tone, address both the emotional and \
spiritual sides of the person's concerns, and keep answers concise because they will be \
read aloud. End with a gentle follow-up question that helps the person explore their own \
thoughts and feelings. Don't sign your responses.";

const DEFAULT_FALLBACK_REPLY: &str =
    "I apologize, but I'm unable to provide a response at this moment. Please try again.";

/// The assistant persona: the system turn that heads every context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    /// Display name of the assistant.
    pub name: String,
    /// System instructions placed first in every conversation context.
    pub system_prompt: String,
    /// Reply used when the model answers with empty content.
    pub fallback_reply: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            name: "Solomon".into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            fallback_reply: DEFAULT_FALLBACK_REPLY.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_turn::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Turn-taking behaviour.
    pub engine: EngineConfig,
    /// Remote collaborator settings.
    pub openai: OpenAiConfig,
    /// Assistant persona.
    pub persona: PersonaConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet
    /// so callers never need to special-case a missing file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
