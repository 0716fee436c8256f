//! Speech-to-text for finished utterances.
//!
//! ```text
//! WAV bytes ──▶ Transcriber (trait) ──▶ text
//!                 ├─ OpenAiTranscriber   POST /v1/audio/transcriptions
//!                 └─ WhisperTranscriber  whisper.cpp, `local-whisper` feature
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use voice_turn::config::OpenAiConfig;
//! use voice_turn::stt::{OpenAiTranscriber, Transcriber};
//!
//! #[tokio::main]
//! async fn main() {
//!     let stt = OpenAiTranscriber::from_config(&OpenAiConfig::default());
//!     let wav = std::fs::read("utterance.wav").unwrap();
//!     println!("{}", stt.transcribe(&wav).await.unwrap());
//! }
//! ```

pub mod transcriber;
#[cfg(feature = "local-whisper")]
pub mod whisper;

pub use transcriber::{OpenAiTranscriber, Transcriber, TranscriptionError};
#[cfg(feature = "local-whisper")]
pub use whisper::WhisperTranscriber;

#[cfg(test)]
pub use transcriber::MockTranscriber;
