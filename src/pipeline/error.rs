//! Errors surfaced to the host by a failed turn.

use thiserror::Error;

use crate::audio::{CaptureError, PlaybackError};
use crate::llm::{GenerationError, HistoryError};
use crate::stt::TranscriptionError;
use crate::tts::SynthesisError;

/// Why the reply service failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationErrorKind {
    RateLimited,
    Unauthorized,
    Unknown,
}

/// Stage of a turn that can time out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStage {
    Transcription,
    Reply,
    Synthesis,
}

impl std::fmt::Display for TurnStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TurnStage::Transcription => "transcription",
            TurnStage::Reply => "reply",
            TurnStage::Synthesis => "speech synthesis",
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("microphone access was denied")]
    PermissionDenied,

    #[error("a turn is already in progress")]
    AlreadyInProgress,

    #[error("audio device failed: {0}")]
    DeviceFailure(String),

    #[error("transcription failed: {0}")]
    TranscriptionFailed(String),

    #[error("reply generation failed: {0:?}")]
    GenerationFailed(GenerationErrorKind),

    #[error("speech synthesis failed: {0}")]
    SynthesisFailed(String),

    #[error("{stage} timed out")]
    Timeout { stage: TurnStage },
}

impl From<CaptureError> for TurnError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::PermissionDenied => TurnError::PermissionDenied,
            other => TurnError::DeviceFailure(other.to_string()),
        }
    }
}

impl From<PlaybackError> for TurnError {
    fn from(e: PlaybackError) -> Self {
        TurnError::DeviceFailure(e.to_string())
    }
}

impl From<TranscriptionError> for TurnError {
    fn from(e: TranscriptionError) -> Self {
        TurnError::TranscriptionFailed(e.to_string())
    }
}

impl From<GenerationError> for TurnError {
    fn from(e: GenerationError) -> Self {
        TurnError::GenerationFailed(match e {
            GenerationError::RateLimited => GenerationErrorKind::RateLimited,
            GenerationError::Unauthorized => GenerationErrorKind::Unauthorized,
            GenerationError::Unknown(_) => GenerationErrorKind::Unknown,
        })
    }
}

impl From<SynthesisError> for TurnError {
    fn from(e: SynthesisError) -> Self {
        TurnError::SynthesisFailed(e.to_string())
    }
}

impl From<HistoryError> for TurnError {
    fn from(e: HistoryError) -> Self {
        TurnError::GenerationFailed(match e {
            HistoryError::SystemTurnRejected => GenerationErrorKind::Unknown,
        })
    }
}
