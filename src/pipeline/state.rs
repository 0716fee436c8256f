//! Turn state machine types and turn results.
//!
//! [`TurnState`] is the phase the engine is in.  Hosts read it through
//! [`TurnEngine::state`](crate::pipeline::TurnEngine::state) or follow it
//! through [`TurnEvent::StateChanged`](crate::pipeline::TurnEvent).

pub use crate::audio::vad::RecordingStatus;

// ---------------------------------------------------------------------------
// TurnState
// ---------------------------------------------------------------------------

/// Phases of one conversational turn.
///
/// ```text
/// Idle ──start_turn──▶ Recording ⇄ SilencePending
///                                     │ silence ≥ duration (or manual stop)
///                                     ▼
///                               Transcribing ──text──▶ AwaitingReply ──reply──▶ Speaking ──▶ Idle
///
/// any state ──cancel──▶ Cancelled ──▶ Idle
/// any state ──failure─▶ Errored   ──▶ Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    /// No turn in progress.
    #[default]
    Idle,

    /// Microphone open; the user is (or may start) speaking.
    Recording,

    /// Microphone open; level has been below threshold since
    /// `RecordingStatus::silence_started_at`.
    SilencePending,

    /// Capture stopped; the utterance is with the transcription service.
    Transcribing,

    /// Waiting on the reply service.
    AwaitingReply,

    /// Reply committed to history and being synthesized / played.
    Speaking,

    /// The turn was cancelled.  Transient: always followed by `Idle`.
    Cancelled,

    /// The turn failed.  Transient: always followed by `Idle`.
    Errored,
}

impl TurnState {
    /// Returns `true` while a turn owns the engine.
    ///
    /// ```
    /// use voice_turn::pipeline::TurnState;
    ///
    /// assert!(!TurnState::Idle.is_busy());
    /// assert!(TurnState::Recording.is_busy());
    /// assert!(TurnState::Speaking.is_busy());
    /// ```
    pub fn is_busy(&self) -> bool {
        !matches!(self, TurnState::Idle)
    }

    /// Returns `true` while the microphone is open.
    pub fn is_recording(&self) -> bool {
        matches!(self, TurnState::Recording | TurnState::SilencePending)
    }

    /// A short human-readable label for status displays.
    pub fn label(&self) -> &'static str {
        match self {
            TurnState::Idle => "Idle",
            TurnState::Recording => "Listening",
            TurnState::SilencePending => "Listening",
            TurnState::Transcribing => "Transcribing",
            TurnState::AwaitingReply => "Thinking",
            TurnState::Speaking => "Speaking",
            TurnState::Cancelled => "Cancelled",
            TurnState::Errored => "Error",
        }
    }
}

// ---------------------------------------------------------------------------
// Turn results
// ---------------------------------------------------------------------------

/// What one successful turn produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResult {
    pub transcription: String,
    pub reply_text: String,
}

/// How a turn that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed(TurnResult),
    /// Nothing intelligible was said; history is untouched.
    NoSpeech,
    Cancelled,
}

/// Per-turn overrides of the engine configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnOptions {
    /// Speak the reply.  `None` uses `EngineConfig::speak_replies`.
    pub speak: Option<bool>,
}

impl TurnOptions {
    pub fn silent() -> Self {
        Self { speak: Some(false) }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_idle_is_free() {
        for state in [
            TurnState::Recording,
            TurnState::SilencePending,
            TurnState::Transcribing,
            TurnState::AwaitingReply,
            TurnState::Speaking,
            TurnState::Cancelled,
            TurnState::Errored,
        ] {
            assert!(state.is_busy(), "{state:?} should be busy");
        }
        assert!(!TurnState::Idle.is_busy());
    }

    #[test]
    fn recording_covers_silence_pending() {
        assert!(TurnState::Recording.is_recording());
        assert!(TurnState::SilencePending.is_recording());
        assert!(!TurnState::Transcribing.is_recording());
    }

    #[test]
    fn labels() {
        assert_eq!(TurnState::AwaitingReply.label(), "Thinking");
        assert_eq!(TurnState::Errored.label(), "Error");
    }

    #[test]
    fn default_state_is_idle() {
        assert_eq!(TurnState::default(), TurnState::Idle);
        assert_eq!(TurnOptions::default().speak, None);
        assert_eq!(TurnOptions::silent().speak, Some(false));
    }
}
