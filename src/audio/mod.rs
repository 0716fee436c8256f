//! Audio side of a turn: microphone capture, voice activity and playback.
//!
//! # Pipeline
//!
//! ```text
//! Microphone → cpal callback → CaptureBuffer ── level ──→ SilenceDetector → VadEvent
//!                                   │
//!                                   └─ finish → downmix → resample 16k → WAV bytes
//!
//! speech bytes (MP3) → minimp3 → PlaybackManager → cpal output
//! ```

pub mod buffer;
pub mod capture;
pub mod encode;
pub mod playback;
pub mod vad;

pub use buffer::{rms_dbfs, CaptureBuffer, SILENCE_FLOOR_DB};
pub use capture::{CaptureDevice, CaptureError, CaptureSession, CpalCapture, LevelMeter};
pub use encode::{CapturedAudio, EncodeError, TRANSCRIPTION_SAMPLE_RATE};
pub use playback::{
    AudioOutput, CpalOutput, LoadedSound, PlaybackDone, PlaybackEnd, PlaybackError, PlaybackManager,
};
pub use vad::{spawn_monitor, Detection, MonitorHandle, RecordingStatus, SilenceDetector, VadEvent};
