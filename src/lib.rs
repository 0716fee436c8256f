//! Voice conversation turn-taking engine.
//!
//! One turn: open the microphone, wait for the user to stop talking,
//! transcribe the utterance, ask the reply service for an answer with the
//! recent conversation as context, and speak the answer back.
//!
//! * [`audio`]: capture, level metering, silence detection, playback.
//! * [`stt`] / [`llm`] / [`tts`]: the remote (or local) collaborators.
//! * [`pipeline`]: [`TurnEngine`](pipeline::TurnEngine) and its state machine.
//! * [`config`]: TOML settings.

pub mod audio;
pub mod config;
pub mod llm;
pub mod pipeline;
pub mod stt;
pub mod tts;
