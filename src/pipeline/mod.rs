//! Turn-taking pipeline.
//!
//! This module wires microphone capture, voice activity detection,
//! transcription, reply generation and speech playback into one
//! conversational turn, and exposes the state hosts observe.
//!
//! # Architecture
//!
//! ```text
//! host ──start_turn / stop_turn_manually / cancel_turn──▶ TurnEngine
//!                                                           │
//!   CaptureDevice ──▶ spawn_monitor ──VadEvent──────────────┤
//!   Transcriber ◀── WAV bytes ──────────────────────────────┤
//!   ResponseGenerator ◀── ConversationHistory + user turn ──┤
//!   SpeechSynthesizer ──▶ PlaybackManager ◀─────────────────┘
//!
//! StateNotifier (broadcast) ──TurnEvent──▶ subscribers / on_recording_change
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use voice_turn::pipeline::{TurnEngine, TurnEvent};
//!
//! # async fn example(engine: TurnEngine) {
//! let mut events = engine.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         if let TurnEvent::RecordingChanged(on) = event {
//!             println!("microphone {}", if on { "on" } else { "off" });
//!         }
//!     }
//! });
//!
//! let outcome = engine.start_turn().await;
//! println!("{outcome:?}");
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod notifier;
pub mod state;

pub use engine::{Collaborators, TurnEngine};
pub use error::{GenerationErrorKind, TurnError, TurnStage};
pub use notifier::{StateNotifier, Subscription, TurnEvent};
pub use state::{RecordingStatus, TurnOptions, TurnOutcome, TurnResult, TurnState};
