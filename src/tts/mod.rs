//! Text-to-speech for assistant replies.

pub mod synthesizer;

pub use synthesizer::{OpenAiSynthesizer, SpeechSynthesizer, SynthesisError};

#[cfg(test)]
pub use synthesizer::MockSynthesizer;
