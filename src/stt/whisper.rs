//! In-process transcription with whisper.cpp (`local-whisper` feature).
//!
//! [`WhisperTranscriber`] loads a GGML model once and runs each utterance on
//! the blocking thread pool with a fresh `WhisperState`, so one instance can
//! serve the engine without locking.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::audio::encode::{resample, wav_samples, TRANSCRIPTION_SAMPLE_RATE};
use crate::stt::transcriber::{Transcriber, TranscriptionError};

/// Shortest clip worth running through the model: 0.5 s at 16 kHz.
const MIN_AUDIO_SAMPLES: usize = 8_000;

struct SharedContext(WhisperContext);

// SAFETY: whisper-rs declares WhisperContext Send + Sync; the model weights
// are read-only after loading and every call creates its own state.
unsafe impl Send for SharedContext {}
unsafe impl Sync for SharedContext {}

pub struct WhisperTranscriber {
    ctx: Arc<SharedContext>,
    language: Option<String>,
    n_threads: i32,
}

impl std::fmt::Debug for WhisperTranscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperTranscriber")
            .field("language", &self.language)
            .field("n_threads", &self.n_threads)
            .finish_non_exhaustive()
    }
}

impl WhisperTranscriber {
    /// Load a GGML model.  `language` of `None` lets Whisper detect it.
    pub fn load(model_path: impl AsRef<Path>, language: Option<String>) -> Result<Self, TranscriptionError> {
        let path = model_path.as_ref();
        if !path.exists() {
            return Err(TranscriptionError::Engine(format!(
                "model not found: {}",
                path.display()
            )));
        }
        let path_str = path.to_str().ok_or_else(|| {
            TranscriptionError::Engine(format!(
                "model path contains non-UTF-8 characters: {}",
                path.display()
            ))
        })?;

        let ctx = WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
            .map_err(|e| TranscriptionError::Engine(e.to_string()))?;
        log::info!("stt: loaded whisper model {}", path.display());

        Ok(Self {
            ctx: Arc::new(SharedContext(ctx)),
            language,
            n_threads: optimal_threads(),
        })
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, TranscriptionError> {
        let (samples, rate) = wav_samples(audio).map_err(|e| TranscriptionError::Audio(e.to_string()))?;
        let samples = resample(&samples, rate, TRANSCRIPTION_SAMPLE_RATE)
            .map_err(|e| TranscriptionError::Audio(e.to_string()))?;

        if samples.len() < MIN_AUDIO_SAMPLES {
            log::debug!("stt: clip too short for whisper ({} samples)", samples.len());
            return Ok(String::new());
        }

        let ctx = Arc::clone(&self.ctx);
        let language = self.language.clone();
        let n_threads = self.n_threads;

        tokio::task::spawn_blocking(move || run_inference(&ctx.0, language.as_deref(), n_threads, &samples))
            .await
            .map_err(|e| TranscriptionError::Engine(format!("whisper task failed: {e}")))?
    }
}

fn run_inference(
    ctx: &WhisperContext,
    language: Option<&str>,
    n_threads: i32,
    samples: &[f32],
) -> Result<String, TranscriptionError> {
    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    params.set_language(language);
    params.set_n_threads(n_threads);
    params.set_print_progress(false);
    params.set_print_realtime(false);

    let mut state = ctx
        .create_state()
        .map_err(|e| TranscriptionError::Engine(e.to_string()))?;
    state
        .full(params, samples)
        .map_err(|e| TranscriptionError::Engine(e.to_string()))?;

    let n_segments = state
        .full_n_segments()
        .map_err(|e| TranscriptionError::Engine(e.to_string()))?;

    let mut text = String::new();
    for i in 0..n_segments {
        let segment = state
            .full_get_segment_text(i)
            .map_err(|e| TranscriptionError::Engine(format!("segment {i}: {e}")))?;
        text.push_str(&segment);
    }
    Ok(text.trim().to_string())
}

/// CPU threads for inference, capped at 8.
fn optimal_threads() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get().min(8) as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_is_an_engine_error() {
        let err = WhisperTranscriber::load("/nonexistent/ggml-base.bin", None).unwrap_err();
        assert!(matches!(err, TranscriptionError::Engine(msg) if msg.contains("model not found")));
    }

    #[test]
    fn thread_count_is_capped() {
        let n = optimal_threads();
        assert!((1..=8).contains(&n));
    }
}
