//! Utterance encoding for transcription upload.
//!
//! Transcription services want **16 kHz mono** speech.  A finished recording
//! goes through three steps:
//!
//! 1. [`downmix`]: average interleaved channels down to mono.
//! 2. [`resample`]: FFT resampling from the device rate with `rubato`.
//! 3. [`wav_bytes`]: 16-bit PCM WAV container via `hound`.
//!
//! [`CapturedAudio::to_wav`] runs the whole chain.

use std::io::Cursor;

use rubato::{FftFixedIn, Resampler};
use thiserror::Error;

/// Sample rate handed to transcription.
pub const TRANSCRIPTION_SAMPLE_RATE: u32 = 16_000;

/// Input block size fed to the resampler.
const RESAMPLE_CHUNK: usize = 1024;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("resampler setup failed: {0}")]
    ResamplerSetup(#[from] rubato::ResamplerConstructionError),

    #[error("resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),

    #[error("WAV encoding failed: {0}")]
    Wav(#[from] hound::Error),
}

// ---------------------------------------------------------------------------
// CapturedAudio
// ---------------------------------------------------------------------------

/// Raw samples of one finished recording, as delivered by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedAudio {
    /// Interleaved PCM samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    /// Device sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
}

impl CapturedAudio {
    /// Recording length in seconds.
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / (self.sample_rate as f32 * f32::from(self.channels))
    }

    /// Encode as a 16 kHz mono WAV file.
    pub fn to_wav(&self) -> Result<Vec<u8>, EncodeError> {
        let mono = downmix(&self.samples, self.channels);
        let speech = resample(&mono, self.sample_rate, TRANSCRIPTION_SAMPLE_RATE)?;
        wav_bytes(&speech, TRANSCRIPTION_SAMPLE_RATE)
    }
}

/// Average interleaved channels into one.  `channels == 0` yields nothing.
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = usize::from(n);
            samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

/// Resample mono `samples` from `from_rate` to `to_rate`.
///
/// The final partial block is zero-padded by the resampler, so the output
/// can be slightly longer than the exact ratio.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, EncodeError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler =
        FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 2, 1)?;

    let expected = samples.len() as u64 * u64::from(to_rate) / u64::from(from_rate);
    let mut out = Vec::with_capacity(expected as usize + RESAMPLE_CHUNK);
    let mut pos = 0;

    loop {
        let needed = resampler.input_frames_next();
        if pos + needed > samples.len() {
            break;
        }
        let input: [&[f32]; 1] = [&samples[pos..pos + needed]];
        let block = resampler.process(&input[..], None)?;
        out.extend_from_slice(&block[0]);
        pos += needed;
    }

    if pos < samples.len() {
        let input: [&[f32]; 1] = [&samples[pos..]];
        let block = resampler.process_partial(Some(&input[..]), None)?;
        out.extend_from_slice(&block[0]);
    }

    Ok(out)
}

/// Wrap mono `samples` in a 16-bit PCM WAV container.
pub fn wav_bytes(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, EncodeError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            let pcm = (sample * f32::from(i16::MAX)).clamp(f32::from(i16::MIN), f32::from(i16::MAX));
            writer.write_sample(pcm as i16)?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

/// Decode a mono 16-bit WAV file back into `f32` samples and its rate.
pub fn wav_samples(wav: &[u8]) -> Result<(Vec<f32>, u32), EncodeError> {
    let mut reader = hound::WavReader::new(Cursor::new(wav))?;
    let rate = reader.spec().sample_rate;
    let samples = reader
        .samples::<i16>()
        .map(|s| s.map(|v| f32::from(v) / f32::from(i16::MAX)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((samples, rate))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_frames() {
        let out = downmix(&[1.0, -1.0, 0.5, 0.5], 2);
        assert_eq!(out.len(), 2);
        assert!(out[0].abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn downmix_mono_and_zero_channels() {
        assert_eq!(downmix(&[0.1, 0.2], 1), vec![0.1, 0.2]);
        assert!(downmix(&[0.1, 0.2], 0).is_empty());
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let input: Vec<f32> = (0..160).map(|i| i as f32 / 160.0).collect();
        assert_eq!(resample(&input, 16_000, 16_000).unwrap(), input);
    }

    #[test]
    fn resample_48k_to_16k_is_about_a_third() {
        let input = vec![0.0_f32; 48_000];
        let out = resample(&input, 48_000, 16_000).unwrap();
        assert!(
            out.len().abs_diff(16_000) < 1_500,
            "unexpected length {}",
            out.len()
        );
    }

    #[test]
    fn wav_round_trip_keeps_length_and_rate() {
        let samples = vec![0.25_f32; 1_600];
        let wav = wav_bytes(&samples, 16_000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");

        let (decoded, rate) = wav_samples(&wav).unwrap();
        assert_eq!(rate, 16_000);
        assert_eq!(decoded.len(), samples.len());
        assert!((decoded[0] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn wav_clamps_out_of_range_samples() {
        let wav = wav_bytes(&[2.0, -2.0], 16_000).unwrap();
        let (decoded, _) = wav_samples(&wav).unwrap();
        assert!((decoded[0] - 1.0).abs() < 1e-3);
        assert!(decoded[1] <= -1.0);
    }

    #[test]
    fn captured_audio_duration_and_encoding() {
        let audio = CapturedAudio {
            samples: vec![0.0; 32_000],
            sample_rate: 16_000,
            channels: 2,
        };
        assert!((audio.duration_secs() - 1.0).abs() < 1e-6);

        let wav = audio.to_wav().unwrap();
        let (decoded, rate) = wav_samples(&wav).unwrap();
        assert_eq!(rate, TRANSCRIPTION_SAMPLE_RATE);
        assert_eq!(decoded.len(), 16_000);
    }
}
