//! Microphone capture sessions.
//!
//! A [`CaptureDevice`] hands out one [`CaptureSession`] per recording.  The
//! session owns the microphone until [`CaptureSession::finish`] is called or
//! the session is dropped; either way the hardware stream is released.
//! While recording, [`CaptureSession::meter`] exposes the input level that
//! the voice-activity monitor polls.
//!
//! [`CpalCapture`] is the production device.  `cpal::Stream` is not `Send`
//! on every platform, so each session parks its stream on a dedicated
//! thread and talks to it through a stop channel.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;

use crate::audio::buffer::{CaptureBuffer, SILENCE_FLOOR_DB};
use crate::audio::encode::{CapturedAudio, EncodeError};
use crate::config::VadConfig;

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

/// Errors that can occur while opening, metering or finishing a recording.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("microphone access was denied")]
    PermissionDenied,

    #[error("no input device found on the default audio host")]
    NoDevice,

    #[error("input device delivered no audio")]
    NoSignal,

    #[error("failed to query default input config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build input stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("audio stream failed: {0}")]
    Stream(String),

    #[error("failed to encode recording: {0}")]
    Encode(#[from] EncodeError),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Source of microphone sessions.
pub trait CaptureDevice: Send + Sync {
    /// Acquire the microphone and start recording.  May block while the
    /// device opens; the engine calls it on the blocking pool.
    fn start(&self) -> Result<Box<dyn CaptureSession>, CaptureError>;
}

/// One live recording.  Dropping it releases the microphone.
pub trait CaptureSession: Send {
    /// Level meter for the voice-activity monitor.
    fn meter(&self) -> Arc<dyn LevelMeter>;

    /// Stop recording, release the microphone and return the utterance as
    /// 16 kHz mono WAV bytes.  An empty vector means nothing was captured.
    fn finish(self: Box<Self>) -> Result<Vec<u8>, CaptureError>;
}

/// Current input level of a live recording.
pub trait LevelMeter: Send + Sync {
    /// Level of the latest input block in dBFS.
    ///
    /// Fails when the device stopped delivering audio or reported an error.
    fn level_dbfs(&self) -> Result<f32, CaptureError>;
}

// ---------------------------------------------------------------------------
// CpalCapture
// ---------------------------------------------------------------------------

type SharedBuffer = Arc<Mutex<CaptureBuffer>>;

#[derive(Debug, Clone, Copy)]
struct StreamFormat {
    sample_rate: u32,
    channels: u16,
}

type Ready = Result<(StreamFormat, SharedBuffer), CaptureError>;

/// Default-input-device capture built on `cpal`.
///
/// ```rust,no_run
/// use voice_turn::audio::{CaptureDevice, CpalCapture};
/// use voice_turn::config::VadConfig;
///
/// let device = CpalCapture::new(&VadConfig::default());
/// let session = device.start().unwrap();
/// let level = session.meter().level_dbfs();
/// let wav = session.finish().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct CpalCapture {
    max_recording: Duration,
    no_signal_timeout: Duration,
}

impl CpalCapture {
    pub fn new(vad: &VadConfig) -> Self {
        Self {
            max_recording: vad.max_recording(),
            no_signal_timeout: vad.no_signal_timeout(),
        }
    }
}

impl CaptureDevice for CpalCapture {
    fn start(&self) -> Result<Box<dyn CaptureSession>, CaptureError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Ready>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let max_secs = self.max_recording.as_secs_f32();

        let worker = std::thread::Builder::new()
            .name("voice-capture".into())
            .spawn(move || run_input_stream(max_secs, ready_tx, stop_rx))
            .map_err(|e| CaptureError::Stream(format!("failed to spawn capture thread: {e}")))?;

        let (format, buffer) = match ready_rx.recv() {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(CaptureError::Stream(
                    "capture thread exited before the stream started".into(),
                ));
            }
        };

        log::debug!(
            "capture: started ({} Hz, {} ch)",
            format.sample_rate,
            format.channels
        );

        let meter = Arc::new(BufferMeter {
            buffer: Arc::clone(&buffer),
            started: Instant::now(),
            no_signal_timeout: self.no_signal_timeout,
        });

        Ok(Box::new(CpalSession {
            buffer,
            format,
            meter,
            stop_tx: Some(stop_tx),
            worker: Some(worker),
        }))
    }
}

/// Body of the capture thread: open the stream, report readiness, then park
/// until the session asks to stop (or is dropped).
fn run_input_stream(max_secs: f32, ready_tx: std_mpsc::Sender<Ready>, stop_rx: std_mpsc::Receiver<()>) {
    let stream = match open_input_stream(max_secs) {
        Ok((stream, format, buffer)) => {
            if ready_tx.send(Ok((format, buffer))).is_err() {
                return;
            }
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let _ = stop_rx.recv();
    drop(stream);
    log::debug!("capture: stream released");
}

fn open_input_stream(max_secs: f32) -> Result<(cpal::Stream, StreamFormat, SharedBuffer), CaptureError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;
    let supported = device.default_input_config()?;

    let format = StreamFormat {
        sample_rate: supported.sample_rate().0,
        channels: supported.channels(),
    };
    let config: cpal::StreamConfig = supported.into();

    let capacity = (format.sample_rate as f32 * f32::from(format.channels) * max_secs).ceil() as usize;
    let buffer = Arc::new(Mutex::new(CaptureBuffer::new(capacity.max(1))));

    let data_buf = Arc::clone(&buffer);
    let err_buf = Arc::clone(&buffer);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = data_buf.lock() {
                    buf.push_block(data);
                }
            },
            move |err: cpal::StreamError| {
                log::error!("capture: cpal stream error: {err}");
                if let Ok(mut buf) = err_buf.lock() {
                    buf.record_failure(err.to_string());
                }
            },
            None,
        )
        .map_err(classify_build_error)?;

    stream.play()?;
    Ok((stream, format, buffer))
}

/// Mobile and sandboxed desktop backends report a refused microphone as a
/// backend-specific build error.
fn classify_build_error(err: cpal::BuildStreamError) -> CaptureError {
    if let cpal::BuildStreamError::BackendSpecific { err: backend } = &err {
        let description = backend.description.to_lowercase();
        if ["permission", "denied", "not authorized"]
            .iter()
            .any(|needle| description.contains(needle))
        {
            return CaptureError::PermissionDenied;
        }
    }
    CaptureError::BuildStream(err)
}

struct CpalSession {
    buffer: SharedBuffer,
    format: StreamFormat,
    meter: Arc<BufferMeter>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CpalSession {
    fn halt(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("capture: capture thread panicked");
            }
        }
    }
}

impl CaptureSession for CpalSession {
    fn meter(&self) -> Arc<dyn LevelMeter> {
        Arc::clone(&self.meter) as Arc<dyn LevelMeter>
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<u8>, CaptureError> {
        self.halt();

        let samples = self
            .buffer
            .lock()
            .map_err(|_| CaptureError::Stream("capture buffer lock poisoned".into()))?
            .drain();

        let audio = CapturedAudio {
            samples,
            sample_rate: self.format.sample_rate,
            channels: self.format.channels,
        };
        log::debug!("capture: finished with {:.2}s of audio", audio.duration_secs());

        if audio.samples.is_empty() {
            return Ok(Vec::new());
        }
        Ok(audio.to_wav()?)
    }
}

impl Drop for CpalSession {
    fn drop(&mut self) {
        self.halt();
    }
}

struct BufferMeter {
    buffer: SharedBuffer,
    started: Instant,
    no_signal_timeout: Duration,
}

impl LevelMeter for BufferMeter {
    fn level_dbfs(&self) -> Result<f32, CaptureError> {
        let buf = self
            .buffer
            .lock()
            .map_err(|_| CaptureError::Stream("capture buffer lock poisoned".into()))?;

        if let Some(message) = buf.failure() {
            return Err(CaptureError::Stream(message.to_string()));
        }

        let last_audio = buf.last_block_at().unwrap_or(self.started);
        if last_audio.elapsed() > self.no_signal_timeout {
            return Err(CaptureError::NoSignal);
        }

        Ok(buf.level_dbfs().unwrap_or(SILENCE_FLOOR_DB))
    }
}

// ---------------------------------------------------------------------------
// ScriptedCapture  (test-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use scripted::ScriptedCapture;


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
