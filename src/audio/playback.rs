//! Speech playback with a single owned output handle.
//!
//! [`PlaybackManager`] keeps at most one loaded sound alive.  Starting a new
//! utterance stops and releases the previous one first, and [`stop`] can be
//! called from any thread to interrupt whatever is playing.
//!
//! [`CpalOutput`] decodes MP3 with `minimp3` and plays it on the default
//! output device from a dedicated thread.
//!
//! [`stop`]: PlaybackManager::stop

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::audio::encode::resample;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("could not decode speech audio: {0}")]
    Decode(String),

    #[error("audio output failed: {0}")]
    Device(String),
}

/// How a call to [`PlaybackManager::speak`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    Finished,
    Interrupted,
}

/// Completion signal of a started sound.  A dropped sender means the sound
/// was stopped before it finished.
pub type PlaybackDone = oneshot::Receiver<Result<(), PlaybackError>>;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait AudioOutput: Send + Sync {
    /// Decode `audio` into a sound ready to play.
    fn load(&self, audio: &[u8]) -> Result<Box<dyn LoadedSound>, PlaybackError>;
}

/// One decoded utterance bound to the output device.  Dropping it releases
/// the device.
pub trait LoadedSound: Send {
    fn play(&mut self) -> Result<PlaybackDone, PlaybackError>;

    /// Halt playback.  Idempotent.
    fn stop(&mut self);
}

// ---------------------------------------------------------------------------
// PlaybackManager
// ---------------------------------------------------------------------------

struct PlaybackHandle {
    id: u64,
    sound: Box<dyn LoadedSound>,
    // Dropping the sender wakes the waiting `speak` call.
    _interrupt: oneshot::Sender<()>,
}

pub struct PlaybackManager {
    output: Arc<dyn AudioOutput>,
    current: Mutex<Option<PlaybackHandle>>,
    next_id: AtomicU64,
}

impl PlaybackManager {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Play `audio` to completion or until interrupted.
    ///
    /// Any sound still playing is stopped and released before `audio` is
    /// loaded.  Load and device errors leave nothing loaded.
    pub async fn speak(&self, audio: &[u8]) -> Result<PlaybackEnd, PlaybackError> {
        self.stop();

        let mut sound = self.output.load(audio)?;
        let done = sound.play()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (interrupt_tx, interrupt_rx) = oneshot::channel::<()>();
        if let Some(previous) = self.lock().replace(PlaybackHandle {
            id,
            sound,
            _interrupt: interrupt_tx,
        }) {
            release(previous);
        }
        log::debug!("playback: started #{id}");

        let _release = ReleaseOnDrop { manager: self, id };

        tokio::select! {
            result = done => match result {
                Ok(Ok(())) => {
                    log::debug!("playback: #{id} finished");
                    Ok(PlaybackEnd::Finished)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Ok(PlaybackEnd::Interrupted),
            },
            _ = interrupt_rx => {
                log::debug!("playback: #{id} interrupted");
                Ok(PlaybackEnd::Interrupted)
            }
        }
    }

    /// Stop and release the current sound, if any.
    pub fn stop(&self) {
        if let Some(handle) = self.lock().take() {
            release(handle);
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    fn release_if_current(&self, id: u64) {
        let mut current = self.lock();
        if current.as_ref().is_some_and(|h| h.id == id) {
            if let Some(handle) = current.take() {
                drop(current);
                release(handle);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PlaybackHandle>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn release(mut handle: PlaybackHandle) {
    handle.sound.stop();
}

struct ReleaseOnDrop<'a> {
    manager: &'a PlaybackManager,
    id: u64,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.manager.release_if_current(self.id);
    }
}

// ---------------------------------------------------------------------------
// CpalOutput
// ---------------------------------------------------------------------------

/// Default output device via `cpal`; expects MP3 input.
#[derive(Debug, Default, Clone)]
pub struct CpalOutput;

impl CpalOutput {
    pub fn new() -> Self {
        Self
    }
}

impl AudioOutput for CpalOutput {
    fn load(&self, audio: &[u8]) -> Result<Box<dyn LoadedSound>, PlaybackError> {
        let (samples, sample_rate) = decode_mp3(audio)?;
        log::debug!(
            "playback: decoded {:.2}s at {sample_rate} Hz",
            samples.len() as f32 / sample_rate as f32
        );
        Ok(Box::new(CpalSound {
            samples: Arc::new(samples),
            sample_rate,
            stop_tx: None,
            worker: None,
        }))
    }
}

/// Decode MP3 bytes into mono `f32` samples and their sample rate.
pub fn decode_mp3(mp3: &[u8]) -> Result<(Vec<f32>, u32), PlaybackError> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = frame.sample_rate as u32;
                let channels = frame.channels.max(1);
                samples.extend(frame.data.chunks(channels).map(|chunk| {
                    chunk.iter().map(|&s| f32::from(s) / 32768.0).sum::<f32>() / chunk.len() as f32
                }));
            }
            Err(minimp3::Error::SkippedData) => continue,
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(PlaybackError::Decode(e.to_string())),
        }
    }

    if samples.is_empty() || sample_rate == 0 {
        return Err(PlaybackError::Decode("no audio frames".into()));
    }
    Ok((samples, sample_rate))
}

struct CpalSound {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    stop_tx: Option<std_mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl LoadedSound for CpalSound {
    fn play(&mut self) -> Result<PlaybackDone, PlaybackError> {
        self.stop();

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), PlaybackError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel();
        let samples = Arc::clone(&self.samples);
        let sample_rate = self.sample_rate;

        let worker = std::thread::Builder::new()
            .name("voice-playback".into())
            .spawn(move || run_output_stream(&samples, sample_rate, ready_tx, stop_rx, done_tx))
            .map_err(|e| PlaybackError::Device(format!("failed to spawn playback thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(PlaybackError::Device("playback thread exited early".into()));
            }
        }

        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        Ok(done_rx)
    }

    /// Signal the playback thread and return without joining it; the thread
    /// drops the stream within one poll.
    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.worker.take();
    }
}

impl Drop for CpalSound {
    fn drop(&mut self) {
        self.stop();
    }
}

const FINISH_POLL: Duration = Duration::from_millis(20);

fn run_output_stream(
    samples: &[f32],
    sample_rate: u32,
    ready_tx: std_mpsc::Sender<Result<(), PlaybackError>>,
    stop_rx: std_mpsc::Receiver<()>,
    done_tx: oneshot::Sender<Result<(), PlaybackError>>,
) {
    let finished = Arc::new(AtomicBool::new(false));
    let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let stream = match open_output_stream(samples, sample_rate, &finished, &failure) {
        Ok(stream) => {
            if ready_tx.send(Ok(())).is_err() {
                return;
            }
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    loop {
        match stop_rx.recv_timeout(FINISH_POLL) {
            // Stopped: dropping `done_tx` reports the interruption.
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
        }

        let failed = failure.lock().ok().and_then(|mut f| f.take());
        if let Some(message) = failed {
            let _ = done_tx.send(Err(PlaybackError::Device(message)));
            break;
        }
        if finished.load(Ordering::Acquire) {
            // Let the device drain its last buffer unless stopped first.
            if let Err(std_mpsc::RecvTimeoutError::Timeout) = stop_rx.recv_timeout(FINISH_POLL * 5) {
                let _ = done_tx.send(Ok(()));
            }
            break;
        }
    }

    drop(stream);
}

fn open_output_stream(
    samples: &[f32],
    sample_rate: u32,
    finished: &Arc<AtomicBool>,
    failure: &Arc<Mutex<Option<String>>>,
) -> Result<cpal::Stream, PlaybackError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| PlaybackError::Device("no output device available".into()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| PlaybackError::Device(e.to_string()))?;
    let config: cpal::StreamConfig = supported.into();
    let channels = usize::from(config.channels.max(1));

    let audio = resample(samples, sample_rate, config.sample_rate.0)
        .map_err(|e| PlaybackError::Decode(e.to_string()))?;

    let mut pos = 0usize;
    let finished_cb = Arc::clone(finished);
    let failure_cb = Arc::clone(failure);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = audio.get(pos).copied().unwrap_or(0.0);
                    frame.fill(sample);
                    pos += 1;
                }
                if pos >= audio.len() {
                    finished_cb.store(true, Ordering::Release);
                }
            },
            move |err: cpal::StreamError| {
                log::error!("playback: cpal stream error: {err}");
                if let Ok(mut slot) = failure_cb.lock() {
                    if slot.is_none() {
                        *slot = Some(err.to_string());
                    }
                }
            },
            None,
        )
        .map_err(|e| PlaybackError::Device(e.to_string()))?;

    stream
        .play()
        .map_err(|e| PlaybackError::Device(e.to_string()))?;
    Ok(stream)
}

// ---------------------------------------------------------------------------
// MockOutput  (test-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use mock::MockOutput;


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
