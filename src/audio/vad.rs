//! Energy-based voice activity monitoring.
//!
//! [`SilenceDetector`] is the pure end-of-utterance rule: feed it one level
//! reading per tick and it reports speech, silence and the moment the
//! utterance is over.  [`spawn_monitor`] runs it against a live
//! [`LevelMeter`] on a fixed `tokio` interval and forwards [`VadEvent`]s to
//! the engine.
//!
//! ## Rule
//!
//! * A reading **below** the threshold starts (or continues) a silence run.
//! * A reading **at or above** the threshold clears any pending silence.
//! * The utterance ends once the silence run has lasted `silence_duration`
//!   **and** the recording is at least `min_recording` old.  Silence may
//!   begin inside the minimum window; it just cannot end the turn there.
//! * Hitting `max_recording` ends the utterance regardless of level.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audio::capture::{CaptureError, LevelMeter};
use crate::config::VadConfig;

// ---------------------------------------------------------------------------
// RecordingStatus
// ---------------------------------------------------------------------------

/// Live status of the current recording.
///
/// Written by the engine; the monitor watches `is_recording` to know when to
/// stop polling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordingStatus {
    pub is_recording: bool,
    /// Most recent input level in dBFS, `None` before the first tick.
    pub last_volume_db: Option<f32>,
    /// Start of the current silence run.
    pub silence_started_at: Option<Instant>,
}

impl RecordingStatus {
    pub fn recording() -> Self {
        Self {
            is_recording: true,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// SilenceDetector
// ---------------------------------------------------------------------------

/// Result of feeding one reading to [`SilenceDetector::observe`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Detection {
    /// Level at or above threshold.  `first` is set on the first speech
    /// reading of the recording, `resumed` when it cut a silence run short.
    Speech { first: bool, resumed: bool },
    /// Level below threshold.  `started` marks the first reading of a run.
    Silence { started: bool },
    /// The utterance is over.
    EndOfUtterance,
}

/// Pure end-of-utterance state machine.
///
/// ```rust
/// use std::time::Duration;
/// use tokio::time::Instant;
/// use voice_turn::audio::{Detection, SilenceDetector};
/// use voice_turn::config::VadConfig;
///
/// let t0 = Instant::now();
/// let mut det = SilenceDetector::new(&VadConfig::default(), t0);
///
/// assert_eq!(
///     det.observe(-20.0, t0),
///     Detection::Speech { first: true, resumed: false }
/// );
/// assert_eq!(det.observe(-60.0, t0 + Duration::from_millis(500)), Detection::Silence { started: true });
/// assert_eq!(det.observe(-60.0, t0 + Duration::from_millis(2500)), Detection::EndOfUtterance);
/// ```
#[derive(Debug, Clone)]
pub struct SilenceDetector {
    threshold_db: f32,
    silence_duration: Duration,
    min_recording: Duration,
    max_recording: Duration,
    started: Instant,
    silence_since: Option<Instant>,
    heard_speech: bool,
}

impl SilenceDetector {
    pub fn new(config: &VadConfig, started: Instant) -> Self {
        Self {
            threshold_db: config.silence_threshold_db,
            silence_duration: config.silence_duration(),
            min_recording: config.min_recording(),
            max_recording: config.max_recording(),
            started,
            silence_since: None,
            heard_speech: false,
        }
    }

    pub fn observe(&mut self, level_db: f32, now: Instant) -> Detection {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.max_recording {
            return Detection::EndOfUtterance;
        }

        if level_db >= self.threshold_db {
            let resumed = self.silence_since.take().is_some();
            let first = !self.heard_speech;
            self.heard_speech = true;
            return Detection::Speech { first, resumed };
        }

        let started = self.silence_since.is_none();
        let since = *self.silence_since.get_or_insert(now);

        if now.saturating_duration_since(since) >= self.silence_duration
            && elapsed >= self.min_recording
        {
            Detection::EndOfUtterance
        } else {
            Detection::Silence { started }
        }
    }

    /// Start of the current silence run.
    pub fn silence_since(&self) -> Option<Instant> {
        self.silence_since
    }

    /// Whether any reading so far reached the threshold.
    pub fn heard_speech(&self) -> bool {
        self.heard_speech
    }
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

/// Events sent from the monitor to the engine.
#[derive(Debug)]
pub enum VadEvent {
    SpeechStarted { level_db: f32 },
    SilenceStarted { at: Instant, level_db: f32 },
    SpeechResumed { level_db: f32 },
    /// Level of a tick that did not change the classification.
    Level { level_db: f32 },
    EndOfUtterance,
    Failed(CaptureError),
}

/// Handle to a running monitor.  Dropping it stops the task.
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Poll `meter` every `config.poll_interval()` until end of utterance, a
/// meter failure, cancellation, or `status.is_recording` going false.
///
/// `cancel` is usually a child of the turn's token so cancelling the turn
/// also stops the monitor.
pub fn spawn_monitor(
    meter: Arc<dyn LevelMeter>,
    config: &VadConfig,
    status: watch::Receiver<RecordingStatus>,
    events: mpsc::UnboundedSender<VadEvent>,
    cancel: CancellationToken,
) -> MonitorHandle {
    let detector = SilenceDetector::new(config, Instant::now());
    let poll = config.poll_interval();
    let task = tokio::spawn(run_monitor(
        meter,
        detector,
        poll,
        status,
        events,
        cancel.clone(),
    ));
    MonitorHandle { cancel, task }
}

async fn run_monitor(
    meter: Arc<dyn LevelMeter>,
    mut detector: SilenceDetector,
    poll: Duration,
    status: watch::Receiver<RecordingStatus>,
    events: mpsc::UnboundedSender<VadEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("vad: monitor cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        if !status.borrow().is_recording {
            log::debug!("vad: recording stopped, monitor exiting");
            return;
        }

        let level_db = match meter.level_dbfs() {
            Ok(level) => level,
            Err(e) => {
                log::warn!("vad: level meter failed: {e}");
                let _ = events.send(VadEvent::Failed(e));
                return;
            }
        };

        let now = Instant::now();
        let event = match detector.observe(level_db, now) {
            Detection::Speech { first: true, .. } => VadEvent::SpeechStarted { level_db },
            Detection::Speech { resumed: true, .. } => VadEvent::SpeechResumed { level_db },
            Detection::Silence { started: true } => VadEvent::SilenceStarted { at: now, level_db },
            Detection::Speech { .. } | Detection::Silence { started: false } => {
                VadEvent::Level { level_db }
            }
            Detection::EndOfUtterance => {
                log::debug!("vad: end of utterance");
                let _ = events.send(VadEvent::EndOfUtterance);
                return;
            }
        };

        if events.send(event).is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
