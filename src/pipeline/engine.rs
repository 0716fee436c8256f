//! Turn engine: drives one conversational turn from microphone to speaker.
//!
//! [`TurnEngine`] owns the capture device, the collaborators, the playback
//! manager, the conversation history and the notifier.  It is a cheap,
//! cloneable handle; every clone drives the same single-session engine.
//!
//! # Turn flow
//!
//! ```text
//! start_turn()
//!   └─▶ spawn_blocking(capture.start) + spawn_monitor()       [Recording]
//!         ├─ VadEvent::SilenceStarted                          [SilencePending]
//!         ├─ VadEvent::SpeechResumed                           [Recording]
//!         └─ VadEvent::EndOfUtterance (or stop_turn_manually)
//!               └─▶ spawn_blocking(capture.finish)             [Transcribing]
//!                     └─▶ transcriber.transcribe               ──empty──▶ NoSpeech
//!                           └─▶ responder.complete(history + user)   [AwaitingReply]
//!                                 └─▶ history.append(user, assistant)  [Speaking]
//!                                       └─▶ synthesize + playback.speak
//!                                             └─▶ Completed(TurnResult)  [Idle]
//! ```
//!
//! Every state mutation and notification happens under one `std` mutex that
//! is never held across an `.await`.  Each turn carries an id; work that
//! finishes after its turn was cancelled finds a different (or no) turn and
//! leaves the session alone.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::audio::{
    spawn_monitor, AudioOutput, CaptureDevice, CaptureSession, MonitorHandle, PlaybackManager,
    RecordingStatus, VadEvent,
};
use crate::config::EngineConfig;
use crate::llm::{ConversationHistory, ConversationTurn, ResponseGenerator};
use crate::stt::Transcriber;
use crate::tts::SpeechSynthesizer;

use super::error::{TurnError, TurnStage};
use super::notifier::{StateNotifier, Subscription, TurnEvent};
use super::state::{TurnOptions, TurnOutcome, TurnResult, TurnState};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Devices and services the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub capture: Arc<dyn CaptureDevice>,
    pub output: Arc<dyn AudioOutput>,
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn ResponseGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct ActiveTurn {
    id: u64,
    cancel: CancellationToken,
    capture: Option<Box<dyn CaptureSession>>,
    monitor: Option<MonitorHandle>,
    status: watch::Sender<RecordingStatus>,
    // Lets `stop_turn_manually` inject an end of utterance.
    vad_tx: mpsc::UnboundedSender<VadEvent>,
    heard_speech: bool,
}

struct Session {
    state: TurnState,
    turn: Option<ActiveTurn>,
    history: ConversationHistory,
    last_result: Option<TurnResult>,
    next_turn_id: u64,
}

/// Mutable view of the session while a specific turn still owns it.
struct TurnScope<'a> {
    state: &'a mut TurnState,
    turn: &'a mut ActiveTurn,
    history: &'a mut ConversationHistory,
    last_result: &'a mut Option<TurnResult>,
    notifier: &'a StateNotifier,
}

impl TurnScope<'_> {
    fn set(&mut self, to: TurnState) {
        set_state(self.state, self.notifier, to);
    }
}

fn set_state(state: &mut TurnState, notifier: &StateNotifier, to: TurnState) {
    let from = std::mem::replace(state, to);
    if from != to {
        log::debug!("engine: {from:?} → {to:?}");
        notifier.publish_state(from, to);
    }
}

struct Shared {
    config: EngineConfig,
    parts: Collaborators,
    playback: PlaybackManager,
    notifier: StateNotifier,
    session: Mutex<Session>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// TurnEngine
// ---------------------------------------------------------------------------

/// Single-session voice turn engine.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use voice_turn::audio::{CpalCapture, CpalOutput};
/// use voice_turn::config::AppConfig;
/// use voice_turn::llm::ChatCompletionResponder;
/// use voice_turn::pipeline::{Collaborators, TurnEngine, TurnOutcome};
/// use voice_turn::stt::OpenAiTranscriber;
/// use voice_turn::tts::OpenAiSynthesizer;
///
/// # async fn example() {
/// let config = AppConfig::load().unwrap();
/// let engine = TurnEngine::new(
///     config.engine.clone(),
///     &config.persona.system_prompt,
///     Collaborators {
///         capture: Arc::new(CpalCapture::new(&config.engine.vad)),
///         output: Arc::new(CpalOutput::new()),
///         transcriber: Arc::new(OpenAiTranscriber::from_config(&config.openai)),
///         responder: Arc::new(ChatCompletionResponder::from_config(&config.openai, &config.persona)),
///         synthesizer: Arc::new(OpenAiSynthesizer::from_config(&config.openai)),
///     },
/// );
///
/// if let Ok(TurnOutcome::Completed(turn)) = engine.start_turn().await {
///     println!("you: {}\nsolomon: {}", turn.transcription, turn.reply_text);
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct TurnEngine {
    shared: Arc<Shared>,
}

impl TurnEngine {
    pub fn new(config: EngineConfig, system_prompt: impl Into<String>, parts: Collaborators) -> Self {
        let history = ConversationHistory::new(system_prompt, config.history.max_turns);
        let playback = PlaybackManager::new(Arc::clone(&parts.output));

        Self {
            shared: Arc::new(Shared {
                config,
                parts,
                playback,
                notifier: StateNotifier::new(),
                session: Mutex::new(Session {
                    state: TurnState::Idle,
                    turn: None,
                    history,
                    last_result: None,
                    next_turn_id: 0,
                }),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Turn control
    // -----------------------------------------------------------------------

    /// Run one turn with the configured options.
    pub async fn start_turn(&self) -> Result<TurnOutcome, TurnError> {
        self.start_turn_with(TurnOptions::default()).await
    }

    /// Run one turn: record until the user stops speaking, transcribe,
    /// reply, and (optionally) speak the reply.
    ///
    /// # Errors
    ///
    /// - [`TurnError::AlreadyInProgress`] when a turn is running; that turn
    ///   is not affected.
    /// - [`TurnError::PermissionDenied`] when the microphone is refused.
    /// - Any collaborator failure or timeout, after the engine is back to
    ///   [`TurnState::Idle`].
    ///
    /// Dropping the returned future cancels the turn.
    pub async fn start_turn_with(&self, options: TurnOptions) -> Result<TurnOutcome, TurnError> {
        let (id, token, mut events) = self.reserve()?;

        let guard = TurnGuard { engine: self, id, armed: true };
        let result = match self.open_capture(id, &token).await {
            Ok(true) => self.run_turn(id, &token, &mut events, options).await,
            Ok(false) => Ok(TurnOutcome::Cancelled),
            Err(e) => Err(e),
        };
        guard.disarm();

        self.finish(id, result)
    }

    /// Abandon the current turn, whatever it is doing.  No-op when idle.
    ///
    /// While `Speaking` the reply is already in the history: playback stops,
    /// the state goes straight to `Idle` and the turn still returns
    /// [`TurnOutcome::Completed`].
    pub fn cancel_turn(&self) {
        self.teardown(None);
    }

    /// Treat the recording as finished now (push-to-talk release).
    ///
    /// No-op unless the microphone is open.
    pub fn stop_turn_manually(&self) {
        let session = self.shared.lock();
        if !session.state.is_recording() {
            return;
        }
        if let Some(turn) = &session.turn {
            log::debug!("engine: manual stop of turn {}", turn.id);
            let _ = turn.vad_tx.send(VadEvent::EndOfUtterance);
        }
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.shared.notifier.subscribe()
    }

    /// Call `callback` whenever the microphone opens or closes.
    pub fn on_recording_change<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(bool) + Send + 'static,
    {
        self.shared.notifier.on_recording_change(callback)
    }

    pub fn state(&self) -> TurnState {
        self.shared.lock().state
    }

    /// Snapshot of the live recording, `None` outside a turn.
    pub fn recording_status(&self) -> Option<RecordingStatus> {
        self.shared
            .lock()
            .turn
            .as_ref()
            .map(|turn| turn.status.borrow().clone())
    }

    pub fn last_result(&self) -> Option<TurnResult> {
        self.shared.lock().last_result.clone()
    }

    /// Current context, system turn first.
    pub fn history(&self) -> Vec<ConversationTurn> {
        self.shared.lock().history.as_context()
    }

    pub fn clear_history(&self) {
        self.shared.lock().history.clear();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Claim the session for a new turn.  The microphone is opened later,
    /// outside the lock, by `open_capture`.
    fn reserve(&self) -> Result<(u64, CancellationToken, mpsc::UnboundedReceiver<VadEvent>), TurnError> {
        let mut session = self.shared.lock();
        if session.state.is_busy() || session.turn.is_some() {
            log::warn!("engine: start_turn while {:?}", session.state);
            return Err(TurnError::AlreadyInProgress);
        }

        session.next_turn_id += 1;
        let id = session.next_turn_id;
        let cancel = CancellationToken::new();
        let (status, _) = watch::channel(RecordingStatus::default());
        let (vad_tx, vad_rx) = mpsc::unbounded_channel();

        session.turn = Some(ActiveTurn {
            id,
            cancel: cancel.clone(),
            capture: None,
            monitor: None,
            status,
            vad_tx,
            heard_speech: false,
        });
        Ok((id, cancel, vad_rx))
    }

    /// Open the microphone on the blocking pool and start the monitor.
    ///
    /// Returns `Ok(false)` if the turn was cancelled meanwhile; a session
    /// opened after that is dropped unused.
    async fn open_capture(&self, id: u64, token: &CancellationToken) -> Result<bool, TurnError> {
        let device = Arc::clone(&self.shared.parts.capture);
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(false),
            opened = tokio::task::spawn_blocking(move || device.start()) => opened,
        };
        let capture = opened
            .map_err(|e| TurnError::DeviceFailure(format!("capture task failed: {e}")))?
            .map_err(|e| {
                log::error!("engine: could not start capture: {e}");
                TurnError::from(e)
            })?;

        let vad = &self.shared.config.vad;
        let started = self.with_turn(id, move |scope| {
            scope.turn.status.send_replace(RecordingStatus::recording());
            scope.turn.monitor = Some(spawn_monitor(
                capture.meter(),
                vad,
                scope.turn.status.subscribe(),
                scope.turn.vad_tx.clone(),
                scope.turn.cancel.child_token(),
            ));
            scope.turn.capture = Some(capture);
            scope.set(TurnState::Recording);
            scope.notifier.publish_recording(true);
        });
        if started.is_some() {
            log::info!("engine: turn {id} started");
        }
        Ok(started.is_some())
    }

    /// Run `f` if turn `id` still owns the session.
    fn with_turn<R>(&self, id: u64, f: impl FnOnce(&mut TurnScope<'_>) -> R) -> Option<R> {
        let mut guard = self.shared.lock();
        let Session {
            state,
            turn,
            history,
            last_result,
            ..
        } = &mut *guard;
        let turn = turn.as_mut().filter(|t| t.id == id)?;

        let mut scope = TurnScope {
            state,
            turn,
            history,
            last_result,
            notifier: &self.shared.notifier,
        };
        Some(f(&mut scope))
    }

    async fn run_turn(
        &self,
        id: u64,
        token: &CancellationToken,
        events: &mut mpsc::UnboundedReceiver<VadEvent>,
        options: TurnOptions,
    ) -> Result<TurnOutcome, TurnError> {
        // ── 1. Listen until end of utterance ─────────────────────────────
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(TurnOutcome::Cancelled),
                event = events.recv() => event,
            };

            let handled = match event {
                Some(VadEvent::EndOfUtterance) => break,
                Some(VadEvent::Failed(e)) => return Err(e.into()),
                None => return Ok(TurnOutcome::Cancelled),
                Some(event) => self.with_turn(id, |scope| apply_vad_event(scope, event)),
            };
            if handled.is_none() {
                return Ok(TurnOutcome::Cancelled);
            }
        }

        // ── 2. Stop capture ──────────────────────────────────────────────
        let Some((capture, heard_speech)) = self.with_turn(id, |scope| {
            scope.turn.monitor.take();
            scope.turn.status.send_modify(|status| {
                status.is_recording = false;
                status.silence_started_at = None;
            });
            scope.set(TurnState::Transcribing);
            scope.notifier.publish_recording(false);
            (scope.turn.capture.take(), scope.turn.heard_speech)
        }) else {
            return Ok(TurnOutcome::Cancelled);
        };
        let Some(capture) = capture else {
            return Err(TurnError::DeviceFailure("capture session already released".into()));
        };

        if !heard_speech && self.shared.config.vad.discard_silent_recordings {
            log::info!("engine: no speech detected, skipping transcription");
            drop(capture);
            return Ok(TurnOutcome::NoSpeech);
        }

        let audio = tokio::task::spawn_blocking(move || capture.finish())
            .await
            .map_err(|e| TurnError::DeviceFailure(format!("capture task failed: {e}")))??;
        if audio.is_empty() {
            return Ok(TurnOutcome::NoSpeech);
        }

        // ── 3. Transcribe ────────────────────────────────────────────────
        let config = &self.shared.config;
        let Some(text) = guarded(
            token,
            TurnStage::Transcription,
            config.transcription_timeout(),
            self.shared.parts.transcriber.transcribe(&audio),
        )
        .await?
        else {
            return Ok(TurnOutcome::Cancelled);
        };

        let transcription = text.trim().to_string();
        if transcription.is_empty() {
            log::info!("engine: empty transcription");
            return Ok(TurnOutcome::NoSpeech);
        }

        // ── 4. Reply ─────────────────────────────────────────────────────
        let user_turn = ConversationTurn::user(&transcription);
        let Some(context) = self.with_turn(id, |scope| {
            scope.set(TurnState::AwaitingReply);
            scope.history.context_with(&user_turn)
        }) else {
            return Ok(TurnOutcome::Cancelled);
        };

        let Some(reply) = guarded(
            token,
            TurnStage::Reply,
            config.reply_timeout(),
            self.shared.parts.responder.complete(&context),
        )
        .await?
        else {
            return Ok(TurnOutcome::Cancelled);
        };

        let result = TurnResult {
            transcription,
            reply_text: reply.trim().to_string(),
        };

        let committed = self.with_turn(id, |scope| {
            scope.history.append(user_turn)?;
            scope
                .history
                .append(ConversationTurn::assistant(&result.reply_text))?;
            *scope.last_result = Some(result.clone());
            scope.set(TurnState::Speaking);
            Ok::<_, TurnError>(())
        });
        match committed {
            None => return Ok(TurnOutcome::Cancelled),
            Some(res) => res?,
        }

        // ── 5. Speak ─────────────────────────────────────────────────────
        // The reply is committed from here on; cancelling only cuts it short.
        if !options.speak.unwrap_or(config.speak_replies) {
            return Ok(TurnOutcome::Completed(result));
        }

        let Some(speech) = guarded(
            token,
            TurnStage::Synthesis,
            config.synthesis_timeout(),
            self.shared.parts.synthesizer.synthesize(&result.reply_text),
        )
        .await?
        else {
            return Ok(TurnOutcome::Completed(result));
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            end = self.shared.playback.speak(&speech) => {
                log::debug!("engine: playback ended ({:?})", end?);
            }
        }

        Ok(TurnOutcome::Completed(result))
    }

    /// Return the session to `Idle` after `run_turn` for turn `id`.
    fn finish(&self, id: u64, result: Result<TurnOutcome, TurnError>) -> Result<TurnOutcome, TurnError> {
        let released = {
            let mut session = self.shared.lock();
            if session.turn.as_ref().is_some_and(|t| t.id == id) {
                let turn = session.turn.take();
                if let Some(turn) = &turn {
                    turn.cancel.cancel();
                }
                // A turn whose microphone never opened is still `Idle`.
                if result.is_err() && session.state.is_busy() {
                    set_state(&mut session.state, &self.shared.notifier, TurnState::Errored);
                }
                set_state(&mut session.state, &self.shared.notifier, TurnState::Idle);
                self.shared.notifier.publish_recording(false);
                Some(turn)
            } else {
                None
            }
        };

        let Some(turn) = released else {
            // Someone else already tore this turn down.
            return match result {
                Ok(outcome @ TurnOutcome::Completed(_)) => Ok(outcome),
                _ => {
                    log::info!("engine: turn {id} cancelled");
                    Ok(TurnOutcome::Cancelled)
                }
            };
        };

        self.shared.playback.stop();
        drop(turn);

        match &result {
            Ok(TurnOutcome::Completed(_)) => log::info!("engine: turn {id} completed"),
            Ok(TurnOutcome::NoSpeech) => log::info!("engine: turn {id} heard no speech"),
            Ok(TurnOutcome::Cancelled) => log::info!("engine: turn {id} cancelled"),
            Err(e) => log::error!("engine: turn {id} failed: {e}"),
        }
        result
    }

    /// Tear down the active turn (or only turn `id`): release the
    /// microphone and speaker and go back to `Idle` through `Cancelled`.
    fn teardown(&self, id: Option<u64>) {
        let turn = {
            let mut session = self.shared.lock();
            let owns = session
                .turn
                .as_ref()
                .is_some_and(|t| id.map_or(true, |id| t.id == id));
            if !owns {
                return;
            }
            let turn = session.turn.take();
            if let Some(turn) = &turn {
                turn.cancel.cancel();
                turn.status.send_modify(|status| status.is_recording = false);
            }
            // The reply is already committed while `Speaking`; the turn
            // completes with its playback cut short.
            if session.state.is_busy() && session.state != TurnState::Speaking {
                set_state(&mut session.state, &self.shared.notifier, TurnState::Cancelled);
            }
            set_state(&mut session.state, &self.shared.notifier, TurnState::Idle);
            self.shared.notifier.publish_recording(false);
            turn
        };

        self.shared.playback.stop();
        if let Some(turn) = turn {
            log::info!("engine: turn {} cancelled", turn.id);
        }
    }
}

fn apply_vad_event(scope: &mut TurnScope<'_>, event: VadEvent) {
    match event {
        VadEvent::SpeechStarted { level_db } => {
            scope.turn.heard_speech = true;
            scope.turn.status.send_modify(|status| {
                status.last_volume_db = Some(level_db);
                status.silence_started_at = None;
            });
            scope.set(TurnState::Recording);
        }
        VadEvent::SilenceStarted { at, level_db } => {
            scope.turn.status.send_modify(|status| {
                status.last_volume_db = Some(level_db);
                status.silence_started_at = Some(at);
            });
            scope.set(TurnState::SilencePending);
        }
        VadEvent::SpeechResumed { level_db } => {
            scope.turn.status.send_modify(|status| {
                status.last_volume_db = Some(level_db);
                status.silence_started_at = None;
            });
            scope.set(TurnState::Recording);
        }
        VadEvent::Level { level_db } => {
            scope.turn.status.send_modify(|status| status.last_volume_db = Some(level_db));
        }
        VadEvent::EndOfUtterance | VadEvent::Failed(_) => {}
    }
}

/// Race a collaborator call against cancellation and a timeout.
///
/// `Ok(None)` means the turn was cancelled and the call was dropped.
async fn guarded<T, E, F>(
    token: &CancellationToken,
    stage: TurnStage,
    limit: Duration,
    call: F,
) -> Result<Option<T>, TurnError>
where
    F: Future<Output = Result<T, E>>,
    TurnError: From<E>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Ok(None),
        outcome = tokio::time::timeout(limit, call) => match outcome {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                log::warn!("engine: {stage} timed out after {limit:?}");
                Err(TurnError::Timeout { stage })
            }
        },
    }
}

/// Cancels turn `id` if the `start_turn` future is dropped mid-turn.
struct TurnGuard<'a> {
    engine: &'a TurnEngine,
    id: u64,
    armed: bool,
}

impl TurnGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.engine.teardown(Some(self.id));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::ScriptedCapture;
    use crate::audio::playback::MockOutput;
    use crate::audio::CaptureError;
    use crate::config::{HistoryConfig, VadConfig};
    use crate::llm::{GenerationError, MockResponder, Role};
    use crate::pipeline::error::GenerationErrorKind;
    use crate::stt::{MockTranscriber, TranscriptionError};
    use crate::tts::{MockSynthesizer, SynthesisError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;
    use tokio::time::Instant;

    const LOUD: f32 = -20.0;
    const QUIET: f32 = -60.0;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            vad: VadConfig {
                silence_threshold_db: -40.0,
                silence_duration_ms: 2_000,
                min_recording_ms: 1_000,
                max_recording_secs: 60,
                poll_interval_ms: 100,
                ..VadConfig::default()
            },
            history: HistoryConfig { max_turns: 10 },
            transcription_timeout_secs: 30,
            reply_timeout_secs: 60,
            synthesis_timeout_secs: 30,
            speak_replies: true,
        }
    }

    struct Rig {
        capture: ScriptedCapture,
        output: MockOutput,
        stt: MockTranscriber,
        llm: MockResponder,
        tts: MockSynthesizer,
        config: EngineConfig,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                capture: ScriptedCapture::speech_then_silence(ms(500)),
                output: MockOutput::finishing_after(Duration::from_secs(1)),
                stt: MockTranscriber::ok("I feel anxious about tomorrow"),
                llm: MockResponder::ok("Peace I leave with you."),
                tts: MockSynthesizer::ok(),
                config: test_config(),
            }
        }

        fn engine(&self) -> TurnEngine {
            self.engine_with_capture(Arc::new(self.capture.clone()))
        }

        fn engine_with_capture(&self, capture: Arc<dyn CaptureDevice>) -> TurnEngine {
            TurnEngine::new(
                self.config.clone(),
                "You are Solomon.",
                Collaborators {
                    capture,
                    output: Arc::new(self.output.clone()),
                    transcriber: Arc::new(self.stt.clone()),
                    responder: Arc::new(self.llm.clone()),
                    synthesizer: Arc::new(self.tts.clone()),
                },
            )
        }
    }

    fn drain(rx: &mut broadcast::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn changed(from: TurnState, to: TurnState) -> TurnEvent {
        TurnEvent::StateChanged { from, to }
    }

    fn assert_released(rig: &Rig, engine: &TurnEngine) {
        assert_eq!(engine.state(), TurnState::Idle);
        assert_eq!(rig.capture.active_sessions(), 0, "microphone leaked");
        assert_eq!(rig.output.active_sounds(), 0, "speaker leaked");
        assert!(engine.recording_status().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn turn_ends_two_and_a_half_seconds_after_start() {
        let rig = Rig::new();
        let engine = rig.engine();
        let t0 = Instant::now();

        let outcome = engine.start_turn().await.unwrap();

        let expected = TurnResult {
            transcription: "I feel anxious about tomorrow".into(),
            reply_text: "Peace I leave with you.".into(),
        };
        assert_eq!(outcome, TurnOutcome::Completed(expected.clone()));
        assert_eq!(engine.last_result(), Some(expected));

        let calls = rig.stt.calls();
        assert_eq!(calls.len(), 1);
        let ended = calls[0] - t0;
        assert!(ended >= ms(2_500) && ended < ms(2_600), "ended at {ended:?}");

        assert_eq!(rig.tts.calls(), 1);
        assert_eq!(rig.output.loads(), 1);
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_follow_the_state_machine() {
        let rig = Rig::new();
        let engine = rig.engine();
        let mut rx = engine.subscribe();

        engine.start_turn().await.unwrap();

        use TurnState::*;
        assert_eq!(
            drain(&mut rx),
            vec![
                changed(Idle, Recording),
                TurnEvent::RecordingChanged(true),
                changed(Recording, SilencePending),
                changed(SilencePending, Transcribing),
                TurnEvent::RecordingChanged(false),
                changed(Transcribing, AwaitingReply),
                changed(AwaitingReply, Speaking),
                changed(Speaking, Idle),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn history_receives_user_then_assistant() {
        let rig = Rig::new();
        let engine = rig.engine();

        engine.start_turn().await.unwrap();

        let history = engine.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role(), Role::System);
        assert_eq!(history[1].role(), Role::User);
        assert_eq!(history[1].text(), "I feel anxious about tomorrow");
        assert_eq!(history[2].role(), Role::Assistant);

        // The reply was requested with the pending user turn last.
        let contexts = rig.llm.contexts();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].len(), 2);
        assert_eq!(contexts[0][1].text(), "I feel anxious about tomorrow");
    }

    #[tokio::test(start_paused = true)]
    async fn speech_during_silence_keeps_recording() {
        let mut rig = Rig::new();
        rig.capture = ScriptedCapture::new(|t| {
            Ok(if t < ms(500) || (t >= ms(1_500) && t < ms(2_000)) {
                LOUD
            } else {
                QUIET
            })
        });
        let engine = rig.engine();
        let mut rx = engine.subscribe();
        let t0 = Instant::now();

        engine.start_turn().await.unwrap();

        let ended = rig.stt.calls()[0] - t0;
        assert!(ended >= ms(4_000) && ended < ms(4_100), "ended at {ended:?}");
        assert!(drain(&mut rx).contains(&changed(TurnState::SilencePending, TurnState::Recording)));
    }

    #[tokio::test(start_paused = true)]
    async fn recording_status_tracks_pending_silence() {
        let mut rig = Rig::new();
        rig.capture = ScriptedCapture::new(|t| Ok(if t < ms(500) { LOUD } else { QUIET }));
        rig.config.vad.silence_duration_ms = 5_000;
        let engine = rig.engine();
        let t0 = Instant::now();

        let turn = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start_turn().await }
        });
        tokio::time::sleep(ms(1_000)).await;

        let status = engine.recording_status().unwrap();
        assert!(status.is_recording);
        assert_eq!(status.last_volume_db, Some(QUIET));
        let since = status.silence_started_at.unwrap() - t0;
        assert!(since >= ms(500) && since < ms(600), "silence from {since:?}");
        assert_eq!(engine.state(), TurnState::SilencePending);

        engine.cancel_turn();
        assert_eq!(turn.await.unwrap(), Ok(TurnOutcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_without_touching_the_first() {
        let mut rig = Rig::new();
        rig.capture = ScriptedCapture::endless_speech();
        let engine = rig.engine();

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start_turn().await }
        });
        tokio::time::sleep(ms(300)).await;

        assert_eq!(engine.start_turn().await, Err(TurnError::AlreadyInProgress));
        assert_eq!(engine.state(), TurnState::Recording);
        assert_eq!(rig.capture.sessions_started(), 1);
        assert_eq!(rig.capture.active_sessions(), 1);

        engine.cancel_turn();
        assert_eq!(first.await.unwrap(), Ok(TurnOutcome::Cancelled));
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_microphone_leaves_engine_idle() {
        let mut rig = Rig::new();
        rig.capture = ScriptedCapture::denied();
        let engine = rig.engine();

        assert_eq!(engine.start_turn().await, Err(TurnError::PermissionDenied));
        assert_eq!(engine.state(), TurnState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent_and_releases_the_microphone() {
        let mut rig = Rig::new();
        rig.capture = ScriptedCapture::endless_speech();
        let engine = rig.engine();

        let turn = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start_turn().await }
        });
        tokio::time::sleep(ms(500)).await;

        let mut rx = engine.subscribe();
        engine.cancel_turn();
        engine.cancel_turn();

        assert_eq!(turn.await.unwrap(), Ok(TurnOutcome::Cancelled));
        assert_eq!(
            drain(&mut rx),
            vec![
                changed(TurnState::Recording, TurnState::Cancelled),
                changed(TurnState::Cancelled, TurnState::Idle),
                TurnEvent::RecordingChanged(false),
            ]
        );
        assert_released(&rig, &engine);
        assert_eq!(engine.last_result(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_when_idle_does_nothing() {
        let rig = Rig::new();
        let engine = rig.engine();
        let mut rx = engine.subscribe();

        engine.cancel_turn();
        engine.stop_turn_manually();

        assert!(drain(&mut rx).is_empty());
        assert_eq!(engine.state(), TurnState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_start_cancel_cycles_leak_nothing() {
        let mut rig = Rig::new();
        rig.capture = ScriptedCapture::endless_speech();
        let engine = rig.engine();

        for _ in 0..3 {
            let turn = tokio::spawn({
                let engine = engine.clone();
                async move { engine.start_turn().await }
            });
            tokio::time::sleep(ms(200)).await;
            engine.cancel_turn();
            assert_eq!(turn.await.unwrap(), Ok(TurnOutcome::Cancelled));
        }

        assert_eq!(rig.capture.sessions_started(), 3);
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_transcription_abandons_the_call() {
        let mut rig = Rig::new();
        rig.stt = MockTranscriber::ok("hello").with_delay(Duration::from_secs(10));
        let engine = rig.engine();

        let turn = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start_turn().await }
        });
        tokio::time::sleep(ms(4_000)).await;
        assert_eq!(engine.state(), TurnState::Transcribing);

        engine.cancel_turn();
        assert_eq!(turn.await.unwrap(), Ok(TurnOutcome::Cancelled));
        assert!(rig.llm.contexts().is_empty());
        assert_eq!(engine.history().len(), 1);
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_transcription_is_no_speech() {
        let mut rig = Rig::new();
        rig.stt = MockTranscriber::ok("   ");
        let engine = rig.engine();

        assert_eq!(engine.start_turn().await, Ok(TurnOutcome::NoSpeech));
        assert!(rig.llm.contexts().is_empty());
        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.last_result(), None);
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_recording_skips_transcription() {
        let mut rig = Rig::new();
        rig.capture = ScriptedCapture::new(|_| Ok(QUIET));
        let engine = rig.engine();
        let t0 = Instant::now();

        assert_eq!(engine.start_turn().await, Ok(TurnOutcome::NoSpeech));
        assert!(t0.elapsed() >= ms(2_000));
        assert!(rig.stt.calls().is_empty());
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_reply_leaves_history_unchanged() {
        let mut rig = Rig::new();
        rig.llm = MockResponder::err(GenerationError::RateLimited);
        let engine = rig.engine();
        let mut rx = engine.subscribe();

        assert_eq!(
            engine.start_turn().await,
            Err(TurnError::GenerationFailed(GenerationErrorKind::RateLimited))
        );
        assert_eq!(engine.history().len(), 1);
        assert_eq!(rig.tts.calls(), 0);

        let events = drain(&mut rx);
        assert!(events.contains(&changed(TurnState::AwaitingReply, TurnState::Errored)));
        assert_eq!(events.last(), Some(&changed(TurnState::Errored, TurnState::Idle)));
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_transcription_times_out() {
        let mut rig = Rig::new();
        rig.stt = MockTranscriber::ok("too late").with_delay(Duration::from_secs(120));
        let engine = rig.engine();
        let t0 = Instant::now();

        assert_eq!(
            engine.start_turn().await,
            Err(TurnError::Timeout { stage: TurnStage::Transcription })
        );
        let elapsed = t0.elapsed();
        assert!(elapsed >= ms(32_500) && elapsed < ms(33_000), "elapsed {elapsed:?}");
        assert!(rig.llm.contexts().is_empty());
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_signal_fails_the_turn() {
        let mut rig = Rig::new();
        rig.capture = ScriptedCapture::new(|t| {
            if t >= ms(300) {
                Err(CaptureError::NoSignal)
            } else {
                Ok(LOUD)
            }
        });
        let engine = rig.engine();

        assert!(matches!(engine.start_turn().await, Err(TurnError::DeviceFailure(_))));
        assert!(rig.stt.calls().is_empty());
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_stop_ends_recording_immediately() {
        let mut rig = Rig::new();
        rig.capture = ScriptedCapture::endless_speech();
        let engine = rig.engine();
        let t0 = Instant::now();

        let turn = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start_turn().await }
        });
        tokio::time::sleep(ms(1_000)).await;
        engine.stop_turn_manually();

        assert!(matches!(turn.await.unwrap(), Ok(TurnOutcome::Completed(_))));
        let ended = rig.stt.calls()[0] - t0;
        assert!(ended >= ms(1_000) && ended < ms(1_100), "ended at {ended:?}");
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_option_skips_speech() {
        let rig = Rig::new();
        let engine = rig.engine();

        let outcome = engine.start_turn_with(TurnOptions::silent()).await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed(_)));
        assert_eq!(rig.tts.calls(), 0);
        assert_eq!(rig.output.loads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn synthesis_failure_keeps_committed_reply() {
        let mut rig = Rig::new();
        rig.tts = MockSynthesizer::err(SynthesisError::EmptyAudio);
        let engine = rig.engine();

        assert!(matches!(engine.start_turn().await, Err(TurnError::SynthesisFailed(_))));
        assert_eq!(engine.history().len(), 3);
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_speaking_interrupts_playback() {
        let mut rig = Rig::new();
        rig.output = MockOutput::endless();
        let engine = rig.engine();

        let turn = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start_turn().await }
        });
        tokio::time::sleep(ms(5_000)).await;
        assert_eq!(engine.state(), TurnState::Speaking);
        assert_eq!(rig.output.active_sounds(), 1);

        let mut rx = engine.subscribe();
        engine.cancel_turn();

        assert!(matches!(turn.await.unwrap(), Ok(TurnOutcome::Completed(_))));
        assert_eq!(drain(&mut rx), vec![changed(TurnState::Speaking, TurnState::Idle)]);
        assert_eq!(engine.history().len(), 3);
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_synthesis_skips_playback() {
        let mut rig = Rig::new();
        rig.tts = MockSynthesizer::ok().with_delay(Duration::from_secs(10));
        let engine = rig.engine();

        let turn = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start_turn().await }
        });
        tokio::time::sleep(ms(4_000)).await;
        assert_eq!(engine.state(), TurnState::Speaking);
        assert_eq!(rig.tts.calls(), 1);

        engine.cancel_turn();

        assert!(matches!(turn.await.unwrap(), Ok(TurnOutcome::Completed(_))));
        assert_eq!(rig.output.loads(), 0);
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_speech_fails_without_loading_a_sound() {
        let mut rig = Rig::new();
        rig.output = MockOutput::undecodable();
        let engine = rig.engine();

        assert!(matches!(engine.start_turn().await, Err(TurnError::DeviceFailure(_))));
        assert_eq!(rig.output.loads(), 0);
        assert_eq!(engine.history().len(), 3);
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_transcription_releases_the_microphone() {
        let mut rig = Rig::new();
        rig.stt = MockTranscriber::err(TranscriptionError::Api {
            status: 500,
            body: "upstream error".into(),
        });
        let engine = rig.engine();

        assert!(matches!(engine.start_turn().await, Err(TurnError::TranscriptionFailed(_))));
        assert!(rig.llm.contexts().is_empty());
        assert_eq!(engine.history().len(), 1);
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_awaiting_reply_commits_nothing() {
        let mut rig = Rig::new();
        rig.llm = MockResponder::ok("too late").with_delay(Duration::from_secs(10));
        let engine = rig.engine();

        let turn = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start_turn().await }
        });
        tokio::time::sleep(ms(4_000)).await;
        assert_eq!(engine.state(), TurnState::AwaitingReply);

        let mut rx = engine.subscribe();
        engine.cancel_turn();

        assert_eq!(turn.await.unwrap(), Ok(TurnOutcome::Cancelled));
        assert_eq!(
            drain(&mut rx),
            vec![
                changed(TurnState::AwaitingReply, TurnState::Cancelled),
                changed(TurnState::Cancelled, TurnState::Idle),
            ]
        );
        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.last_result(), None);
        assert_eq!(rig.tts.calls(), 0);
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reply_times_out() {
        let mut rig = Rig::new();
        rig.llm = MockResponder::ok("too late").with_delay(Duration::from_secs(600));
        let engine = rig.engine();
        let t0 = Instant::now();

        assert_eq!(
            engine.start_turn().await,
            Err(TurnError::Timeout { stage: TurnStage::Reply })
        );
        let elapsed = t0.elapsed();
        assert!(elapsed >= ms(62_500) && elapsed < ms(63_000), "elapsed {elapsed:?}");
        assert_eq!(engine.history().len(), 1);
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_reply_is_reported_by_kind() {
        let mut rig = Rig::new();
        rig.llm = MockResponder::err(GenerationError::Unauthorized);
        let engine = rig.engine();

        assert_eq!(
            engine.start_turn().await,
            Err(TurnError::GenerationFailed(GenerationErrorKind::Unauthorized))
        );
        assert_eq!(engine.history().len(), 1);
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn recording_status_follows_the_current_level() {
        let mut rig = Rig::new();
        rig.capture = ScriptedCapture::new(|t| Ok(if t < ms(500) { LOUD } else { -5.0 }));
        let engine = rig.engine();

        let turn = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start_turn().await }
        });
        tokio::time::sleep(ms(300)).await;
        assert_eq!(engine.recording_status().unwrap().last_volume_db, Some(LOUD));

        tokio::time::sleep(ms(1_200)).await;
        let status = engine.recording_status().unwrap();
        assert_eq!(status.last_volume_db, Some(-5.0));
        assert_eq!(status.silence_started_at, None);
        assert_eq!(engine.state(), TurnState::Recording);

        engine.cancel_turn();
        assert_eq!(turn.await.unwrap(), Ok(TurnOutcome::Cancelled));
    }

    /// Capture device whose `start` blocks until the test opens the gate.
    struct GatedCapture {
        inner: ScriptedCapture,
        gate: Mutex<std_mpsc::Receiver<()>>,
        entered: Arc<AtomicUsize>,
    }

    impl GatedCapture {
        fn new(inner: ScriptedCapture) -> (Arc<Self>, std_mpsc::Sender<()>) {
            let (open, gate) = std_mpsc::channel();
            let device = Arc::new(Self {
                inner,
                gate: Mutex::new(gate),
                entered: Arc::new(AtomicUsize::new(0)),
            });
            (device, open)
        }

        fn opening(&self) -> bool {
            self.entered.load(Ordering::SeqCst) > 0
        }
    }

    impl CaptureDevice for GatedCapture {
        fn start(&self) -> Result<Box<dyn CaptureSession>, CaptureError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let _ = self.gate.lock().unwrap().recv();
            self.inner.start()
        }
    }

    async fn wait_until(mut ready: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !ready() {
                tokio::time::sleep(ms(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn observers_are_not_blocked_while_the_microphone_opens() {
        let rig = Rig::new();
        let mic = ScriptedCapture::endless_speech();
        let (device, open) = GatedCapture::new(mic.clone());
        let engine = rig.engine_with_capture(device.clone());

        let turn = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start_turn().await }
        });
        wait_until(|| device.opening()).await;

        assert_eq!(engine.state(), TurnState::Idle);
        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.start_turn().await, Err(TurnError::AlreadyInProgress));
        engine.stop_turn_manually();

        open.send(()).unwrap();
        wait_until(|| engine.state() == TurnState::Recording).await;
        assert_eq!(mic.active_sessions(), 1);

        engine.cancel_turn();
        assert_eq!(turn.await.unwrap(), Ok(TurnOutcome::Cancelled));
        assert_eq!(mic.active_sessions(), 0);
    }

    #[tokio::test]
    async fn cancel_while_the_microphone_opens_releases_it() {
        let rig = Rig::new();
        let mic = ScriptedCapture::endless_speech();
        let (device, open) = GatedCapture::new(mic.clone());
        let engine = rig.engine_with_capture(device.clone());
        let mut rx = engine.subscribe();

        let turn = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start_turn().await }
        });
        wait_until(|| device.opening()).await;

        engine.cancel_turn();
        assert_eq!(turn.await.unwrap(), Ok(TurnOutcome::Cancelled));
        assert_eq!(engine.state(), TurnState::Idle);

        // The late session is dropped as soon as the device hands it over.
        open.send(()).unwrap();
        wait_until(|| mic.sessions_started() == 1 && mic.active_sessions() == 0).await;
        assert_eq!(engine.state(), TurnState::Idle);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_turn_future_cancels_it() {
        let mut rig = Rig::new();
        rig.capture = ScriptedCapture::endless_speech();
        let engine = rig.engine();

        let result = tokio::time::timeout(ms(1_000), engine.start_turn()).await;
        assert!(result.is_err());
        assert_released(&rig, &engine);
        assert_eq!(rig.capture.sessions_started(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_capture_is_no_speech() {
        let mut rig = Rig::new();
        rig.capture = ScriptedCapture::speech_then_silence(ms(500)).with_wav(Vec::new());
        let engine = rig.engine();

        assert_eq!(engine.start_turn().await, Ok(TurnOutcome::NoSpeech));
        assert!(rig.stt.calls().is_empty());
        assert_released(&rig, &engine);
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_capped_across_turns() {
        let mut rig = Rig::new();
        rig.config.history.max_turns = 4;
        let engine = rig.engine();

        for _ in 0..3 {
            engine.start_turn_with(TurnOptions::silent()).await.unwrap();
        }

        let history = engine.history();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].role(), Role::System);
        assert_eq!(history[1].role(), Role::User);

        engine.clear_history();
        assert_eq!(engine.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recording_callback_sees_open_and_close() {
        let rig = Rig::new();
        let engine = rig.engine();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = engine.on_recording_change(move |recording| {
            let _ = tx.send(recording);
        });

        engine.start_turn().await.unwrap();

        assert_eq!(rx.recv().await, Some(true));
        assert_eq!(rx.recv().await, Some(false));
    }
}
