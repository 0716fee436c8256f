//! Multi-subscriber turn events.
//!
//! [`StateNotifier`] fans [`TurnEvent`]s out over a `tokio` broadcast
//! channel.  Publishing never blocks; a subscriber that falls behind skips
//! the events it missed instead of holding up the engine.
//!
//! Hosts that only care about the microphone indicator can register a plain
//! callback with [`StateNotifier::on_recording_change`] and keep the
//! returned [`Subscription`] for as long as they want to be called.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::pipeline::state::TurnState;

/// Events buffered per subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    /// The microphone opened (`true`) or closed (`false`).
    RecordingChanged(bool),
    StateChanged { from: TurnState, to: TurnState },
}

pub struct StateNotifier {
    tx: broadcast::Sender<TurnEvent>,
    recording: AtomicBool,
}

impl StateNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            recording: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.tx.subscribe()
    }

    /// Publish a recording flag change.  Repeating the last published value
    /// is a no-op; returns whether an event was sent.
    pub fn publish_recording(&self, recording: bool) -> bool {
        if self.recording.swap(recording, Ordering::SeqCst) == recording {
            return false;
        }
        // No subscribers is fine.
        let _ = self.tx.send(TurnEvent::RecordingChanged(recording));
        true
    }

    pub fn publish_state(&self, from: TurnState, to: TurnState) {
        if from != to {
            let _ = self.tx.send(TurnEvent::StateChanged { from, to });
        }
    }

    /// Call `callback` with every recording change until the returned
    /// [`Subscription`] is unsubscribed or dropped.
    ///
    /// Must be called from within a `tokio` runtime.
    pub fn on_recording_change<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(bool) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let token = CancellationToken::new();
        let task_token = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(TurnEvent::RecordingChanged(recording)) => {
                            if task_token.is_cancelled() {
                                break;
                            }
                            callback(recording);
                        }
                        Ok(TurnEvent::StateChanged { .. }) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("notifier: subscriber lagged, skipped {skipped} events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        Subscription { token }
    }
}

impl Default for StateNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Live callback registration.  Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    /// Stop delivering events.  Idempotent.
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
