//! Bounded capture buffer with input-level metering.
//!
//! [`CaptureBuffer`] is filled from the audio callback thread and drained
//! once when the recording ends.  Besides the samples it remembers the level
//! of the most recent callback block and when that block arrived, which is
//! what the voice-activity monitor polls.
//!
//! When the buffer is full, new samples **overwrite** the oldest data so the
//! tail of an over-long recording survives.
//!
//! # Example
//!
//! ```rust
//! use voice_turn::audio::CaptureBuffer;
//!
//! let mut buf = CaptureBuffer::new(4);
//! buf.push_block(&[0.1, 0.2, 0.3, 0.4, 0.5]); // 5 items → capacity 4 → oldest dropped
//! assert!(buf.level_dbfs().is_some());
//! assert_eq!(buf.drain(), vec![0.2, 0.3, 0.4, 0.5]);
//! ```

use std::time::Instant;

/// Level reported for digital silence (`rms == 0`), in dBFS.
pub const SILENCE_FLOOR_DB: f32 = -100.0;

/// RMS level of `block` in dBFS, clamped to [`SILENCE_FLOOR_DB`].
///
/// Full-scale (±1.0) square signals measure 0 dBFS.
pub fn rms_dbfs(block: &[f32]) -> f32 {
    if block.is_empty() {
        return SILENCE_FLOOR_DB;
    }
    let mean_sq = block.iter().map(|s| s * s).sum::<f32>() / block.len() as f32;
    let rms = mean_sq.sqrt();
    if rms <= 0.0 {
        return SILENCE_FLOOR_DB;
    }
    (20.0 * rms.log10()).max(SILENCE_FLOOR_DB)
}

// ---------------------------------------------------------------------------
// CaptureBuffer
// ---------------------------------------------------------------------------

/// Fixed-capacity circular sample store plus level bookkeeping.
pub struct CaptureBuffer {
    buf: Vec<f32>,
    capacity: usize,
    /// Index of the *next* write position (wraps around `capacity`).
    write_pos: usize,
    /// Number of valid samples currently stored (≤ `capacity`).
    len: usize,
    last_level_db: Option<f32>,
    last_block_at: Option<Instant>,
    failure: Option<String>,
}

impl CaptureBuffer {
    /// Create a buffer holding at most `capacity` samples.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "CaptureBuffer capacity must be > 0");
        Self {
            buf: vec![0.0; capacity],
            capacity,
            write_pos: 0,
            len: 0,
            last_level_db: None,
            last_block_at: None,
            failure: None,
        }
    }

    /// Append one callback block and update the level meter.
    pub fn push_block(&mut self, block: &[f32]) {
        for &sample in block {
            self.buf[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.capacity;
            if self.len < self.capacity {
                self.len += 1;
            }
        }
        self.last_level_db = Some(rms_dbfs(block));
        self.last_block_at = Some(Instant::now());
    }

    /// Record a stream failure reported by the audio backend.
    ///
    /// The first failure wins; later ones are usually consequences of it.
    pub fn record_failure(&mut self, message: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(message.into());
        }
    }

    /// Drain all stored samples in chronological order.
    pub fn drain(&mut self) -> Vec<f32> {
        // Until the first overflow valid data starts at 0; afterwards the
        // oldest sample sits at `write_pos`.
        let read_pos = if self.len < self.capacity {
            0
        } else {
            self.write_pos
        };

        let out = (0..self.len)
            .map(|i| self.buf[(read_pos + i) % self.capacity])
            .collect();

        self.write_pos = 0;
        self.len = 0;
        out
    }

    /// Level of the most recent block, `None` before any audio arrived.
    pub fn level_dbfs(&self) -> Option<f32> {
        self.last_level_db
    }

    /// Arrival time of the most recent block.
    pub fn last_block_at(&self) -> Option<Instant> {
        self.last_block_at
    }

    /// Backend failure message, if the stream reported one.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
