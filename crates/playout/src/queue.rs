//! Playback queue (jitter buffer) and the lock-free handoff that feeds it.
//!
//! ```text
//! control side                         RT audio callback
//! ────────────                         ─────────────────
//! FrameIngestor ── PlaybackSender ──▶ rtrb ──▶ PlaybackQueue::render()
//!        ▲                                         │      │
//!        └──────────── recycled Vec<f32> ◀── rtrb ─┘      │
//! QueueMonitor ◀──────────── QueueEvent ◀──── rtrb ───────┘
//! ```
//!
//! The RT side never locks, never logs and never allocates: chunk buffers
//! travel back to the control side for reuse, and everything worth
//! reporting goes out as a [`QueueEvent`] or an atomic counter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rtrb::{Consumer, Producer};
use sidecarconf::PlaybackMode;

/// Messages from the control side into the RT context.
#[derive(Debug)]
pub enum PlaybackMessage {
    /// Interleaved f32 samples.
    Chunk(Vec<f32>),
    /// Drop everything buffered. Sent when a session restarts or ends.
    Reset,
}

/// Depth tuning, in chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueProfile {
    /// Depth to build up before playback starts, and the floor trimming returns to.
    pub target_depth: usize,
    /// Proactive trim threshold. `None` never trims.
    pub trim_above: Option<usize>,
    /// Hard cap; pushing past it evicts the oldest chunks.
    pub max_depth: usize,
}

impl QueueProfile {
    pub const LOW_LATENCY: Self = Self {
        target_depth: 6,
        trim_above: Some(10),
        max_depth: 16,
    };

    pub const STABLE: Self = Self {
        target_depth: 12,
        trim_above: None,
        max_depth: 24,
    };

    pub fn for_mode(mode: PlaybackMode) -> Self {
        match mode {
            PlaybackMode::LowLatency => Self::LOW_LATENCY,
            PlaybackMode::Stable => Self::STABLE,
        }
    }
}

/// Something the RT context wants the control side to know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// Target depth reached; playback (re)started.
    Primed { depth: usize },
    /// Cap exceeded; oldest chunks evicted.
    Overflow { dropped: usize, depth: usize },
    /// Low-latency trim back down to target.
    Trim { dropped: usize, depth: usize },
    /// Ran dry mid-playback; rebuffering.
    Underrun,
    /// Periodic depth report.
    Depth { depth: usize, buffered_samples: usize },
    Reset,
}

/// Counters written by the RT context, read anywhere.
#[derive(Debug, Default)]
pub struct QueueStats {
    pub chunks_received: AtomicU64,
    pub chunks_played: AtomicU64,
    pub samples_rendered: AtomicU64,
    pub overflow_drops: AtomicU64,
    pub trim_drops: AtomicU64,
    pub underruns: AtomicU64,
    pub resets: AtomicU64,
    /// Chunks the control side could not hand off because the ring was full.
    pub handoff_drops: AtomicU64,
    /// Events lost because the monitor fell behind.
    pub events_lost: AtomicU64,
    pub depth: AtomicUsize,
    // Don't count underruns until playback has started once
    pub warmed_up: AtomicBool,
}

/// Point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub chunks_received: u64,
    pub chunks_played: u64,
    pub samples_rendered: u64,
    pub overflow_drops: u64,
    pub trim_drops: u64,
    pub underruns: u64,
    pub resets: u64,
    pub handoff_drops: u64,
    pub events_lost: u64,
    pub depth: usize,
    pub warmed_up: bool,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_played: self.chunks_played.load(Ordering::Relaxed),
            samples_rendered: self.samples_rendered.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
            trim_drops: self.trim_drops.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            handoff_drops: self.handoff_drops.load(Ordering::Relaxed),
            events_lost: self.events_lost.load(Ordering::Relaxed),
            depth: self.depth.load(Ordering::Relaxed),
            warmed_up: self.warmed_up.load(Ordering::Relaxed),
        }
    }
}

/// Control-side end of the handoff.
pub struct PlaybackSender {
    messages: Producer<PlaybackMessage>,
    recycled: Consumer<Vec<f32>>,
    stats: Arc<QueueStats>,
}

impl PlaybackSender {
    pub(crate) fn new(
        messages: Producer<PlaybackMessage>,
        recycled: Consumer<Vec<f32>>,
        stats: Arc<QueueStats>,
    ) -> Self {
        Self {
            messages,
            recycled,
            stats,
        }
    }

    /// Hand a message to the RT context. Never blocks; a full ring hands
    /// the message back.
    pub fn send(&mut self, message: PlaybackMessage) -> Result<(), PlaybackMessage> {
        match self.messages.push(message) {
            Ok(()) => Ok(()),
            Err(rtrb::PushError::Full(message)) => {
                self.stats.handoff_drops.fetch_add(1, Ordering::Relaxed);
                Err(message)
            }
        }
    }

    /// An empty buffer, reusing one the RT side has finished with if possible.
    pub fn take_buffer(&mut self, capacity: usize) -> Vec<f32> {
        match self.recycled.pop() {
            Ok(mut buf) => {
                buf.clear();
                buf.reserve(capacity);
                buf
            }
            Err(_) => Vec::with_capacity(capacity),
        }
    }

    pub fn stats(&self) -> &Arc<QueueStats> {
        &self.stats
    }

    /// True once the RT side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.messages.is_abandoned()
    }
}

/// RT-side jitter buffer. Owned by the audio callback.
pub struct PlaybackQueue {
    profile: QueueProfile,
    chunks: VecDeque<Vec<f32>>,
    /// Read position inside the front chunk.
    cursor: usize,
    primed: bool,
    messages: Consumer<PlaybackMessage>,
    recycle: Producer<Vec<f32>>,
    events: Producer<QueueEvent>,
    stats: Arc<QueueStats>,
    telemetry_every: Option<u64>,
    since_telemetry: u64,
}

impl PlaybackQueue {
    pub(crate) fn new(
        profile: QueueProfile,
        messages: Consumer<PlaybackMessage>,
        recycle: Producer<Vec<f32>>,
        events: Producer<QueueEvent>,
        stats: Arc<QueueStats>,
        telemetry_every: Option<u64>,
    ) -> Self {
        Self {
            profile,
            // +1: a push may briefly sit one over the cap before eviction
            chunks: VecDeque::with_capacity(profile.max_depth + 1),
            cursor: 0,
            primed: false,
            messages,
            recycle,
            events,
            stats,
            telemetry_every,
            since_telemetry: 0,
        }
    }

    pub fn profile(&self) -> QueueProfile {
        self.profile
    }

    pub fn depth(&self) -> usize {
        self.chunks.len()
    }

    /// Fill `out` with interleaved samples, padding with silence when the
    /// queue is priming or dry. Returns how many real samples were written.
    pub fn render(&mut self, out: &mut [f32]) -> usize {
        self.receive();
        self.trim();

        if !self.primed && !self.chunks.is_empty() && self.chunks.len() >= self.profile.target_depth
        {
            self.primed = true;
            self.stats.warmed_up.store(true, Ordering::Relaxed);
            self.post(QueueEvent::Primed {
                depth: self.chunks.len(),
            });
        }

        let mut written = 0;
        if self.primed {
            while written < out.len() {
                let Some(front) = self.chunks.front() else {
                    break;
                };
                let available = &front[self.cursor.min(front.len())..];
                let n = available.len().min(out.len() - written);
                out[written..written + n].copy_from_slice(&available[..n]);
                written += n;
                self.cursor += n;

                if self.cursor >= front.len() {
                    self.cursor = 0;
                    if let Some(done) = self.chunks.pop_front() {
                        self.retire(done);
                    }
                    self.stats.chunks_played.fetch_add(1, Ordering::Relaxed);
                }
            }

            if written < out.len() {
                self.primed = false;
                self.stats.underruns.fetch_add(1, Ordering::Relaxed);
                self.post(QueueEvent::Underrun);
            }
        }
        out[written..].fill(0.0);

        self.stats
            .samples_rendered
            .fetch_add(written as u64, Ordering::Relaxed);
        self.stats.depth.store(self.chunks.len(), Ordering::Relaxed);
        self.telemetry(out.len());
        written
    }

    fn receive(&mut self) {
        while let Ok(message) = self.messages.pop() {
            match message {
                PlaybackMessage::Chunk(chunk) => {
                    self.stats.chunks_received.fetch_add(1, Ordering::Relaxed);
                    self.chunks.push_back(chunk);
                    if self.chunks.len() > self.profile.max_depth {
                        let dropped = self.drop_oldest(self.profile.max_depth);
                        self.stats
                            .overflow_drops
                            .fetch_add(dropped as u64, Ordering::Relaxed);
                        self.post(QueueEvent::Overflow {
                            dropped,
                            depth: self.chunks.len(),
                        });
                    }
                }
                PlaybackMessage::Reset => {
                    self.drop_oldest(0);
                    self.primed = false;
                    self.since_telemetry = 0;
                    self.stats.resets.fetch_add(1, Ordering::Relaxed);
                    self.post(QueueEvent::Reset);
                }
            }
        }
    }

    fn trim(&mut self) {
        let Some(threshold) = self.profile.trim_above else {
            return;
        };
        if self.chunks.len() > threshold {
            let dropped = self.drop_oldest(self.profile.target_depth);
            self.stats
                .trim_drops
                .fetch_add(dropped as u64, Ordering::Relaxed);
            self.post(QueueEvent::Trim {
                dropped,
                depth: self.chunks.len(),
            });
        }
    }

    /// Evict from the front until at most `keep` chunks remain.
    fn drop_oldest(&mut self, keep: usize) -> usize {
        let mut dropped = 0;
        while self.chunks.len() > keep {
            if let Some(chunk) = self.chunks.pop_front() {
                self.retire(chunk);
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.cursor = 0;
        }
        dropped
    }

    fn retire(&mut self, chunk: Vec<f32>) {
        // A full recycle ring frees the buffer here; rare enough to accept.
        let _ = self.recycle.push(chunk);
    }

    fn post(&mut self, event: QueueEvent) {
        if self.events.push(event).is_err() {
            self.stats.events_lost.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn telemetry(&mut self, rendered: usize) {
        let Some(every) = self.telemetry_every else {
            return;
        };
        self.since_telemetry += rendered as u64;
        if self.since_telemetry >= every {
            self.since_telemetry = 0;
            let buffered_samples =
                self.chunks.iter().map(Vec::len).sum::<usize>().saturating_sub(self.cursor);
            self.post(QueueEvent::Depth {
                depth: self.chunks.len(),
                buffered_samples,
            });
        }
    }
}
