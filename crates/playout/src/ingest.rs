//! Frame ingestion: validator, gap recovery and RT handoff in one place.

use std::time::Duration;

use sidecarconf::PlaybackConfig;
use sidecarproto::{decode_pcm_base64, AudioFrame, CaptureSession, FramePayload};
use tracing::{debug, warn};

use crate::queue::{PlaybackMessage, PlaybackSender};
use crate::recovery::{recoverable_silence_frames, silence_len};
use crate::throttle::LogThrottle;
use crate::validator::{validate, AcceptedFrame, RejectReason, ValidationContext};

/// Result of feeding one frame through the ingestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted {
        missing_frames: u64,
        /// Whole frames of silence queued ahead of this one.
        silence_frames: u32,
    },
    Rejected(RejectReason),
    /// Frame was valid but the RT handoff ring was full.
    HandoffFull,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestCounters {
    pub accepted: u64,
    pub rejected: u64,
    pub silence_frames_inserted: u64,
    pub handoff_dropped: u64,
    /// Broadcast events lost upstream before the ingestor saw them. Not all
    /// of them were frames, so this bounds the frame loss from above.
    pub lagged_events: u64,
}

/// Owns the per-session validation state and the producer side of the
/// playback handoff. Lives on the control side.
pub struct FrameIngestor {
    ctx: ValidationContext,
    insert_silence: bool,
    max_recoverable_frames: u32,
    sender: PlaybackSender,
    throttle: LogThrottle<&'static str>,
    counters: IngestCounters,
}

impl FrameIngestor {
    pub fn new(
        session: &CaptureSession,
        output_channels: u16,
        config: &PlaybackConfig,
        sender: PlaybackSender,
    ) -> Self {
        Self::with_log_window(session, output_channels, config, sender, config.log_window())
    }

    fn with_log_window(
        session: &CaptureSession,
        output_channels: u16,
        config: &PlaybackConfig,
        sender: PlaybackSender,
        log_window: Duration,
    ) -> Self {
        Self {
            ctx: ValidationContext::new(&session.session_id, session.sample_rate, output_channels),
            insert_silence: config.insert_silence,
            max_recoverable_frames: config.max_recoverable_frames,
            sender,
            throttle: LogThrottle::new(log_window),
            counters: IngestCounters::default(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.ctx.expected_session_id
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.ctx.last_sequence
    }

    pub fn counters(&self) -> IngestCounters {
        self.counters
    }

    pub fn sender(&self) -> &PlaybackSender {
        &self.sender
    }

    pub fn ingest(&mut self, frame: &AudioFrame) -> IngestOutcome {
        let accepted = match validate(frame, &self.ctx) {
            Ok(accepted) => accepted,
            Err(reason) => return self.reject(reason, frame),
        };
        self.ctx.last_sequence = Some(accepted.sequence);

        let Some(samples) = self.decode_payload(frame, &accepted) else {
            return self.reject(RejectReason::MalformedPayload, frame);
        };

        let silence_frames = self.recover_gap(&accepted);

        if self.sender.send(PlaybackMessage::Chunk(samples)).is_err() {
            self.counters.handoff_dropped += 1;
            return IngestOutcome::HandoffFull;
        }

        self.counters.accepted += 1;
        IngestOutcome::Accepted {
            missing_frames: accepted.missing_frame_count,
            silence_frames,
        }
    }

    /// Switch to a new session: forget sequence history and flush the queue.
    pub fn restart(&mut self, session: &CaptureSession) {
        self.ctx.expected_session_id = session.session_id.clone();
        self.ctx.sample_rate = session.sample_rate;
        self.reset();
    }

    /// Flush the playback queue and forget sequence history.
    pub fn reset(&mut self) {
        self.ctx.last_sequence = None;
        self.throttle.clear();
        if self.sender.send(PlaybackMessage::Reset).is_err() {
            warn!(
                "Playback handoff full, reset for session {} not delivered",
                self.ctx.expected_session_id
            );
        }
    }

    /// Record upstream events lost by a lagging subscriber.
    pub fn note_lagged(&mut self, events: u64) {
        self.counters.lagged_events += events;
        if let Some(suppressed) = self.throttle.check("lagged") {
            warn!(
                "Session {} lost {} events before ingestion ({} similar suppressed)",
                self.ctx.expected_session_id, events, suppressed
            );
        }
    }

    fn reject(&mut self, reason: RejectReason, frame: &AudioFrame) -> IngestOutcome {
        self.counters.rejected += 1;
        if !reason.is_silent() {
            if let Some(suppressed) = self.throttle.check(reason.as_str()) {
                warn!(
                    "Dropping frame for session {}: {} (sequence={:?}, {} similar suppressed)",
                    frame.session_id, reason, frame.sequence, suppressed
                );
            }
        }
        IngestOutcome::Rejected(reason)
    }

    fn decode_payload(&mut self, frame: &AudioFrame, accepted: &AcceptedFrame) -> Option<Vec<f32>> {
        let expected = accepted.expected_samples();
        let samples = match frame.payload.as_ref()? {
            FramePayload::Samples { samples } => {
                if samples.len() != expected {
                    return None;
                }
                let mut buf = self.sender.take_buffer(expected);
                buf.extend_from_slice(samples);
                buf
            }
            FramePayload::Encoded { pcm_base64, .. } => decode_pcm_base64(pcm_base64).ok()?,
        };
        (samples.len() == expected).then_some(samples)
    }

    /// Queue silence for missing frames. Returns whole frames inserted.
    fn recover_gap(&mut self, accepted: &AcceptedFrame) -> u32 {
        if accepted.missing_frame_count == 0 {
            return 0;
        }
        if let Some(suppressed) = self.throttle.check("sequence-gap") {
            debug!(
                "Session {} missing {} frames before sequence {} ({} similar suppressed)",
                self.ctx.expected_session_id,
                accepted.missing_frame_count,
                accepted.sequence,
                suppressed
            );
        }
        if !self.insert_silence {
            return 0;
        }

        let frames = recoverable_silence_frames(
            accepted.missing_frame_count as f64,
            self.max_recoverable_frames,
        );
        if frames == 0 {
            return 0;
        }

        let len = silence_len(frames, accepted.frame_count, accepted.channels);
        let mut silence = self.sender.take_buffer(len);
        silence.resize(len, 0.0);
        if self.sender.send(PlaybackMessage::Chunk(silence)).is_err() {
            self.counters.handoff_dropped += 1;
            return 0;
        }
        self.counters.silence_frames_inserted += u64::from(frames);
        frames
    }
}
