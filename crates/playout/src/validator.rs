//! Inbound frame screening.
//!
//! [`validate`] is a pure function of the frame and a [`ValidationContext`].
//! It never mutates the context; the caller advances `last_sequence` only
//! for frames that come back accepted.

use std::fmt;

use sidecarproto::{AudioFrame, FramePayload, PCM_ENCODING, PROTOCOL_VERSION};

/// Largest integer an f64 header field can carry exactly.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Why a frame was kept out of the playback queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    SessionMismatch,
    UnsupportedProtocol,
    UnsupportedEncoding,
    SampleRateMismatch,
    InvalidSequence,
    OutOfOrderSequence,
    MalformedHeader,
    ChannelMismatch,
    MalformedPayload,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::SessionMismatch => "session-mismatch",
            RejectReason::UnsupportedProtocol => "unsupported-protocol",
            RejectReason::UnsupportedEncoding => "unsupported-encoding",
            RejectReason::SampleRateMismatch => "sample-rate-mismatch",
            RejectReason::InvalidSequence => "invalid-sequence",
            RejectReason::OutOfOrderSequence => "out-of-order-sequence",
            RejectReason::MalformedHeader => "malformed-header",
            RejectReason::ChannelMismatch => "channel-mismatch",
            RejectReason::MalformedPayload => "malformed-payload",
        }
    }

    /// Session mismatches are routine during session switches and never logged.
    pub fn is_silent(&self) -> bool {
        matches!(self, RejectReason::SessionMismatch)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the validator compares a frame against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationContext {
    pub expected_session_id: String,
    pub sample_rate: u32,
    /// Output channel count; frames must match it exactly.
    pub channels: u16,
    /// Sequence of the last accepted frame, if any.
    pub last_sequence: Option<u64>,
}

impl ValidationContext {
    pub fn new(expected_session_id: impl Into<String>, sample_rate: u32, channels: u16) -> Self {
        Self {
            expected_session_id: expected_session_id.into(),
            sample_rate,
            channels,
            last_sequence: None,
        }
    }
}

/// Header facts of an accepted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedFrame {
    pub sequence: u64,
    pub frame_count: u32,
    pub channels: u16,
    /// Sequence numbers skipped since the last accepted frame.
    pub sequence_gap_frames: u64,
    /// Sidecar's own drop counter, floored.
    pub dropped_frame_count: u64,
    pub missing_frame_count: u64,
}

impl AcceptedFrame {
    /// Interleaved sample count the payload must carry.
    pub fn expected_samples(&self) -> usize {
        self.frame_count as usize * self.channels as usize
    }
}

/// Non-negative integer view of a JSON number.
fn exact_index(value: f64) -> Option<u64> {
    (value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= MAX_EXACT_INTEGER)
        .then_some(value as u64)
}

fn positive_integer(value: Option<f64>) -> Option<u64> {
    value.and_then(exact_index).filter(|v| *v > 0)
}

/// Screen one frame. Checks run in a fixed order and the first failure wins.
pub fn validate(frame: &AudioFrame, ctx: &ValidationContext) -> Result<AcceptedFrame, RejectReason> {
    if frame.session_id != ctx.expected_session_id {
        return Err(RejectReason::SessionMismatch);
    }

    if frame.protocol_version != Some(PROTOCOL_VERSION as f64) {
        return Err(RejectReason::UnsupportedProtocol);
    }

    // Encoded payloads must name their transport encoding.
    if let Some(FramePayload::Encoded { encoding, .. }) = &frame.payload {
        if encoding.as_deref() != Some(PCM_ENCODING) {
            return Err(RejectReason::UnsupportedEncoding);
        }
    }

    match positive_integer(frame.sample_rate) {
        Some(rate) if rate == u64::from(ctx.sample_rate) => {}
        _ => return Err(RejectReason::SampleRateMismatch),
    }

    let sequence = frame
        .sequence
        .and_then(exact_index)
        .ok_or(RejectReason::InvalidSequence)?;

    let sequence_gap_frames = match ctx.last_sequence {
        Some(last) if sequence <= last => return Err(RejectReason::OutOfOrderSequence),
        Some(last) => sequence - last - 1,
        None => 0,
    };

    let (Some(channels), Some(frame_count)) = (
        positive_integer(frame.channels),
        positive_integer(frame.frame_count),
    ) else {
        return Err(RejectReason::MalformedHeader);
    };
    let frame_count = u32::try_from(frame_count).map_err(|_| RejectReason::MalformedHeader)?;

    if channels != u64::from(ctx.channels) {
        return Err(RejectReason::ChannelMismatch);
    }

    let dropped_frame_count = frame
        .dropped_frame_count
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| v.floor().min(MAX_EXACT_INTEGER) as u64)
        .unwrap_or(0);

    Ok(AcceptedFrame {
        sequence,
        frame_count,
        channels: ctx.channels,
        sequence_gap_frames,
        dropped_frame_count,
        missing_frame_count: dropped_frame_count.max(sequence_gap_frames),
    })
}
