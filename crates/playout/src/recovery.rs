//! Gap recovery: how much silence to synthesize for lost frames.

/// Default ceiling on silent frames inserted for one gap.
pub const DEFAULT_MAX_RECOVERABLE_FRAMES: u32 = 50;

/// Whole missing frames worth filling, clamped to `cap`.
///
/// Large gaps (a stalled sidecar, a suspended laptop) would otherwise flood
/// the queue with seconds of silence.
pub fn recoverable_silence_frames(missing_frame_count: f64, cap: u32) -> u32 {
    if !missing_frame_count.is_finite() || missing_frame_count <= 0.0 {
        return 0;
    }
    missing_frame_count.floor().min(f64::from(cap)) as u32
}

/// Interleaved silent samples covering `missing` frames of `frame_count` each.
pub fn silence_len(missing: u32, frame_count: u32, channels: u16) -> usize {
    missing as usize * frame_count as usize * channels as usize
}
