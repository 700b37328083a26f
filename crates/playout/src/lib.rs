//! Consumer side of the capture pipeline.
//!
//! Frames arriving from the sidecar pass through [`FrameIngestor`], which
//! screens them ([`validate`]), synthesizes silence for sequence gaps, and
//! hands sample chunks to a [`PlaybackQueue`] living in the audio callback.
//!
//! ```text
//! AudioFrame ─▶ validate ─▶ gap silence ─▶ PlaybackSender ═rtrb═▶ PlaybackQueue ─▶ device
//!                                                                     │
//!                                         QueueMonitor ◀═rtrb═ QueueEvent
//! ```

pub mod ingest;
pub mod monitor;
pub mod queue;
pub mod recovery;
pub mod throttle;
pub mod validator;

use std::sync::Arc;
use std::time::Duration;

use rtrb::RingBuffer;
use sidecarconf::PlaybackConfig;

pub use ingest::{FrameIngestor, IngestCounters, IngestOutcome};
pub use monitor::QueueMonitor;
pub use queue::{
    PlaybackMessage, PlaybackQueue, PlaybackSender, QueueEvent, QueueProfile, QueueSnapshot,
    QueueStats,
};
pub use recovery::{recoverable_silence_frames, DEFAULT_MAX_RECOVERABLE_FRAMES};
pub use throttle::LogThrottle;
pub use validator::{validate, AcceptedFrame, RejectReason, ValidationContext};

/// Slots in the control → RT message ring.
const HANDOFF_SLOTS: usize = 64;

/// Slots in the RT → control event ring.
const EVENT_SLOTS: usize = 256;

/// Build a connected sender / queue / monitor triple from config.
///
/// `sample_rate` and `channels` describe what the queue renders; they only
/// matter for converting the telemetry interval into samples.
pub fn playback_channel(
    config: &PlaybackConfig,
    sample_rate: u32,
    channels: u16,
) -> (PlaybackSender, PlaybackQueue, QueueMonitor) {
    let telemetry_every = config.telemetry_interval().map(|interval| {
        let samples_per_sec = u64::from(sample_rate) * u64::from(channels.max(1));
        ((interval.as_millis() as u64 * samples_per_sec) / 1000).max(1)
    });
    playback_channel_with(
        QueueProfile::for_mode(config.mode),
        telemetry_every,
        config.log_window(),
    )
}

/// [`playback_channel`] with an explicit profile. `telemetry_every` is in samples.
pub fn playback_channel_with(
    profile: QueueProfile,
    telemetry_every: Option<u64>,
    log_window: Duration,
) -> (PlaybackSender, PlaybackQueue, QueueMonitor) {
    let stats = Arc::new(QueueStats::default());
    let (msg_tx, msg_rx) = RingBuffer::new(HANDOFF_SLOTS);
    let (recycle_tx, recycle_rx) = RingBuffer::new(HANDOFF_SLOTS + profile.max_depth);
    let (event_tx, event_rx) = RingBuffer::new(EVENT_SLOTS);

    let sender = PlaybackSender::new(msg_tx, recycle_rx, Arc::clone(&stats));
    let queue = PlaybackQueue::new(
        profile,
        msg_rx,
        recycle_tx,
        event_tx,
        Arc::clone(&stats),
        telemetry_every,
    );
    let monitor = QueueMonitor::new(event_rx, stats, log_window);
    (sender, queue, monitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidecarconf::PlaybackMode;

    #[test]
    fn profile_follows_mode() {
        let config = PlaybackConfig {
            mode: PlaybackMode::Stable,
            ..Default::default()
        };
        let (_tx, queue, _monitor) = playback_channel(&config, 48000, 2);
        assert_eq!(queue.profile(), QueueProfile::STABLE);
    }

    #[test]
    fn telemetry_interval_becomes_samples() {
        let config = PlaybackConfig {
            telemetry_interval_ms: 10,
            ..Default::default()
        };
        let (mut tx, mut queue, mut monitor) = playback_channel(&config, 48000, 2);
        for _ in 0..6 {
            tx.send(PlaybackMessage::Chunk(vec![0.0; 960])).unwrap();
        }
        // 10ms of 48kHz stereo
        let mut out = vec![0.0; 960];
        queue.render(&mut out);

        let mut events = Vec::new();
        monitor.drain_into(&mut events);
        assert!(events
            .iter()
            .any(|e| matches!(e, QueueEvent::Depth { depth: 5, .. })));
    }
}
