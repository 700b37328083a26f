//! Control-side reader for playback queue events.

use std::sync::Arc;
use std::time::Duration;

use rtrb::Consumer;
use tracing::{debug, info, warn};

use crate::queue::{QueueEvent, QueueSnapshot, QueueStats};
use crate::throttle::LogThrottle;

/// Drains [`QueueEvent`]s posted by the RT context and logs them,
/// rate limited per event kind.
pub struct QueueMonitor {
    events: Consumer<QueueEvent>,
    stats: Arc<QueueStats>,
    throttle: LogThrottle<&'static str>,
}

impl QueueMonitor {
    pub(crate) fn new(
        events: Consumer<QueueEvent>,
        stats: Arc<QueueStats>,
        log_window: Duration,
    ) -> Self {
        Self {
            events,
            stats,
            throttle: LogThrottle::new(log_window),
        }
    }

    /// Log everything pending. Returns how many events were drained.
    pub fn poll(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(event) = self.events.pop() {
            self.log(event);
            drained += 1;
        }
        drained
    }

    /// Move pending events into `out` without logging.
    pub fn drain_into(&mut self, out: &mut Vec<QueueEvent>) {
        while let Ok(event) = self.events.pop() {
            out.push(event);
        }
    }

    pub fn stats(&self) -> QueueSnapshot {
        self.stats.snapshot()
    }

    fn log(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::Overflow { dropped, depth } => {
                if let Some(suppressed) = self.throttle.check("overflow") {
                    warn!(
                        "Playback queue overflow: dropped {} oldest chunks, depth now {} ({} similar suppressed)",
                        dropped, depth, suppressed
                    );
                }
            }
            QueueEvent::Trim { dropped, depth } => {
                if let Some(suppressed) = self.throttle.check("trim") {
                    debug!(
                        "Playback queue trimmed {} chunks to depth {} ({} similar suppressed)",
                        dropped, depth, suppressed
                    );
                }
            }
            QueueEvent::Underrun => {
                if let Some(suppressed) = self.throttle.check("underrun") {
                    debug!(
                        "Playback queue underrun, rebuffering ({} similar suppressed)",
                        suppressed
                    );
                }
            }
            QueueEvent::Primed { depth } => debug!("Playback started at depth {}", depth),
            QueueEvent::Depth {
                depth,
                buffered_samples,
            } => info!(
                "Playback queue depth={} buffered_samples={}",
                depth, buffered_samples
            ),
            QueueEvent::Reset => {
                self.throttle.clear();
                debug!("Playback queue reset");
            }
        }
    }
}
