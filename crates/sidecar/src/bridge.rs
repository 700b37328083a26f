//! Connects supervisor events to a playback queue.

use playout::{FrameIngestor, IngestCounters, IngestOutcome};
use sidecarproto::CaptureSession;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::supervisor::SupervisorEvent;

/// Feeds one session's frames into a [`FrameIngestor`] until the session ends.
pub struct PlaybackBridge {
    task: JoinHandle<IngestCounters>,
}

impl PlaybackBridge {
    pub fn spawn(
        mut events: broadcast::Receiver<SupervisorEvent>,
        session: CaptureSession,
        mut ingestor: FrameIngestor,
    ) -> Self {
        let task = tokio::spawn(async move {
            let session_id = session.session_id;
            loop {
                match events.recv().await {
                    Ok(SupervisorEvent::Frame { frame, .. }) if frame.session_id == session_id => {
                        if let IngestOutcome::Accepted { silence_frames, .. } = ingestor.ingest(&frame) {
                            if silence_frames > 0 {
                                debug!("{}: {} frames of silence for gap", session_id, silence_frames);
                            }
                        }
                    }
                    Ok(SupervisorEvent::Status(status))
                        if status.is_ended()
                            && status.session_id.as_deref() == Some(session_id.as_str()) =>
                    {
                        info!(
                            "{}: Session ended ({}), resetting playback",
                            session_id,
                            status.reason.as_deref().unwrap_or("unknown")
                        );
                        ingestor.reset();
                        break;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!("{}: Playback bridge lagged, {} events lost", session_id, n);
                        ingestor.note_lagged(n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            ingestor.counters()
        });
        Self { task }
    }

    /// Wait for the session to end. An aborted bridge reports empty counters.
    pub async fn join(self) -> IngestCounters {
        self.task.await.unwrap_or_default()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
