//! Supervisor for the native capture sidecar.
//!
//! The sidecar is an external process doing the platform audio capture.
//! This crate keeps it alive and talks to it:
//!
//! - **Control channel**: line-delimited JSON over the child's stdio.
//!   Requests carry an id and a timeout; events arrive unsolicited.
//! - **Binary ingress**: a loopback TCP socket for pushing microphone PCM
//!   into the voice filter without base64, with a bounded drop-oldest
//!   queue for when the socket backs up.
//! - **Sessions**: capture / voice-filter sessions and their status
//!   transitions, including teardown when the sidecar dies.
//!
//! ```text
//!            Supervisor (handle, Clone)
//!                 │ Command + oneshot
//!                 ▼
//!   ┌──────── Reactor task ────────┐
//!   │ pending requests, sessions,  │◀── stdout reader (LineAssembler)
//!   │ restart timer, watchdogs     │──▶ stdin writer
//!   └──────────────┬───────────────┘◀── exit waiter
//!                  │ broadcast<SupervisorEvent>
//!                  ▼
//!           PlaybackBridge ─▶ playout::FrameIngestor ─▶ PlaybackQueue
//! ```

pub mod backpressure;
pub mod bridge;
pub mod error;
pub mod ingress;
pub mod launcher;
mod reactor;
pub mod session;
pub mod supervisor;

pub use backpressure::{drop_oldest, Admission, DropNewest, DropOldest, EvictionPolicy, IngressQueue, QueueCaps};
pub use bridge::PlaybackBridge;
pub use error::SidecarError;
pub use ingress::{IngressStats, PushDisposition};
pub use launcher::{BinaryLocator, ProcessHandle, ProcessLauncher, SidecarLauncher, SidecarProcess};
pub use reactor::SupervisorSnapshot;
pub use session::{SessionState, SessionStatus};
pub use supervisor::{
    SidecarStatus, StartCaptureOptions, StartVoiceFilterOptions, Supervisor, SupervisorEvent,
};
