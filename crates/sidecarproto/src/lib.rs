//! Wire types for the capture sidecar.
//!
//! The sidecar is a native subprocess that does the actual audio capture and
//! voice filtering. We talk to it over two channels:
//!
//! - **Control channel**: one JSON object per line on the child's stdin/stdout.
//!   Requests carry an `id` and get exactly one response; notifications have
//!   no `id`; the sidecar pushes unsolicited events tagged by `event`.
//! - **Binary ingress**: a loopback TCP connection for pushing PCM into the
//!   sidecar at audio rate without JSON or base64 overhead. Length-prefixed,
//!   little-endian, fire-and-forget.
//!
//! ```text
//! caller ──{id,method,params}\n──────────────▶ sidecar stdin
//! caller ◀─{id,ok,result}\n / {event,params}\n─ sidecar stdout
//! caller ──[u32 len][header][pcm]──(TCP)─────▶ sidecar ingress port
//! ```
//!
//! This crate is I/O free: it encodes, decodes and validates. The `sidecar`
//! crate owns the sockets and the process.

pub mod control;
pub mod event;
pub mod ingress;
pub mod lines;
pub mod pcm;
pub mod session;

pub use control::{
    parse_incoming, ControlNotification, ControlRequest, ControlResponse, Incoming, Method,
    RemoteError,
};
pub use event::{
    AudioFrame, FramePayload, PushKeybindKind, PushKeybindState, SessionEnded, SidecarEvent,
};
pub use ingress::{
    decode_packet, encode_packet, IngressPacket, IngressPacketError, PcmPushFrame,
    DEFAULT_MAX_PAYLOAD_BYTES,
};
pub use lines::LineAssembler;
pub use pcm::{decode_pcm_base64, encode_pcm_base64, pcm_bytes_from_samples, samples_from_pcm_bytes};
pub use session::{
    AudioTarget, CaptureSession, IngressInfo, PushKeybinds, SessionKind, StartCaptureParams,
    StartVoiceFilterParams, StopSessionParams,
};

/// The only frame protocol version this build understands.
pub const PROTOCOL_VERSION: u32 = 1;

/// Transport encoding for frames that travel as JSON.
pub const PCM_ENCODING: &str = "f32le_base64";

/// Errors decoding control-channel traffic.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Line is not a JSON object")]
    NotAnObject,
    #[error("Line has neither `event` nor `id`")]
    Unclassified,
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
    #[error("Malformed `{event}` params: {message}")]
    MalformedEvent { event: String, message: String },
    #[error("Invalid base64 PCM: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("PCM byte length {0} is not a multiple of 4")]
    UnalignedPcm(usize),
}
