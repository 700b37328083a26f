//! Session descriptors and request/response params for session methods.

use serde::{Deserialize, Serialize};

use crate::{PCM_ENCODING, PROTOCOL_VERSION};

/// What kind of session a descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    AudioCapture,
    VoiceFilter,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::AudioCapture => "audio_capture",
            SessionKind::VoiceFilter => "voice_filter",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

fn default_encoding() -> String {
    PCM_ENCODING.to_string()
}

/// Result of a successful `audio_capture.start` / `voice_filter.start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSession {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames_per_buffer: Option<u32>,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

/// One capturable application or device from `audio_targets.list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioTarget {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCaptureParams {
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames_per_buffer: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartVoiceFilterParams {
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames_per_buffer: Option<u32>,
    /// 0.0 to 1.0; the sidecar picks its own default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppression_level: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSessionParams {
    pub session_id: String,
}

/// `voice_filter.binary_ingress_info` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressInfo {
    pub port: u16,
}

impl IngressInfo {
    /// Pull a usable port out of a raw result.
    ///
    /// The sidecar reports a plain JSON number; anything that is not an
    /// integer in `1..=65535` means the binary path is unusable.
    pub fn from_result(result: &serde_json::Value) -> Option<Self> {
        let port = result.get("port")?.as_u64()?;
        let port = u16::try_from(port).ok().filter(|p| *p != 0)?;
        Some(Self { port })
    }
}

/// Global push-to-talk / push-to-mute accelerators, e.g. `"Ctrl+Shift+T"`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PushKeybinds {
    #[serde(default)]
    pub talk: Option<String>,
    #[serde(default)]
    pub mute: Option<String>,
}
