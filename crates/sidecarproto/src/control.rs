//! Control channel messages: requests, notifications, responses.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::event::SidecarEvent;
use crate::ProtoError;

/// Control methods the sidecar implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    HealthPing,
    AudioTargetsList,
    AudioCaptureStart,
    AudioCaptureStop,
    VoiceFilterStart,
    VoiceFilterStop,
    VoiceFilterPushFrame,
    VoiceFilterBinaryIngressInfo,
    PushKeybindsSet,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::HealthPing => "health.ping",
            Method::AudioTargetsList => "audio_targets.list",
            Method::AudioCaptureStart => "audio_capture.start",
            Method::AudioCaptureStop => "audio_capture.stop",
            Method::VoiceFilterStart => "voice_filter.start",
            Method::VoiceFilterStop => "voice_filter.stop",
            Method::VoiceFilterPushFrame => "voice_filter.push_frame",
            Method::VoiceFilterBinaryIngressInfo => "voice_filter.binary_ingress_info",
            Method::PushKeybindsSet => "push_keybinds.set",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "health.ping" => Method::HealthPing,
            "audio_targets.list" => Method::AudioTargetsList,
            "audio_capture.start" => Method::AudioCaptureStart,
            "audio_capture.stop" => Method::AudioCaptureStop,
            "voice_filter.start" => Method::VoiceFilterStart,
            "voice_filter.stop" => Method::VoiceFilterStop,
            "voice_filter.push_frame" => Method::VoiceFilterPushFrame,
            "voice_filter.binary_ingress_info" => Method::VoiceFilterBinaryIngressInfo,
            "push_keybinds.set" => Method::PushKeybindsSet,
            _ => return None,
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Method {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// `{id, method, params}` - expects exactly one response with the same id.
#[derive(Debug, Clone, Serialize)]
pub struct ControlRequest {
    pub id: String,
    pub method: Method,
    pub params: Value,
}

/// `{method, params}` - fire-and-forget.
#[derive(Debug, Clone, Serialize)]
pub struct ControlNotification {
    pub method: Method,
    pub params: Value,
}

impl ControlRequest {
    /// Serialize to one newline-terminated line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

impl ControlNotification {
    /// Serialize to one newline-terminated line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// `{id, ok, result}` or `{id, ok:false, error:{message}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl ControlResponse {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result,
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: Value::Null,
            error: Some(RemoteError {
                message: message.into(),
                code: None,
            }),
        }
    }

    pub fn into_result(self) -> Result<Value, RemoteError> {
        if self.ok {
            Ok(self.result)
        } else {
            Err(self.error.unwrap_or_else(|| RemoteError {
                message: "sidecar reported failure without a message".to_string(),
                code: None,
            }))
        }
    }
}

/// Sidecars written in dynamic languages sometimes echo numeric ids.
fn id_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "response id must be a string or number, got {other}"
        ))),
    }
}

/// One classified line from the sidecar's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(ControlResponse),
    Event(SidecarEvent),
}

/// Classify and decode one stdout line.
///
/// Events are recognized by an `event` key, responses by an `id` key.
/// Event names this build does not know are reported as
/// [`ProtoError::UnknownEvent`] so the caller can log and move on.
pub fn parse_incoming(line: &str) -> Result<Incoming, ProtoError> {
    let value: Value = serde_json::from_str(line)?;
    let object = value.as_object().ok_or(ProtoError::NotAnObject)?;

    if let Some(name) = object.get("event").and_then(Value::as_str) {
        let name = name.to_string();
        return match serde_json::from_value::<SidecarEvent>(value) {
            Ok(event) => Ok(Incoming::Event(event)),
            Err(e) if SidecarEvent::is_known(&name) => Err(ProtoError::MalformedEvent {
                event: name,
                message: e.to_string(),
            }),
            Err(_) => Err(ProtoError::UnknownEvent(name)),
        };
    }

    if object.contains_key("id") {
        return Ok(Incoming::Response(serde_json::from_value(value)?));
    }

    Err(ProtoError::Unclassified)
}
