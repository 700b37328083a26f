//! Unsolicited events pushed by the sidecar.

use serde::{Deserialize, Serialize};

use crate::{pcm, PCM_ENCODING, PROTOCOL_VERSION};

/// Events the sidecar writes to stdout as `{"event": ..., "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "params")]
pub enum SidecarEvent {
    #[serde(rename = "audio_capture.frame")]
    AudioCaptureFrame(AudioFrame),

    #[serde(rename = "audio_capture.ended")]
    AudioCaptureEnded(SessionEnded),

    #[serde(rename = "voice_filter.frame")]
    VoiceFilterFrame(AudioFrame),

    #[serde(rename = "voice_filter.ended")]
    VoiceFilterEnded(SessionEnded),

    #[serde(rename = "push_keybind.state")]
    PushKeybindState(PushKeybindState),
}

impl SidecarEvent {
    const NAMES: [&'static str; 5] = [
        "audio_capture.frame",
        "audio_capture.ended",
        "voice_filter.frame",
        "voice_filter.ended",
        "push_keybind.state",
    ];

    pub fn is_known(name: &str) -> bool {
        Self::NAMES.contains(&name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SidecarEvent::AudioCaptureFrame(_) => Self::NAMES[0],
            SidecarEvent::AudioCaptureEnded(_) => Self::NAMES[1],
            SidecarEvent::VoiceFilterFrame(_) => Self::NAMES[2],
            SidecarEvent::VoiceFilterEnded(_) => Self::NAMES[3],
            SidecarEvent::PushKeybindState(_) => Self::NAMES[4],
        }
    }
}

/// One chunk of PCM tagged with its per-session sequence number.
///
/// Header numbers stay `f64` because the sidecar emits plain JSON numbers;
/// whether they are valid integers is the frame validator's call, not the
/// decoder's. A frame that fails validation must never fail the whole line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFrame {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropped_frame_count: Option<f64>,
    #[serde(flatten)]
    pub payload: Option<FramePayload>,
}

/// Frame samples, either already decoded or in transport encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FramePayload {
    Encoded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encoding: Option<String>,
        #[serde(rename = "pcmBase64")]
        pcm_base64: String,
    },
    Samples {
        samples: Vec<f32>,
    },
}

impl AudioFrame {
    /// Frame carrying decoded samples, as produced in-process.
    pub fn from_samples(
        session_id: impl Into<String>,
        sequence: u64,
        sample_rate: u32,
        channels: u16,
        samples: Vec<f32>,
    ) -> Self {
        let frame_count = if channels == 0 {
            0
        } else {
            samples.len() / channels as usize
        };
        Self {
            session_id: session_id.into(),
            sequence: Some(sequence as f64),
            sample_rate: Some(sample_rate as f64),
            channels: Some(channels as f64),
            frame_count: Some(frame_count as f64),
            protocol_version: Some(PROTOCOL_VERSION as f64),
            dropped_frame_count: Some(0.0),
            payload: Some(FramePayload::Samples { samples }),
        }
    }

    /// Same frame with the samples re-encoded for JSON transport.
    pub fn into_encoded(mut self) -> Self {
        if let Some(FramePayload::Samples { samples }) = &self.payload {
            let bytes = pcm::pcm_bytes_from_samples(samples);
            self.payload = Some(FramePayload::Encoded {
                encoding: Some(PCM_ENCODING.to_string()),
                pcm_base64: pcm::encode_pcm_base64(&bytes),
            });
        }
        self
    }
}

/// `*.ended` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnded {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushKeybindKind {
    Talk,
    Mute,
}

/// `push_keybind.state` params: a global push-to-talk/mute key went down or up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushKeybindState {
    pub kind: PushKeybindKind,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{parse_incoming, Incoming};
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_encoded_frame_event() {
        let line = r#"{"event":"audio_capture.frame","params":{"sessionId":"cap-1","sequence":3,"sampleRate":48000,"channels":2,"frameCount":480,"protocolVersion":1,"droppedFrameCount":0,"encoding":"f32le_base64","pcmBase64":"AAAAAA=="}}"#;
        let Incoming::Event(SidecarEvent::AudioCaptureFrame(frame)) = parse_incoming(line).unwrap()
        else {
            panic!("expected audio frame");
        };

        assert_eq!(frame.session_id, "cap-1");
        assert_eq!(frame.sequence, Some(3.0));
        assert_eq!(frame.sample_rate, Some(48000.0));
        assert_eq!(
            frame.payload,
            Some(FramePayload::Encoded {
                encoding: Some("f32le_base64".to_string()),
                pcm_base64: "AAAAAA==".to_string(),
            })
        );
    }

    #[test]
    fn frame_with_bad_header_types_still_decodes() {
        // Non-integer numbers are the validator's problem.
        let line = r#"{"event":"voice_filter.frame","params":{"sessionId":"vf-1","sequence":2.5,"sampleRate":-1,"channels":1,"frameCount":0}}"#;
        let Incoming::Event(SidecarEvent::VoiceFilterFrame(frame)) = parse_incoming(line).unwrap()
        else {
            panic!("expected voice filter frame");
        };
        assert_eq!(frame.sequence, Some(2.5));
        assert_eq!(frame.sample_rate, Some(-1.0));
        assert_eq!(frame.payload, None);
        assert_eq!(frame.protocol_version, None);
    }

    #[test]
    fn decodes_ended_and_keybind_events() {
        let ended =
            parse_incoming(r#"{"event":"audio_capture.ended","params":{"sessionId":"cap-1","reason":"capture_stopped"}}"#)
                .unwrap();
        assert_eq!(
            ended,
            Incoming::Event(SidecarEvent::AudioCaptureEnded(SessionEnded {
                session_id: "cap-1".to_string(),
                reason: Some("capture_stopped".to_string()),
                error: None,
            }))
        );

        let key = parse_incoming(r#"{"event":"push_keybind.state","params":{"kind":"talk","active":true}}"#)
            .unwrap();
        assert_eq!(
            key,
            Incoming::Event(SidecarEvent::PushKeybindState(PushKeybindState {
                kind: PushKeybindKind::Talk,
                active: true,
            }))
        );
    }

    #[test]
    fn sample_frames_encode_for_transport() {
        let frame = AudioFrame::from_samples("cap-9", 7, 48000, 2, vec![0.5, -0.5, 0.25, -0.25]);
        assert_eq!(frame.frame_count, Some(2.0));

        let encoded = frame.into_encoded();
        let Some(FramePayload::Encoded { encoding, pcm_base64 }) = encoded.payload else {
            panic!("expected encoded payload");
        };
        assert_eq!(encoding.as_deref(), Some(PCM_ENCODING));
        assert_eq!(
            crate::pcm::decode_pcm_base64(&pcm_base64).unwrap(),
            vec![0.5, -0.5, 0.25, -0.25]
        );
    }

    #[test]
    fn event_names_match_serde_tags() {
        let event = SidecarEvent::PushKeybindState(PushKeybindState {
            kind: PushKeybindKind::Mute,
            active: false,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], event.name());
        assert!(SidecarEvent::is_known(event.name()));
    }
}
