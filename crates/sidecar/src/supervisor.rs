//! Public handle onto the reactor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use sidecarconf::SidecarConfig;
use sidecarproto::{
    encode_pcm_base64, AudioFrame, AudioTarget, CaptureSession, Method, PcmPushFrame,
    PushKeybindState, PushKeybinds, SessionKind, StartCaptureParams, StartVoiceFilterParams,
    PCM_ENCODING,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::trace;

use crate::error::SidecarError;
use crate::ingress::{BinaryOutcome, IngressPath, IngressStats, PushDisposition};
use crate::launcher::{ProcessLauncher, SidecarLauncher};
use crate::reactor::{Command, Reactor, Reply, SupervisorSnapshot};
use crate::session::SessionStatus;

pub type StartCaptureOptions = StartCaptureParams;
pub type StartVoiceFilterOptions = StartVoiceFilterParams;

const COMMAND_BACKLOG: usize = 256;
const EVENT_BACKLOG: usize = 1024;

/// Everything subscribers hear about.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// A frame for an active session. Not yet validated.
    Frame {
        kind: SessionKind,
        frame: Arc<AudioFrame>,
    },
    Status(SessionStatus),
    PushKeybind(PushKeybindState),
    SidecarExited {
        reason: String,
        code: Option<i32>,
    },
    SidecarRestarted {
        pid: Option<u32>,
    },
}

/// Answer to "can I use the sidecar right now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SidecarStatus {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

struct Inner {
    name: String,
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<SupervisorEvent>,
    ingress: Arc<IngressPath>,
    launcher: Arc<dyn SidecarLauncher>,
    /// Mirrors the reactor's view: a process is up and answered its ping.
    ready: Arc<AtomicBool>,
}

/// Cloneable handle to one supervised sidecar.
///
/// Each `Supervisor::new` owns its own process, sessions and event stream;
/// nothing is shared between instances. The sidecar is started lazily by
/// the first call that needs it. Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(config: SidecarConfig, launcher: Arc<dyn SidecarLauncher>) -> Self {
        let name = config.binary.name.clone();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BACKLOG);
        let (events, _) = broadcast::channel(EVENT_BACKLOG);
        let ingress = Arc::new(IngressPath::new(config.ingress.clone()));
        let ready = Arc::new(AtomicBool::new(false));

        let reactor = Reactor::new(
            name.clone(),
            config.supervisor.clone(),
            Arc::clone(&launcher),
            events.clone(),
            Arc::clone(&ingress),
            Arc::clone(&ready),
        );
        tokio::spawn(reactor.run(cmd_rx));

        Self {
            inner: Arc::new(Inner {
                name,
                cmd_tx,
                events,
                ingress,
                launcher,
                ready,
            }),
        }
    }

    /// Supervisor for the real executable, located per `config.binary`.
    pub fn from_config(config: SidecarConfig) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(config.binary.clone()));
        Self::new(config, launcher)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True once the sidecar answered its health ping, until it exits.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, SidecarError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| SidecarError::Disposed)?;
        rx.await.map_err(|_| SidecarError::Disposed)?
    }

    /// Whether the sidecar is installed and answering.
    ///
    /// Never fails: a missing binary or a failed start becomes
    /// `available: false` with the reason.
    pub async fn get_status(&self) -> SidecarStatus {
        if let Err(e) = self.inner.launcher.resolve_binary() {
            return SidecarStatus {
                available: false,
                reason: Some(e.to_string()),
                pid: None,
            };
        }
        match self.ensure_ready().await {
            Ok(pid) => SidecarStatus {
                available: true,
                reason: None,
                pid,
            },
            Err(e) => SidecarStatus {
                available: false,
                reason: Some(e.to_string()),
                pid: None,
            },
        }
    }

    /// Start the sidecar if needed and wait for its first `health.ping`.
    /// Returns the pid when the platform reports one.
    pub async fn ensure_ready(&self) -> Result<Option<u32>, SidecarError> {
        self.call(|reply| Command::EnsureReady { reply }).await
    }

    pub async fn request(&self, method: Method, params: Value) -> Result<Value, SidecarError> {
        self.call(|reply| Command::Request {
            method,
            params,
            reply,
        })
        .await
    }

    /// Fire-and-forget. Fails with `NotRunning` while the sidecar is not up.
    pub fn notify(&self, method: Method, params: Value) -> Result<(), SidecarError> {
        if !self.is_ready() {
            return Err(SidecarError::NotRunning);
        }
        self.inner
            .cmd_tx
            .try_send(Command::Notify { method, params })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SidecarError::Backlogged(method.to_string()),
                mpsc::error::TrySendError::Closed(_) => SidecarError::Disposed,
            })
    }

    pub async fn list_audio_targets(&self) -> Result<Vec<AudioTarget>, SidecarError> {
        let result = self.request(Method::AudioTargetsList, json!({})).await?;
        // Older sidecars answer with a bare array.
        let targets = match result {
            Value::Array(_) => result,
            Value::Object(mut object) => object.remove("targets").unwrap_or(Value::Null),
            other => other,
        };
        serde_json::from_value(targets).map_err(|e| SidecarError::InvalidResponse {
            method: Method::AudioTargetsList.to_string(),
            message: e.to_string(),
        })
    }

    pub async fn start_audio_capture(
        &self,
        options: StartCaptureOptions,
    ) -> Result<CaptureSession, SidecarError> {
        self.start_session(SessionKind::AudioCapture, Method::AudioCaptureStart, &options)
            .await
    }

    /// Stop a capture session, or the current one when `session_id` is `None`.
    /// Stopping a session that already ended is a no-op.
    pub async fn stop_audio_capture(&self, session_id: Option<&str>) -> Result<(), SidecarError> {
        self.stop_session(SessionKind::AudioCapture, session_id).await
    }

    pub async fn start_voice_filter(
        &self,
        options: StartVoiceFilterOptions,
    ) -> Result<CaptureSession, SidecarError> {
        self.start_session(SessionKind::VoiceFilter, Method::VoiceFilterStart, &options)
            .await
    }

    pub async fn stop_voice_filter(&self, session_id: Option<&str>) -> Result<(), SidecarError> {
        self.stop_session(SessionKind::VoiceFilter, session_id).await
    }

    async fn start_session(
        &self,
        kind: SessionKind,
        method: Method,
        options: &impl Serialize,
    ) -> Result<CaptureSession, SidecarError> {
        let params = serde_json::to_value(options).map_err(|e| SidecarError::Encode {
            method: method.to_string(),
            message: e.to_string(),
        })?;
        self.call(|reply| Command::StartSession {
            kind,
            params,
            reply,
        })
        .await
    }

    async fn stop_session(
        &self,
        kind: SessionKind,
        session_id: Option<&str>,
    ) -> Result<(), SidecarError> {
        let session_id = session_id.map(str::to_string);
        self.call(|reply| Command::StopSession {
            kind,
            session_id,
            reply,
        })
        .await
    }

    /// Hand one frame of microphone PCM to the voice filter.
    ///
    /// Safe to call from a capture callback: it never waits. The binary
    /// socket is used when connected (and connected on first use); otherwise
    /// the frame goes out as a base64 `voice_filter.push_frame` notification.
    pub fn push_voice_filter_frame(&self, frame: PcmPushFrame) -> PushDisposition {
        if !self.is_ready() {
            trace!(
                "{}: Sidecar not ready, dropping frame {}",
                self.inner.name,
                frame.sequence
            );
            return PushDisposition::Dropped;
        }
        match self.inner.ingress.try_send(&frame) {
            BinaryOutcome::Sent => PushDisposition::Binary,
            BinaryOutcome::Queued { evicted } => PushDisposition::Queued { evicted },
            BinaryOutcome::Unavailable { connect } => {
                if connect && self.inner.cmd_tx.try_send(Command::ConnectIngress).is_err() {
                    self.inner.ingress.connect_failed();
                }
                self.push_json(&frame)
            }
            BinaryOutcome::Invalid(e) => {
                trace!("{}: Frame not binary-encodable ({}), using JSON", self.inner.name, e);
                self.push_json(&frame)
            }
            BinaryOutcome::Broken(_) => self.push_json(&frame),
        }
    }

    fn push_json(&self, frame: &PcmPushFrame) -> PushDisposition {
        let params = json!({
            "sessionId": frame.session_id,
            "sequence": frame.sequence,
            "sampleRate": frame.sample_rate,
            "channels": frame.channels,
            "frameCount": frame.frame_count,
            "protocolVersion": frame.protocol_version,
            "encoding": PCM_ENCODING,
            "pcmBase64": encode_pcm_base64(&frame.pcm),
        });
        match self.notify(Method::VoiceFilterPushFrame, params) {
            Ok(()) => {
                self.inner.ingress.record_json();
                PushDisposition::Json
            }
            Err(_) => PushDisposition::Dropped,
        }
    }

    pub async fn set_push_keybinds(&self, keybinds: PushKeybinds) -> Result<(), SidecarError> {
        let params = serde_json::to_value(&keybinds).map_err(|e| SidecarError::Encode {
            method: Method::PushKeybindsSet.to_string(),
            message: e.to_string(),
        })?;
        self.request(Method::PushKeybindsSet, params).await.map(|_| ())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    pub fn ingress_stats(&self) -> IngressStats {
        self.inner.ingress.stats()
    }

    pub async fn snapshot(&self) -> Result<SupervisorSnapshot, SidecarError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| SidecarError::Disposed)?;
        rx.await.map_err(|_| SidecarError::Disposed)
    }

    /// Stop sessions, close ingress, kill the sidecar. Safe to call twice.
    pub async fn dispose(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .inner
            .cmd_tx
            .send(Command::Dispose { reply })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }
}
