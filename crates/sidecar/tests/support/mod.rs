//! In-process stand-in for the capture sidecar.
//!
//! `FakeLauncher` plugs into the `SidecarLauncher` seam and hands out
//! processes made of `tokio::io::duplex` pipes. Each launch produces a
//! `FakeProcess` the test can script: see what the supervisor sent, emit
//! events, crash it.

#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sidecar::{ProcessHandle, SidecarError, SidecarLauncher, SidecarProcess};
use sidecarproto::{AudioFrame, SidecarEvent};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};

/// How the fake answers requests.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub answer_ping: bool,
    /// Port reported by `voice_filter.binary_ingress_info`; `None` answers with an error.
    pub ingress_port: Option<u16>,
    /// Methods that never get a response.
    pub silent: Vec<&'static str>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            answer_ping: true,
            ingress_port: None,
            silent: Vec::new(),
            sample_rate: 48000,
            channels: 2,
        }
    }
}

impl Behavior {
    fn respond(&self, msg: &Value, sessions: &mut u32) -> Option<Value> {
        let id = msg.get("id")?.clone();
        let method = msg.get("method")?.as_str()?;
        if self.silent.contains(&method) {
            return None;
        }
        let params = msg.get("params").cloned().unwrap_or(Value::Null);

        let result = match method {
            "health.ping" if !self.answer_ping => {
                return Some(json!({"id": id, "ok": false, "error": {"message": "not healthy"}}))
            }
            "health.ping" => json!({"status": "ok"}),
            "audio_targets.list" => json!({
                "targets": [
                    {"id": "app:42", "label": "Music Player", "pid": 42, "processName": "music"},
                    {"id": "system", "label": "System Audio"}
                ]
            }),
            "audio_capture.start" => {
                *sessions += 1;
                json!({
                    "sessionId": format!("cap-{}", sessions),
                    "targetId": params.get("targetId").cloned().unwrap_or(Value::Null),
                    "sampleRate": self.sample_rate,
                    "channels": self.channels,
                    "framesPerBuffer": 480,
                    "protocolVersion": 1,
                    "encoding": "f32le_base64"
                })
            }
            "voice_filter.start" => {
                *sessions += 1;
                json!({
                    "sessionId": format!("vf-{}", sessions),
                    "sampleRate": params.get("sampleRate").cloned().unwrap_or(json!(self.sample_rate)),
                    "channels": params.get("channels").cloned().unwrap_or(json!(1)),
                    "protocolVersion": 1
                })
            }
            "voice_filter.binary_ingress_info" => match self.ingress_port {
                Some(port) => json!({"port": port}),
                None => {
                    return Some(
                        json!({"id": id, "ok": false, "error": {"message": "binary ingress disabled"}}),
                    )
                }
            },
            _ => json!({}),
        };
        Some(json!({"id": id, "ok": true, "result": result}))
    }
}

/// Test-side controls for one launched fake.
pub struct FakeProcess {
    pub pid: u32,
    requests: mpsc::UnboundedReceiver<Value>,
    stdout: mpsc::UnboundedSender<String>,
    exit: watch::Sender<Option<Option<i32>>>,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
}

impl FakeProcess {
    pub fn emit(&self, value: Value) {
        let _ = self.stdout.send(value.to_string());
    }

    pub fn emit_raw(&self, line: &str) {
        let _ = self.stdout.send(line.to_string());
    }

    pub fn emit_event(&self, event: SidecarEvent) {
        self.emit(serde_json::to_value(event).unwrap());
    }

    pub fn emit_frame(&self, frame: AudioFrame) {
        self.emit_event(SidecarEvent::AudioCaptureFrame(frame.into_encoded()));
    }

    /// Die with an exit code, as if the native side crashed.
    pub fn crash(&self, code: i32) {
        self.exit.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(Some(code));
                true
            } else {
                false
            }
        });
    }

    /// Next message the supervisor wrote, whatever it is.
    pub async fn next_message(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(10), self.requests.recv())
            .await
            .expect("timed out waiting for a message from the supervisor")
            .expect("fake process request channel closed")
    }

    /// Skip ahead to the next message for `method`.
    pub async fn next_request(&mut self, method: &str) -> Value {
        loop {
            let msg = self.next_message().await;
            if msg.get("method").and_then(Value::as_str) == Some(method) {
                return msg;
            }
        }
    }

    /// Resolves once the process has been killed or crashed.
    pub async fn exited(&mut self) -> Option<i32> {
        let state = tokio::time::timeout(
            Duration::from_secs(10),
            self.exit_rx.wait_for(Option::is_some),
        )
        .await
        .expect("timed out waiting for exit")
        .map(|state| *state)
        .expect("exit channel closed");
        state.flatten()
    }
}

struct FakeHandle {
    exit: watch::Sender<Option<Option<i32>>>,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let state = self
            .exit_rx
            .wait_for(Option::is_some)
            .await
            .map(|state| *state)
            .map_err(|_| io::Error::other("fake process vanished"))?;
        Ok(state.flatten())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.exit.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(None);
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

pub struct FakeLauncher {
    binary: Option<PathBuf>,
    behavior: Behavior,
    launches: AtomicUsize,
    processes: mpsc::UnboundedSender<FakeProcess>,
}

impl FakeLauncher {
    /// Launcher plus the stream of processes it starts.
    pub fn new(behavior: Behavior) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeProcess>) {
        Self::build(Some(PathBuf::from("/opt/fake/capture-sidecar")), behavior)
    }

    /// A launcher whose binary cannot be found.
    pub fn missing() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeProcess>) {
        Self::build(None, Behavior::default())
    }

    fn build(
        binary: Option<PathBuf>,
        behavior: Behavior,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeProcess>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let launcher = Arc::new(Self {
            binary,
            behavior,
            launches: AtomicUsize::new(0),
            processes: tx,
        });
        (launcher, rx)
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SidecarLauncher for FakeLauncher {
    fn resolve_binary(&self) -> Result<PathBuf, SidecarError> {
        self.binary
            .clone()
            .ok_or_else(|| SidecarError::BinaryNotFound("no fake binary configured".to_string()))
    }

    async fn launch(&self, _binary: &Path) -> Result<SidecarProcess, SidecarError> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let pid = 1000 + n as u32;

        let (stdin_ours, stdin_theirs) = tokio::io::duplex(64 * 1024);
        let (stdout_theirs, stdout_ours) = tokio::io::duplex(1024 * 1024);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (stdout_tx, mut stdout_rx) = mpsc::unbounded_channel::<String>();
        let (exit_tx, exit_rx) = watch::channel(None);

        let behavior = self.behavior.clone();
        let mut task_exit = exit_rx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdin_theirs).lines();
            let mut out = stdout_theirs;
            let mut sessions = 0u32;
            loop {
                let line = tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let Ok(msg) = serde_json::from_str::<Value>(&line) else {
                                continue;
                            };
                            let reply = behavior.respond(&msg, &mut sessions);
                            let _ = requests_tx.send(msg);
                            match reply {
                                Some(reply) => reply.to_string(),
                                None => continue,
                            }
                        }
                        _ => break,
                    },
                    Some(line) = stdout_rx.recv() => line,
                    _ = task_exit.wait_for(Option::is_some) => break,
                };
                let written = out.write_all(format!("{}\n", line).as_bytes()).await;
                if written.is_err() {
                    break;
                }
            }
            // Dropping `out` closes the supervisor's stdout.
        });

        let _ = self.processes.send(FakeProcess {
            pid,
            requests: requests_rx,
            stdout: stdout_tx,
            exit: exit_tx.clone(),
            exit_rx: exit_rx.clone(),
        });

        Ok(SidecarProcess {
            pid: Some(pid),
            stdin: Box::new(stdin_ours),
            stdout: Box::new(stdout_ours),
            stderr: None,
            handle: Box::new(FakeHandle {
                exit: exit_tx,
                exit_rx,
            }),
        })
    }
}

/// Wait for the next event matching `pick`, skipping others.
pub async fn next_event<T>(
    events: &mut tokio::sync::broadcast::Receiver<sidecar::SupervisorEvent>,
    mut pick: impl FnMut(&sidecar::SupervisorEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(&event) {
                        return found;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for supervisor event")
}
