//! The supervisor's event loop.
//!
//! One task owns the child process, the pending-request map and the session
//! registry. [`Supervisor`](crate::Supervisor) handles talk to it with
//! [`Command`]s carrying oneshot replies. The per-process I/O tasks report
//! back on a second channel, tagged with the process generation so that
//! late reports from a dead process are ignored.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use playout::LogThrottle;
use serde::Serialize;
use serde_json::{json, Value};
use sidecarconf::SupervisorConfig;
use sidecarproto::{
    parse_incoming, CaptureSession, ControlNotification, ControlRequest, ControlResponse,
    Incoming, IngressInfo, LineAssembler, Method, ProtoError, PushKeybindKind, PushKeybindState,
    SessionEnded, SessionKind, SidecarEvent, StopSessionParams,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::SidecarError;
use crate::ingress::{flush_loop, IngressPath};
use crate::launcher::{ProcessHandle, SidecarLauncher, SidecarProcess};
use crate::session::{reason, SessionRegistry, SessionStatus, SessionState};
use crate::supervisor::SupervisorEvent;

/// Timers (request timeouts, watchdogs, restarts) are checked this often.
const TICK: Duration = Duration::from_millis(50);

/// Lines buffered toward one process's stdin.
const STDIN_BACKLOG: usize = 256;

/// Reports buffered from the I/O tasks.
const INTERNAL_BACKLOG: usize = 1024;

/// How long dispose waits for stop replies, and then for the exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SidecarError>>;

pub(crate) enum Command {
    EnsureReady {
        reply: Reply<Option<u32>>,
    },
    Request {
        method: Method,
        params: Value,
        reply: Reply<Value>,
    },
    Notify {
        method: Method,
        params: Value,
    },
    StartSession {
        kind: SessionKind,
        params: Value,
        reply: Reply<CaptureSession>,
    },
    StopSession {
        kind: SessionKind,
        session_id: Option<String>,
        reply: Reply<()>,
    },
    ConnectIngress,
    Snapshot {
        reply: oneshot::Sender<SupervisorSnapshot>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// Point-in-time view of the reactor, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorSnapshot {
    pub running: bool,
    pub ready: bool,
    pub pid: Option<u32>,
    /// Processes launched so far.
    pub generation: u64,
    pub last_error: Option<String>,
    pub pending_requests: usize,
    pub active_sessions: usize,
    pub restart_pending: bool,
}

enum Internal {
    Launched(Result<SidecarProcess, SidecarError>),
    Line {
        generation: u64,
        line: String,
    },
    StdoutClosed {
        generation: u64,
    },
    StdinFailed {
        generation: u64,
        error: String,
    },
    Exited {
        generation: u64,
        code: Option<i32>,
        error: Option<String>,
    },
    IngressConnected {
        generation: u64,
        port: u16,
        result: Result<TcpStream, String>,
    },
}

/// Where a response goes once it arrives.
enum Responder {
    Caller(Reply<Value>),
    HealthCheck {
        generation: u64,
    },
    Start {
        kind: SessionKind,
        reply: Reply<CaptureSession>,
    },
    Stop {
        session_id: String,
        reply: Reply<()>,
    },
    IngressInfo {
        generation: u64,
    },
    Discard,
}

struct Pending {
    method: Method,
    responder: Responder,
    deadline: Instant,
}

/// Parked until the process answers its first ping.
enum Waiter {
    Ready(Reply<Option<u32>>),
    Request {
        method: Method,
        params: Value,
        responder: Responder,
    },
}

struct Running {
    generation: u64,
    pid: Option<u32>,
    ready: bool,
    /// We asked for this exit; no restart.
    expected_exit: bool,
    stdin_tx: mpsc::Sender<String>,
    kill_tx: Option<oneshot::Sender<()>>,
    io_tasks: Vec<JoinHandle<()>>,
}

impl Running {
    fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        for task in &self.io_tasks {
            task.abort();
        }
    }
}

pub(crate) struct Reactor {
    name: String,
    config: SupervisorConfig,
    launcher: Arc<dyn SidecarLauncher>,
    events: broadcast::Sender<SupervisorEvent>,
    ingress: Arc<IngressPath>,
    ready_flag: Arc<AtomicBool>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,

    running: Option<Running>,
    spawning: bool,
    generation: u64,
    pending: HashMap<String, Pending>,
    waiters: Vec<Waiter>,
    request_counter: u64,

    sessions: SessionRegistry,
    held_keys: HashSet<PushKeybindKind>,

    ingress_links: u64,
    flusher: Option<JoinHandle<()>>,

    restart_at: Option<Instant>,
    restarting: bool,
    shutting_down: bool,
    dispose_replies: Vec<oneshot::Sender<()>>,
    last_error: Option<String>,
    line_log: LogThrottle<&'static str>,
}

impl Reactor {
    pub fn new(
        name: String,
        config: SupervisorConfig,
        launcher: Arc<dyn SidecarLauncher>,
        events: broadcast::Sender<SupervisorEvent>,
        ingress: Arc<IngressPath>,
        ready_flag: Arc<AtomicBool>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_BACKLOG);
        Self {
            name,
            config,
            launcher,
            events,
            ingress,
            ready_flag,
            internal_tx,
            internal_rx,
            running: None,
            spawning: false,
            generation: 0,
            pending: HashMap::new(),
            waiters: Vec::new(),
            request_counter: 0,
            sessions: SessionRegistry::default(),
            held_keys: HashSet::new(),
            ingress_links: 0,
            flusher: None,
            restart_at: None,
            restarting: false,
            shutting_down: false,
            dispose_replies: Vec::new(),
            last_error: None,
            line_log: LogThrottle::new(Duration::from_secs(5)),
        }
    }

    pub async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!("{}: Reactor task started", self.name);

        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        self.on_command(cmd);
                        if self.shutting_down {
                            break;
                        }
                    }
                    None => {
                        info!("{}: All handles dropped, shutting down", self.name);
                        self.dispose();
                        break;
                    }
                },

                Some(msg) = self.internal_rx.recv() => self.on_internal(msg),

                _ = ticker.tick() => self.on_tick(Instant::now()),
            }
        }

        self.shutdown().await;
        for reply in self.dispose_replies.drain(..) {
            let _ = reply.send(());
        }
        debug!("{}: Reactor task exiting", self.name);
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::EnsureReady { reply } => match self.ready_pid() {
                Some(pid) => {
                    let _ = reply.send(Ok(pid));
                }
                None => {
                    self.waiters.push(Waiter::Ready(reply));
                    self.start_spawn();
                }
            },
            Command::Request {
                method,
                params,
                reply,
            } => self.dispatch(method, params, Responder::Caller(reply)),
            Command::Notify { method, params } => self.notify(method, params),
            Command::StartSession {
                kind,
                params,
                reply,
            } => {
                self.emit(SupervisorEvent::Status(SessionStatus::starting(kind)));
                let method = match kind {
                    SessionKind::AudioCapture => Method::AudioCaptureStart,
                    SessionKind::VoiceFilter => Method::VoiceFilterStart,
                };
                self.dispatch(method, params, Responder::Start { kind, reply });
            }
            Command::StopSession {
                kind,
                session_id,
                reply,
            } => {
                let session_id = session_id.or_else(|| self.sessions.current(kind).map(str::to_string));
                match session_id {
                    Some(id) if self.sessions.is_known(&id) => self.request_stop(kind, id, reply),
                    // Already ended, or never started: nothing to do.
                    _ => {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            Command::ConnectIngress => self.connect_ingress(),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Dispose { reply } => {
                self.dispose();
                self.dispose_replies.push(reply);
            }
        }
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Launched(result) => self.on_launched(result),
            Internal::Line { generation, line } => {
                if self.is_current(generation) {
                    self.on_line(&line);
                }
            }
            Internal::StdoutClosed { generation } => {
                if let Some(running) = self.current_mut(generation) {
                    debug!("Sidecar stdout closed, killing process");
                    running.kill();
                }
            }
            Internal::StdinFailed { generation, error } => {
                if let Some(running) = self.current_mut(generation) {
                    warn!("Sidecar stdin write failed: {}", error);
                    running.kill();
                }
            }
            Internal::Exited {
                generation,
                code,
                error,
            } => self.on_exit(generation, code, error),
            Internal::IngressConnected {
                generation,
                port,
                result,
            } => self.on_ingress_connected(generation, port, result),
        }
    }

    fn on_tick(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                debug!("{}: Request {} ({}) timed out", self.name, id, pending.method);
                let err = SidecarError::RequestTimeout {
                    method: pending.method.to_string(),
                    timeout_ms: self.config.request_timeout_ms,
                };
                self.settle(pending.method, pending.responder, Err(err));
            }
        }

        for session_id in self.sessions.expired_watchdogs(now) {
            self.on_watchdog(session_id);
        }

        if self.restart_at.is_some_and(|at| now >= at) {
            self.restart_at = None;
            if self.running.is_none() && !self.spawning {
                info!("{}: Restarting capture sidecar", self.name);
                self.start_spawn();
            }
        }
    }

    // --- process lifecycle ---

    fn ready_pid(&self) -> Option<Option<u32>> {
        self.running.as_ref().filter(|r| r.ready).map(|r| r.pid)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| r.generation == generation)
    }

    fn current_mut(&mut self, generation: u64) -> Option<&mut Running> {
        self.running
            .as_mut()
            .filter(|r| r.generation == generation)
    }

    fn start_spawn(&mut self) {
        if self.running.is_some() || self.spawning || self.shutting_down {
            return;
        }
        self.spawning = true;
        self.restart_at = None;

        let launcher = Arc::clone(&self.launcher);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match launcher.resolve_binary() {
                Ok(binary) => launcher.launch(&binary).await,
                Err(e) => Err(e),
            };
            let _ = tx.send(Internal::Launched(result)).await;
        });
    }

    fn on_launched(&mut self, result: Result<SidecarProcess, SidecarError>) {
        self.spawning = false;

        let process = match result {
            Ok(process) => process,
            Err(e) => {
                warn!("{}: Failed to start capture sidecar: {}", self.name, e);
                self.last_error = Some(e.to_string());
                self.fail_waiters(&e);
                if self.restarting {
                    if matches!(e, SidecarError::BinaryNotFound(_)) {
                        self.restarting = false;
                    } else {
                        self.schedule_restart();
                    }
                }
                return;
            }
        };

        if self.shutting_down {
            let mut handle = process.handle;
            tokio::spawn(async move {
                let _ = handle.kill().await;
            });
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        let SidecarProcess {
            pid,
            stdin,
            stdout,
            stderr,
            handle,
        } = process;
        info!(
            "{}: Capture sidecar started (pid {:?}, generation {})",
            self.name, pid, generation
        );

        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_BACKLOG);
        let (kill_tx, kill_rx) = oneshot::channel();

        let mut io_tasks = vec![
            spawn_stdout_reader(generation, stdout, self.internal_tx.clone()),
            spawn_stdin_writer(generation, stdin, stdin_rx, self.internal_tx.clone()),
        ];
        if let Some(stderr) = stderr {
            io_tasks.push(spawn_stderr_forwarder(self.name.clone(), stderr));
        }
        spawn_waiter(generation, handle, kill_rx, self.internal_tx.clone());

        self.running = Some(Running {
            generation,
            pid,
            ready: false,
            expected_exit: false,
            stdin_tx,
            kill_tx: Some(kill_tx),
            io_tasks,
        });

        self.write_request(
            Method::HealthPing,
            json!({}),
            Responder::HealthCheck { generation },
        );
    }

    fn on_ping(&mut self, generation: u64, result: Result<Value, SidecarError>) {
        if !self.is_current(generation) {
            return;
        }

        match result {
            Ok(_) => {
                let pid = match self.running.as_mut() {
                    Some(running) => {
                        running.ready = true;
                        running.pid
                    }
                    None => return,
                };
                self.ready_flag.store(true, Ordering::Release);
                self.last_error = None;
                info!("{}: Capture sidecar ready", self.name);
                if std::mem::take(&mut self.restarting) {
                    self.emit(SupervisorEvent::SidecarRestarted { pid });
                }

                for waiter in std::mem::take(&mut self.waiters) {
                    match waiter {
                        Waiter::Ready(reply) => {
                            let _ = reply.send(Ok(pid));
                        }
                        Waiter::Request {
                            method,
                            params,
                            responder,
                        } => self.write_request(method, params, responder),
                    }
                }
            }
            Err(e) => {
                warn!("{}: Health check failed: {}", self.name, e);
                self.last_error = Some(e.to_string());
                self.fail_waiters(&e);
                self.ready_flag.store(false, Ordering::Release);
                if let Some(running) = self.running.as_mut() {
                    running.expected_exit = true;
                    running.kill();
                }
            }
        }
    }

    fn on_exit(&mut self, generation: u64, code: Option<i32>, error: Option<String>) {
        if !self.is_current(generation) {
            return;
        }
        let Some(running) = self.running.take() else {
            return;
        };
        self.ready_flag.store(false, Ordering::Release);

        let exit_reason = match (code, error) {
            (_, Some(error)) => error,
            (Some(code), None) => format!("exit code {}", code),
            (None, None) => "terminated by signal".to_string(),
        };
        if running.expected_exit || self.shutting_down {
            info!("{}: Capture sidecar stopped ({})", self.name, exit_reason);
        } else {
            warn!("{}: Capture sidecar exited: {}", self.name, exit_reason);
        }
        let restart = !self.shutting_down && (!running.expected_exit || self.restarting);
        drop(running);

        let pending: Vec<(String, Pending)> = self.pending.drain().collect();
        if !pending.is_empty() {
            debug!(
                "{}: Failing {} pending requests after exit",
                self.name,
                pending.len()
            );
        }
        for (_, p) in pending {
            self.settle(
                p.method,
                p.responder,
                Err(SidecarError::ProcessExited(exit_reason.clone())),
            );
        }
        self.fail_waiters(&SidecarError::ProcessExited(exit_reason.clone()));
        self.last_error = Some(exit_reason.clone());

        self.close_ingress();

        for (_, session_id) in self.sessions.active() {
            if let Some(status) =
                self.sessions
                    .end(&session_id, reason::SIDECAR_EXITED, Some(exit_reason.clone()))
            {
                self.emit(SupervisorEvent::Status(status));
            }
        }

        self.release_keybinds();

        self.emit(SupervisorEvent::SidecarExited {
            reason: exit_reason,
            code,
        });

        if restart {
            self.schedule_restart();
        }
    }

    fn schedule_restart(&mut self) {
        self.restarting = true;
        let delay = self.config.restart_delay();
        debug!("{}: Restart scheduled in {:?}", self.name, delay);
        self.restart_at = Some(Instant::now() + delay);
    }

    fn fail_waiters(&mut self, err: &SidecarError) {
        for waiter in std::mem::take(&mut self.waiters) {
            match waiter {
                Waiter::Ready(reply) => {
                    let _ = reply.send(Err(err.duplicate()));
                }
                Waiter::Request {
                    method, responder, ..
                } => self.settle(method, responder, Err(err.duplicate())),
            }
        }
    }

    fn release_keybinds(&mut self) {
        for kind in std::mem::take(&mut self.held_keys) {
            debug!("{}: Releasing held {:?} keybind", self.name, kind);
            self.emit(SupervisorEvent::PushKeybind(PushKeybindState {
                kind,
                active: false,
            }));
        }
    }

    /// Settle everything local and queue stop requests for live sessions.
    /// The process itself is left to [`Reactor::shutdown`].
    fn dispose(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.ready_flag.store(false, Ordering::Release);
        info!(
            "{}: Disposing, failing {} pending requests",
            self.name,
            self.pending.len()
        );

        let pending: Vec<(String, Pending)> = self.pending.drain().collect();
        for (_, p) in pending {
            self.settle(p.method, p.responder, Err(SidecarError::Disposed));
        }
        self.fail_waiters(&SidecarError::Disposed);

        let ready = self.ready_pid().is_some();
        for (kind, session_id) in self.sessions.active() {
            if ready {
                self.write_request(stop_method(kind), stop_params(&session_id), Responder::Discard);
            }
            if let Some(status) = self.sessions.end(&session_id, reason::DISPOSED, None) {
                self.emit(SupervisorEvent::Status(status));
            }
        }

        self.close_ingress();
        self.restart_at = None;
        self.restarting = false;
        self.release_keybinds();
    }

    /// Wait (bounded) for the stop replies, then kill the sidecar and wait
    /// (bounded) for its exit report.
    async fn shutdown(&mut self) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.pending.is_empty() && self.running.is_some() {
            match tokio::time::timeout_at(deadline, self.internal_rx.recv()).await {
                Ok(Some(msg)) => self.on_internal(msg),
                Ok(None) | Err(_) => break,
            }
        }

        let unanswered: Vec<(String, Pending)> = self.pending.drain().collect();
        if !unanswered.is_empty() {
            debug!(
                "{}: {} requests unanswered at shutdown",
                self.name,
                unanswered.len()
            );
        }
        for (_, p) in unanswered {
            self.settle(p.method, p.responder, Err(SidecarError::Disposed));
        }

        let Some(running) = self.running.as_mut() else {
            return;
        };
        running.expected_exit = true;
        running.kill();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.running.is_some() {
            match tokio::time::timeout_at(deadline, self.internal_rx.recv()).await {
                Ok(Some(msg)) => self.on_internal(msg),
                Ok(None) | Err(_) => {
                    warn!("{}: Capture sidecar did not report exit", self.name);
                    break;
                }
            }
        }
    }

    // --- control channel ---

    fn next_request_id(&mut self) -> String {
        self.request_counter = self.request_counter.wrapping_add(1);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        format!("{}-{}", millis, self.request_counter)
    }

    /// Send now if ready, otherwise park until the process is.
    fn dispatch(&mut self, method: Method, params: Value, responder: Responder) {
        if self.ready_pid().is_some() {
            self.write_request(method, params, responder);
        } else {
            self.waiters.push(Waiter::Request {
                method,
                params,
                responder,
            });
            self.start_spawn();
        }
    }

    fn write_request(&mut self, method: Method, params: Value, responder: Responder) {
        let Some(stdin_tx) = self.running.as_ref().map(|r| r.stdin_tx.clone()) else {
            self.settle(method, responder, Err(SidecarError::NotRunning));
            return;
        };

        let id = self.next_request_id();
        let request = ControlRequest {
            id: id.clone(),
            method,
            params,
        };
        let line = match request.to_line() {
            Ok(line) => line,
            Err(e) => {
                let err = SidecarError::Encode {
                    method: method.to_string(),
                    message: e.to_string(),
                };
                self.settle(method, responder, Err(err));
                return;
            }
        };

        match stdin_tx.try_send(line) {
            Ok(()) => {
                trace!("{}: Sent {} ({})", self.name, id, method);
                self.pending.insert(
                    id,
                    Pending {
                        method,
                        responder,
                        deadline: Instant::now() + self.config.request_timeout(),
                    },
                );
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.settle(
                    method,
                    responder,
                    Err(SidecarError::Backlogged(method.to_string())),
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.settle(method, responder, Err(SidecarError::NotRunning));
            }
        }
    }

    fn notify(&mut self, method: Method, params: Value) {
        let Some(running) = self.running.as_ref().filter(|r| r.ready) else {
            trace!("{}: Dropping {} notification, sidecar not ready", self.name, method);
            return;
        };
        let line = match (ControlNotification { method, params }).to_line() {
            Ok(line) => line,
            Err(e) => {
                debug!("{}: Could not encode {}: {}", self.name, method, e);
                return;
            }
        };
        if running.stdin_tx.try_send(line).is_err() {
            trace!("{}: Dropping {} notification, stdin backlogged", self.name, method);
        }
    }

    fn on_line(&mut self, line: &str) {
        match parse_incoming(line) {
            Ok(Incoming::Response(response)) => self.on_response(response),
            Ok(Incoming::Event(event)) => self.on_event(event),
            Err(ProtoError::UnknownEvent(name)) => {
                debug!("{}: Ignoring unknown event {}", self.name, name);
            }
            Err(e) => {
                if let Some(suppressed) = self.line_log.check("malformed-line") {
                    warn!(
                        "{}: Discarding malformed sidecar line ({} similar suppressed): {}",
                        self.name, suppressed, e
                    );
                }
            }
        }
    }

    fn on_response(&mut self, response: ControlResponse) {
        let Some(pending) = self.pending.remove(&response.id) else {
            debug!(
                "{}: Response for unknown request {} (late or duplicate)",
                self.name, response.id
            );
            return;
        };
        let method = pending.method;
        let result = response.into_result().map_err(|e| SidecarError::Remote {
            method: method.to_string(),
            message: e.message,
        });
        self.settle(method, pending.responder, result);
    }

    fn settle(&mut self, method: Method, responder: Responder, result: Result<Value, SidecarError>) {
        match responder {
            Responder::Caller(reply) => {
                let _ = reply.send(result);
            }
            Responder::HealthCheck { generation } => self.on_ping(generation, result),
            Responder::Start { kind, reply } => {
                let outcome = result.and_then(|value| {
                    serde_json::from_value::<CaptureSession>(value).map_err(|e| {
                        SidecarError::InvalidResponse {
                            method: method.to_string(),
                            message: e.to_string(),
                        }
                    })
                });
                match &outcome {
                    Ok(session) => self.on_session_started(kind, session),
                    Err(e) => {
                        warn!("{}: {} failed: {}", self.name, method, e);
                        self.emit(SupervisorEvent::Status(SessionStatus {
                            kind,
                            session_id: None,
                            state: SessionState::Ended,
                            reason: Some(reason::START_FAILED.to_string()),
                            error: Some(e.to_string()),
                        }));
                    }
                }
                let _ = reply.send(outcome);
            }
            Responder::Stop { session_id, reply } => {
                if let Err(e) = &result {
                    debug!("{}: {} for {} failed: {}", self.name, method, session_id, e);
                }
                // Ends locally even when the request failed.
                if let Some(status) = self.sessions.end(&session_id, reason::STOPPED, None) {
                    info!("{}: Session {} stopped", self.name, session_id);
                    self.emit(SupervisorEvent::Status(status));
                }
                let _ = reply.send(result.map(|_| ()));
            }
            Responder::IngressInfo { generation } => self.on_ingress_info(generation, result),
            Responder::Discard => {
                if let Err(e) = result {
                    debug!("{}: {} failed: {}", self.name, method, e);
                }
            }
        }
    }

    // --- sessions ---

    fn on_session_started(&mut self, kind: SessionKind, session: &CaptureSession) {
        info!(
            "{}: {} session {} active ({} Hz, {} ch)",
            self.name, kind, session.session_id, session.sample_rate, session.channels
        );
        let watchdog = Instant::now() + self.config.startup_watchdog();
        self.sessions.activate(kind, session, Some(watchdog));
        self.emit(SupervisorEvent::Status(SessionStatus::active(
            kind,
            &session.session_id,
        )));
    }

    fn request_stop(&mut self, kind: SessionKind, session_id: String, reply: Reply<()>) {
        let params = stop_params(&session_id);
        let responder = Responder::Stop { session_id, reply };
        if self.ready_pid().is_some() {
            self.write_request(stop_method(kind), params, responder);
        } else {
            // No process means no session on the other side.
            self.settle(stop_method(kind), responder, Ok(Value::Null));
        }
    }

    fn on_watchdog(&mut self, session_id: String) {
        let Some(status) = self.sessions.end(
            &session_id,
            reason::STARTUP_TIMEOUT,
            Some(format!(
                "no frames within {}ms of start",
                self.config.startup_watchdog_ms
            )),
        ) else {
            return;
        };
        warn!(
            "{}: Session {} produced no frames, tearing it down",
            self.name, session_id
        );
        if self.ready_pid().is_some() {
            self.write_request(
                stop_method(status.kind),
                stop_params(&session_id),
                Responder::Discard,
            );
        }
        self.emit(SupervisorEvent::Status(status));
    }

    fn on_event(&mut self, event: SidecarEvent) {
        match event {
            SidecarEvent::AudioCaptureFrame(frame) => {
                self.on_frame(SessionKind::AudioCapture, frame)
            }
            SidecarEvent::VoiceFilterFrame(frame) => self.on_frame(SessionKind::VoiceFilter, frame),
            SidecarEvent::AudioCaptureEnded(ended) | SidecarEvent::VoiceFilterEnded(ended) => {
                self.on_session_ended(ended)
            }
            SidecarEvent::PushKeybindState(state) => {
                if state.active {
                    self.held_keys.insert(state.kind);
                } else {
                    self.held_keys.remove(&state.kind);
                }
                self.emit(SupervisorEvent::PushKeybind(state));
            }
        }
    }

    fn on_frame(&mut self, kind: SessionKind, frame: sidecarproto::AudioFrame) {
        if !self.sessions.record_frame(kind, &frame.session_id) {
            trace!(
                "{}: Frame for inactive {} session {}",
                self.name,
                kind,
                frame.session_id
            );
            return;
        }
        self.emit(SupervisorEvent::Frame {
            kind,
            frame: Arc::new(frame),
        });
    }

    fn on_session_ended(&mut self, ended: SessionEnded) {
        let why = ended.reason.as_deref().unwrap_or(reason::ENDED);
        if let Some(status) = self.sessions.end(&ended.session_id, why, ended.error) {
            info!("{}: Session {} ended ({})", self.name, ended.session_id, why);
            self.emit(SupervisorEvent::Status(status));
        }
    }

    // --- binary ingress ---

    fn connect_ingress(&mut self) {
        match self.ready_pid() {
            Some(_) => {
                let generation = self.generation;
                self.write_request(
                    Method::VoiceFilterBinaryIngressInfo,
                    json!({}),
                    Responder::IngressInfo { generation },
                );
            }
            None => self.ingress.connect_failed(),
        }
    }

    fn on_ingress_info(&mut self, generation: u64, result: Result<Value, SidecarError>) {
        let info = match result {
            Ok(value) => IngressInfo::from_result(&value),
            Err(e) => {
                debug!("{}: Binary ingress unavailable: {}", self.name, e);
                None
            }
        };
        let Some(IngressInfo { port }) = info.filter(|_| self.is_current(generation)) else {
            self.ingress.connect_failed();
            return;
        };

        let timeout = self.ingress.config().connect_timeout();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port)))
                .await
            {
                Ok(Ok(stream)) => match stream.set_nodelay(true) {
                    Ok(()) => Ok(stream),
                    Err(e) => Err(e.to_string()),
                },
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
            };
            let _ = tx
                .send(Internal::IngressConnected {
                    generation,
                    port,
                    result,
                })
                .await;
        });
    }

    fn on_ingress_connected(
        &mut self,
        generation: u64,
        port: u16,
        result: Result<TcpStream, String>,
    ) {
        let stream = match result {
            Ok(stream) if self.is_current(generation) && !self.shutting_down => stream,
            Ok(_) => {
                self.ingress.connect_failed();
                return;
            }
            Err(e) => {
                let err = SidecarError::IngressConnect(format!("127.0.0.1:{}: {}", port, e));
                warn!("{}: {}; using JSON push path", self.name, err);
                self.ingress.connect_failed();
                return;
            }
        };

        if let Some(old) = self.flusher.take() {
            old.abort();
        }
        self.ingress_links += 1;
        let link = self.ingress_links;
        let stream = self.ingress.install(stream, link);
        info!("{}: Binary ingress connected on port {}", self.name, port);

        let path = Arc::clone(&self.ingress);
        let name = self.name.clone();
        self.flusher = Some(tokio::spawn(async move {
            if let Err(e) = flush_loop(Arc::clone(&path), stream).await {
                warn!("{}: Binary ingress write failed: {}", name, e);
                path.lost(link);
            }
        }));
    }

    fn close_ingress(&mut self) {
        if let Some(flusher) = self.flusher.take() {
            flusher.abort();
        }
        self.ingress.close();
    }

    fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            running: self.running.is_some(),
            ready: self.ready_pid().is_some(),
            pid: self.running.as_ref().and_then(|r| r.pid),
            generation: self.generation,
            last_error: self.last_error.clone(),
            pending_requests: self.pending.len(),
            active_sessions: self.sessions.len(),
            restart_pending: self.restart_at.is_some(),
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn stop_method(kind: SessionKind) -> Method {
    match kind {
        SessionKind::AudioCapture => Method::AudioCaptureStop,
        SessionKind::VoiceFilter => Method::VoiceFilterStop,
    }
}

fn stop_params(session_id: &str) -> Value {
    serde_json::to_value(StopSessionParams {
        session_id: session_id.to_string(),
    })
    .unwrap_or_else(|_| json!({ "sessionId": session_id }))
}

fn spawn_stdout_reader(
    generation: u64,
    mut stdout: Box<dyn AsyncRead + Send + Unpin>,
    tx: mpsc::Sender<Internal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = LineAssembler::default();
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            match stdout.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    lines.push(&chunk[..n]);
                    while let Some(line) = lines.next_line() {
                        if tx.send(Internal::Line { generation, line }).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    debug!("Sidecar stdout read failed: {}", e);
                    break;
                }
            }
        }
        if let Some(line) = lines.take_remainder() {
            let _ = tx.send(Internal::Line { generation, line }).await;
        }
        let _ = tx.send(Internal::StdoutClosed { generation }).await;
    })
}

fn spawn_stdin_writer(
    generation: u64,
    mut stdin: Box<dyn AsyncWrite + Send + Unpin>,
    mut lines: mpsc::Receiver<String>,
    tx: mpsc::Sender<Internal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            let written = match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                let _ = tx
                    .send(Internal::StdinFailed {
                        generation,
                        error: e.to_string(),
                    })
                    .await;
                return;
            }
        }
    })
}

fn spawn_stderr_forwarder(
    name: String,
    stderr: Box<dyn AsyncRead + Send + Unpin>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("{} stderr: {}", name, line);
        }
    })
}

/// Waits for exit. Sending on (or dropping) the kill channel kills first.
fn spawn_waiter(
    generation: u64,
    mut handle: Box<dyn ProcessHandle>,
    kill_rx: oneshot::Receiver<()>,
    tx: mpsc::Sender<Internal>,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = handle.wait() => status,
            _ = kill_rx => {
                if let Err(e) = handle.kill().await {
                    debug!("Sidecar kill failed: {}", e);
                }
                handle.wait().await
            }
        };
        let (code, error) = match status {
            Ok(code) => (code, None),
            Err(e) => (None, Some(e.to_string())),
        };
        let _ = tx
            .send(Internal::Exited {
                generation,
                code,
                error,
            })
            .await;
    });
}
