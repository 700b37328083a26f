//! Supervisor lifecycle against the in-process fake sidecar.
//!
//! Covers:
//! - Status when the binary is missing
//! - Lazy spawn + health.ping before the first request
//! - Request timeouts, orphan responses, malformed lines
//! - Crash handling: pending rejection, session teardown, keybind release, restart
//! - Session status transitions and the startup watchdog
//! - Dispose idempotence

mod support;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use sidecar::{
    SessionState, SessionStatus, SidecarError, StartCaptureOptions, StartVoiceFilterOptions,
    Supervisor, SupervisorEvent,
};
use sidecarconf::SidecarConfig;
use sidecarproto::{
    AudioFrame, Method, PushKeybindKind, PushKeybindState, SessionKind, SidecarEvent,
};
use support::{next_event, Behavior, FakeLauncher};

fn config() -> SidecarConfig {
    let mut config = SidecarConfig::default();
    config.supervisor.restart_delay_ms = 200;
    config
}

fn capture_options() -> StartCaptureOptions {
    StartCaptureOptions {
        target_id: "app:42".to_string(),
        ..Default::default()
    }
}

fn ended(event: &SupervisorEvent) -> Option<SessionStatus> {
    match event {
        SupervisorEvent::Status(status) if status.state == SessionState::Ended => Some(status.clone()),
        _ => None,
    }
}

#[tokio::test]
async fn status_reports_missing_binary() {
    let (launcher, _processes) = FakeLauncher::missing();
    let supervisor = Supervisor::new(config(), launcher.clone());

    let status = supervisor.get_status().await;
    assert!(!status.available);
    let reason = status.reason.unwrap().to_lowercase();
    assert!(reason.contains("not found"), "reason was {reason}");
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn missing_binary_fails_requests() {
    let (launcher, _processes) = FakeLauncher::missing();
    let supervisor = Supervisor::new(config(), launcher);

    let err = supervisor.list_audio_targets().await.unwrap_err();
    assert_eq!(err.kind(), "binary-not-found");
}

#[tokio::test]
async fn first_request_spawns_and_pings() {
    let (launcher, mut processes) = FakeLauncher::new(Behavior::default());
    let supervisor = Supervisor::new(config(), launcher.clone());

    let targets = supervisor.list_audio_targets().await.unwrap();
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0].id, "app:42");
    assert_eq!(targets[0].process_name.as_deref(), Some("music"));

    let mut process = processes.recv().await.unwrap();
    let ping = process.next_message().await;
    assert_eq!(ping["method"], "health.ping");
    let list = process.next_message().await;
    assert_eq!(list["method"], "audio_targets.list");

    // Ids look like `<millis>-<counter>` and never repeat.
    let (a, b) = (ping["id"].as_str().unwrap(), list["id"].as_str().unwrap());
    assert_ne!(a, b);
    assert!(a.split_once('-').is_some_and(|(ms, n)| ms.parse::<u64>().is_ok() && n.parse::<u64>().is_ok()));

    let status = supervisor.get_status().await;
    assert!(status.available);
    assert_eq!(status.pid, Some(process.pid));
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn failed_ping_reports_unavailable() {
    let behavior = Behavior {
        answer_ping: false,
        ..Default::default()
    };
    let (launcher, _processes) = FakeLauncher::new(behavior);
    let supervisor = Supervisor::new(config(), launcher);

    let status = supervisor.get_status().await;
    assert!(!status.available);
    assert!(status.reason.unwrap().contains("not healthy"));
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    let behavior = Behavior {
        silent: vec!["audio_targets.list"],
        ..Default::default()
    };
    let (launcher, _processes) = FakeLauncher::new(behavior);
    let supervisor = Supervisor::new(config(), launcher);
    supervisor.ensure_ready().await.unwrap();

    let started = tokio::time::Instant::now();
    let err = supervisor.list_audio_targets().await.unwrap_err();
    assert!(matches!(err, SidecarError::RequestTimeout { .. }), "got {err:?}");
    assert!(started.elapsed() >= Duration::from_secs(5));

    // The pending entry is gone.
    let snapshot = supervisor.snapshot().await.unwrap();
    assert_eq!(snapshot.pending_requests, 0);
}

#[tokio::test]
async fn orphan_and_malformed_lines_are_ignored() {
    let (launcher, mut processes) = FakeLauncher::new(Behavior::default());
    let supervisor = Supervisor::new(config(), launcher);
    supervisor.ensure_ready().await.unwrap();
    let process = processes.recv().await.unwrap();

    process.emit_raw("this is not json");
    process.emit_raw("{\"half\": ");
    process.emit(json!({"id": "1-999", "ok": true, "result": {}}));
    process.emit(json!({"event": "mystery.event", "params": {}}));
    process.emit(json!({"event": "audio_capture.frame", "params": {"nope": true}}));

    let value = supervisor.request(Method::HealthPing, json!({})).await.unwrap();
    assert_eq!(value, json!({"status": "ok"}));
}

#[tokio::test]
async fn remote_errors_surface_with_message() {
    let behavior = Behavior::default();
    let (launcher, _processes) = FakeLauncher::new(behavior);
    let supervisor = Supervisor::new(config(), launcher);

    let err = supervisor
        .request(Method::VoiceFilterBinaryIngressInfo, json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "remote-error");
    assert!(err.to_string().contains("binary ingress disabled"));
}

#[tokio::test]
async fn capture_session_lifecycle() {
    let (launcher, mut processes) = FakeLauncher::new(Behavior::default());
    let supervisor = Supervisor::new(config(), launcher);
    let mut events = supervisor.subscribe();

    let session = supervisor.start_audio_capture(capture_options()).await.unwrap();
    assert_eq!(session.session_id, "cap-1");
    assert_eq!(session.target_id.as_deref(), Some("app:42"));
    assert_eq!(session.sample_rate, 48000);

    let starting = next_event(&mut events, |e| match e {
        SupervisorEvent::Status(s) => Some(s.clone()),
        _ => None,
    })
    .await;
    assert_eq!(starting.state, SessionState::Starting);
    let active = next_event(&mut events, |e| match e {
        SupervisorEvent::Status(s) => Some(s.clone()),
        _ => None,
    })
    .await;
    assert_eq!(active, SessionStatus::active(SessionKind::AudioCapture, "cap-1"));

    let mut process = processes.recv().await.unwrap();
    let start = process.next_request("audio_capture.start").await;
    assert_eq!(start["params"]["targetId"], "app:42");

    supervisor.stop_audio_capture(None).await.unwrap();
    let stop = process.next_request("audio_capture.stop").await;
    assert_eq!(stop["params"]["sessionId"], "cap-1");

    let status = next_event(&mut events, ended).await;
    assert_eq!(status.session_id.as_deref(), Some("cap-1"));
    assert_eq!(status.reason.as_deref(), Some("stopped"));

    // Second stop is a no-op.
    supervisor.stop_audio_capture(None).await.unwrap();
    supervisor.stop_audio_capture(Some("cap-1")).await.unwrap();
}

#[tokio::test]
async fn frames_forwarded_for_active_session_only() {
    let (launcher, mut processes) = FakeLauncher::new(Behavior::default());
    let supervisor = Supervisor::new(config(), launcher);
    let session = supervisor.start_audio_capture(capture_options()).await.unwrap();
    let mut events = supervisor.subscribe();
    let process = processes.recv().await.unwrap();

    process.emit_frame(AudioFrame::from_samples("stranger", 0, 48000, 2, vec![0.0; 960]));
    process.emit_frame(AudioFrame::from_samples(&session.session_id, 0, 48000, 2, vec![0.5; 960]));

    let frame = next_event(&mut events, |e| match e {
        SupervisorEvent::Frame { kind, frame } => Some((*kind, Arc::clone(frame))),
        _ => None,
    })
    .await;
    assert_eq!(frame.0, SessionKind::AudioCapture);
    assert_eq!(frame.1.session_id, session.session_id);
}

#[tokio::test]
async fn voice_filter_frames_route_by_kind() {
    let (launcher, mut processes) = FakeLauncher::new(Behavior::default());
    let supervisor = Supervisor::new(config(), launcher);
    let session = supervisor
        .start_voice_filter(StartVoiceFilterOptions {
            sample_rate: 48000,
            channels: 1,
            frames_per_buffer: Some(480),
            suppression_level: None,
        })
        .await
        .unwrap();
    let mut events = supervisor.subscribe();
    let process = processes.recv().await.unwrap();

    // Right session id on the capture event: not this session's stream.
    process.emit_frame(AudioFrame::from_samples(&session.session_id, 0, 48000, 1, vec![0.1; 480]));
    process.emit_event(SidecarEvent::VoiceFilterFrame(
        AudioFrame::from_samples(&session.session_id, 1, 48000, 1, vec![0.2; 480]).into_encoded(),
    ));

    let (kind, frame) = next_event(&mut events, |e| match e {
        SupervisorEvent::Frame { kind, frame } => Some((*kind, Arc::clone(frame))),
        _ => None,
    })
    .await;
    assert_eq!(kind, SessionKind::VoiceFilter);
    assert_eq!(frame.session_id, session.session_id);
    assert_eq!(frame.sequence, Some(1.0));
}

#[tokio::test]
async fn sidecar_reported_end_fires_once() {
    let (launcher, mut processes) = FakeLauncher::new(Behavior::default());
    let supervisor = Supervisor::new(config(), launcher);
    let session = supervisor.start_audio_capture(capture_options()).await.unwrap();
    let mut events = supervisor.subscribe();
    let process = processes.recv().await.unwrap();

    let ended_event = json!({
        "event": "audio_capture.ended",
        "params": {"sessionId": session.session_id, "reason": "capture_stopped"}
    });
    process.emit(ended_event.clone());
    process.emit(ended_event);

    let status = next_event(&mut events, ended).await;
    assert_eq!(status.reason.as_deref(), Some("capture_stopped"));

    // A crash afterwards must not end it again.
    process.crash(1);
    let mut statuses = Vec::new();
    next_event(&mut events, |e| {
        if let Some(status) = ended(e) {
            statuses.push(status);
        }
        matches!(e, SupervisorEvent::SidecarExited { .. }).then_some(())
    })
    .await;
    assert!(statuses.is_empty(), "unexpected: {statuses:?}");
}

#[tokio::test(start_paused = true)]
async fn silent_session_hits_startup_watchdog() {
    let (launcher, mut processes) = FakeLauncher::new(Behavior::default());
    let supervisor = Supervisor::new(config(), launcher);
    let mut events = supervisor.subscribe();
    let session = supervisor.start_audio_capture(capture_options()).await.unwrap();
    let mut process = processes.recv().await.unwrap();

    let started = tokio::time::Instant::now();
    let status = next_event(&mut events, ended).await;
    assert_eq!(status.session_id.as_deref(), Some(session.session_id.as_str()));
    assert_eq!(status.reason.as_deref(), Some("startup_timeout"));
    assert!(started.elapsed() >= Duration::from_secs(3));

    let stop = process.next_request("audio_capture.stop").await;
    assert_eq!(stop["params"]["sessionId"], session.session_id.as_str());
}

#[tokio::test(start_paused = true)]
async fn first_frame_disarms_watchdog() {
    let (launcher, mut processes) = FakeLauncher::new(Behavior::default());
    let supervisor = Supervisor::new(config(), launcher);
    let session = supervisor.start_audio_capture(capture_options()).await.unwrap();
    let mut events = supervisor.subscribe();
    let process = processes.recv().await.unwrap();

    process.emit_frame(AudioFrame::from_samples(&session.session_id, 0, 48000, 2, vec![0.0; 960]));
    next_event(&mut events, |e| matches!(e, SupervisorEvent::Frame { .. }).then_some(())).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    let snapshot = supervisor.snapshot().await.unwrap();
    assert_eq!(snapshot.active_sessions, 1);
}

#[tokio::test]
async fn crash_rejects_pending_ends_sessions_and_restarts() {
    let behavior = Behavior {
        silent: vec!["audio_targets.list"],
        ..Default::default()
    };
    let (launcher, mut processes) = FakeLauncher::new(behavior);
    let supervisor = Supervisor::new(config(), launcher.clone());
    let mut events = supervisor.subscribe();

    let session = supervisor.start_audio_capture(capture_options()).await.unwrap();
    let mut first = processes.recv().await.unwrap();

    let pending = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.list_audio_targets().await }
    });
    first.next_request("audio_targets.list").await;
    first.crash(9);

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), "sidecar-crash");

    let status = next_event(&mut events, ended).await;
    assert_eq!(status.session_id.as_deref(), Some(session.session_id.as_str()));
    assert_eq!(status.reason.as_deref(), Some("sidecar_exited"));

    let code = next_event(&mut events, |e| match e {
        SupervisorEvent::SidecarExited { code, .. } => Some(*code),
        _ => None,
    })
    .await;
    assert_eq!(code, Some(9));

    // Respawned after the restart delay without anyone asking.
    let second = tokio::time::timeout(Duration::from_secs(5), processes.recv())
        .await
        .unwrap()
        .unwrap();
    let pid = next_event(&mut events, |e| match e {
        SupervisorEvent::SidecarRestarted { pid } => Some(*pid),
        _ => None,
    })
    .await;
    assert_eq!(pid, Some(second.pid));

    let status = supervisor.get_status().await;
    assert!(status.available);
    assert_eq!(launcher.launches(), 2);
}

#[tokio::test]
async fn crash_releases_held_keybinds() {
    let (launcher, mut processes) = FakeLauncher::new(Behavior::default());
    let supervisor = Supervisor::new(config(), launcher);
    let mut events = supervisor.subscribe();
    supervisor
        .set_push_keybinds(sidecarproto::PushKeybinds {
            talk: Some("Ctrl+Shift+T".to_string()),
            mute: None,
        })
        .await
        .unwrap();
    let process = processes.recv().await.unwrap();

    process.emit(json!({"event": "push_keybind.state", "params": {"kind": "talk", "active": true}}));
    let held = next_event(&mut events, |e| match e {
        SupervisorEvent::PushKeybind(state) => Some(*state),
        _ => None,
    })
    .await;
    assert_eq!(
        held,
        PushKeybindState {
            kind: PushKeybindKind::Talk,
            active: true
        }
    );

    process.crash(3);
    let released = next_event(&mut events, |e| match e {
        SupervisorEvent::PushKeybind(state) => Some(*state),
        _ => None,
    })
    .await;
    assert_eq!(
        released,
        PushKeybindState {
            kind: PushKeybindKind::Talk,
            active: false
        }
    );
}

#[tokio::test]
async fn dispose_twice_is_safe() {
    let (launcher, mut processes) = FakeLauncher::new(Behavior::default());
    let supervisor = Supervisor::new(config(), launcher.clone());
    let mut events = supervisor.subscribe();
    let session = supervisor.start_audio_capture(capture_options()).await.unwrap();
    let mut process = processes.recv().await.unwrap();

    supervisor.dispose().await;
    supervisor.dispose().await;

    let status = next_event(&mut events, ended).await;
    assert_eq!(status.session_id.as_deref(), Some(session.session_id.as_str()));
    assert_eq!(status.reason.as_deref(), Some("disposed"));

    // The sidecar hears the stop before it is killed.
    let stop = process.next_request("audio_capture.stop").await;
    assert_eq!(stop["params"]["sessionId"], session.session_id.as_str());
    assert_eq!(process.exited().await, None);
    assert!(!supervisor.is_ready());

    let err = supervisor.ensure_ready().await.unwrap_err();
    assert!(matches!(err, SidecarError::Disposed));

    // No restart after a deliberate shutdown.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn independent_supervisors_do_not_share_state() {
    let (launcher_a, _pa) = FakeLauncher::new(Behavior::default());
    let (launcher_b, _pb) = FakeLauncher::missing();
    let a = Supervisor::new(config(), launcher_a);
    let b = Supervisor::new(config(), launcher_b);

    assert!(a.get_status().await.available);
    assert!(!b.get_status().await.available);
    a.dispose().await;
    assert!(!b.get_status().await.available);
}
