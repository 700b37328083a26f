//! Session lifecycle bookkeeping, owned by the reactor.
//!
//! `idle → starting → active → ended`. A session leaves the registry when
//! it ends, which is what makes the ended notification fire exactly once
//! no matter how many teardown paths race for it.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use sidecarproto::{CaptureSession, SessionKind};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Active,
    Ended,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Ended => "ended",
        })
    }
}

/// Why a session ended, as reported to subscribers.
pub mod reason {
    pub const STOPPED: &str = "stopped";
    pub const ENDED: &str = "ended";
    pub const START_FAILED: &str = "start_failed";
    pub const SIDECAR_EXITED: &str = "sidecar_exited";
    pub const STARTUP_TIMEOUT: &str = "startup_timeout";
    pub const DISPOSED: &str = "disposed";
}

/// One status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub kind: SessionKind,
    pub session_id: Option<String>,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionStatus {
    pub fn starting(kind: SessionKind) -> Self {
        Self {
            kind,
            session_id: None,
            state: SessionState::Starting,
            reason: None,
            error: None,
        }
    }

    pub fn active(kind: SessionKind, session_id: &str) -> Self {
        Self {
            kind,
            session_id: Some(session_id.to_string()),
            state: SessionState::Active,
            reason: None,
            error: None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.state == SessionState::Ended
    }
}

struct Entry {
    kind: SessionKind,
    /// Cleared by the first frame.
    watchdog: Option<Instant>,
}

#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: HashMap<String, Entry>,
    current: HashMap<SessionKind, String>,
}

impl SessionRegistry {
    pub fn activate(&mut self, kind: SessionKind, session: &CaptureSession, watchdog: Option<Instant>) {
        self.sessions
            .insert(session.session_id.clone(), Entry { kind, watchdog });
        self.current.insert(kind, session.session_id.clone());
    }

    /// Session a stop-without-id applies to.
    pub fn current(&self, kind: SessionKind) -> Option<&str> {
        self.current.get(&kind).map(String::as_str)
    }

    /// Note a frame. Returns false for sessions we do not know about.
    pub fn record_frame(&mut self, kind: SessionKind, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(entry) if entry.kind == kind => {
                entry.watchdog = None;
                true
            }
            _ => false,
        }
    }

    /// Retire a session. `None` if it had already ended.
    pub fn end(
        &mut self,
        session_id: &str,
        reason: &str,
        error: Option<String>,
    ) -> Option<SessionStatus> {
        let entry = self.sessions.remove(session_id)?;
        if self.current.get(&entry.kind).is_some_and(|id| id == session_id) {
            self.current.remove(&entry.kind);
        }
        Some(SessionStatus {
            kind: entry.kind,
            session_id: Some(session_id.to_string()),
            state: SessionState::Ended,
            reason: Some(reason.to_string()),
            error,
        })
    }

    pub fn is_known(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn active(&self) -> Vec<(SessionKind, String)> {
        self.sessions
            .iter()
            .map(|(id, entry)| (entry.kind, id.clone()))
            .collect()
    }

    pub fn expired_watchdogs(&self, now: Instant) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|(_, entry)| entry.watchdog.is_some_and(|deadline| now >= deadline))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
