use std::path::PathBuf;

/// Failures surfaced to supervisor callers.
///
/// Data-plane problems (bad frames, ingress backpressure, a dead binary
/// socket) never show up here; they are absorbed locally and counted.
#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("capture sidecar binary not found ({0})")]
    BinaryNotFound(String),

    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{method} timed out after {timeout_ms}ms")]
    RequestTimeout { method: String, timeout_ms: u64 },

    #[error("{method} failed: {message}")]
    Remote { method: String, message: String },

    #[error("capture sidecar exited: {0}")]
    ProcessExited(String),

    #[error("capture sidecar is not running")]
    NotRunning,

    #[error("control channel backlogged, {0} dropped")]
    Backlogged(String),

    #[error("binary ingress connect failed: {0}")]
    IngressConnect(String),

    #[error("invalid {method} response: {message}")]
    InvalidResponse { method: String, message: String },

    #[error("failed to encode {method} request: {message}")]
    Encode { method: String, message: String },

    #[error("supervisor disposed")]
    Disposed,
}

impl SidecarError {
    /// Stable label for logs and status reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            SidecarError::BinaryNotFound(_) => "binary-not-found",
            SidecarError::Spawn { .. } => "spawn-failure",
            SidecarError::RequestTimeout { .. } => "request-timeout",
            SidecarError::Remote { .. } => "remote-error",
            SidecarError::ProcessExited(_) | SidecarError::NotRunning => "sidecar-crash",
            SidecarError::Backlogged(_) => "backpressure",
            SidecarError::IngressConnect(_) => "socket-connect-failure",
            SidecarError::InvalidResponse { .. } => "invalid-response",
            SidecarError::Encode { .. } => "invalid-request",
            SidecarError::Disposed => "disposed",
        }
    }

    /// Copy of this error for fanning one failure out to several waiters.
    ///
    /// `io::Error` is not `Clone`, so a spawn failure keeps only its kind
    /// and message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            SidecarError::BinaryNotFound(s) => SidecarError::BinaryNotFound(s.clone()),
            SidecarError::Spawn { path, source } => SidecarError::Spawn {
                path: path.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            SidecarError::RequestTimeout { method, timeout_ms } => SidecarError::RequestTimeout {
                method: method.clone(),
                timeout_ms: *timeout_ms,
            },
            SidecarError::Remote { method, message } => SidecarError::Remote {
                method: method.clone(),
                message: message.clone(),
            },
            SidecarError::ProcessExited(s) => SidecarError::ProcessExited(s.clone()),
            SidecarError::NotRunning => SidecarError::NotRunning,
            SidecarError::Backlogged(s) => SidecarError::Backlogged(s.clone()),
            SidecarError::IngressConnect(s) => SidecarError::IngressConnect(s.clone()),
            SidecarError::InvalidResponse { method, message } => SidecarError::InvalidResponse {
                method: method.clone(),
                message: message.clone(),
            },
            SidecarError::Encode { method, message } => SidecarError::Encode {
                method: method.clone(),
                message: message.clone(),
            },
            SidecarError::Disposed => SidecarError::Disposed,
        }
    }

    /// Worth retrying the same call later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SidecarError::RequestTimeout { .. }
                | SidecarError::ProcessExited(_)
                | SidecarError::NotRunning
                | SidecarError::Backlogged(_)
        )
    }
}
