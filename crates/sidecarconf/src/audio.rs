//! Playback and telemetry configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Playback queue tuning profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PlaybackMode {
    /// Small target depth, trims aggressively. Interactive voice.
    #[default]
    LowLatency,
    /// Deeper buffer, never trims. One-way app audio.
    Stable,
}

impl PlaybackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackMode::LowLatency => "low-latency",
            PlaybackMode::Stable => "stable",
        }
    }
}

impl fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlaybackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low-latency" | "low_latency" | "lowlatency" => Ok(PlaybackMode::LowLatency),
            "stable" => Ok(PlaybackMode::Stable),
            other => Err(format!("unknown playback mode: {other}")),
        }
    }
}

/// Consumer-side frame handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Default: low-latency
    #[serde(default)]
    pub mode: PlaybackMode,

    /// Synthesize silence for detected gaps so the queue does not starve.
    /// Default: true
    #[serde(default = "PlaybackConfig::default_insert_silence")]
    pub insert_silence: bool,

    /// Ceiling on silent frames inserted for one gap.
    /// Default: 50
    #[serde(default = "PlaybackConfig::default_max_recoverable_frames")]
    pub max_recoverable_frames: u32,

    /// Depth telemetry period. 0 disables.
    /// Default: 0
    #[serde(default)]
    pub telemetry_interval_ms: u64,

    /// Window for rate-limited rejection and queue logs.
    /// Default: 5000
    #[serde(default = "PlaybackConfig::default_log_window_ms")]
    pub log_window_ms: u64,
}

impl PlaybackConfig {
    fn default_insert_silence() -> bool {
        true
    }

    fn default_max_recoverable_frames() -> u32 {
        50
    }

    fn default_log_window_ms() -> u64 {
        5000
    }

    pub fn log_window(&self) -> Duration {
        Duration::from_millis(self.log_window_ms)
    }

    pub fn telemetry_interval(&self) -> Option<Duration> {
        (self.telemetry_interval_ms > 0).then(|| Duration::from_millis(self.telemetry_interval_ms))
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            mode: PlaybackMode::default(),
            insert_silence: Self::default_insert_silence(),
            max_recoverable_frames: Self::default_max_recoverable_frames(),
            telemetry_interval_ms: 0,
            log_window_ms: Self::default_log_window_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or EnvFilter directive.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
