//! Sidecar process configuration - binary location, supervision timing, ingress socket.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where to find the capture sidecar executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryConfig {
    /// Explicit path to the sidecar binary. Skips the search when set.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Extra directories searched after the packaged locations.
    #[serde(default)]
    pub search_dirs: Vec<PathBuf>,

    /// Executable stem. ".exe" is appended on Windows.
    /// Default: capture-sidecar
    #[serde(default = "BinaryConfig::default_name")]
    pub name: String,
}

impl BinaryConfig {
    fn default_name() -> String {
        "capture-sidecar".to_string()
    }

    /// Platform-specific executable file name.
    pub fn file_name(&self) -> String {
        if cfg!(windows) {
            format!("{}.exe", self.name)
        } else {
            self.name.clone()
        }
    }
}

impl Default for BinaryConfig {
    fn default() -> Self {
        Self {
            path: None,
            search_dirs: Vec::new(),
            name: Self::default_name(),
        }
    }
}

/// Control channel and restart timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Per-request timeout on the control channel.
    /// Default: 5000
    #[serde(default = "SupervisorConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Delay before respawning a crashed sidecar.
    /// Default: 1000
    #[serde(default = "SupervisorConfig::default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// A session that produces no frame within this bound is torn down.
    /// Default: 3500
    #[serde(default = "SupervisorConfig::default_startup_watchdog_ms")]
    pub startup_watchdog_ms: u64,
}

impl SupervisorConfig {
    fn default_request_timeout_ms() -> u64 {
        5000
    }

    fn default_restart_delay_ms() -> u64 {
        1000
    }

    fn default_startup_watchdog_ms() -> u64 {
        3500
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn startup_watchdog(&self) -> Duration {
        Duration::from_millis(self.startup_watchdog_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: Self::default_request_timeout_ms(),
            restart_delay_ms: Self::default_restart_delay_ms(),
            startup_watchdog_ms: Self::default_startup_watchdog_ms(),
        }
    }
}

/// Binary ingress socket: connect behavior and backpressure queue caps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Loopback connect timeout.
    /// Default: 1000
    #[serde(default = "IngressConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Wait before retrying after a failed connect or a broken socket.
    /// Default: 3000
    #[serde(default = "IngressConfig::default_retry_cooldown_ms")]
    pub retry_cooldown_ms: u64,

    /// Packets held while the socket is backpressured.
    /// Default: 24
    #[serde(default = "IngressConfig::default_max_queued_packets")]
    pub max_queued_packets: usize,

    /// Bytes held while the socket is backpressured.
    /// Default: 512 KiB
    #[serde(default = "IngressConfig::default_max_queued_bytes")]
    pub max_queued_bytes: usize,

    /// Hard cap on one packet's payload.
    /// Default: 4 MiB
    #[serde(default = "IngressConfig::default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Log one line per this many dropped packets.
    /// Default: 25
    #[serde(default = "IngressConfig::default_drop_log_interval")]
    pub drop_log_interval: u64,
}

impl IngressConfig {
    fn default_connect_timeout_ms() -> u64 {
        1000
    }

    fn default_retry_cooldown_ms() -> u64 {
        3000
    }

    fn default_max_queued_packets() -> usize {
        24
    }

    fn default_max_queued_bytes() -> usize {
        512 * 1024
    }

    fn default_max_payload_bytes() -> usize {
        4 * 1024 * 1024
    }

    fn default_drop_log_interval() -> u64 {
        25
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_millis(self.retry_cooldown_ms)
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            retry_cooldown_ms: Self::default_retry_cooldown_ms(),
            max_queued_packets: Self::default_max_queued_packets(),
            max_queued_bytes: Self::default_max_queued_bytes(),
            max_payload_bytes: Self::default_max_payload_bytes(),
            drop_log_interval: Self::default_drop_log_interval(),
        }
    }
}
