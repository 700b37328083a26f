//! Configuration loading for the capture sidecar pipeline.
//!
//! Every sidecar crate imports this, so it stays free of async and
//! audio dependencies.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/capture-sidecar/config.toml` (system)
//! 2. `~/.config/capture-sidecar/config.toml` (user)
//! 3. `./capture-sidecar.toml` (local override, or the `--config` path)
//! 4. Environment variables (`CAPTURE_SIDECAR_*`)
//!
//! Files are merged table-by-table before deserializing, so a local file
//! that only sets `[playback] mode` keeps everything else from the user file.
//!
//! # Example Config
//!
//! ```toml
//! [binary]
//! path = "~/src/capture-sidecar/target/release/capture-sidecar"
//!
//! [supervisor]
//! request_timeout_ms = 5000
//! restart_delay_ms = 1000
//!
//! [ingress]
//! max_queued_packets = 24
//! max_queued_bytes = 524288
//!
//! [playback]
//! mode = "stable"
//!
//! [telemetry]
//! log_level = "debug"
//! ```

pub mod audio;
pub mod loader;
pub mod process;

pub use audio::{PlaybackConfig, PlaybackMode, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use process::{BinaryConfig, IngressConfig, SupervisorConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete sidecar pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SidecarConfig {
    #[serde(default)]
    pub binary: BinaryConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub ingress: IngressConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl SidecarConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an explicit file replacing the local override.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which files and env vars contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::read_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::from_table(merged, Path::new("<merged>"))?;
        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize the effective configuration to TOML.
    pub fn to_toml(&self) -> String {
        let mut output = String::from("# Capture sidecar configuration\n\n");
        match toml::to_string_pretty(self) {
            Ok(body) => output.push_str(&body),
            Err(e) => output.push_str(&format!("# failed to serialize: {e}\n")),
        }
        output
    }
}
