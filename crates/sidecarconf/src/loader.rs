//! Config file discovery, table merging, and environment variable overlay.

use crate::{ConfigError, SidecarConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Directory name used under /etc and the user config dir.
const APP_DIR: &str = "capture-sidecar";

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli). Only existing files.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from(format!("/etc/{APP_DIR}/config.toml"));
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join(APP_DIR).join("config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from(format!("{APP_DIR}.toml"));
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse::<toml::Table>()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Load a single config file (no env overlay, no merging).
pub fn load_from_file(path: &Path) -> Result<SidecarConfig, ConfigError> {
    let table = read_table(path)?;
    from_table(table, path)
}

/// Deserialize a merged table, filling gaps from compiled defaults.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<SidecarConfig, ConfigError> {
    let mut config = toml::Value::Table(table)
        .try_into::<SidecarConfig>()
        .map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;

    if let Some(path) = config.binary.path.take() {
        config.binary.path = Some(expand_path(&path.to_string_lossy()));
    }
    config.binary.search_dirs = config
        .binary
        .search_dirs
        .iter()
        .map(|p| expand_path(&p.to_string_lossy()))
        .collect();

    Ok(config)
}

/// Recursively merge `overlay` into `base`. Tables merge key-by-key,
/// everything else is replaced.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, sources: &mut ConfigSources) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => {
            sources.env_overrides.push(name.to_string());
            Some(parsed)
        }
        Err(_) => None,
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut SidecarConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("CAPTURE_SIDECAR_BIN") {
        if !v.trim().is_empty() {
            config.binary.path = Some(expand_path(v.trim()));
            sources.env_overrides.push("CAPTURE_SIDECAR_BIN".to_string());
        }
    }

    if let Some(v) = parse_env("CAPTURE_SIDECAR_REQUEST_TIMEOUT_MS", sources) {
        config.supervisor.request_timeout_ms = v;
    }
    if let Some(v) = parse_env("CAPTURE_SIDECAR_RESTART_DELAY_MS", sources) {
        config.supervisor.restart_delay_ms = v;
    }
    if let Some(v) = parse_env("CAPTURE_SIDECAR_PLAYBACK_MODE", sources) {
        config.playback.mode = v;
    }

    if let Ok(v) = env::var("CAPTURE_SIDECAR_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources
            .env_overrides
            .push("CAPTURE_SIDECAR_LOG_LEVEL".to_string());
    }
    // RUST_LOG wins over everything
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
        return PathBuf::from(path);
    }

    if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        return match stripped.find('/') {
            Some(slash_pos) => {
                let var_name = &stripped[..slash_pos];
                match env::var(var_name) {
                    Ok(var_value) => PathBuf::from(var_value).join(&stripped[slash_pos + 1..]),
                    Err(_) => PathBuf::from(path),
                }
            }
            None => env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path)),
        };
    }

    PathBuf::from(path)
}
