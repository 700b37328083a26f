//! Finding and starting the sidecar executable.
//!
//! [`SidecarLauncher`] is the seam tests swap out: the supervisor only ever
//! sees byte streams and a [`ProcessHandle`], never a real `Child`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use sidecarconf::BinaryConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::SidecarError;

/// Wait on or kill a launched sidecar.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Resolves when the process exits, with its exit code if it had one.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    async fn kill(&mut self) -> std::io::Result<()>;
}

/// A running sidecar as the supervisor sees it.
pub struct SidecarProcess {
    pub pid: Option<u32>,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub handle: Box<dyn ProcessHandle>,
}

#[async_trait]
pub trait SidecarLauncher: Send + Sync {
    /// Locate the executable. Failure here means "not installed", and is
    /// reported as an unavailable status rather than an error.
    fn resolve_binary(&self) -> Result<PathBuf, SidecarError>;

    async fn launch(&self, binary: &Path) -> Result<SidecarProcess, SidecarError>;
}

/// Resolves the sidecar binary from config, packaged and development locations.
#[derive(Debug, Clone)]
pub struct BinaryLocator {
    config: BinaryConfig,
    exe_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
}

impl BinaryLocator {
    pub fn new(config: BinaryConfig) -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        let work_dir = std::env::current_dir().ok();
        Self {
            config,
            exe_dir,
            work_dir,
        }
    }

    /// Locator anchored at explicit directories instead of the current process.
    pub fn with_roots(
        config: BinaryConfig,
        exe_dir: Option<PathBuf>,
        work_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            config,
            exe_dir,
            work_dir,
        }
    }

    /// Every location checked, in order, excluding an explicit config path.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let file = self.config.file_name();
        let mut dirs: Vec<PathBuf> = Vec::new();

        // Packaged: shipped beside the app binary or in its resource dir
        if let Some(exe) = &self.exe_dir {
            dirs.push(exe.clone());
            dirs.push(exe.join("sidecar"));
            dirs.push(exe.join("resources"));
            dirs.push(exe.join("resources").join("sidecar"));
            if let Some(parent) = exe.parent() {
                if cfg!(target_os = "macos") {
                    dirs.push(parent.join("Resources"));
                }
                dirs.push(parent.join("lib").join(&self.config.name));
                dirs.push(parent.join("libexec"));
            }
        }

        // Development: configured dirs, then conventional build outputs
        dirs.extend(self.config.search_dirs.iter().cloned());
        if let Some(work) = &self.work_dir {
            for profile in ["release", "debug"] {
                dirs.push(work.join("target").join(profile));
                dirs.push(work.join("sidecar").join("target").join(profile));
            }
            dirs.push(work.join("native").join(&self.config.name).join("build"));
        }

        dirs.into_iter().map(|d| d.join(&file)).collect()
    }

    pub fn locate(&self) -> Result<PathBuf, SidecarError> {
        if let Some(path) = &self.config.path {
            return if path.is_file() {
                Ok(path.clone())
            } else {
                Err(SidecarError::BinaryNotFound(format!(
                    "configured path {} does not exist",
                    path.display()
                )))
            };
        }

        let candidates = self.candidates();
        for candidate in &candidates {
            if candidate.is_file() {
                debug!("Resolved capture sidecar binary: {}", candidate.display());
                return Ok(candidate.clone());
            }
        }

        Err(SidecarError::BinaryNotFound(format!(
            "{} not in any of {} search locations",
            self.config.file_name(),
            candidates.len()
        )))
    }
}

/// Spawns the real executable with piped stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    locator: BinaryLocator,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(config: BinaryConfig) -> Self {
        Self {
            locator: BinaryLocator::new(config),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

struct ChildHandle(Child);

#[async_trait]
impl ProcessHandle for ChildHandle {
    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.0.wait().await?.code())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.0.kill().await
    }
}

#[async_trait]
impl SidecarLauncher for ProcessLauncher {
    fn resolve_binary(&self) -> Result<PathBuf, SidecarError> {
        self.locator.locate()
    }

    async fn launch(&self, binary: &Path) -> Result<SidecarProcess, SidecarError> {
        let spawn_err = |source| SidecarError::Spawn {
            path: binary.to_path_buf(),
            source,
        };

        let mut child = Command::new(binary)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let missing = || spawn_err(std::io::Error::other("stdio was not piped"));
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take();

        Ok(SidecarProcess {
            pid: child.id(),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            handle: Box::new(ChildHandle(child)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn explicit_path_wins_or_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("my-sidecar");
        touch(&bin);

        let config = BinaryConfig {
            path: Some(bin.clone()),
            ..Default::default()
        };
        assert_eq!(BinaryLocator::with_roots(config, None, None).locate().unwrap(), bin);

        let config = BinaryConfig {
            path: Some(dir.path().join("missing")),
            ..Default::default()
        };
        let err = BinaryLocator::with_roots(config, None, None).locate().unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn packaged_location_beats_dev_dirs() {
        let exe = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let config = BinaryConfig::default();
        let name = config.file_name();

        let dev = work.path().join("target").join("debug").join(&name);
        touch(&dev);
        let locator = BinaryLocator::with_roots(
            config.clone(),
            Some(exe.path().to_path_buf()),
            Some(work.path().to_path_buf()),
        );
        assert_eq!(locator.locate().unwrap(), dev);

        let packaged = exe.path().join("resources").join(&name);
        touch(&packaged);
        assert_eq!(locator.locate().unwrap(), packaged);
    }

    #[test]
    fn configured_search_dirs_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let config = BinaryConfig {
            search_dirs: vec![dir.path().to_path_buf()],
            name: "fake-capture".to_string(),
            ..Default::default()
        };
        let expected = dir.path().join(config.file_name());
        touch(&expected);

        let locator = BinaryLocator::with_roots(config, None, None);
        assert_eq!(locator.candidates(), vec![expected.clone()]);
        assert_eq!(locator.locate().unwrap(), expected);
    }

    #[test]
    fn nothing_found_is_binary_not_found() {
        let locator = BinaryLocator::with_roots(BinaryConfig::default(), None, None);
        let err = locator.locate().unwrap_err();
        assert_eq!(err.kind(), "binary-not-found");
    }
}
