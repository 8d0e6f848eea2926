//! Process management for the debug adapter
//!
//! This module handles adapter process creation and lifetime, and the
//! [`AdapterLauncher`] seam that lets tests substitute an in-memory adapter.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to start adapter process: {0}")]
    StartError(#[from] std::io::Error),
    #[error("Adapter process has no {0} handle")]
    MissingPipe(&'static str),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

pub struct AdapterProcess {
    child: Child,
}

impl AdapterProcess {
    /// Spawn the adapter with piped standard streams
    pub fn start(path: &Path, args: &[String]) -> Result<Self> {
        log::debug!("Starting debug adapter: {} {:?}", path.display(), args);

        let child = Command::new(path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        log::info!("Debug adapter started with PID: {:?}", child.id());

        Ok(AdapterProcess { child })
    }

    /// Get the process ID
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Give the adapter `grace` to exit on its own, then kill it
    pub async fn shutdown(mut self, grace: Duration) {
        let pid = self.id();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                log::debug!("Debug adapter {:?} exited: {}", pid, status);
                return;
            }
            Ok(Err(e)) => log::warn!("Waiting for debug adapter {:?} failed: {}", pid, e),
            Err(_) => log::debug!("Debug adapter {:?} still running, killing", pid),
        }
        if let Err(e) = self.child.kill().await {
            log::warn!("Failed to kill debug adapter {:?}: {}", pid, e);
        }
    }
}

/// Streams connected to a running adapter
pub struct AdapterIo {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// Owned process, absent for in-memory adapters
    pub process: Option<AdapterProcess>,
}

/// Starts an adapter and hands back its streams
pub trait AdapterLauncher: Send + Sync {
    fn launch(&self) -> Result<AdapterIo>;
}

/// Launches the configured adapter executable
pub struct ProcessLauncher {
    path: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(path: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            path: path.into(),
            args,
        }
    }
}

impl AdapterLauncher for ProcessLauncher {
    fn launch(&self) -> Result<AdapterIo> {
        let mut process = AdapterProcess::start(&self.path, &self.args)?;

        let stdin = process.take_stdin().ok_or(ProcessError::MissingPipe("stdin"))?;
        let stdout = process.take_stdout().ok_or(ProcessError::MissingPipe("stdout"))?;
        let stderr = process.take_stderr();

        Ok(AdapterIo {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            process: Some(process),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_executable_fails_to_start() {
        let launcher = ProcessLauncher::new("/nonexistent/netcoredbg", vec![]);
        assert!(matches!(launcher.launch(), Err(ProcessError::StartError(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_kills_lingering_process() {
        let process = AdapterProcess::start(Path::new("sleep"), &["30".to_string()]).unwrap();
        assert!(process.id().is_some());
        tokio::time::timeout(Duration::from_secs(5), process.shutdown(Duration::from_millis(50)))
            .await
            .expect("shutdown should not hang");
    }
}
