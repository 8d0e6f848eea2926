//! Session configuration
//!
//! Values normally come from the command line / environment of the host
//! binary; `Default` gives settings suitable for netcoredbg.

use std::path::PathBuf;
use std::time::Duration;

/// Default number of buffered output entries
pub const DEFAULT_OUTPUT_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Debug adapter executable
    pub adapter_path: PathBuf,
    /// Arguments that select the DAP interpreter
    pub adapter_args: Vec<String>,
    /// Every path handed to the adapter must live under this directory
    pub project_root: PathBuf,
    /// Default timeout for adapter requests
    pub request_timeout: Duration,
    /// How long to wait for the `initialized` event after `initialize`
    pub handshake_timeout: Duration,
    /// Timeout for the best-effort `disconnect` sent while stopping
    pub disconnect_timeout: Duration,
    /// Optional delay before `stackTrace` requests, for adapters that report
    /// stale stacks right after a stop
    pub stack_trace_delay: Option<Duration>,
    /// Maximum number of buffered output entries
    pub output_capacity: usize,
    /// Build tool invocation used for pre-launch builds
    pub build_tool: String,
    /// Upper bound for a pre-launch build
    pub build_timeout: Duration,
    /// Run `restore` before `build`
    pub restore_before_build: bool,
}

impl SessionConfig {
    pub fn new(adapter_path: impl Into<PathBuf>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            adapter_path: adapter_path.into(),
            project_root: project_root.into(),
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            adapter_path: PathBuf::from("netcoredbg"),
            adapter_args: vec!["--interpreter=vscode".to_string()],
            project_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(2),
            stack_trace_delay: None,
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
            build_tool: "dotnet".to_string(),
            build_timeout: Duration::from_secs(300),
            restore_before_build: true,
        }
    }
}
