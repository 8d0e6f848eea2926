//! DAP adapter bridge
//!
//! This crate drives an external debug adapter (netcoredbg) over the Debug
//! Adapter Protocol and keeps a consistent model of the debug session:
//! lifecycle state, breakpoints, threads and the frames fetched during the
//! current stop.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod bridge;
pub mod commands;
pub mod communication;
pub mod config;
pub mod events;
pub mod parser;
pub mod paths;
pub mod prebuild;
pub mod process;
pub mod session;
pub mod state;
pub mod types;
pub mod version;

pub use bridge::{DebugBridge, LaunchOutcome, StartOptions};
pub use commands::{EvaluateResult, Scope, StackFrame, ThreadInfo, Variable};
pub use config::SessionConfig;
pub use parser::*;
pub use prebuild::{BuildDiagnostic, BuildManager, BuildStatus, BuildTask};
pub use session::Session;
pub use state::{Breakpoint, OutputRecord, SessionSnapshot};
pub use types::*;
pub use version::{CompatibilityAdvisory, VersionInfo};

#[derive(Error, Debug)]
pub enum DapError {
    #[error("Failed to start debug adapter: {0}")]
    ProcessStart(#[source] std::io::Error),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol framing error: {0}")]
    ProtocolFraming(String),
    #[error("Adapter rejected '{command}' (seq {seq}): {message}")]
    Adapter {
        command: String,
        seq: i64,
        message: String,
    },
    #[error("Request '{command}' (seq {seq}) timed out after {timeout:?}")]
    RequestTimeout {
        command: String,
        seq: i64,
        timeout: Duration,
    },
    #[error("Cannot {operation} while the session is {state}")]
    InvalidState {
        state: DebugState,
        operation: &'static str,
    },
    #[error("Path {} is outside the project root {}", path.display(), root.display())]
    PathConstraintViolation { path: PathBuf, root: PathBuf },
    #[error("{message}")]
    Build {
        message: String,
        exit_code: Option<i32>,
        output: String,
        diagnostics: Vec<BuildDiagnostic>,
    },
    #[error("Debug session terminated")]
    SessionTerminated,
    #[error("A debug session is already active (state: {0})")]
    SessionConflict(DebugState),
    #[error("Stale reference: {0}")]
    StaleReference(String),
    #[error("Program not found: {}", .0.display())]
    ProgramNotFound(PathBuf),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

impl DapError {
    /// Stable name for the error class, used by callers that serialize errors
    pub fn kind(&self) -> &'static str {
        match self {
            DapError::ProcessStart(_) => "process_start_error",
            DapError::Transport(_) => "transport_error",
            DapError::ProtocolFraming(_) => "protocol_framing_error",
            DapError::Adapter { .. } => "adapter_error",
            DapError::RequestTimeout { .. } => "request_timeout",
            DapError::InvalidState { .. } => "invalid_state",
            DapError::PathConstraintViolation { .. } => "path_constraint_violation",
            DapError::Build { .. } => "build_error",
            DapError::SessionTerminated => "session_terminated",
            DapError::SessionConflict(_) => "session_conflict",
            DapError::StaleReference(_) => "stale_reference",
            DapError::ProgramNotFound(_) => "program_not_found",
            DapError::InvalidArgument(_) => "invalid_argument",
            DapError::MissingField(_) => "missing_field",
        }
    }

    /// Transport and framing failures end the session
    pub fn is_fatal(&self) -> bool {
        matches!(self, DapError::Transport(_) | DapError::ProtocolFraming(_))
    }
}

impl From<FrameError> for DapError {
    fn from(e: FrameError) -> Self {
        if e.is_transport() {
            DapError::Transport(e.to_string())
        } else {
            DapError::ProtocolFraming(e.to_string())
        }
    }
}

impl From<process::ProcessError> for DapError {
    fn from(e: process::ProcessError) -> Self {
        match e {
            process::ProcessError::StartError(io) => DapError::ProcessStart(io),
            other => DapError::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DapError>;
