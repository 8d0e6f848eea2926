//! Debug Adapter Protocol types and data structures
//!
//! This module defines the envelopes exchanged with the adapter process and
//! the small enums the session uses to describe its own state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One decoded wire frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtocolMessage {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl ProtocolMessage {
    pub fn seq(&self) -> i64 {
        match self {
            ProtocolMessage::Request(r) => r.seq,
            ProtocolMessage::Response(r) => r.seq,
            ProtocolMessage::Event(e) => e.seq,
        }
    }
}

/// Outgoing (or reverse) request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: i64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

/// Response to a request, matched by `request_seq`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: i64,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

/// Unsolicited adapter notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

impl Event {
    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    pub fn body_i64(&self, key: &str) -> Option<i64> {
        self.body.get(key).and_then(Value::as_i64)
    }
}

/// Request commands sent to the adapter
pub mod command {
    pub const INITIALIZE: &str = "initialize";
    pub const LAUNCH: &str = "launch";
    pub const ATTACH: &str = "attach";
    pub const DISCONNECT: &str = "disconnect";
    pub const SET_BREAKPOINTS: &str = "setBreakpoints";
    pub const SET_EXCEPTION_BREAKPOINTS: &str = "setExceptionBreakpoints";
    pub const CONFIGURATION_DONE: &str = "configurationDone";
    pub const CONTINUE: &str = "continue";
    pub const NEXT: &str = "next";
    pub const STEP_IN: &str = "stepIn";
    pub const STEP_OUT: &str = "stepOut";
    pub const PAUSE: &str = "pause";
    pub const THREADS: &str = "threads";
    pub const STACK_TRACE: &str = "stackTrace";
    pub const SCOPES: &str = "scopes";
    pub const VARIABLES: &str = "variables";
    pub const EVALUATE: &str = "evaluate";
    pub const EXCEPTION_INFO: &str = "exceptionInfo";
}

/// Event names emitted by the adapter
pub mod event {
    pub const INITIALIZED: &str = "initialized";
    pub const STOPPED: &str = "stopped";
    pub const CONTINUED: &str = "continued";
    pub const EXITED: &str = "exited";
    pub const TERMINATED: &str = "terminated";
    pub const THREAD: &str = "thread";
    pub const OUTPUT: &str = "output";
    pub const BREAKPOINT: &str = "breakpoint";
    pub const MODULE: &str = "module";
    pub const PROCESS: &str = "process";
}

/// Lifecycle of a debug session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugState {
    /// No adapter process
    Idle,
    /// Adapter starting, initialize/launch handshake in flight
    Launching,
    /// Program executing
    Running,
    /// Program halted at a breakpoint, step, exception or pause
    Stopped,
    /// Adapter exited or stop requested
    Terminated,
    /// Unrecoverable protocol failure
    Error,
}

impl DebugState {
    /// Terminated and Error end a session instance for good
    pub fn is_terminal(self) -> bool {
        matches!(self, DebugState::Terminated | DebugState::Error)
    }
}

impl fmt::Display for DebugState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DebugState::Idle => "idle",
            DebugState::Launching => "launching",
            DebugState::Running => "running",
            DebugState::Stopped => "stopped",
            DebugState::Terminated => "terminated",
            DebugState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Reason carried by a `stopped` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Step,
    Breakpoint,
    Exception,
    Pause,
    Entry,
    Goto,
    FunctionBreakpoint,
    DataBreakpoint,
    Other(String),
}

impl From<&str> for StopReason {
    fn from(s: &str) -> Self {
        match s {
            "step" => StopReason::Step,
            "breakpoint" => StopReason::Breakpoint,
            "exception" => StopReason::Exception,
            "pause" => StopReason::Pause,
            "entry" => StopReason::Entry,
            "goto" => StopReason::Goto,
            "function breakpoint" => StopReason::FunctionBreakpoint,
            "data breakpoint" => StopReason::DataBreakpoint,
            other => StopReason::Other(other.to_string()),
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Step => "step",
            StopReason::Breakpoint => "breakpoint",
            StopReason::Exception => "exception",
            StopReason::Pause => "pause",
            StopReason::Entry => "entry",
            StopReason::Goto => "goto",
            StopReason::FunctionBreakpoint => "function breakpoint",
            StopReason::DataBreakpoint => "data breakpoint",
            StopReason::Other(other) => other,
        };
        write!(f, "{}", s)
    }
}

impl Serialize for StopReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Category of an `output` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCategory {
    Console,
    Stdout,
    Stderr,
    Telemetry,
    Other,
}

impl From<&str> for OutputCategory {
    fn from(s: &str) -> Self {
        match s {
            "console" => OutputCategory::Console,
            "stdout" => OutputCategory::Stdout,
            "stderr" => OutputCategory::Stderr,
            "telemetry" => OutputCategory::Telemetry,
            _ => OutputCategory::Other,
        }
    }
}

/// Body of a `stopped` event
#[derive(Debug, Clone, PartialEq)]
pub struct StoppedBody {
    pub reason: StopReason,
    pub thread_id: Option<i64>,
    pub all_threads_stopped: bool,
    pub description: Option<String>,
    pub text: Option<String>,
}

impl StoppedBody {
    pub fn from_event(event: &Event) -> Self {
        StoppedBody {
            reason: StopReason::from(event.body_str("reason").unwrap_or("breakpoint")),
            thread_id: event.body_i64("threadId"),
            all_threads_stopped: event
                .body
                .get("allThreadsStopped")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            description: event.body_str("description").map(str::to_string),
            text: event.body_str("text").map(str::to_string),
        }
    }
}
