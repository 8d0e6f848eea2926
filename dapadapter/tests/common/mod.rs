//! In-memory debug adapter used by the integration tests
//!
//! The adapter answers every request on its own (with canned bodies unless a
//! test overrides the behavior of a command) and lets tests inject events.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dapadapter::process::{AdapterIo, AdapterLauncher, AdapterProcess, Result as ProcessResult};
use dapadapter::{read_frame, write_frame, DebugState, Event, ProtocolMessage, Request, Response, Session, SessionConfig};
use serde_json::{json, Value};
use tokio::io::{duplex, split, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Notify};

pub const WAIT: Duration = Duration::from_secs(5);

/// How the fake adapter answers one command
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Success with this body
    Reply(Value),
    /// `success: false` with this message
    Fail(String),
    /// Never answer
    Ignore,
    /// Emit the event first, then answer with an empty success
    EventThenReply(String, Value),
}

enum Outgoing {
    Event(String, Value),
    Raw(Vec<u8>),
}

#[derive(Default)]
struct Shared {
    behaviors: Mutex<HashMap<String, Behavior>>,
    requests: Mutex<Vec<Request>>,
    seen: Notify,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    launches: AtomicUsize,
    next_breakpoint_id: AtomicI64,
    with_process: AtomicBool,
    pids: Mutex<Vec<u32>>,
}

/// Test handle on the fake adapter; cloning shares the same adapter
#[derive(Clone, Default)]
pub struct FakeAdapter {
    shared: Arc<Shared>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each launch also owns a real, long-running child process
    pub fn with_process() -> Self {
        let adapter = Self::default();
        adapter.shared.with_process.store(true, Ordering::SeqCst);
        adapter
    }

    /// Process ids of the children started by `with_process` adapters
    pub fn pids(&self) -> Vec<u32> {
        self.shared.pids.lock().unwrap().clone()
    }

    pub fn on(&self, command: &str, behavior: Behavior) {
        self.shared
            .behaviors
            .lock()
            .unwrap()
            .insert(command.to_string(), behavior);
    }

    pub fn launches(&self) -> usize {
        self.shared.launches.load(Ordering::SeqCst)
    }

    /// Every request received so far, in order
    pub fn requests(&self) -> Vec<Request> {
        self.shared.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, command: &str) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| r.command == command)
            .collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.command).collect()
    }

    /// Wait until `count` requests of `command` have arrived
    pub async fn wait_for_requests(&self, command: &str, count: usize) -> Vec<Request> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let notified = self.shared.seen.notified();
            let found = self.requests_for(command);
            if found.len() >= count {
                return found;
            }
            tokio::time::timeout_at(deadline, notified)
                .await
                .unwrap_or_else(|_| panic!("no '{}' request arrived", command));
        }
    }

    pub async fn wait_for_request(&self, command: &str) -> Request {
        self.wait_for_requests(command, 1).await.remove(0)
    }

    pub fn emit(&self, event: &str, body: Value) {
        self.send(Outgoing::Event(event.to_string(), body));
    }

    pub fn emit_stopped(&self, reason: &str, thread_id: i64) {
        self.emit(
            "stopped",
            json!({"reason": reason, "threadId": thread_id, "allThreadsStopped": true}),
        );
    }

    /// Write bytes that are not a valid frame
    pub fn send_garbage(&self) {
        self.send(Outgoing::Raw(b"Content-Length: nope\r\n\r\n".to_vec()));
    }

    fn send(&self, message: Outgoing) {
        let outgoing = self.shared.outgoing.lock().unwrap();
        outgoing
            .as_ref()
            .expect("adapter not launched")
            .send(message)
            .expect("adapter task gone");
    }

    fn behavior(&self, request: &Request) -> Behavior {
        if let Some(behavior) = self.shared.behaviors.lock().unwrap().get(&request.command) {
            return behavior.clone();
        }
        Behavior::Reply(self.canned_body(request))
    }

    fn canned_body(&self, request: &Request) -> Value {
        match request.command.as_str() {
            "initialize" => json!({
                "supportsConfigurationDoneRequest": true,
                "supportsExceptionInfoRequest": true,
            }),
            "setBreakpoints" => {
                let breakpoints: Vec<Value> = request.arguments["breakpoints"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .iter()
                    .map(|bp| {
                        let id = self.shared.next_breakpoint_id.fetch_add(1, Ordering::SeqCst) + 1;
                        json!({"id": id, "verified": true, "line": bp["line"]})
                    })
                    .collect();
                json!({ "breakpoints": breakpoints })
            }
            "threads" => json!({"threads": [{"id": 1, "name": "Main Thread"}, {"id": 2, "name": "Worker"}]}),
            "stackTrace" => json!({
                "stackFrames": [
                    {"id": 1000, "name": "App.Program.Main()", "line": 11, "column": 13,
                     "source": {"path": "/src/Program.cs"}},
                    {"id": 1001, "name": "[External Code]", "line": 0, "column": 0}
                ],
                "totalFrames": 2
            }),
            "scopes" => json!({"scopes": [{"name": "Locals", "variablesReference": 2000, "expensive": false}]}),
            "variables" => json!({"variables": [
                {"name": "count", "value": "42", "type": "int", "variablesReference": 0},
                {"name": "items", "value": "{System.Collections.Generic.List<int>}", "type": "List<int>", "variablesReference": 2001}
            ]}),
            "evaluate" => json!({"result": "84", "type": "int", "variablesReference": 0}),
            "exceptionInfo" => json!({
                "exceptionId": "System.InvalidOperationException",
                "description": "Sequence contains no elements",
                "breakMode": "always"
            }),
            _ => Value::Null,
        }
    }

    fn record(&self, request: Request) {
        self.shared.requests.lock().unwrap().push(request);
        self.shared.seen.notify_waiters();
    }
}

impl AdapterLauncher for FakeAdapter {
    fn launch(&self) -> ProcessResult<AdapterIo> {
        self.shared.launches.fetch_add(1, Ordering::SeqCst);
        let process = if self.shared.with_process.load(Ordering::SeqCst) {
            let process = AdapterProcess::start(Path::new("sleep"), &["30".to_string()])?;
            if let Some(pid) = process.id() {
                self.shared.pids.lock().unwrap().push(pid);
            }
            Some(process)
        } else {
            None
        };

        let (client, server) = duplex(256 * 1024);
        let (client_read, client_write) = split(client);
        let (server_read, mut server_write) = split(server);
        let (sender, mut receiver) = mpsc::unbounded_channel();
        *self.shared.outgoing.lock().unwrap() = Some(sender);

        // Frames are read on their own task; `read_frame` is not cancel safe
        let (requests, mut incoming) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut reader = BufReader::new(server_read);
            while let Ok(frame) = read_frame(&mut reader).await {
                if let ProtocolMessage::Request(request) = frame {
                    if requests.send(request).is_err() {
                        break;
                    }
                }
            }
        });

        let adapter = self.clone();
        tokio::spawn(async move {
            let mut seq = 0i64;
            loop {
                let mut frames = Vec::new();
                tokio::select! {
                    request = incoming.recv() => {
                        let Some(request) = request else { break };
                        adapter.record(request.clone());

                        let (success, message, body) = match adapter.behavior(&request) {
                            Behavior::Ignore => continue,
                            Behavior::Reply(body) => (true, None, body),
                            Behavior::Fail(message) => (false, Some(message), Value::Null),
                            Behavior::EventThenReply(event, body) => {
                                seq += 1;
                                frames.push(ProtocolMessage::Event(Event { seq, event, body }));
                                (true, None, Value::Null)
                            }
                        };
                        seq += 1;
                        frames.push(ProtocolMessage::Response(Response {
                            seq,
                            request_seq: request.seq,
                            success,
                            command: request.command.clone(),
                            message,
                            body,
                        }));
                        if request.command == "initialize" && success {
                            seq += 1;
                            frames.push(ProtocolMessage::Event(Event {
                                seq,
                                event: "initialized".to_string(),
                                body: Value::Null,
                            }));
                        }
                    }
                    outgoing = receiver.recv() => {
                        match outgoing {
                            Some(Outgoing::Event(event, body)) => {
                                seq += 1;
                                frames.push(ProtocolMessage::Event(Event { seq, event, body }));
                            }
                            Some(Outgoing::Raw(bytes)) => {
                                if server_write.write_all(&bytes).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }

                for frame in &frames {
                    if write_frame(&mut server_write, frame).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(AdapterIo {
            reader: Box::new(client_read),
            writer: Box::new(client_write),
            stderr: None,
            process,
        })
    }
}

/// Throwaway project with a built program in `bin/`
pub struct Project {
    pub dir: tempfile::TempDir,
}

impl Project {
    pub fn new() -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin/App.dll"), b"MZ").unwrap();
        std::fs::write(dir.path().join("Program.cs"), b"class Program {}").unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn program(&self) -> PathBuf {
        self.dir.path().join("bin/App.dll")
    }

    pub fn source(&self) -> PathBuf {
        self.dir.path().join("Program.cs")
    }

    pub fn config(&self) -> SessionConfig {
        let mut config = SessionConfig::new("netcoredbg", self.dir.path());
        config.request_timeout = Duration::from_secs(2);
        config.handshake_timeout = Duration::from_secs(2);
        config.disconnect_timeout = Duration::from_millis(200);
        config
    }
}

pub fn session(project: &Project, adapter: &FakeAdapter) -> Session {
    Session::with_launcher(project.config(), Arc::new(adapter.clone())).unwrap()
}

pub async fn wait_for_state(session: &Session, expected: DebugState) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while session.state() != expected {
        if tokio::time::Instant::now() > deadline {
            panic!("session is {} instead of {}", session.state(), expected);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Whether a process with this id still exists
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Wait until the process is gone; false if it outlives the wait
#[cfg(unix)]
pub async fn wait_for_exit(pid: u32) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while is_alive(pid) {
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    true
}
