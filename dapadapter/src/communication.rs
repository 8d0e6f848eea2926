//! Communication layer for the Debug Adapter Protocol
//!
//! This module owns the adapter's streams: it writes framed requests,
//! correlates responses with their requests by sequence number, and runs the
//! single read loop that hands events to a [`MessageHandler`] in the order the
//! adapter emitted them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::parser::{read_frame, write_frame};
use crate::types::{Event, ProtocolMessage, Request, Response};
use crate::{DapError, Result};

/// What the read loop should do after an event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Continue,
    /// The session ended; outstanding requests are failed
    Terminated,
}

/// Receives everything from the read loop that is not a response
pub trait MessageHandler: Send + Sync {
    /// Called in delivery order, before the next frame is read
    fn handle_event(&self, event: Event) -> EventOutcome;

    /// The stream failed or reached EOF; the read loop is exiting
    fn stream_closed(&self, error: DapError);
}

struct PendingRequest {
    command: String,
    submitted_at: Instant,
    slot: oneshot::Sender<Result<Response>>,
}

type PendingTable = Arc<Mutex<HashMap<i64, PendingRequest>>>;

/// Manages communication with one adapter process
pub struct DapConnection {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    next_seq: AtomicI64,
    pending: PendingTable,
    closed: AtomicBool,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl DapConnection {
    /// Take ownership of the adapter streams and start the read loop
    pub fn start(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        handler: Arc<dyn MessageHandler>,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            writer: tokio::sync::Mutex::new(writer),
            next_seq: AtomicI64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
            reader_task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::read_loop(connection.clone(), reader, handler));
        *connection.reader_task.lock().unwrap() = Some(task);

        connection
    }

    /// Send a request and wait for its response
    ///
    /// A response with `success: false` becomes [`DapError::Adapter`]. On
    /// timeout the pending entry is dropped, so a late response is discarded.
    pub async fn call(&self, command: &str, arguments: Value, timeout: Duration) -> Result<Response> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        {
            // Closing drains the table under this lock, so a registered
            // request always gets the closer's error
            let mut pending = self.pending.lock().unwrap();
            if self.is_closed() {
                return Err(DapError::SessionTerminated);
            }
            pending.insert(
                seq,
                PendingRequest {
                    command: command.to_string(),
                    submitted_at: Instant::now(),
                    slot: sender,
                },
            );
        }

        let request = ProtocolMessage::Request(Request {
            seq,
            command: command.to_string(),
            arguments,
        });

        log::debug!("SEND[{}]: {}", seq, command);
        if let Err(e) = self.send(&request).await {
            if self.pending.lock().unwrap().remove(&seq).is_none() {
                // Already failed by whoever closed the connection
                return match receiver.await {
                    Ok(Err(closed)) => Err(closed),
                    _ => Err(DapError::SessionTerminated),
                };
            }
            log::error!("SEND[{}]: {} failed: {}", seq, command, e);
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(DapError::SessionTerminated),
            Err(_) => {
                self.pending.lock().unwrap().remove(&seq);
                log::warn!("SEND[{}]: {} timed out after {:?}", seq, command, timeout);
                return Err(DapError::RequestTimeout {
                    command: command.to_string(),
                    seq,
                    timeout,
                });
            }
        };

        if !response.success {
            let message = response
                .message
                .clone()
                .or_else(|| {
                    response
                        .body
                        .pointer("/error/format")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "Unknown error".to_string());
            log::error!("RECV[{}]: {} failed -> {}", seq, command, message);
            return Err(DapError::Adapter {
                command: command.to_string(),
                seq,
                message,
            });
        }

        Ok(response)
    }

    /// Write one message atomically with respect to other writers
    pub async fn send(&self, message: &ProtocolMessage) -> Result<()> {
        if self.is_closed() {
            return Err(DapError::Transport("adapter stream is closed".into()));
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, message).await?;
        Ok(())
    }

    /// Resolve every outstanding request with an error built by `error`
    pub fn fail_all<F>(&self, error: F)
    where
        F: Fn() -> DapError,
    {
        let drained: Vec<(i64, PendingRequest)> = self.pending.lock().unwrap().drain().collect();
        Self::fail(drained, error);
    }

    /// Mark the connection closed and fail what is pending, atomically with
    /// respect to new calls
    fn shut<F>(&self, error: F)
    where
        F: Fn() -> DapError,
    {
        let drained: Vec<(i64, PendingRequest)> = {
            let mut pending = self.pending.lock().unwrap();
            self.closed.store(true, Ordering::SeqCst);
            pending.drain().collect()
        };
        Self::fail(drained, error);
    }

    fn fail<F>(drained: Vec<(i64, PendingRequest)>, error: F)
    where
        F: Fn() -> DapError,
    {
        for (seq, pending) in drained {
            log::debug!("RECV[{}]: failing pending {}", seq, pending.command);
            let _ = pending.slot.send(Err(error()));
        }
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the read loop and refuse further requests
    pub fn close(&self) {
        self.shut(|| DapError::SessionTerminated);
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        handler: Arc<dyn MessageHandler>,
    ) {
        log::debug!("Adapter reader started");
        let mut reader = BufReader::new(reader);

        loop {
            let message = match read_frame(&mut reader).await {
                Ok(message) => message,
                Err(e) => {
                    let transport = e.is_transport();
                    let reason = e.to_string();
                    if transport {
                        log::warn!("Adapter stream closed: {}", reason);
                    } else {
                        log::error!("Adapter framing error: {}", reason);
                    }

                    self.shut(|| {
                        if transport {
                            DapError::Transport(reason.clone())
                        } else {
                            DapError::ProtocolFraming(reason.clone())
                        }
                    });
                    handler.stream_closed(e.into());
                    break;
                }
            };

            log::trace!("RECV frame seq={}", message.seq());
            match message {
                ProtocolMessage::Response(response) => self.resolve(response),
                ProtocolMessage::Event(event) => {
                    log::debug!("EVENT[{}]: {}", event.seq, event.event);
                    if handler.handle_event(event) == EventOutcome::Terminated {
                        self.fail_all(|| DapError::SessionTerminated);
                    }
                }
                ProtocolMessage::Request(request) => self.reject_reverse_request(request).await,
            }
        }

        log::debug!("Adapter reader finished");
    }

    fn resolve(&self, response: Response) {
        let seq = response.request_seq;
        match self.pending.lock().unwrap().remove(&seq) {
            Some(pending) => {
                log::debug!(
                    "RECV[{}]: {} success={} after {:?}",
                    seq,
                    pending.command,
                    response.success,
                    pending.submitted_at.elapsed()
                );
                let _ = pending.slot.send(Ok(response));
            }
            None => {
                log::debug!("RECV[{}]: discarding late response to {}", seq, response.command);
            }
        }
    }

    async fn reject_reverse_request(&self, request: Request) {
        log::warn!("Adapter sent unsupported reverse request '{}'", request.command);
        let response = ProtocolMessage::Response(Response {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            request_seq: request.seq,
            success: false,
            command: request.command,
            message: Some("not supported".to_string()),
            body: Value::Null,
        });
        if let Err(e) = self.send(&response).await {
            log::warn!("Failed to answer reverse request: {}", e);
        }
    }
}

/// Log adapter stderr until it closes
pub fn drain_stderr(stderr: Box<dyn AsyncRead + Send + Unpin>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        log::debug!("ADAPTER stderr: {}", trimmed);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::debug!("Adapter stderr read error: {}", e);
                    break;
                }
            }
        }
    })
}
