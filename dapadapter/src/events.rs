//! Event handling and state management for the debug adapter
//!
//! This module applies adapter events to the session state. It runs inside
//! the read loop, so each event is fully applied before the next frame is
//! read and responses can never overtake the events that preceded them.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use crate::commands::BreakpointAck;
use crate::communication::{EventOutcome, MessageHandler};
use crate::process::AdapterProcess;
use crate::state::SessionState;
use crate::types::{event, DebugState, Event, OutputCategory, StoppedBody};
use crate::DapError;

/// Grace period for the adapter to exit once the session ended
const RELEASE_GRACE: Duration = Duration::from_secs(1);

/// Shared slot for the adapter process of a session
pub type ProcessSlot = Arc<tokio::sync::Mutex<Option<AdapterProcess>>>;

/// Event handler for one session
pub struct EventDispatcher {
    state: Arc<Mutex<SessionState>>,
    process: ProcessSlot,
    initialized: Arc<Notify>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
}

impl EventDispatcher {
    pub fn new(state: Arc<Mutex<SessionState>>, process: ProcessSlot, initialized: Arc<Notify>) -> Self {
        Self {
            state,
            process,
            initialized,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Receive every event after it has been applied to the state
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(sender);
        receiver
    }

    fn apply(&self, state: &mut SessionState, event: &Event) -> EventOutcome {
        match event.event.as_str() {
            event::INITIALIZED => {
                log::debug!("Adapter initialized");
            }
            event::STOPPED => {
                let stopped = StoppedBody::from_event(event);
                log::info!(
                    "Stopped: reason={} thread={:?}",
                    stopped.reason,
                    stopped.thread_id
                );
                state.on_stopped(stopped);
            }
            event::CONTINUED => {
                log::debug!("Continued: thread={:?}", event.body_i64("threadId"));
                state.on_resumed();
            }
            event::THREAD => {
                let Some(thread_id) = event.body_i64("threadId") else {
                    log::warn!("Thread event without threadId");
                    return EventOutcome::Continue;
                };
                match event.body_str("reason") {
                    Some("started") => {
                        state
                            .threads
                            .entry(thread_id)
                            .or_insert_with(|| format!("Thread {}", thread_id));
                    }
                    Some("exited") => {
                        state.threads.remove(&thread_id);
                    }
                    other => log::debug!("Thread {} event: {:?}", thread_id, other),
                }
            }
            event::OUTPUT => {
                let category = OutputCategory::from(event.body_str("category").unwrap_or("console"));
                let output = event.body_str("output").unwrap_or("");
                state.output.push(category, output);
            }
            event::EXITED => {
                let code = event.body_i64("exitCode");
                log::info!("Debuggee exited with code {:?}", code);
                state.exit_code = code;
                state.transition(DebugState::Terminated);
                return EventOutcome::Terminated;
            }
            event::TERMINATED => {
                log::info!("Debug session terminated by adapter");
                state.transition(DebugState::Terminated);
                return EventOutcome::Terminated;
            }
            event::BREAKPOINT => {
                let reason = event.body_str("reason").unwrap_or("changed");
                let ack = event.body.get("breakpoint").map(BreakpointAck::from_value);
                match ack {
                    Some(Ok(ack)) if reason == "changed" => {
                        if !state.breakpoints.apply_update(&ack) {
                            log::debug!("Breakpoint event for unknown adapter id {:?}", ack.id);
                        }
                    }
                    Some(Ok(ack)) => {
                        log::debug!("Breakpoint {} event for adapter id {:?}", reason, ack.id)
                    }
                    Some(Err(e)) => log::warn!("Malformed breakpoint event: {}", e),
                    None => log::warn!("Breakpoint event without breakpoint"),
                }
            }
            event::PROCESS => {
                state.process_id = event.body_i64("systemProcessId");
                state.process_name = event.body_str("name").map(str::to_string);
                log::info!(
                    "Debuggee process {:?} ({:?})",
                    state.process_id,
                    state.process_name
                );
            }
            event::MODULE => {
                log::debug!(
                    "Module {}: {}",
                    event.body_str("reason").unwrap_or("?"),
                    event
                        .body
                        .pointer("/module/name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("?")
                );
            }
            other => log::debug!("Unhandled event: {}", other),
        }
        EventOutcome::Continue
    }

    /// Shut the adapter down in the background
    ///
    /// The slot stays locked until the process is gone, so a concurrent
    /// `Session::stop` returns only after the adapter exited.
    fn release_process(&self) {
        let process = self.process.clone();
        tokio::spawn(async move {
            let mut slot = process.lock().await;
            if let Some(process) = slot.take() {
                process.shutdown(RELEASE_GRACE).await;
            }
        });
    }

    fn forward(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

impl MessageHandler for EventDispatcher {
    fn handle_event(&self, event: Event) -> EventOutcome {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            self.apply(&mut state, &event)
        };

        // Launch waits on this; a termination must wake it as well
        if event.event == event::INITIALIZED || outcome == EventOutcome::Terminated {
            self.initialized.notify_one();
        }
        if outcome == EventOutcome::Terminated {
            self.release_process();
        }

        self.forward(event);
        outcome
    }

    fn stream_closed(&self, error: DapError) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.state.is_terminal() {
                log::error!("Adapter connection lost: {}", error);
                state.transition(DebugState::Error);
            }
        }
        self.initialized.notify_one();
        self.release_process();
    }
}
