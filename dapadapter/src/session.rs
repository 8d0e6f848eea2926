//! One debug session against one adapter process
//!
//! A `Session` owns the adapter connection, the event dispatcher and the
//! session state. It checks every operation against the lifecycle state
//! before anything is sent, and keeps frame ids and variable references
//! scoped to the stop that produced them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use crate::commands::{DapCommands, EvaluateResult, ExceptionInfo, Scope, StackFrame, ThreadInfo, Variable};
use crate::communication::{drain_stderr, DapConnection};
use crate::config::SessionConfig;
use crate::events::{EventDispatcher, ProcessSlot};
use crate::paths::ProjectRoot;
use crate::process::{AdapterLauncher, ProcessLauncher};
use crate::state::{Breakpoint, BreakpointRegistry, OutputRecord, SessionSnapshot, SessionState};
use crate::types::{DebugState, Event};
use crate::{DapError, Result};

/// Grace period for the adapter to exit after `disconnect`
const ADAPTER_EXIT_GRACE: Duration = Duration::from_millis(500);

/// Program launch parameters
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub program: PathBuf,
    /// Defaults to the program's directory
    pub cwd: Option<PathBuf>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stop_at_entry: bool,
}

enum Target {
    Launch(Value),
    Attach(u32),
}

#[derive(Debug, Clone, Copy)]
enum Resume {
    Continue,
    Next,
    StepIn,
    StepOut,
}

impl Resume {
    fn operation(self) -> &'static str {
        match self {
            Resume::Continue => "continue",
            Resume::Next => "step_over",
            Resume::StepIn => "step_into",
            Resume::StepOut => "step_out",
        }
    }
}

pub struct Session {
    config: SessionConfig,
    root: ProjectRoot,
    launcher: Arc<dyn AdapterLauncher>,
    state: Arc<Mutex<SessionState>>,
    dispatcher: Arc<EventDispatcher>,
    initialized: Arc<Notify>,
    connection: Mutex<Option<Arc<DapConnection>>>,
    process: ProcessSlot,
}

impl Session {
    /// Session that spawns the configured adapter executable
    pub fn new(config: SessionConfig) -> Result<Self> {
        let launcher = Arc::new(ProcessLauncher::new(
            config.adapter_path.clone(),
            config.adapter_args.clone(),
        ));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: SessionConfig, launcher: Arc<dyn AdapterLauncher>) -> Result<Self> {
        let root = ProjectRoot::new(&config.project_root)?;
        let state = Arc::new(Mutex::new(SessionState::new(config.output_capacity)));
        let process: ProcessSlot = Arc::new(tokio::sync::Mutex::new(None));
        let initialized = Arc::new(Notify::new());
        let dispatcher = Arc::new(EventDispatcher::new(
            state.clone(),
            process.clone(),
            initialized.clone(),
        ));

        Ok(Self {
            config,
            root,
            launcher,
            state,
            dispatcher,
            initialized,
            connection: Mutex::new(None),
            process,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }

    fn commands(&self) -> Result<DapCommands> {
        let connection = self
            .connection
            .lock()
            .unwrap()
            .clone()
            .ok_or(DapError::SessionTerminated)?;
        Ok(DapCommands::new(connection, self.config.request_timeout))
    }

    /// Transport and framing failures end the session
    fn note_error(&self, error: DapError) -> DapError {
        if error.is_fatal() {
            self.lock().transition(DebugState::Error);
        }
        error
    }

    pub fn project_root(&self) -> &ProjectRoot {
        &self.root
    }

    pub fn state(&self) -> DebugState {
        self.lock().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }

    /// Capabilities reported by the adapter in its `initialize` response
    pub fn capabilities(&self) -> Value {
        self.lock().capabilities.clone()
    }

    /// Events as they are applied, in adapter order
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        self.dispatcher.subscribe()
    }

    pub fn output(&self, clear: bool) -> Vec<OutputRecord> {
        let mut state = self.lock();
        if clear {
            state.output.drain()
        } else {
            state.output.records()
        }
    }

    // Lifecycle

    /// Start the adapter and launch `request.program` under it
    pub async fn launch(&self, request: LaunchRequest) -> Result<()> {
        let program = self.root.constrain(&request.program)?;
        let cwd = match &request.cwd {
            Some(cwd) => self.root.constrain(cwd)?,
            None => program
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.root.path().to_path_buf()),
        };

        {
            let mut state = self.lock();
            state.require("launch", &[DebugState::Idle])?;
            state.transition(DebugState::Launching);
            state.program = Some(program.clone());
            state.cwd = Some(cwd.clone());
        }

        log::info!("Launching {}", program.display());
        let arguments = json!({
            "name": ".NET Core Launch",
            "type": "coreclr",
            "request": "launch",
            "program": program,
            "cwd": cwd,
            "args": request.args,
            "env": request.env,
            "stopAtEntry": request.stop_at_entry,
            "justMyCode": false,
            "console": "internalConsole",
        });
        self.start_adapter(Target::Launch(arguments)).await
    }

    /// Start the adapter and attach it to a running process
    pub async fn attach(&self, process_id: u32) -> Result<()> {
        {
            let mut state = self.lock();
            state.require("attach", &[DebugState::Idle])?;
            state.transition(DebugState::Launching);
            state.process_id = Some(i64::from(process_id));
        }

        log::info!("Attaching to process {}", process_id);
        self.start_adapter(Target::Attach(process_id)).await
    }

    async fn start_adapter(&self, target: Target) -> Result<()> {
        match self.handshake(target).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("Debug session failed to start: {}", e);
                let end = if e.is_fatal() {
                    DebugState::Error
                } else {
                    DebugState::Terminated
                };
                self.lock().transition(end);
                self.teardown(Duration::ZERO).await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, target: Target) -> Result<()> {
        let io = self.launcher.launch()?;
        if let Some(stderr) = io.stderr {
            drain_stderr(stderr);
        }
        *self.process.lock().await = io.process;

        let connection = DapConnection::start(io.reader, io.writer, self.dispatcher.clone());
        *self.connection.lock().unwrap() = Some(connection.clone());
        let commands = DapCommands::new(connection, self.config.request_timeout);

        let capabilities = commands.initialize().await?;
        self.lock().capabilities = capabilities;

        let timeout = self.config.handshake_timeout;
        if tokio::time::timeout(timeout, self.initialized.notified()).await.is_err() {
            return Err(DapError::RequestTimeout {
                command: "initialized".to_string(),
                seq: 0,
                timeout,
            });
        }
        match self.state() {
            DebugState::Error => {
                return Err(DapError::Transport(
                    "adapter connection lost during launch".to_string(),
                ))
            }
            DebugState::Terminated => return Err(DapError::SessionTerminated),
            _ => {}
        }

        self.sync_dirty_breakpoints(false).await?;
        commands.set_exception_breakpoints(&[]).await?;

        match target {
            Target::Launch(arguments) => commands.launch(arguments).await?,
            Target::Attach(process_id) => commands.attach(process_id).await?,
        }
        if self.capabilities()["supportsConfigurationDoneRequest"].as_bool() == Some(true) {
            commands.configuration_done().await?;
        } else {
            log::debug!("Adapter does not support configurationDone");
        }

        {
            let mut state = self.lock();
            // A stop (e.g. stopAtEntry) may already have been applied
            if state.state == DebugState::Launching {
                state.transition(DebugState::Running);
            }
        }

        // Pick up breakpoints added while the handshake was in flight
        self.sync_dirty_breakpoints(false).await?;
        log::info!("Debug session started");
        Ok(())
    }

    /// End the session and release the adapter
    ///
    /// Safe to call repeatedly. A session that already ended on its own
    /// keeps its final state, but its connection and process are still torn
    /// down here.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.lock();
            if !state.state.is_terminal() {
                state.transition(DebugState::Terminated);
            }
        }

        let connection = self.connection.lock().unwrap().take();
        if let Some(connection) = connection {
            connection.fail_all(|| DapError::SessionTerminated);
            let commands = DapCommands::new(connection.clone(), self.config.request_timeout);
            if let Err(e) = commands.disconnect(true, self.config.disconnect_timeout).await {
                log::debug!("Disconnect failed: {}", e);
            }
            connection.close();
        }
        if let Some(process) = self.process.lock().await.take() {
            process.shutdown(ADAPTER_EXIT_GRACE).await;
        }

        log::info!("Debug session stopped");
        Ok(())
    }

    async fn teardown(&self, grace: Duration) {
        let connection = self.connection.lock().unwrap().take();
        if let Some(connection) = connection {
            connection.close();
        }
        if let Some(process) = self.process.lock().await.take() {
            process.shutdown(grace).await;
        }
    }

    // Execution control

    pub async fn continue_execution(&self, thread_id: Option<i64>) -> Result<i64> {
        self.resume(Resume::Continue, thread_id).await
    }

    pub async fn step_over(&self, thread_id: Option<i64>) -> Result<i64> {
        self.resume(Resume::Next, thread_id).await
    }

    pub async fn step_into(&self, thread_id: Option<i64>) -> Result<i64> {
        self.resume(Resume::StepIn, thread_id).await
    }

    pub async fn step_out(&self, thread_id: Option<i64>) -> Result<i64> {
        self.resume(Resume::StepOut, thread_id).await
    }

    /// Resume and report the thread that was resumed
    ///
    /// The state moves to Running before the request goes out, so a `stopped`
    /// event that overtakes the response is kept. If the request fails and no
    /// event intervened, the previous stop is restored.
    async fn resume(&self, kind: Resume, thread_id: Option<i64>) -> Result<i64> {
        let (commands, thread_id, saved, epoch) = {
            let mut state = self.lock();
            state.require(kind.operation(), &[DebugState::Stopped])?;
            let thread_id = thread_id
                .or_else(|| state.default_thread())
                .ok_or_else(|| DapError::InvalidArgument("No thread to resume".to_string()))?;
            let commands = self.commands()?;
            let saved = (
                state.stopped_thread_id,
                state.stop_reason.clone(),
                state.stop_description.clone(),
            );
            state.on_resumed();
            (commands, thread_id, saved, state.stop_epoch)
        };

        let result = match kind {
            Resume::Continue => commands.continue_(thread_id).await,
            Resume::Next => commands.next(thread_id).await,
            Resume::StepIn => commands.step_in(thread_id).await,
            Resume::StepOut => commands.step_out(thread_id).await,
        };

        if let Err(e) = result {
            let e = self.note_error(e);
            let mut state = self.lock();
            if state.stop_epoch == epoch && state.state == DebugState::Running {
                log::warn!("{} failed, restoring stopped state", kind.operation());
                let (thread, reason, description) = saved;
                state.transition(DebugState::Stopped);
                state.stopped_thread_id = thread;
                state.stop_reason = reason;
                state.stop_description = description;
            }
            return Err(e);
        }
        Ok(thread_id)
    }

    pub async fn pause(&self, thread_id: Option<i64>) -> Result<i64> {
        let (commands, thread_id) = {
            let state = self.lock();
            state.require("pause", &[DebugState::Running, DebugState::Stopped])?;
            let thread_id = thread_id.or_else(|| state.default_thread()).unwrap_or(0);
            (self.commands()?, thread_id)
        };
        commands
            .pause(thread_id)
            .await
            .map_err(|e| self.note_error(e))?;
        Ok(thread_id)
    }

    // Inspection

    pub async fn threads(&self) -> Result<Vec<ThreadInfo>> {
        let commands = {
            let state = self.lock();
            state.require("get_threads", &[DebugState::Running, DebugState::Stopped])?;
            self.commands()?
        };
        let threads = commands.threads().await.map_err(|e| self.note_error(e))?;

        let mut state = self.lock();
        state.threads = threads
            .iter()
            .map(|t| (t.id, t.name.clone()))
            .collect();
        Ok(threads)
    }

    /// Frames of `thread_id` (default: the stopped thread)
    pub async fn stack_trace(&self, thread_id: Option<i64>, levels: Option<u32>) -> Result<Vec<StackFrame>> {
        let (commands, thread_id, is_stopped_thread, epoch) = {
            let state = self.lock();
            state.require("get_call_stack", &[DebugState::Stopped])?;
            let thread_id = thread_id
                .or_else(|| state.default_thread())
                .ok_or_else(|| DapError::InvalidArgument("No stopped thread".to_string()))?;
            (
                self.commands()?,
                thread_id,
                state.stopped_thread_id == Some(thread_id),
                state.stop_epoch,
            )
        };

        if let Some(delay) = self.config.stack_trace_delay {
            tokio::time::sleep(delay).await;
        }

        let frames = commands
            .stack_trace(thread_id, levels)
            .await
            .map_err(|e| self.note_error(e))?;

        let mut state = self.lock();
        self.still_stopped(&state, epoch)?;
        state.frames.register_frames(frames.iter().map(|f| f.id));
        if is_stopped_thread {
            if let Some(top) = frames.first() {
                state.frames.top_frame = Some(top.id);
            }
        }
        Ok(frames)
    }

    fn still_stopped(&self, state: &SessionState, epoch: u64) -> Result<()> {
        if state.stop_epoch != epoch || state.state != DebugState::Stopped {
            return Err(DapError::StaleReference(
                "execution resumed while the request was in flight".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn scopes(&self, frame_id: i64) -> Result<Vec<Scope>> {
        let (commands, epoch) = {
            let state = self.lock();
            state.require("get_scopes", &[DebugState::Stopped])?;
            if !state.frames.has_frame(frame_id) {
                return Err(DapError::StaleReference(format!(
                    "frame {} does not belong to the current stop",
                    frame_id
                )));
            }
            (self.commands()?, state.stop_epoch)
        };

        let scopes = commands.scopes(frame_id).await.map_err(|e| self.note_error(e))?;

        let mut state = self.lock();
        self.still_stopped(&state, epoch)?;
        state
            .frames
            .register_refs(scopes.iter().map(|s| s.variables_reference));
        Ok(scopes)
    }

    pub async fn variables(&self, variables_reference: i64) -> Result<Vec<Variable>> {
        let (commands, epoch) = {
            let state = self.lock();
            state.require("get_variables", &[DebugState::Stopped])?;
            if !state.frames.has_ref(variables_reference) {
                return Err(DapError::StaleReference(format!(
                    "variables reference {} does not belong to the current stop",
                    variables_reference
                )));
            }
            (self.commands()?, state.stop_epoch)
        };

        let variables = commands
            .variables(variables_reference)
            .await
            .map_err(|e| self.note_error(e))?;

        let mut state = self.lock();
        self.still_stopped(&state, epoch)?;
        state
            .frames
            .register_refs(variables.iter().map(|v| v.variables_reference));
        Ok(variables)
    }

    /// Evaluate in `frame_id`, or in the innermost frame of the stopped thread
    pub async fn evaluate(&self, expression: &str, frame_id: Option<i64>) -> Result<EvaluateResult> {
        let known_top = {
            let state = self.lock();
            state.require("evaluate", &[DebugState::Stopped])?;
            if let Some(frame_id) = frame_id {
                if !state.frames.has_frame(frame_id) {
                    return Err(DapError::StaleReference(format!(
                        "frame {} does not belong to the current stop",
                        frame_id
                    )));
                }
            }
            state.frames.top_frame
        };

        let frame_id = match frame_id.or(known_top) {
            Some(frame_id) => Some(frame_id),
            None => self.stack_trace(None, Some(1)).await?.first().map(|f| f.id),
        };

        let (commands, epoch) = {
            let state = self.lock();
            state.require("evaluate", &[DebugState::Stopped])?;
            (self.commands()?, state.stop_epoch)
        };
        let result = commands
            .evaluate(expression, frame_id)
            .await
            .map_err(|e| self.note_error(e))?;

        let mut state = self.lock();
        self.still_stopped(&state, epoch)?;
        state.frames.register_refs([result.variables_reference]);
        Ok(result)
    }

    pub async fn exception_info(&self, thread_id: Option<i64>) -> Result<ExceptionInfo> {
        let (commands, thread_id) = {
            let state = self.lock();
            state.require("get_exception_info", &[DebugState::Stopped])?;
            let thread_id = thread_id
                .or_else(|| state.default_thread())
                .ok_or_else(|| DapError::InvalidArgument("No stopped thread".to_string()))?;
            (self.commands()?, thread_id)
        };

        let info = commands
            .exception_info(thread_id)
            .await
            .map_err(|e| self.note_error(e))?;

        let mut state = self.lock();
        if state.state == DebugState::Stopped {
            state.last_exception = serde_json::to_value(&info).ok();
        }
        Ok(info)
    }

    // Breakpoints

    fn is_live(state: &SessionState) -> bool {
        matches!(state.state, DebugState::Running | DebugState::Stopped)
    }

    /// Add (or update) a source breakpoint
    ///
    /// With a live adapter the file is synced immediately; otherwise the
    /// breakpoint is queued and sent during launch.
    pub async fn add_breakpoint(
        &self,
        file: &Path,
        line: i64,
        condition: Option<String>,
        hit_condition: Option<String>,
        log_message: Option<String>,
    ) -> Result<Breakpoint> {
        if line < 1 {
            return Err(DapError::InvalidArgument(format!("Invalid line number: {}", line)));
        }
        let file = self.root.constrain(file)?;

        let (breakpoint, live) = {
            let mut state = self.lock();
            state.require_not_terminal("add_breakpoint")?;
            let breakpoint = state
                .breakpoints
                .add(file.clone(), line, condition, hit_condition, log_message);
            (breakpoint, Self::is_live(&state))
        };
        log::debug!("Breakpoint {} at {}:{}", breakpoint.id, file.display(), line);

        if !live {
            return Ok(breakpoint);
        }
        self.sync_file(&file).await?;
        Ok(self
            .lock()
            .breakpoints
            .get(breakpoint.id)
            .cloned()
            .unwrap_or(breakpoint))
    }

    pub async fn remove_breakpoint(&self, id: u32) -> Result<Breakpoint> {
        let (removed, live) = {
            let mut state = self.lock();
            state.require_not_terminal("remove_breakpoint")?;
            let removed = state
                .breakpoints
                .remove(id)
                .ok_or_else(|| DapError::InvalidArgument(format!("No breakpoint with id {}", id)))?;
            (removed, Self::is_live(&state))
        };
        if live {
            self.sync_file(&removed.file).await?;
        }
        Ok(removed)
    }

    pub async fn remove_breakpoint_at(&self, file: &Path, line: i64) -> Result<Breakpoint> {
        let file = self.root.constrain(file)?;
        let (removed, live) = {
            let mut state = self.lock();
            state.require_not_terminal("remove_breakpoint")?;
            let removed = state.breakpoints.remove_at(&file, line).ok_or_else(|| {
                DapError::InvalidArgument(format!("No breakpoint at {}:{}", file.display(), line))
            })?;
            (removed, Self::is_live(&state))
        };
        if live {
            self.sync_file(&file).await?;
        }
        Ok(removed)
    }

    pub fn list_breakpoints(&self, file: Option<&Path>) -> Result<Vec<Breakpoint>> {
        let file = file.map(|f| self.root.constrain(f)).transpose()?;
        Ok(self.lock().breakpoints.list(file.as_deref()))
    }

    /// Remove all breakpoints (or those of one file); returns how many
    pub async fn clear_breakpoints(&self, file: Option<&Path>) -> Result<usize> {
        let file = file.map(|f| self.root.constrain(f)).transpose()?;
        let (count, live) = {
            let mut state = self.lock();
            state.require_not_terminal("clear_breakpoints")?;
            (state.breakpoints.clear(file.as_deref()), Self::is_live(&state))
        };
        if live {
            self.sync_dirty_breakpoints(true).await?;
        }
        Ok(count)
    }

    /// Send one file's breakpoints and apply the adapter's verdicts
    async fn sync_file(&self, file: &Path) -> Result<()> {
        let (commands, ids, breakpoints) = {
            let mut state = self.lock();
            let entries = state.breakpoints.for_file(file);
            state.breakpoints.mark_synced(file);
            let ids: Vec<u32> = entries.iter().map(|bp| bp.id).collect();
            let breakpoints: Vec<Value> = entries.iter().map(Breakpoint::to_dap).collect();
            (self.commands(), ids, breakpoints)
        };

        let result = match commands {
            Ok(commands) => commands.set_breakpoints(file, breakpoints).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(acks) => {
                if acks.len() != ids.len() {
                    log::warn!(
                        "Adapter answered {} of {} breakpoints in {}",
                        acks.len(),
                        ids.len(),
                        file.display()
                    );
                }
                self.lock().breakpoints.apply_acks(file, &ids, &acks);
                Ok(())
            }
            Err(e) => {
                self.lock().breakpoints.mark_dirty(file);
                Err(self.note_error(e))
            }
        }
    }

    /// Sync every file with unsent changes
    ///
    /// A file the adapter rejects stays queued and the other files still go
    /// out. The first rejection is returned only when `report_rejections`.
    async fn sync_dirty_breakpoints(&self, report_rejections: bool) -> Result<()> {
        let files = self.lock().breakpoints.dirty_files();
        let mut first_error = None;
        for file in files {
            match self.sync_file(&file).await {
                Ok(()) => {}
                Err(e @ DapError::Adapter { .. }) => {
                    log::warn!("Breakpoints for {} rejected: {}", file.display(), e);
                    first_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        match first_error {
            Some(e) if report_rejections => Err(e),
            _ => Ok(()),
        }
    }

    /// Move the breakpoint registry out, e.g. into a successor session
    pub fn take_breakpoints(&self) -> BreakpointRegistry {
        std::mem::take(&mut self.lock().breakpoints)
    }

    /// Adopt breakpoints from a previous session; all are re-sent on launch
    pub fn restore_breakpoints(&self, mut registry: BreakpointRegistry) {
        registry.invalidate_all();
        self.lock().breakpoints = registry;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.lock().unwrap().take() {
            connection.close();
        }
    }
}
