//! Single-session ownership and the command surface
//!
//! `DebugBridge` holds at most one live [`Session`]. A finished session stays
//! in the slot so its state and output can still be read; the next launch
//! replaces it and carries its breakpoints over.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use serde::{Deserialize, Serialize};

use crate::commands::{EvaluateResult, ExceptionInfo, Scope, StackFrame, ThreadInfo, Variable};
use crate::config::SessionConfig;
use crate::paths::{resolve_managed_module, validate_program, ProjectRoot};
use crate::prebuild::{BuildManager, BuildTask};
use crate::process::{AdapterLauncher, ProcessLauncher};
use crate::session::{LaunchRequest, Session};
use crate::state::{Breakpoint, OutputRecord, SessionSnapshot};
use crate::types::DebugState;
use crate::version::{self, CompatibilityAdvisory};
use crate::{DapError, Result};

fn default_configuration() -> String {
    "Debug".to_string()
}

/// Parameters of `start_debug`, kept for `restart_debug`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    pub program: PathBuf,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub stop_at_entry: bool,
    /// Build `build_project` before launching
    #[serde(default)]
    pub pre_build: bool,
    #[serde(default)]
    pub build_project: Option<PathBuf>,
    #[serde(default = "default_configuration")]
    pub build_configuration: String,
}

impl StartOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cwd: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            stop_at_entry: false,
            pre_build: false,
            build_project: None,
            build_configuration: default_configuration(),
        }
    }
}

/// Result of a successful `start_debug`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchOutcome {
    /// Program actually handed to the adapter
    pub program: PathBuf,
    pub state: DebugState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildTask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advisory: Option<CompatibilityAdvisory>,
}

pub struct DebugBridge {
    config: SessionConfig,
    launcher: Arc<dyn AdapterLauncher>,
    root: ProjectRoot,
    slot: Mutex<Arc<Session>>,
    launch_lock: tokio::sync::Mutex<()>,
    builder: BuildManager,
    last_launch: Mutex<Option<StartOptions>>,
}

impl DebugBridge {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let launcher = Arc::new(ProcessLauncher::new(
            config.adapter_path.clone(),
            config.adapter_args.clone(),
        ));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: SessionConfig, launcher: Arc<dyn AdapterLauncher>) -> Result<Self> {
        let root = ProjectRoot::new(&config.project_root)?;
        let session = Session::with_launcher(config.clone(), launcher.clone())?;
        let builder = BuildManager::from_config(&config);
        log::info!("Project root: {}", root.path().display());

        Ok(Self {
            config,
            launcher,
            root,
            slot: Mutex::new(Arc::new(session)),
            launch_lock: tokio::sync::Mutex::new(()),
            builder,
            last_launch: Mutex::new(None),
        })
    }

    pub fn project_root(&self) -> &Path {
        self.root.path()
    }

    /// The session currently in the slot
    pub fn session(&self) -> Arc<Session> {
        self.slot.lock().unwrap().clone()
    }

    /// Session usable for a new launch
    ///
    /// An untouched session is reused, a finished one is replaced (keeping its
    /// breakpoints), an active one is a conflict.
    fn fresh_session(&self) -> Result<Arc<Session>> {
        let mut slot = self.slot.lock().unwrap();
        let state = slot.state();
        match state {
            DebugState::Idle => Ok(slot.clone()),
            DebugState::Terminated | DebugState::Error => {
                let session = Session::with_launcher(self.config.clone(), self.launcher.clone())?;
                session.restore_breakpoints(slot.take_breakpoints());
                *slot = Arc::new(session);
                Ok(slot.clone())
            }
            active => Err(DapError::SessionConflict(active)),
        }
    }

    /// Session for breakpoint edits; a finished session is replaced first
    fn editable_session(&self) -> Result<Arc<Session>> {
        let current = self.session();
        if current.state().is_terminal() {
            return self.fresh_session();
        }
        Ok(current)
    }

    fn claim_launch(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.launch_lock
            .try_lock()
            .map_err(|_| DapError::SessionConflict(DebugState::Launching))
    }

    // Lifecycle

    /// Build (when asked), resolve the program and launch it
    pub async fn start_debug(&self, options: StartOptions) -> Result<LaunchOutcome> {
        let _launching = self.claim_launch()?;
        let session = self.fresh_session()?;

        let program = self.root.constrain(&options.program)?;
        let cwd = options.cwd.as_ref().map(|cwd| self.root.constrain(cwd)).transpose()?;
        let build_project = options
            .build_project
            .as_ref()
            .map(|project| self.root.constrain(project))
            .transpose()?;

        let project = match (options.pre_build, &build_project) {
            (true, None) => {
                return Err(DapError::InvalidArgument(
                    "build_project is required when pre_build is set".to_string(),
                ))
            }
            (true, Some(project)) => Some(project.as_path()),
            (false, _) => None,
        };
        let build = self
            .builder
            .build_if_requested(project, &options.build_configuration)
            .await?;

        // The program may only exist once the build produced it
        let program = resolve_managed_module(&program);
        validate_program(&program)?;
        let advisory = version::check_program(&self.config.adapter_path, &program);

        session
            .launch(LaunchRequest {
                program: program.clone(),
                cwd,
                args: options.args.clone(),
                env: options.env.clone(),
                stop_at_entry: options.stop_at_entry,
            })
            .await?;
        *self.last_launch.lock().unwrap() = Some(options);

        Ok(LaunchOutcome {
            program,
            state: session.state(),
            build,
            advisory,
        })
    }

    pub async fn attach_debug(&self, process_id: u32) -> Result<SessionSnapshot> {
        let _launching = self.claim_launch()?;
        let session = self.fresh_session()?;
        session.attach(process_id).await?;
        Ok(session.snapshot())
    }

    /// Stop the session and any running build
    pub async fn stop_debug(&self) -> Result<SessionSnapshot> {
        if self.builder.cancel() {
            log::info!("Cancelled the running build");
        }
        let session = self.session();
        session.stop().await?;
        Ok(session.snapshot())
    }

    /// Stop, then launch again with the last start options
    pub async fn restart_debug(&self, rebuild: bool) -> Result<LaunchOutcome> {
        let mut options = self
            .last_launch
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DapError::InvalidArgument("Nothing was launched yet".to_string()))?;

        self.stop_debug().await?;
        if rebuild && options.build_project.is_some() {
            options.pre_build = true;
        }
        self.start_debug(options).await
    }

    // Execution control

    pub async fn continue_execution(&self, thread_id: Option<i64>) -> Result<i64> {
        self.session().continue_execution(thread_id).await
    }

    pub async fn pause(&self, thread_id: Option<i64>) -> Result<i64> {
        self.session().pause(thread_id).await
    }

    pub async fn step_over(&self, thread_id: Option<i64>) -> Result<i64> {
        self.session().step_over(thread_id).await
    }

    pub async fn step_into(&self, thread_id: Option<i64>) -> Result<i64> {
        self.session().step_into(thread_id).await
    }

    pub async fn step_out(&self, thread_id: Option<i64>) -> Result<i64> {
        self.session().step_out(thread_id).await
    }

    // Breakpoints

    pub async fn add_breakpoint(
        &self,
        file: &Path,
        line: i64,
        condition: Option<String>,
        hit_condition: Option<String>,
        log_message: Option<String>,
    ) -> Result<Breakpoint> {
        self.editable_session()?
            .add_breakpoint(file, line, condition, hit_condition, log_message)
            .await
    }

    pub async fn remove_breakpoint(&self, id: u32) -> Result<Breakpoint> {
        self.editable_session()?.remove_breakpoint(id).await
    }

    pub async fn remove_breakpoint_at(&self, file: &Path, line: i64) -> Result<Breakpoint> {
        self.editable_session()?.remove_breakpoint_at(file, line).await
    }

    pub fn list_breakpoints(&self, file: Option<&Path>) -> Result<Vec<Breakpoint>> {
        self.session().list_breakpoints(file)
    }

    pub async fn clear_breakpoints(&self, file: Option<&Path>) -> Result<usize> {
        self.editable_session()?.clear_breakpoints(file).await
    }

    // Inspection

    pub fn get_state(&self) -> SessionSnapshot {
        self.session().snapshot()
    }

    pub async fn get_threads(&self) -> Result<Vec<ThreadInfo>> {
        self.session().threads().await
    }

    pub async fn get_call_stack(&self, thread_id: Option<i64>, levels: Option<u32>) -> Result<Vec<StackFrame>> {
        self.session().stack_trace(thread_id, levels).await
    }

    pub async fn get_scopes(&self, frame_id: i64) -> Result<Vec<Scope>> {
        self.session().scopes(frame_id).await
    }

    pub async fn get_variables(&self, variables_reference: i64) -> Result<Vec<Variable>> {
        self.session().variables(variables_reference).await
    }

    pub async fn evaluate(&self, expression: &str, frame_id: Option<i64>) -> Result<EvaluateResult> {
        self.session().evaluate(expression, frame_id).await
    }

    pub async fn get_exception_info(&self, thread_id: Option<i64>) -> Result<ExceptionInfo> {
        self.session().exception_info(thread_id).await
    }

    pub fn get_output(&self, clear: bool) -> Vec<OutputRecord> {
        self.session().output(clear)
    }

    pub fn last_build(&self) -> Option<BuildTask> {
        self.builder.last_result()
    }
}
