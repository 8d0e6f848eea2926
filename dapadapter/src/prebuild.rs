//! Pre-launch build
//!
//! Runs the .NET build tool before a launch, captures its output with bounds,
//! and turns MSBuild diagnostics into structured records. Only one build runs
//! at a time; a running build can be cancelled or time out, and in both cases
//! the child process is killed.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::time::Instant as TokioInstant;

use crate::config::SessionConfig;
use crate::{DapError, Result};

/// Build configurations the tool may be invoked with
pub const ALLOWED_CONFIGURATIONS: [&str; 2] = ["Debug", "Release"];
/// Total captured output per build step
pub const MAX_BUILD_OUTPUT_BYTES: usize = 5_000_000;
/// Captured lines longer than this are cut
pub const MAX_BUILD_LINE_CHARS: usize = 10_000;

const MAX_LOCK_ATTEMPTS: u32 = 3;
const LOCK_RETRY_DELAY: Duration = Duration::from_secs(1);
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Output fragments MSBuild prints when an output file is held open
const FILE_LOCK_MARKERS: [&str; 5] = [
    "MSB3021",
    "MSB3026",
    "MSB3027",
    "being used by another process",
    "The process cannot access the file",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Info,
}

impl DiagnosticSeverity {
    fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "error" => Some(DiagnosticSeverity::Error),
            "warning" => Some(DiagnosticSeverity::Warning),
            "info" => Some(DiagnosticSeverity::Info),
            _ => None,
        }
    }
}

/// One MSBuild diagnostic line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildDiagnostic {
    pub severity: DiagnosticSeverity,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

fn located_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?P<file>[^(]+)\((?P<line>\d+),(?P<col>\d+)\):\s*(?P<severity>error|warning|info)\s+(?P<code>\w+):\s*(?P<message>.+?)(?:\s+\[(?P<project>[^\]]+)\])?$",
        )
        .expect("must compile")
    })
}

fn simple_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?P<severity>error|warning|info)\s+(?P<code>\w+):\s*(?P<message>.+)$")
            .expect("must compile")
    })
}

/// Extract diagnostics from MSBuild console output
///
/// MSBuild repeats every diagnostic in its summary; repeats are dropped.
pub fn parse_diagnostics(output: &str) -> Vec<BuildDiagnostic> {
    let mut diagnostics: Vec<BuildDiagnostic> = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let diagnostic = if let Some(c) = located_pattern().captures(line) {
            DiagnosticSeverity::parse(&c["severity"]).map(|severity| BuildDiagnostic {
                severity,
                code: c["code"].to_string(),
                message: c["message"].to_string(),
                file: Some(c["file"].trim().to_string()),
                line: c["line"].parse().ok(),
                column: c["col"].parse().ok(),
                project: c.name("project").map(|m| m.as_str().to_string()),
            })
        } else if let Some(c) = simple_pattern().captures(line) {
            DiagnosticSeverity::parse(&c["severity"]).map(|severity| BuildDiagnostic {
                severity,
                code: c["code"].to_string(),
                message: c["message"].to_string(),
                file: None,
                line: None,
                column: None,
                project: None,
            })
        } else {
            None
        };

        if let Some(diagnostic) = diagnostic {
            if !diagnostics.contains(&diagnostic) {
                diagnostics.push(diagnostic);
            }
        }
    }
    diagnostics
}

/// One pre-launch build
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTask {
    pub project_path: PathBuf,
    pub configuration: String,
    pub status: BuildStatus,
    pub output: String,
    pub exit_code: Option<i32>,
    pub diagnostics: Vec<BuildDiagnostic>,
    pub duration_ms: u64,
    /// Build-step attempts, more than one after file-lock retries
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl BuildTask {
    fn new(project_path: PathBuf, configuration: String) -> Self {
        Self {
            project_path,
            configuration,
            status: BuildStatus::NotStarted,
            output: String::new(),
            exit_code: None,
            diagnostics: Vec::new(),
            duration_ms: 0,
            attempts: 0,
            failure: None,
        }
    }

    pub fn error_count(&self) -> usize {
        self.count(DiagnosticSeverity::Error)
    }

    pub fn warning_count(&self) -> usize {
        self.count(DiagnosticSeverity::Warning)
    }

    fn count(&self, severity: DiagnosticSeverity) -> usize {
        self.diagnostics.iter().filter(|d| d.severity == severity).count()
    }

    /// Error returned to the caller of a failed pre-launch build
    pub fn into_error(self) -> DapError {
        let reason = self.failure.unwrap_or_else(|| "unknown failure".to_string());
        let errors = self
            .diagnostics
            .iter()
            .filter(|d| d.severity == DiagnosticSeverity::Error)
            .count();
        DapError::Build {
            message: format!("Build failed: {} ({} errors)", reason, errors),
            exit_code: self.exit_code,
            output: self.output,
            diagnostics: self.diagnostics,
        }
    }
}

/// Bounded line capture shared by the stdout and stderr readers
#[derive(Debug, Default)]
struct CapturedOutput {
    lines: VecDeque<String>,
    bytes: usize,
}

impl CapturedOutput {
    fn push(&mut self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        let line = match line.char_indices().nth(MAX_BUILD_LINE_CHARS) {
            Some((cut, _)) => format!("{}...[truncated]", &line[..cut]),
            None => line.to_string(),
        };
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > MAX_BUILD_OUTPUT_BYTES {
            match self.lines.pop_front() {
                Some(dropped) => self.bytes -= dropped.len() + 1,
                None => break,
            }
        }
    }

    fn text(&self) -> String {
        let mut text = String::with_capacity(self.bytes);
        for line in &self.lines {
            text.push_str(line);
            text.push('\n');
        }
        text
    }
}

async fn capture<R>(stream: Option<R>, sink: Arc<Mutex<CapturedOutput>>)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => sink.lock().unwrap().push(&String::from_utf8_lossy(&buf)),
        }
    }
}

enum StepEnd {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

struct StepOutcome {
    end: StepEnd,
    output: String,
}

impl StepOutcome {
    fn succeeded(&self) -> bool {
        matches!(&self.end, StepEnd::Exited(status) if status.success())
    }

    fn exit_code(&self) -> Option<i32> {
        match &self.end {
            StepEnd::Exited(status) => status.code(),
            _ => None,
        }
    }
}

/// Runs pre-launch builds, one at a time
pub struct BuildManager {
    /// Program followed by leading arguments
    tool: Vec<String>,
    timeout: Duration,
    restore_first: bool,
    serial: tokio::sync::Mutex<()>,
    cancel: Mutex<Option<Arc<Notify>>>,
    last: Mutex<Option<BuildTask>>,
}

impl BuildManager {
    pub fn new(tool: &str, timeout: Duration, restore_first: bool) -> Self {
        Self {
            tool: tool.split_whitespace().map(str::to_string).collect(),
            timeout,
            restore_first,
            serial: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(None),
            last: Mutex::new(None),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(&config.build_tool, config.build_timeout, config.restore_before_build)
    }

    /// Build when a project is given; a failed build becomes [`DapError::Build`]
    pub async fn build_if_requested(
        &self,
        project: Option<&Path>,
        configuration: &str,
    ) -> Result<Option<BuildTask>> {
        let Some(project) = project else {
            return Ok(None);
        };
        let task = self.build(project, configuration).await?;
        match task.status {
            BuildStatus::Succeeded => Ok(Some(task)),
            _ => Err(task.into_error()),
        }
    }

    /// Run restore (optionally) and build; the returned task carries the outcome
    pub async fn build(&self, project: &Path, configuration: &str) -> Result<BuildTask> {
        let configuration = ALLOWED_CONFIGURATIONS
            .iter()
            .find(|allowed| allowed.eq_ignore_ascii_case(configuration))
            .copied()
            .ok_or_else(|| {
                DapError::InvalidArgument(format!(
                    "Build configuration must be one of {:?}, got '{}'",
                    ALLOWED_CONFIGURATIONS, configuration
                ))
            })?;
        if !project.exists() {
            return Err(DapError::InvalidArgument(format!(
                "Build project not found: {}",
                project.display()
            )));
        }
        if self.tool.is_empty() {
            return Err(DapError::InvalidArgument("No build tool configured".to_string()));
        }

        let _serial = self.serial.lock().await;
        let cancel = Arc::new(Notify::new());
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        let mut task = BuildTask::new(project.to_path_buf(), configuration.to_string());
        task.status = BuildStatus::Running;
        *self.last.lock().unwrap() = Some(task.clone());

        log::info!("Building {} ({})", project.display(), configuration);
        let started = Instant::now();
        let deadline = TokioInstant::now() + self.timeout;
        let cwd = if project.is_dir() {
            project.to_path_buf()
        } else {
            project.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
        };
        let project_arg = project.to_string_lossy().into_owned();

        let steps = self.run_steps(&mut task, &project_arg, &cwd, deadline, &cancel).await;
        *self.cancel.lock().unwrap() = None;

        let outcome = match steps {
            Ok(outcome) => outcome,
            Err(e) => {
                task.status = BuildStatus::Failed;
                task.failure = Some(e.to_string());
                task.duration_ms = started.elapsed().as_millis() as u64;
                log::warn!("Build could not run: {}", e);
                *self.last.lock().unwrap() = Some(task);
                return Err(e);
            }
        };

        if let Some((step, name)) = outcome {
            task.exit_code = step.exit_code();
            task.diagnostics = parse_diagnostics(&step.output);
            task.status = if step.succeeded() {
                BuildStatus::Succeeded
            } else {
                BuildStatus::Failed
            };
            task.failure = match &step.end {
                StepEnd::Exited(status) if status.success() => None,
                StepEnd::Exited(status) => Some(format!("{} exited with {}", name, status)),
                StepEnd::TimedOut => Some(format!("{} timed out after {:?}", name, self.timeout)),
                StepEnd::Cancelled => Some(format!("{} cancelled", name)),
            };
            task.output = step.output;
        }
        task.duration_ms = started.elapsed().as_millis() as u64;

        match task.status {
            BuildStatus::Succeeded => log::info!(
                "Build succeeded in {} ms ({} warnings)",
                task.duration_ms,
                task.warning_count()
            ),
            _ => log::warn!(
                "Build failed: {} ({} errors)",
                task.failure.as_deref().unwrap_or("unknown"),
                task.error_count()
            ),
        }

        *self.last.lock().unwrap() = Some(task.clone());
        Ok(task)
    }

    /// Restore (optionally), then build with file-lock retries
    ///
    /// Returns the step that decided the outcome and its name.
    async fn run_steps(
        &self,
        task: &mut BuildTask,
        project_arg: &str,
        cwd: &Path,
        deadline: TokioInstant,
        cancel: &Notify,
    ) -> Result<Option<(StepOutcome, &'static str)>> {
        let configuration = task.configuration.clone();
        let mut outcome = None;
        if self.restore_first {
            let restore = self
                .run_step(&["restore", project_arg], cwd, deadline, cancel)
                .await?;
            if !restore.succeeded() {
                outcome = Some((restore, "restore"));
            }
        }

        if outcome.is_none() {
            loop {
                task.attempts += 1;
                let build = self
                    .run_step(
                        &["build", project_arg, "--configuration", &configuration, "--nologo"],
                        cwd,
                        deadline,
                        cancel,
                    )
                    .await?;

                let retry = !build.succeeded()
                    && matches!(build.end, StepEnd::Exited(_))
                    && task.attempts < MAX_LOCK_ATTEMPTS
                    && is_file_lock_error(&build.output);
                if !retry {
                    outcome = Some((build, "build"));
                    break;
                }

                log::warn!(
                    "Build hit a file lock (attempt {}/{}), retrying",
                    task.attempts,
                    MAX_LOCK_ATTEMPTS
                );
                let delay = LOCK_RETRY_DELAY * task.attempts;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.notified() => {
                        outcome = Some((
                            StepOutcome { end: StepEnd::Cancelled, output: build.output },
                            "build",
                        ));
                        break;
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Cancel the running build; returns false when none is running
    pub fn cancel(&self) -> bool {
        match self.cancel.lock().unwrap().as_ref() {
            Some(cancel) => {
                log::info!("Cancelling build");
                cancel.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn last_result(&self) -> Option<BuildTask> {
        self.last.lock().unwrap().clone()
    }

    async fn run_step(
        &self,
        args: &[&str],
        cwd: &Path,
        deadline: TokioInstant,
        cancel: &Notify,
    ) -> Result<StepOutcome> {
        let program = &self.tool[0];
        log::debug!("Running {} {:?} {:?} in {}", program, &self.tool[1..], args, cwd.display());

        let spawn_error = |e: std::io::Error| DapError::Build {
            message: format!("Failed to run build tool '{}': {}", program, e),
            exit_code: None,
            output: String::new(),
            diagnostics: Vec::new(),
        };

        let mut child = Command::new(program)
            .args(&self.tool[1..])
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let sink = Arc::new(Mutex::new(CapturedOutput::default()));
        let stdout = tokio::spawn(capture(child.stdout.take(), sink.clone()));
        let stderr = tokio::spawn(capture(child.stderr.take(), sink.clone()));

        let end = tokio::select! {
            status = child.wait() => StepEnd::Exited(status.map_err(spawn_error)?),
            _ = tokio::time::sleep_until(deadline) => StepEnd::TimedOut,
            _ = cancel.notified() => StepEnd::Cancelled,
        };

        if !matches!(end, StepEnd::Exited(_)) {
            if let Err(e) = child.kill().await {
                log::warn!("Failed to kill build tool: {}", e);
            }
        }

        // Build servers can inherit the pipes and keep them open
        let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, stdout).await;
        let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, stderr).await;

        let output = sink.lock().unwrap().text();
        Ok(StepOutcome { end, output })
    }
}

fn is_file_lock_error(output: &str) -> bool {
    FILE_LOCK_MARKERS.iter().any(|marker| output.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_located_diagnostic() {
        let output = "  Program.cs(10,5): error CS1002: ; expected [/src/App/App.csproj]\n";
        let diagnostics = parse_diagnostics(output);
        assert_eq!(diagnostics.len(), 1);

        let d = &diagnostics[0];
        assert_eq!(d.severity, DiagnosticSeverity::Error);
        assert_eq!(d.code, "CS1002");
        assert_eq!(d.message, "; expected");
        assert_eq!(d.file.as_deref(), Some("Program.cs"));
        assert_eq!((d.line, d.column), (Some(10), Some(5)));
        assert_eq!(d.project.as_deref(), Some("/src/App/App.csproj"));
    }

    #[test]
    fn test_parse_simple_and_deduplicated() {
        let output = "\
warning NU1603: Package resolved to a newer version
Build FAILED.
/src/Program.cs(3,1): warning CS0168: The variable 'e' is declared but never used
/src/Program.cs(3,1): warning CS0168: The variable 'e' is declared but never used
";
        let diagnostics = parse_diagnostics(output);
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].code, "NU1603");
        assert_eq!(diagnostics[0].file, None);
        assert_eq!(diagnostics[1].code, "CS0168");
    }

    #[test]
    fn test_captured_output_bounded() {
        let mut captured = CapturedOutput::default();
        captured.push(&"y".repeat(MAX_BUILD_LINE_CHARS + 10));
        assert!(captured.lines[0].ends_with("...[truncated]"));

        let line = "z".repeat(1000);
        for _ in 0..(MAX_BUILD_OUTPUT_BYTES / 1000 + 10) {
            captured.push(&line);
        }
        assert!(captured.bytes <= MAX_BUILD_OUTPUT_BYTES);
        assert!(!captured.lines[0].ends_with("...[truncated]"));
    }

    #[test]
    fn test_file_lock_detection() {
        assert!(is_file_lock_error(
            "error MSB3027: Could not copy \"obj/App.dll\" to \"bin/App.dll\"."
        ));
        assert!(!is_file_lock_error("error CS1002: ; expected"));
    }

    #[tokio::test]
    async fn test_rejects_unknown_configuration() {
        let manager = BuildManager::new("dotnet", Duration::from_secs(5), false);
        let err = manager
            .build(Path::new("."), "Debug; rm -rf /")
            .await
            .unwrap_err();
        assert!(matches!(err, DapError::InvalidArgument(_)));
        assert!(manager.last_result().is_none());
    }

    #[tokio::test]
    async fn test_no_project_means_no_build() {
        let manager = BuildManager::new("dotnet", Duration::from_secs(5), false);
        assert!(manager.build_if_requested(None, "Debug").await.unwrap().is_none());
        assert!(!manager.cancel());
    }
}
