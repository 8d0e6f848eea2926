//! Session bookkeeping shared by the read loop and the command surface
//!
//! Everything here lives behind the session's `std::sync::Mutex`; none of it
//! is held across an `.await`.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use serde::{Serialize, Serializer};
use serde_json::{json, Value};

use crate::commands::{BreakpointAck, ThreadInfo};
use crate::types::{DebugState, OutputCategory, StopReason, StoppedBody};
use crate::{DapError, Result};

/// Output entries longer than this are cut
pub const MAX_OUTPUT_ENTRY_CHARS: usize = 100_000;
/// Total size the output buffer may hold
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

const TRUNCATED_SUFFIX: &str = "... [truncated]";

/// A source breakpoint as the bridge tracks it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    /// Local handle, stable for the lifetime of the registry
    pub id: u32,
    pub file: PathBuf,
    pub line: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
    pub verified: bool,
    /// Id assigned by the adapter once acknowledged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Breakpoint {
    /// `SourceBreakpoint` as sent in `setBreakpoints`
    pub fn to_dap(&self) -> Value {
        let mut value = json!({ "line": self.line });
        if let Some(condition) = &self.condition {
            value["condition"] = json!(condition);
        }
        if let Some(hit_condition) = &self.hit_condition {
            value["hitCondition"] = json!(hit_condition);
        }
        if let Some(log_message) = &self.log_message {
            value["logMessage"] = json!(log_message);
        }
        value
    }
}

/// Breakpoints grouped per file
///
/// The adapter replaces a file's breakpoints wholesale on every
/// `setBreakpoints`, so changes are tracked per file in a dirty set until the
/// file has been sent.
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    next_id: u32,
    by_file: BTreeMap<PathBuf, Vec<Breakpoint>>,
    dirty: BTreeSet<PathBuf>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breakpoint, or update the one already set on that line
    pub fn add(
        &mut self,
        file: PathBuf,
        line: i64,
        condition: Option<String>,
        hit_condition: Option<String>,
        log_message: Option<String>,
    ) -> Breakpoint {
        self.dirty.insert(file.clone());
        let entries = self.by_file.entry(file.clone()).or_default();

        if let Some(existing) = entries.iter_mut().find(|bp| bp.line == line) {
            existing.condition = condition;
            existing.hit_condition = hit_condition;
            existing.log_message = log_message;
            return existing.clone();
        }

        self.next_id += 1;
        let breakpoint = Breakpoint {
            id: self.next_id,
            file,
            line,
            condition,
            hit_condition,
            log_message,
            verified: false,
            adapter_id: None,
            message: None,
        };
        entries.push(breakpoint.clone());
        breakpoint
    }

    pub fn get(&self, id: u32) -> Option<&Breakpoint> {
        self.by_file.values().flatten().find(|bp| bp.id == id)
    }

    pub fn remove(&mut self, id: u32) -> Option<Breakpoint> {
        let file = self.get(id)?.file.clone();
        self.take(&file, |bp| bp.id == id)
    }

    pub fn remove_at(&mut self, file: &Path, line: i64) -> Option<Breakpoint> {
        self.take(file, |bp| bp.line == line)
    }

    fn take<F>(&mut self, file: &Path, matches: F) -> Option<Breakpoint>
    where
        F: Fn(&Breakpoint) -> bool,
    {
        let entries = self.by_file.get_mut(file)?;
        let index = entries.iter().position(matches)?;
        let removed = entries.remove(index);
        if entries.is_empty() {
            self.by_file.remove(file);
        }
        self.dirty.insert(file.to_path_buf());
        Some(removed)
    }

    /// Remove every breakpoint, or only those in `file`; returns how many went
    pub fn clear(&mut self, file: Option<&Path>) -> usize {
        match file {
            Some(file) => match self.by_file.remove(file) {
                Some(entries) => {
                    self.dirty.insert(file.to_path_buf());
                    entries.len()
                }
                None => 0,
            },
            None => {
                let files: Vec<PathBuf> = self.by_file.keys().cloned().collect();
                let count = self.len();
                self.dirty.extend(files);
                self.by_file.clear();
                count
            }
        }
    }

    pub fn list(&self, file: Option<&Path>) -> Vec<Breakpoint> {
        match file {
            Some(file) => self.for_file(file),
            None => self.by_file.values().flatten().cloned().collect(),
        }
    }

    pub fn for_file(&self, file: &Path) -> Vec<Breakpoint> {
        self.by_file.get(file).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_file.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_file.is_empty()
    }

    /// Files whose adapter-side state is out of date
    pub fn dirty_files(&self) -> Vec<PathBuf> {
        self.dirty.iter().cloned().collect()
    }

    pub fn mark_dirty(&mut self, file: &Path) {
        self.dirty.insert(file.to_path_buf());
    }

    pub fn mark_synced(&mut self, file: &Path) {
        self.dirty.remove(file);
    }

    /// Apply a `setBreakpoints` response
    ///
    /// `ids` are the local handles in the order they were sent; the adapter
    /// answers positionally. Breakpoints removed while the request was in
    /// flight are skipped.
    pub fn apply_acks(&mut self, file: &Path, ids: &[u32], acks: &[BreakpointAck]) {
        let Some(entries) = self.by_file.get_mut(file) else {
            return;
        };
        for (id, ack) in ids.iter().zip(acks) {
            if let Some(bp) = entries.iter_mut().find(|bp| bp.id == *id) {
                bp.verified = ack.verified;
                bp.adapter_id = ack.id;
                bp.message = ack.message.clone();
                if let Some(line) = ack.line {
                    bp.line = line;
                }
            }
        }
    }

    /// Apply a `breakpoint` event; returns false for unknown adapter ids
    pub fn apply_update(&mut self, ack: &BreakpointAck) -> bool {
        let Some(adapter_id) = ack.id else {
            return false;
        };
        let found = self
            .by_file
            .values_mut()
            .flatten()
            .find(|bp| bp.adapter_id == Some(adapter_id));
        match found {
            Some(bp) => {
                bp.verified = ack.verified;
                bp.message = ack.message.clone();
                if let Some(line) = ack.line {
                    bp.line = line;
                }
                true
            }
            None => false,
        }
    }

    /// Forget adapter acknowledgements so every file is re-sent
    pub fn invalidate_all(&mut self) {
        for bp in self.by_file.values_mut().flatten() {
            bp.verified = false;
            bp.adapter_id = None;
            bp.message = None;
        }
        let files: Vec<PathBuf> = self.by_file.keys().cloned().collect();
        self.dirty.extend(files);
    }
}

fn serialize_timestamp<S: Serializer>(time: &SystemTime, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    let millis = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    serializer.serialize_u64(millis)
}

/// One captured chunk of program or adapter output
#[derive(Debug, Clone, Serialize)]
pub struct OutputRecord {
    pub category: OutputCategory,
    pub output: String,
    /// Milliseconds since the Unix epoch when serialized
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: SystemTime,
}

/// Bounded FIFO of output records
#[derive(Debug)]
pub struct OutputBuffer {
    entries: VecDeque<OutputRecord>,
    capacity: usize,
    bytes: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            bytes: 0,
        }
    }

    pub fn push(&mut self, category: OutputCategory, output: &str) {
        let output = match output.char_indices().nth(MAX_OUTPUT_ENTRY_CHARS) {
            Some((cut, _)) => format!("{}{}", &output[..cut], TRUNCATED_SUFFIX),
            None => output.to_string(),
        };

        self.bytes += output.len();
        self.entries.push_back(OutputRecord {
            category,
            output,
            timestamp: SystemTime::now(),
        });

        while self.entries.len() > self.capacity
            || (self.bytes > MAX_OUTPUT_BYTES && self.entries.len() > 1)
        {
            if let Some(evicted) = self.entries.pop_front() {
                self.bytes -= evicted.output.len();
            }
        }
    }

    pub fn records(&self) -> Vec<OutputRecord> {
        self.entries.iter().cloned().collect()
    }

    /// Return everything and empty the buffer
    pub fn drain(&mut self) -> Vec<OutputRecord> {
        self.bytes = 0;
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Frame ids and variable references handed out during the current stop
#[derive(Debug, Default)]
pub struct FrameCache {
    frame_ids: HashSet<i64>,
    variable_refs: HashSet<i64>,
    /// Innermost frame of the stopped thread, once its stack was fetched
    pub top_frame: Option<i64>,
}

impl FrameCache {
    pub fn clear(&mut self) {
        self.frame_ids.clear();
        self.variable_refs.clear();
        self.top_frame = None;
    }

    pub fn register_frames(&mut self, ids: impl IntoIterator<Item = i64>) {
        self.frame_ids.extend(ids);
    }

    /// Zero means "no children" and is never recorded
    pub fn register_refs(&mut self, refs: impl IntoIterator<Item = i64>) {
        self.variable_refs.extend(refs.into_iter().filter(|r| *r > 0));
    }

    pub fn has_frame(&self, id: i64) -> bool {
        self.frame_ids.contains(&id)
    }

    pub fn has_ref(&self, reference: i64) -> bool {
        self.variable_refs.contains(&reference)
    }
}

/// Read-only view of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: DebugState,
    pub program: Option<PathBuf>,
    pub working_directory: Option<PathBuf>,
    pub process_id: Option<i64>,
    pub process_name: Option<String>,
    pub exit_code: Option<i64>,
    pub stopped_thread_id: Option<i64>,
    pub stop_reason: Option<StopReason>,
    pub stop_description: Option<String>,
    pub threads: Vec<ThreadInfo>,
    pub breakpoint_count: usize,
    pub output_count: usize,
    pub has_exception: bool,
}

/// Mutable state of one session instance
#[derive(Debug)]
pub struct SessionState {
    pub state: DebugState,
    pub program: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub threads: BTreeMap<i64, String>,
    pub stopped_thread_id: Option<i64>,
    pub stop_reason: Option<StopReason>,
    pub stop_description: Option<String>,
    pub last_exception: Option<Value>,
    pub exit_code: Option<i64>,
    pub process_id: Option<i64>,
    pub process_name: Option<String>,
    pub capabilities: Value,
    pub breakpoints: BreakpointRegistry,
    pub output: OutputBuffer,
    pub frames: FrameCache,
    /// Bumped on every stop and resume
    pub stop_epoch: u64,
}

fn is_legal_transition(from: DebugState, to: DebugState) -> bool {
    use DebugState::*;
    match (from, to) {
        (Terminated | Error, _) => false,
        (_, Terminated | Error) => true,
        (Idle, Launching) => true,
        // A stop can land before the handshake finishes (stopAtEntry)
        (Launching, Running | Stopped) => true,
        (Running, Stopped) | (Stopped, Running) => true,
        _ => false,
    }
}

impl SessionState {
    pub fn new(output_capacity: usize) -> Self {
        Self {
            state: DebugState::Idle,
            program: None,
            cwd: None,
            threads: BTreeMap::new(),
            stopped_thread_id: None,
            stop_reason: None,
            stop_description: None,
            last_exception: None,
            exit_code: None,
            process_id: None,
            process_name: None,
            capabilities: Value::Null,
            breakpoints: BreakpointRegistry::new(),
            output: OutputBuffer::new(output_capacity),
            frames: FrameCache::default(),
            stop_epoch: 0,
        }
    }

    /// Move to `to` if the lifecycle allows it; returns false otherwise
    ///
    /// Staying in the current state is always accepted. Terminal states are
    /// never left.
    pub fn transition(&mut self, to: DebugState) -> bool {
        if self.state == to {
            return true;
        }
        if !is_legal_transition(self.state, to) {
            log::debug!("Ignoring transition {} -> {}", self.state, to);
            return false;
        }
        log::info!("State changed: {} -> {}", self.state, to);
        self.state = to;
        true
    }

    pub fn require(&self, operation: &'static str, allowed: &[DebugState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DapError::InvalidState {
                state: self.state,
                operation,
            })
        }
    }

    pub fn require_not_terminal(&self, operation: &'static str) -> Result<()> {
        if self.state.is_terminal() {
            Err(DapError::InvalidState {
                state: self.state,
                operation,
            })
        } else {
            Ok(())
        }
    }

    pub fn on_stopped(&mut self, stopped: StoppedBody) {
        if !self.transition(DebugState::Stopped) {
            return;
        }
        if let Some(thread_id) = stopped.thread_id {
            self.threads.entry(thread_id).or_insert_with(|| format!("Thread {}", thread_id));
        }
        self.stopped_thread_id = stopped.thread_id;
        self.stop_reason = Some(stopped.reason);
        self.stop_description = stopped.description.or(stopped.text);
        self.last_exception = None;
        self.invalidate_frames();
    }

    /// Running again: the stop context and its references are gone
    pub fn on_resumed(&mut self) {
        if !self.transition(DebugState::Running) {
            return;
        }
        self.stopped_thread_id = None;
        self.stop_reason = None;
        self.stop_description = None;
        self.invalidate_frames();
    }

    fn invalidate_frames(&mut self) {
        self.frames.clear();
        self.stop_epoch += 1;
    }

    /// Thread used when the caller does not name one
    pub fn default_thread(&self) -> Option<i64> {
        self.stopped_thread_id
            .or_else(|| self.threads.keys().next().copied())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            program: self.program.clone(),
            working_directory: self.cwd.clone(),
            process_id: self.process_id,
            process_name: self.process_name.clone(),
            exit_code: self.exit_code,
            stopped_thread_id: self.stopped_thread_id,
            stop_reason: self.stop_reason.clone(),
            stop_description: self.stop_description.clone(),
            threads: self
                .threads
                .iter()
                .map(|(id, name)| ThreadInfo {
                    id: *id,
                    name: name.clone(),
                })
                .collect(),
            breakpoint_count: self.breakpoints.len(),
            output_count: self.output.len(),
            has_exception: self.last_exception.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(id: i64, verified: bool, line: Option<i64>) -> BreakpointAck {
        BreakpointAck {
            id: Some(id),
            verified,
            line,
            message: None,
        }
    }

    #[test]
    fn test_add_same_line_updates_entry() {
        let mut registry = BreakpointRegistry::new();
        let file = PathBuf::from("/proj/Program.cs");

        let first = registry.add(file.clone(), 10, None, None, None);
        let second = registry.add(file.clone(), 10, Some("x > 1".into()), None, None);

        assert_eq!(first.id, second.id);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.for_file(&file)[0].condition.as_deref(), Some("x > 1"));
    }

    #[test]
    fn test_acks_applied_positionally() {
        let mut registry = BreakpointRegistry::new();
        let file = PathBuf::from("/proj/Program.cs");
        let a = registry.add(file.clone(), 10, None, None, None);
        let b = registry.add(file.clone(), 20, None, None, None);

        registry.apply_acks(
            &file,
            &[a.id, b.id],
            &[ack(1, true, Some(11)), ack(2, false, None)],
        );

        let a = registry.get(a.id).unwrap();
        assert!(a.verified);
        assert_eq!(a.line, 11);
        assert_eq!(a.adapter_id, Some(1));
        let b = registry.get(b.id).unwrap();
        assert!(!b.verified);
        assert_eq!(b.line, 20);
    }

    #[test]
    fn test_update_by_adapter_id() {
        let mut registry = BreakpointRegistry::new();
        let file = PathBuf::from("/proj/Program.cs");
        let bp = registry.add(file.clone(), 5, None, None, None);
        registry.apply_acks(&file, &[bp.id], &[ack(7, false, None)]);

        assert!(registry.apply_update(&ack(7, true, Some(6))));
        assert!(!registry.apply_update(&ack(99, true, None)));
        let bp = registry.get(bp.id).unwrap();
        assert!(bp.verified);
        assert_eq!(bp.line, 6);
    }

    #[test]
    fn test_remove_and_clear_mark_files_dirty() {
        let mut registry = BreakpointRegistry::new();
        let a = PathBuf::from("/proj/A.cs");
        let b = PathBuf::from("/proj/B.cs");
        let bp = registry.add(a.clone(), 1, None, None, None);
        registry.add(b.clone(), 2, None, None, None);
        registry.mark_synced(&a);
        registry.mark_synced(&b);

        assert!(registry.remove(bp.id).is_some());
        assert!(registry.remove(bp.id).is_none());
        assert_eq!(registry.dirty_files(), vec![a.clone()]);
        assert!(registry.for_file(&a).is_empty());

        assert_eq!(registry.clear(None), 1);
        assert_eq!(registry.dirty_files(), vec![a, b]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalidate_all_resets_acks() {
        let mut registry = BreakpointRegistry::new();
        let file = PathBuf::from("/proj/Program.cs");
        let bp = registry.add(file.clone(), 3, None, None, None);
        registry.apply_acks(&file, &[bp.id], &[ack(1, true, None)]);
        registry.mark_synced(&file);

        registry.invalidate_all();
        let bp = registry.get(bp.id).unwrap();
        assert!(!bp.verified);
        assert_eq!(bp.adapter_id, None);
        assert_eq!(registry.dirty_files(), vec![file]);
    }

    #[test]
    fn test_breakpoint_to_dap_includes_optional_fields() {
        let mut registry = BreakpointRegistry::new();
        let bp = registry.add(
            PathBuf::from("/proj/Program.cs"),
            12,
            Some("i == 3".into()),
            None,
            Some("i = {i}".into()),
        );
        assert_eq!(
            bp.to_dap(),
            json!({"line": 12, "condition": "i == 3", "logMessage": "i = {i}"})
        );
    }

    #[test]
    fn test_output_buffer_evicts_oldest() {
        let mut buffer = OutputBuffer::new(2);
        buffer.push(OutputCategory::Stdout, "one");
        buffer.push(OutputCategory::Stdout, "two");
        buffer.push(OutputCategory::Stderr, "three");

        let outputs: Vec<String> = buffer.records().into_iter().map(|r| r.output).collect();
        assert_eq!(outputs, vec!["two", "three"]);
        assert_eq!(buffer.drain().len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_output_entry_truncated() {
        let mut buffer = OutputBuffer::new(10);
        let long = "x".repeat(MAX_OUTPUT_ENTRY_CHARS + 50);
        buffer.push(OutputCategory::Console, &long);

        let record = &buffer.records()[0];
        assert!(record.output.ends_with(TRUNCATED_SUFFIX));
        assert_eq!(record.output.len(), MAX_OUTPUT_ENTRY_CHARS + TRUNCATED_SUFFIX.len());
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let mut state = SessionState::new(10);
        assert!(state.transition(DebugState::Launching));
        assert!(state.transition(DebugState::Terminated));
        assert!(!state.transition(DebugState::Running));
        assert_eq!(state.state, DebugState::Terminated);
    }

    #[test]
    fn test_transition_table() {
        let mut state = SessionState::new(10);
        assert!(!state.transition(DebugState::Running));
        assert!(!state.transition(DebugState::Stopped));
        assert_eq!(state.state, DebugState::Idle);

        assert!(state.transition(DebugState::Launching));
        assert!(state.transition(DebugState::Stopped));
        assert!(!state.transition(DebugState::Launching));
        assert!(state.transition(DebugState::Running));
        assert!(!state.transition(DebugState::Idle));
        assert!(state.transition(DebugState::Error));
        assert!(!state.transition(DebugState::Terminated));
    }

    #[test]
    fn test_stray_stop_before_launch_ignored() {
        let mut state = SessionState::new(10);
        state.on_stopped(StoppedBody {
            reason: StopReason::Breakpoint,
            thread_id: Some(4),
            all_threads_stopped: true,
            description: None,
            text: None,
        });
        assert_eq!(state.state, DebugState::Idle);
        assert_eq!(state.stopped_thread_id, None);
        assert_eq!(state.stop_epoch, 0);
    }

    #[test]
    fn test_stop_and_resume_invalidate_frames() {
        let mut state = SessionState::new(10);
        state.transition(DebugState::Launching);
        state.transition(DebugState::Running);
        state.on_stopped(StoppedBody {
            reason: StopReason::Breakpoint,
            thread_id: Some(4),
            all_threads_stopped: true,
            description: None,
            text: None,
        });
        state.frames.register_frames([1000]);
        state.frames.register_refs([0, 5]);
        assert!(state.frames.has_frame(1000));
        assert!(state.frames.has_ref(5));
        assert!(!state.frames.has_ref(0));
        assert_eq!(state.default_thread(), Some(4));

        let epoch = state.stop_epoch;
        state.on_resumed();
        assert_eq!(state.state, DebugState::Running);
        assert!(!state.frames.has_frame(1000));
        assert!(state.stop_epoch > epoch);
        assert_eq!(state.stopped_thread_id, None);
    }

    #[test]
    fn test_require_reports_state() {
        let state = SessionState::new(10);
        match state.require("get_call_stack", &[DebugState::Stopped]) {
            Err(DapError::InvalidState { state, operation }) => {
                assert_eq!(state, DebugState::Idle);
                assert_eq!(operation, "get_call_stack");
            }
            other => panic!("Expected invalid state, got {:?}", other),
        }
    }
}
