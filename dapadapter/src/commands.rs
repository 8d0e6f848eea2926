//! Typed DAP command set
//!
//! This module provides a high-level interface over [`DapConnection`]: one
//! method per adapter request, with responses decoded into small structs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::communication::DapConnection;
use crate::types::{command, Response};
use crate::{DapError, Result};

const CLIENT_ID: &str = "netdbg-bridge";
const ADAPTER_ID: &str = "coreclr";

/// High-level interface for adapter requests
pub struct DapCommands {
    connection: Arc<DapConnection>,
    timeout: Duration,
}

impl DapCommands {
    pub fn new(connection: Arc<DapConnection>, timeout: Duration) -> Self {
        Self { connection, timeout }
    }

    async fn request(&self, command: &str, arguments: Value) -> Result<Response> {
        self.connection.call(command, arguments, self.timeout).await
    }

    /// Returns the adapter capabilities
    pub async fn initialize(&self) -> Result<Value> {
        let response = self
            .request(
                command::INITIALIZE,
                json!({
                    "clientID": CLIENT_ID,
                    "clientName": CLIENT_ID,
                    "adapterID": ADAPTER_ID,
                    "linesStartAt1": true,
                    "columnsStartAt1": true,
                    "pathFormat": "path",
                    "supportsVariableType": true,
                    "supportsRunInTerminalRequest": false,
                }),
            )
            .await?;
        Ok(response.body)
    }

    pub async fn launch(&self, arguments: Value) -> Result<()> {
        self.request(command::LAUNCH, arguments).await?;
        Ok(())
    }

    pub async fn attach(&self, process_id: u32) -> Result<()> {
        self.request(command::ATTACH, json!({ "processId": process_id })).await?;
        Ok(())
    }

    pub async fn configuration_done(&self) -> Result<()> {
        self.request(command::CONFIGURATION_DONE, Value::Null).await?;
        Ok(())
    }

    pub async fn disconnect(&self, terminate_debuggee: bool, timeout: Duration) -> Result<()> {
        self.connection
            .call(
                command::DISCONNECT,
                json!({ "terminateDebuggee": terminate_debuggee }),
                timeout,
            )
            .await?;
        Ok(())
    }

    /// Replace all breakpoints of one source file
    pub async fn set_breakpoints(&self, file: &Path, breakpoints: Vec<Value>) -> Result<Vec<BreakpointAck>> {
        let lines: Vec<Value> = breakpoints
            .iter()
            .filter_map(|bp| bp.get("line").cloned())
            .collect();
        let response = self
            .request(
                command::SET_BREAKPOINTS,
                json!({
                    "source": {
                        "path": file.to_string_lossy(),
                        "name": file.file_name().map(|n| n.to_string_lossy().into_owned()),
                    },
                    "breakpoints": breakpoints,
                    "lines": lines,
                    "sourceModified": false,
                }),
            )
            .await?;

        list_field(&response.body, "breakpoints")?
            .iter()
            .map(BreakpointAck::from_value)
            .collect()
    }

    pub async fn set_exception_breakpoints(&self, filters: &[&str]) -> Result<()> {
        self.request(command::SET_EXCEPTION_BREAKPOINTS, json!({ "filters": filters }))
            .await?;
        Ok(())
    }

    /// Continue execution
    pub async fn continue_(&self, thread_id: i64) -> Result<()> {
        self.request(command::CONTINUE, json!({ "threadId": thread_id })).await?;
        Ok(())
    }

    /// Step over
    pub async fn next(&self, thread_id: i64) -> Result<()> {
        self.request(command::NEXT, json!({ "threadId": thread_id })).await?;
        Ok(())
    }

    pub async fn step_in(&self, thread_id: i64) -> Result<()> {
        self.request(command::STEP_IN, json!({ "threadId": thread_id })).await?;
        Ok(())
    }

    pub async fn step_out(&self, thread_id: i64) -> Result<()> {
        self.request(command::STEP_OUT, json!({ "threadId": thread_id })).await?;
        Ok(())
    }

    /// Interrupt execution
    pub async fn pause(&self, thread_id: i64) -> Result<()> {
        self.request(command::PAUSE, json!({ "threadId": thread_id })).await?;
        Ok(())
    }

    pub async fn threads(&self) -> Result<Vec<ThreadInfo>> {
        let response = self.request(command::THREADS, Value::Null).await?;
        list_field(&response.body, "threads")?
            .iter()
            .map(ThreadInfo::from_value)
            .collect()
    }

    /// Get stack frames
    pub async fn stack_trace(&self, thread_id: i64, levels: Option<u32>) -> Result<Vec<StackFrame>> {
        let mut arguments = json!({ "threadId": thread_id, "startFrame": 0 });
        if let Some(levels) = levels {
            arguments["levels"] = json!(levels);
        }
        let response = self.request(command::STACK_TRACE, arguments).await?;
        list_field(&response.body, "stackFrames")?
            .iter()
            .map(StackFrame::from_value)
            .collect()
    }

    pub async fn scopes(&self, frame_id: i64) -> Result<Vec<Scope>> {
        let response = self.request(command::SCOPES, json!({ "frameId": frame_id })).await?;
        list_field(&response.body, "scopes")?
            .iter()
            .map(Scope::from_value)
            .collect()
    }

    pub async fn variables(&self, variables_reference: i64) -> Result<Vec<Variable>> {
        let response = self
            .request(
                command::VARIABLES,
                json!({ "variablesReference": variables_reference }),
            )
            .await?;
        list_field(&response.body, "variables")?
            .iter()
            .map(Variable::from_value)
            .collect()
    }

    /// Evaluate expression
    pub async fn evaluate(&self, expression: &str, frame_id: Option<i64>) -> Result<EvaluateResult> {
        let mut arguments = json!({ "expression": expression, "context": "watch" });
        if let Some(frame_id) = frame_id {
            arguments["frameId"] = json!(frame_id);
        }
        let response = self.request(command::EVALUATE, arguments).await?;
        EvaluateResult::from_value(&response.body)
    }

    pub async fn exception_info(&self, thread_id: i64) -> Result<ExceptionInfo> {
        let response = self
            .request(command::EXCEPTION_INFO, json!({ "threadId": thread_id }))
            .await?;
        ExceptionInfo::from_value(&response.body)
    }
}

fn object(value: &Value) -> Result<&Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| DapError::MissingField("body".to_string()))
}

fn list_field<'a>(body: &'a Value, field: &str) -> Result<&'a Vec<Value>> {
    body.get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| DapError::MissingField(field.to_string()))
}

fn required_i64(map: &Map<String, Value>, field: &str) -> Result<i64> {
    map.get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| DapError::MissingField(field.to_string()))
}

fn required_str(map: &Map<String, Value>, field: &str) -> Result<String> {
    map.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DapError::MissingField(field.to_string()))
}

fn optional_str(map: &Map<String, Value>, field: &str) -> Option<String> {
    map.get(field).and_then(Value::as_str).map(str::to_string)
}

/// Adapter verdict on one breakpoint
#[derive(Debug, Clone, PartialEq)]
pub struct BreakpointAck {
    pub id: Option<i64>,
    pub verified: bool,
    pub line: Option<i64>,
    pub message: Option<String>,
}

impl BreakpointAck {
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = object(value)?;
        Ok(BreakpointAck {
            id: map.get("id").and_then(Value::as_i64),
            verified: map
                .get("verified")
                .and_then(Value::as_bool)
                .ok_or_else(|| DapError::MissingField("verified".to_string()))?,
            line: map.get("line").and_then(Value::as_i64),
            message: optional_str(map, "message"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadInfo {
    pub id: i64,
    pub name: String,
}

impl ThreadInfo {
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = object(value)?;
        Ok(ThreadInfo {
            id: required_i64(map, "id")?,
            name: optional_str(map, "name").unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    /// Source path, absent for frames without symbols
    pub source: Option<String>,
    pub line: i64,
    pub column: i64,
}

impl StackFrame {
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = object(value)?;
        let source = map.get("source").and_then(|source| {
            source
                .get("path")
                .or_else(|| source.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        Ok(StackFrame {
            id: required_i64(map, "id")?,
            name: optional_str(map, "name").unwrap_or_else(|| "<unknown>".to_string()),
            source,
            line: map.get("line").and_then(Value::as_i64).unwrap_or(0),
            column: map.get("column").and_then(Value::as_i64).unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub name: String,
    pub variables_reference: i64,
    pub expensive: bool,
}

impl Scope {
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = object(value)?;
        Ok(Scope {
            name: required_str(map, "name")?,
            variables_reference: required_i64(map, "variablesReference")?,
            expensive: map.get("expensive").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Non-zero when the variable has children
    pub variables_reference: i64,
}

impl Variable {
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = object(value)?;
        Ok(Variable {
            name: required_str(map, "name")?,
            value: required_str(map, "value")?,
            type_name: optional_str(map, "type"),
            variables_reference: map
                .get("variablesReference")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub result: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub variables_reference: i64,
}

impl EvaluateResult {
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = object(value)?;
        Ok(EvaluateResult {
            result: required_str(map, "result")?,
            type_name: optional_str(map, "type"),
            variables_reference: map
                .get("variablesReference")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfo {
    pub exception_id: String,
    pub description: Option<String>,
    pub break_mode: String,
    /// Adapter-specific details (type name, stack trace, inner exception)
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl ExceptionInfo {
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = object(value)?;
        Ok(ExceptionInfo {
            exception_id: required_str(map, "exceptionId")?,
            description: optional_str(map, "description"),
            break_mode: optional_str(map, "breakMode").unwrap_or_else(|| "always".to_string()),
            details: map.get("details").cloned().unwrap_or(Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_frame_from_value() {
        let frame = StackFrame::from_value(&json!({
            "id": 1000,
            "name": "Program.Main()",
            "source": {"name": "Program.cs", "path": "/proj/Program.cs"},
            "line": 12,
            "column": 9
        }))
        .unwrap();
        assert_eq!(frame.id, 1000);
        assert_eq!(frame.source.as_deref(), Some("/proj/Program.cs"));
        assert_eq!(frame.line, 12);
    }

    #[test]
    fn test_frame_without_source() {
        let frame = StackFrame::from_value(&json!({"id": 3, "name": "[External Code]"})).unwrap();
        assert_eq!(frame.source, None);
        assert_eq!(frame.line, 0);
    }

    #[test]
    fn test_missing_field_reported() {
        match Scope::from_value(&json!({"name": "Locals"})) {
            Err(DapError::MissingField(field)) => assert_eq!(field, "variablesReference"),
            other => panic!("Expected missing field, got {:?}", other),
        }
    }

    #[test]
    fn test_variable_type_serialized_as_type() {
        let variable = Variable::from_value(&json!({
            "name": "count",
            "value": "3",
            "type": "int",
            "variablesReference": 0
        }))
        .unwrap();
        let value = serde_json::to_value(&variable).unwrap();
        assert_eq!(value["type"], "int");
        assert_eq!(value["variablesReference"], 0);
    }

    #[test]
    fn test_breakpoint_ack_requires_verified() {
        let ack = BreakpointAck::from_value(&json!({"id": 2, "verified": true, "line": 14})).unwrap();
        assert_eq!(ack.id, Some(2));
        assert_eq!(ack.line, Some(14));
        assert!(BreakpointAck::from_value(&json!({"id": 2})).is_err());
    }

    #[test]
    fn test_exception_info_defaults_break_mode() {
        let info = ExceptionInfo::from_value(&json!({
            "exceptionId": "System.InvalidOperationException",
            "description": "boom"
        }))
        .unwrap();
        assert_eq!(info.break_mode, "always");
        assert!(info.details.is_null());
    }
}
