//! Tool calls onto the debug bridge
//!
//! Every call is one JSON object with a tool name and its arguments; the
//! reply carries either the tool's data or the error message and kind.

use std::path::PathBuf;
use dapadapter::{DapError, DebugBridge, Result, StartOptions};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: Value,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Serialize)]
pub struct ToolReply {
    pub id: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}

impl ToolReply {
    pub fn ok(id: Value, data: Value) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        }
    }

    pub fn failed(id: Value, error: &DapError) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(error.to_string()),
            kind: Some(error.kind()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ThreadArgs {
    thread_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachArgs {
    process_id: u32,
}

fn rebuild_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestartArgs {
    #[serde(default = "rebuild_by_default")]
    rebuild: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddBreakpointArgs {
    file: PathBuf,
    line: i64,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    hit_condition: Option<String>,
    #[serde(default)]
    log_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RemoveBreakpointArgs {
    id: Option<u32>,
    file: Option<PathBuf>,
    line: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileArgs {
    file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CallStackArgs {
    thread_id: Option<i64>,
    levels: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopesArgs {
    frame_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariablesArgs {
    variables_reference: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateArgs {
    expression: String,
    #[serde(default)]
    frame_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OutputArgs {
    clear: bool,
}

fn parse<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments)
        .map_err(|e| DapError::InvalidArgument(format!("{}: {}", tool, e)))
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| DapError::InvalidArgument(e.to_string()))
}

/// Run one tool against the bridge
pub async fn dispatch(bridge: &DebugBridge, tool: &str, arguments: Value) -> Result<Value> {
    log::debug!("Tool call: {} {}", tool, arguments);

    match tool {
        "start_debug" => {
            let options: StartOptions = parse(tool, arguments)?;
            to_value(bridge.start_debug(options).await?)
        }
        "attach_debug" => {
            let args: AttachArgs = parse(tool, arguments)?;
            to_value(bridge.attach_debug(args.process_id).await?)
        }
        "stop_debug" => to_value(bridge.stop_debug().await?),
        "restart_debug" => {
            let args: RestartArgs = parse(tool, arguments)?;
            to_value(bridge.restart_debug(args.rebuild).await?)
        }
        "continue_execution" => {
            let args: ThreadArgs = parse(tool, arguments)?;
            let thread_id = bridge.continue_execution(args.thread_id).await?;
            Ok(json!({ "threadId": thread_id }))
        }
        "pause_execution" => {
            let args: ThreadArgs = parse(tool, arguments)?;
            let thread_id = bridge.pause(args.thread_id).await?;
            Ok(json!({ "threadId": thread_id }))
        }
        "step_over" | "step_into" | "step_out" => {
            let args: ThreadArgs = parse(tool, arguments)?;
            let thread_id = match tool {
                "step_over" => bridge.step_over(args.thread_id).await?,
                "step_into" => bridge.step_into(args.thread_id).await?,
                _ => bridge.step_out(args.thread_id).await?,
            };
            Ok(json!({ "threadId": thread_id }))
        }
        "get_debug_state" => to_value(bridge.get_state()),
        "add_breakpoint" => {
            let args: AddBreakpointArgs = parse(tool, arguments)?;
            let breakpoint = bridge
                .add_breakpoint(
                    &args.file,
                    args.line,
                    args.condition,
                    args.hit_condition,
                    args.log_message,
                )
                .await?;
            to_value(breakpoint)
        }
        "remove_breakpoint" => {
            let args: RemoveBreakpointArgs = parse(tool, arguments)?;
            let removed = match (args.id, args.file, args.line) {
                (Some(id), _, _) => bridge.remove_breakpoint(id).await?,
                (None, Some(file), Some(line)) => bridge.remove_breakpoint_at(&file, line).await?,
                _ => {
                    return Err(DapError::InvalidArgument(
                        "remove_breakpoint needs an id, or a file and a line".to_string(),
                    ))
                }
            };
            to_value(removed)
        }
        "list_breakpoints" => {
            let args: FileArgs = parse(tool, arguments)?;
            to_value(bridge.list_breakpoints(args.file.as_deref())?)
        }
        "clear_breakpoints" => {
            let args: FileArgs = parse(tool, arguments)?;
            let removed = bridge.clear_breakpoints(args.file.as_deref()).await?;
            Ok(json!({ "removed": removed }))
        }
        "get_threads" => to_value(bridge.get_threads().await?),
        "get_call_stack" => {
            let args: CallStackArgs = parse(tool, arguments)?;
            to_value(bridge.get_call_stack(args.thread_id, args.levels).await?)
        }
        "get_scopes" => {
            let args: ScopesArgs = parse(tool, arguments)?;
            to_value(bridge.get_scopes(args.frame_id).await?)
        }
        "get_variables" => {
            let args: VariablesArgs = parse(tool, arguments)?;
            to_value(bridge.get_variables(args.variables_reference).await?)
        }
        "evaluate_expression" => {
            let args: EvaluateArgs = parse(tool, arguments)?;
            to_value(bridge.evaluate(&args.expression, args.frame_id).await?)
        }
        "get_exception_info" => {
            let args: ThreadArgs = parse(tool, arguments)?;
            to_value(bridge.get_exception_info(args.thread_id).await?)
        }
        "get_output" => {
            let args: OutputArgs = parse(tool, arguments)?;
            to_value(bridge.get_output(args.clear))
        }
        "get_build_result" => to_value(bridge.last_build()),
        other => Err(DapError::InvalidArgument(format!("Unknown tool: {}", other))),
    }
}

/// Handle one input line; `None` for blank lines
pub async fn handle_line(bridge: &DebugBridge, line: &str) -> Option<ToolReply> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let call: ToolCall = match serde_json::from_str(line) {
        Ok(call) => call,
        Err(e) => {
            log::warn!("Malformed tool call: {}", e);
            let error = DapError::InvalidArgument(format!("Malformed tool call: {}", e));
            return Some(ToolReply::failed(Value::Null, &error));
        }
    };

    let reply = match dispatch(bridge, &call.tool, call.arguments).await {
        Ok(data) => ToolReply::ok(call.id, data),
        Err(e) => {
            log::warn!("Tool {} failed: {}", call.tool, e);
            ToolReply::failed(call.id, &e)
        }
    };
    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dapadapter::SessionConfig;

    fn bridge() -> DebugBridge {
        let root = std::env::temp_dir();
        DebugBridge::new(SessionConfig::new("netcoredbg", root)).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let reply = handle_line(&bridge(), r#"{"id": 1, "tool": "jump"}"#).await.unwrap();
        assert!(!reply.success);
        assert_eq!(reply.kind, Some("invalid_argument"));
        assert_eq!(reply.id, json!(1));
    }

    #[tokio::test]
    async fn test_malformed_line() {
        let reply = handle_line(&bridge(), "{not json").await.unwrap();
        assert!(!reply.success);
        assert_eq!(reply.id, Value::Null);
        assert!(handle_line(&bridge(), "   ").await.is_none());
    }

    #[tokio::test]
    async fn test_state_without_session() {
        let reply = handle_line(&bridge(), r#"{"id": "a", "tool": "get_debug_state"}"#)
            .await
            .unwrap();
        assert!(reply.success);
        assert_eq!(reply.data.unwrap()["state"], "idle");
    }

    #[tokio::test]
    async fn test_stack_requires_stopped_session() {
        let reply = handle_line(&bridge(), r#"{"id": 2, "tool": "get_call_stack"}"#)
            .await
            .unwrap();
        assert_eq!(reply.kind, Some("invalid_state"));
    }

    #[tokio::test]
    async fn test_missing_argument_reported() {
        let reply = handle_line(&bridge(), r#"{"id": 3, "tool": "get_scopes", "arguments": {}}"#)
            .await
            .unwrap();
        assert_eq!(reply.kind, Some("invalid_argument"));
        assert!(reply.error.unwrap().contains("frameId"));
    }
}
