// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use mux_runtime::Runtime;

use crate::events::ToolSideEvent;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model, forwarded verbatim.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// Side-effect class of a tool, used for policy and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolEffect {
    ReadOnly,
    Write,
    Exec,
    Subagent,
}

/// The result of executing a tool.
///
/// `value` is the wire-compatible JSON handed back to the model: a success
/// shape with tool-specific fields, or a failure shape with at least an
/// `error` string (plus `exitCode` / `truncated` where meaningful).
/// Tool-internal failures are results, never panics or `Err` returns.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub value: Value,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(value: Value) -> Self {
        Self {
            value,
            is_error: false,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            value: json!({ "error": message.into() }),
            is_error: true,
        }
    }

    pub fn err_with(message: impl Into<String>, mut extra: Value) -> Self {
        if let Some(obj) = extra.as_object_mut() {
            obj.insert("error".into(), Value::String(message.into()));
        }
        Self {
            value: extra,
            is_error: true,
        }
    }

    /// The `error` string for failure outputs.
    pub fn error_message(&self) -> Option<&str> {
        self.value.get("error").and_then(Value::as_str)
    }
}

/// Everything a tool execution may touch, bound to one workspace.
#[derive(Clone)]
pub struct ToolCtx {
    pub workspace_id: String,
    pub runtime: Arc<dyn Runtime>,
    /// Directory relative tool paths resolve against.
    pub cwd: PathBuf,
    pub secrets: HashMap<String, String>,
    /// Extra environment entries for shell tools.
    pub env: Vec<(String, String)>,
    /// Cumulative session cost, surfaced to shells as MUX_COSTS_USD.
    pub costs_usd: f64,
    /// Abort signal; flips to `true` when the stream is cancelled.
    pub abort: watch::Receiver<bool>,
    /// Best-effort side-channel to the UI (toasts, questions, plan events).
    pub events: Option<mpsc::UnboundedSender<ToolSideEvent>>,
}

impl ToolCtx {
    pub fn new(workspace_id: impl Into<String>, runtime: Arc<dyn Runtime>) -> Self {
        let cwd = runtime.workspace_dir().to_path_buf();
        let (_tx, abort) = watch::channel(false);
        Self {
            workspace_id: workspace_id.into(),
            runtime,
            cwd,
            secrets: HashMap::new(),
            env: Vec::new(),
            costs_usd: 0.0,
            abort,
            events: None,
        }
    }

    pub fn with_abort(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<ToolSideEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn emit(&self, event: ToolSideEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub fn aborted(&self) -> bool {
        *self.abort.borrow()
    }
}

/// Trait every built-in tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters; validated before dispatch.
    fn parameters_schema(&self) -> Value;
    fn effect(&self) -> ToolEffect;
    /// Execute the tool.  Failures are wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolOutput;
}

/// Minimal structural validation of `args` against the tool's schema:
/// every name in `required` must be present.  Full JSON-Schema validation
/// is each tool's own job at read time.
pub fn check_required_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    for field in required {
        let Some(name) = field.as_str() else { continue };
        if args.get(name).is_none() {
            return Err(format!("missing required parameter: {name}"));
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_output_is_not_error() {
        let out = ToolOutput::ok(json!({"content": "x"}));
        assert!(!out.is_error);
        assert!(out.error_message().is_none());
    }

    #[test]
    fn err_output_carries_message() {
        let out = ToolOutput::err("file missing");
        assert!(out.is_error);
        assert_eq!(out.error_message(), Some("file missing"));
    }

    #[test]
    fn err_with_merges_extra_fields() {
        let out = ToolOutput::err_with("boom", json!({"exitCode": 2}));
        assert_eq!(out.value["exitCode"], 2);
        assert_eq!(out.error_message(), Some("boom"));
    }

    #[test]
    fn check_required_args_passes_when_present() {
        let schema = json!({"required": ["path"]});
        assert!(check_required_args(&schema, &json!({"path": "a"})).is_ok());
    }

    #[test]
    fn check_required_args_names_missing_field() {
        let schema = json!({"required": ["path", "content"]});
        let err = check_required_args(&schema, &json!({"path": "a"})).unwrap_err();
        assert!(err.contains("content"));
    }

    #[test]
    fn check_required_args_without_required_is_ok() {
        assert!(check_required_args(&json!({"type": "object"}), &json!({})).is_ok());
    }
}
