// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolCtx, ToolEffect, ToolOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Agent,
    Bash,
}

#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub parent_workspace_id: String,
    pub kind: TaskKind,
    pub agent_type: Option<String>,
    pub prompt: String,
    pub run_in_background: bool,
    /// The parent's `task` tool-call id; recorded on the child so the
    /// eventual report can be routed back to this exact call.
    pub tool_call_id: String,
}

#[derive(Debug, Clone)]
pub struct TaskCreation {
    pub task_id: String,
    /// `"running"` or `"queued"`.
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct TaskReportOut {
    pub report_markdown: String,
    pub title: Option<String>,
}

/// Capability the task service exposes to the `task` tool, keeping the
/// tool crate independent of the orchestration layer.
#[async_trait]
pub trait TaskSpawner: Send + Sync {
    async fn create_task(&self, req: CreateTaskRequest) -> Result<TaskCreation, String>;
    /// Await the child's report.  The countdown excludes time spent queued.
    async fn wait_for_report(
        &self,
        task_id: &str,
        timeout_ms: Option<u64>,
    ) -> Result<TaskReportOut, String>;
}

/// Spawn a subagent (or a delegated shell task) as a child workspace.
pub struct TaskTool {
    spawner: Arc<dyn TaskSpawner>,
}

impl TaskTool {
    pub fn new(spawner: Arc<dyn TaskSpawner>) -> Self {
        Self { spawner }
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Delegate a focused task to a subagent running in its own child \
         workspace. kind=\"agent\" spawns the named agent type with your \
         prompt; kind=\"bash\" runs a one-shot shell task. By default the \
         call waits for the subagent's report; pass run_in_background=true \
         to continue working and receive the report later."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "kind": { "type": "string", "enum": ["agent", "bash"], "description": "What to delegate" },
                "agent_type": { "type": "string", "description": "Agent id to run (kind=agent)" },
                "prompt": { "type": "string", "description": "Task description or shell command" },
                "run_in_background": { "type": "boolean", "description": "Return immediately (default false)" },
                "timeout_ms": { "type": "integer", "description": "Report wait timeout in milliseconds (optional)" }
            },
            "required": ["kind", "prompt"],
            "additionalProperties": false
        })
    }

    fn effect(&self) -> ToolEffect {
        ToolEffect::Subagent
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolOutput {
        let kind = match call.args["kind"].as_str() {
            Some("agent") => TaskKind::Agent,
            Some("bash") => TaskKind::Bash,
            other => return ToolOutput::err(format!("unknown task kind: {other:?}")),
        };
        let prompt = call.args["prompt"].as_str().unwrap_or_default().to_string();
        if prompt.trim().is_empty() {
            return ToolOutput::err("prompt must not be empty");
        }
        let agent_type = call.args.get("agent_type").and_then(Value::as_str).map(String::from);
        if kind == TaskKind::Agent && agent_type.is_none() {
            return ToolOutput::err("agent_type is required when kind=\"agent\"");
        }
        let run_in_background = call
            .args
            .get("run_in_background")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let timeout_ms = call.args.get("timeout_ms").and_then(Value::as_u64);

        debug!(parent = %ctx.workspace_id, ?kind, background = run_in_background, "task tool");
        let created = match self
            .spawner
            .create_task(CreateTaskRequest {
                parent_workspace_id: ctx.workspace_id.clone(),
                kind,
                agent_type,
                prompt,
                run_in_background,
                tool_call_id: call.id.clone(),
            })
            .await
        {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(e),
        };

        if run_in_background {
            return ToolOutput::ok(json!({
                "status": created.status,
                "taskId": created.task_id,
            }));
        }

        match self
            .spawner
            .wait_for_report(&created.task_id, timeout_ms)
            .await
        {
            Ok(report) => {
                let mut body = json!({
                    "status": "reported",
                    "taskId": created.task_id,
                    "reportMarkdown": report.report_markdown,
                });
                if let Some(title) = report.title {
                    body["title"] = json!(title);
                }
                ToolOutput::ok(body)
            }
            Err(e) => ToolOutput::err_with(e, json!({ "taskId": created.task_id })),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
