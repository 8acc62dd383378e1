// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolCtx, ToolEffect, ToolOutput};

/// Terminal report from a subagent to its parent.
///
/// The tool itself only validates and acknowledges; the task service
/// observes the `tool-call-end` event on the child stream and routes the
/// report into the parent's pending `task` tool part.
pub struct AgentReportTool;

#[async_trait]
impl Tool for AgentReportTool {
    fn name(&self) -> &str {
        "agent_report"
    }

    fn description(&self) -> &str {
        "Deliver your final report to the parent workspace. Call this exactly \
         once, when your task is complete. 'reportMarkdown' is the full \
         result; 'title' is an optional one-line summary."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reportMarkdown": { "type": "string", "description": "Full markdown report" },
                "title": { "type": "string", "description": "Optional short title" }
            },
            "required": ["reportMarkdown"],
            "additionalProperties": false
        })
    }

    fn effect(&self) -> ToolEffect {
        ToolEffect::ReadOnly
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
        let report = call.args["reportMarkdown"].as_str().unwrap_or_default();
        if report.trim().is_empty() {
            return ToolOutput::err("reportMarkdown must not be empty");
        }
        ToolOutput::ok(json!({ "success": true }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
