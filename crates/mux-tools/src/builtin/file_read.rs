// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::builtin::workspace_path;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolEffect, ToolOutput};

/// Byte cap for a single read; larger files must be read in windows.
const MAX_READ_BYTES: usize = 200_000;

/// Read a file from the workspace, optionally windowed by line.
pub struct FileReadTool;

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace. Paths are relative to the workspace \
         root. Use 'offset' (1-based line) and 'limit' to window large files; \
         reads are capped at ~200 KB."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" },
                "offset": { "type": "integer", "description": "1-based first line to read (optional)" },
                "limit": { "type": "integer", "description": "Maximum number of lines (optional)" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn effect(&self) -> ToolEffect {
        ToolEffect::ReadOnly
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolOutput {
        let raw_path = call.args["path"].as_str().unwrap_or_default();
        let path = match workspace_path(ctx, raw_path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(e),
        };

        let bytes = match ctx.runtime.read_file(&path).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(format!("read error: {e}")),
        };
        let content = String::from_utf8_lossy(&bytes);

        let offset = call.args.get("offset").and_then(Value::as_u64).unwrap_or(1) as usize;
        let limit = call.args.get("limit").and_then(Value::as_u64).map(|l| l as usize);

        let selected: String = match limit {
            Some(limit) => content
                .lines()
                .skip(offset.saturating_sub(1))
                .take(limit)
                .collect::<Vec<_>>()
                .join("\n"),
            None if offset > 1 => content
                .lines()
                .skip(offset - 1)
                .collect::<Vec<_>>()
                .join("\n"),
            None => content.into_owned(),
        };

        let truncated = selected.len() > MAX_READ_BYTES;
        let body = if truncated {
            // Cut at a char boundary at or below the cap.
            let mut end = MAX_READ_BYTES;
            while !selected.is_char_boundary(end) {
                end -= 1;
            }
            &selected[..end]
        } else {
            &selected
        };

        ToolOutput::ok(json!({
            "path": raw_path,
            "content": body,
            "truncated": truncated,
        }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use mux_runtime::LocalRuntime;

    fn fixture(content: &str) -> (TempDir, ToolCtx) {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("file.txt"), content).unwrap();
        let ctx = ToolCtx::new("ws", Arc::new(LocalRuntime::new(tmp.path())));
        (tmp, ctx)
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "r1".into(),
            name: "file_read".into(),
            args,
        }
    }

    #[tokio::test]
    async fn reads_whole_file() {
        let (_tmp, ctx) = fixture("alpha\nbeta\n");
        let out = FileReadTool.execute(&call(json!({"path": "file.txt"})), &ctx).await;
        assert!(!out.is_error);
        assert_eq!(out.value["content"], "alpha\nbeta\n");
        assert_eq!(out.value["truncated"], false);
    }

    #[tokio::test]
    async fn offset_and_limit_window_lines() {
        let (_tmp, ctx) = fixture("l1\nl2\nl3\nl4\n");
        let out = FileReadTool
            .execute(&call(json!({"path": "file.txt", "offset": 2, "limit": 2})), &ctx)
            .await;
        assert_eq!(out.value["content"], "l2\nl3");
    }

    #[tokio::test]
    async fn missing_file_is_failure_result() {
        let (_tmp, ctx) = fixture("x");
        let out = FileReadTool.execute(&call(json!({"path": "nope.txt"})), &ctx).await;
        assert!(out.is_error);
        assert!(out.error_message().unwrap().contains("read error"));
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let (_tmp, ctx) = fixture("x");
        let out = FileReadTool
            .execute(&call(json!({"path": "../../etc/passwd"})), &ctx)
            .await;
        assert!(out.is_error);
        assert!(out.error_message().unwrap().contains("escapes"));
    }

    #[tokio::test]
    async fn oversized_read_is_truncated_flagged() {
        let big = "line of content\n".repeat(20_000); // ~320 KB
        let (_tmp, ctx) = fixture(&big);
        let out = FileReadTool.execute(&call(json!({"path": "file.txt"})), &ctx).await;
        assert!(!out.is_error);
        assert_eq!(out.value["truncated"], true);
        assert!(out.value["content"].as_str().unwrap().len() <= MAX_READ_BYTES);
    }
}
