// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::builtin::workspace_path;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolEffect, ToolOutput};

/// Replace an exact string in a file.
///
/// The match must be unique unless `replace_all` is set — an ambiguous
/// match is an error so the model re-reads and adds context rather than
/// editing the wrong site.
pub struct FileEditReplaceStringTool;

#[async_trait]
impl Tool for FileEditReplaceStringTool {
    fn name(&self) -> &str {
        "file_edit_replace_string"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing an exact string.\n\
         'old_string' must match the file content exactly, including \
         indentation, and must be unique in the file unless 'replace_all' \
         is true. Re-read the file after a previous edit before building \
         new match text."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" },
                "old_string": { "type": "string", "description": "Exact text to replace" },
                "new_string": { "type": "string", "description": "Replacement text" },
                "replace_all": { "type": "boolean", "description": "Replace every occurrence (default false)" }
            },
            "required": ["path", "old_string", "new_string"],
            "additionalProperties": false
        })
    }

    fn effect(&self) -> ToolEffect {
        ToolEffect::Write
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolOutput {
        let raw_path = call.args["path"].as_str().unwrap_or_default();
        let old = call.args["old_string"].as_str().unwrap_or_default();
        let new = call.args["new_string"].as_str().unwrap_or_default();
        let replace_all = call.args.get("replace_all").and_then(Value::as_bool).unwrap_or(false);

        if old.is_empty() {
            return ToolOutput::err("old_string must not be empty");
        }
        if old == new {
            return ToolOutput::err("old_string and new_string are identical");
        }
        let path = match workspace_path(ctx, raw_path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(e),
        };

        let bytes = match ctx.runtime.read_file(&path).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(format!("read error: {e}")),
        };
        let content = String::from_utf8_lossy(&bytes).into_owned();

        let count = content.matches(old).count();
        if count == 0 {
            return ToolOutput::err(
                "old_string not found in file. Re-read the file and try again with exact text.",
            );
        }
        if count > 1 && !replace_all {
            return ToolOutput::err(format!(
                "old_string matches {count} locations. Add surrounding context to make it \
                 unique, or pass replace_all."
            ));
        }

        debug!(path = %raw_path, count, "file_edit_replace_string");
        let updated = if replace_all {
            content.replace(old, new)
        } else {
            content.replacen(old, new, 1)
        };

        match ctx.runtime.write_file(&path, updated.as_bytes()).await {
            Ok(()) => ToolOutput::ok(json!({
                "path": raw_path,
                "replacements": if replace_all { count } else { 1 },
            })),
            Err(e) => ToolOutput::err(format!("write error: {e}")),
        }
    }
}

/// Insert text at a line position (or create a new file).
pub struct FileEditInsertTool;

#[async_trait]
impl Tool for FileEditInsertTool {
    fn name(&self) -> &str {
        "file_edit_insert"
    }

    fn description(&self) -> &str {
        "Insert text into a file at a given line. 'insert_line' 0 prepends, \
         N inserts after line N, and omitting it appends to the end. \
         Creates the file (and parent directories) when it does not exist."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" },
                "content": { "type": "string", "description": "Text to insert" },
                "insert_line": { "type": "integer", "description": "Insert after this 1-based line; 0 prepends (optional, default append)" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn effect(&self) -> ToolEffect {
        ToolEffect::Write
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolOutput {
        let raw_path = call.args["path"].as_str().unwrap_or_default();
        let content = call.args["content"].as_str().unwrap_or_default();
        let insert_line = call.args.get("insert_line").and_then(Value::as_u64);

        let path = match workspace_path(ctx, raw_path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(e),
        };

        let existing = match ctx.runtime.read_file(&path).await {
            Ok(b) => Some(String::from_utf8_lossy(&b).into_owned()),
            Err(_) => None,
        };

        let updated = match (&existing, insert_line) {
            (None, _) => content.to_string(),
            (Some(old), None) => {
                if old.is_empty() || old.ends_with('\n') {
                    format!("{old}{content}")
                } else {
                    format!("{old}\n{content}")
                }
            }
            (Some(old), Some(after)) => {
                let mut lines: Vec<&str> = old.lines().collect();
                let at = (after as usize).min(lines.len());
                let had_trailing_newline = old.ends_with('\n');
                let mut inserted: Vec<&str> = content.lines().collect();
                if content.is_empty() {
                    inserted = vec![""];
                }
                let tail = lines.split_off(at);
                lines.extend(inserted);
                lines.extend(tail);
                let mut joined = lines.join("\n");
                if had_trailing_newline {
                    joined.push('\n');
                }
                joined
            }
        };

        match ctx.runtime.write_file(&path, updated.as_bytes()).await {
            Ok(()) => ToolOutput::ok(json!({
                "path": raw_path,
                "created": existing.is_none(),
            })),
            Err(e) => ToolOutput::err(format!("write error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
