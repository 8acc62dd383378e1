// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use mux_runtime::{head_tail_truncate, AbortHandle, OutputChunk, SpawnOptions};

use crate::events::ToolSideEvent;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolEffect, ToolOutput};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Output size past which the overflow policy kicks in.
const OVERFLOW_BYTES: usize = 20_000;

// ── Background process manager ────────────────────────────────────────────────

struct BackgroundProc {
    command: String,
    /// Chunks accumulated since the last `bash_output` read.
    pending: Vec<OutputChunk>,
    exit_code: Option<i32>,
    abort: Option<AbortHandle>,
}

/// Process-wide registry of background shells, owned by the composition
/// root and shared by the `bash` / `bash_output` / `bash_background_kill`
/// tools.
#[derive(Default)]
pub struct BackgroundProcessManager {
    procs: Mutex<HashMap<String, Arc<Mutex<BackgroundProc>>>>,
}

impl BackgroundProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn start(
        self: &Arc<Self>,
        id: String,
        command: String,
        mut child: mux_runtime::SpawnedChild,
    ) {
        let proc = Arc::new(Mutex::new(BackgroundProc {
            command,
            pending: Vec::new(),
            exit_code: None,
            abort: child.abort_handle(),
        }));
        self.procs.lock().await.insert(id, proc.clone());

        tokio::spawn(async move {
            while let Some(chunk) = child.output.recv().await {
                proc.lock().await.pending.push(chunk);
            }
            let exit = child.wait().await;
            proc.lock().await.exit_code = Some(exit);
        });
    }

    /// Drain new output.  Returns `(output, exit_code, running)`.
    pub async fn read_output(&self, id: &str) -> Option<(String, Option<i32>, bool)> {
        let proc = self.procs.lock().await.get(id).cloned()?;
        let mut proc = proc.lock().await;
        let output = render_chunks(std::mem::take(&mut proc.pending));
        Some((output, proc.exit_code, proc.exit_code.is_none()))
    }

    pub async fn kill(&self, id: &str) -> bool {
        let Some(proc) = self.procs.lock().await.get(id).cloned() else {
            return false;
        };
        let abort = proc.lock().await.abort.take();
        match abort {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn list(&self) -> Vec<(String, String, bool)> {
        let procs = self.procs.lock().await;
        let mut out = Vec::new();
        for (id, proc) in procs.iter() {
            let proc = proc.lock().await;
            out.push((id.clone(), proc.command.clone(), proc.exit_code.is_none()));
        }
        out.sort();
        out
    }
}

fn render_chunks(chunks: Vec<OutputChunk>) -> String {
    let mut out = String::new();
    for chunk in chunks {
        match chunk {
            OutputChunk::Stdout(l) => {
                out.push_str(&l);
                out.push('\n');
            }
            OutputChunk::Stderr(l) => {
                out.push_str(&l);
                out.push('\n');
            }
        }
    }
    out
}

// ── bash ──────────────────────────────────────────────────────────────────────

/// Run a shell command in the workspace runtime.
pub struct BashTool {
    pub manager: Arc<BackgroundProcessManager>,
    pub default_timeout_secs: u64,
}

impl BashTool {
    pub fn new(manager: Arc<BackgroundProcessManager>) -> Self {
        Self {
            manager,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace and return its output.\n\
         Output is capped; pass overflow_policy=\"tmpfile\" to spill the full \
         output to a file instead of truncating. Set run_in_background=true \
         for long-running commands, then poll with bash_output.\n\
         Write to the file named by $MUX_OUTPUT to surface a short message \
         to the user, and to $MUX_PROMPT to append context for the agent."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command to execute" },
                "timeout_secs": { "type": "integer", "description": "Execution timeout in seconds (optional)" },
                "run_in_background": { "type": "boolean", "description": "Return immediately; poll with bash_output" },
                "overflow_policy": { "type": "string", "enum": ["truncate", "tmpfile"], "description": "What to do with oversized output (default truncate)" }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn effect(&self) -> ToolEffect {
        ToolEffect::Exec
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolOutput {
        let command = call.args["command"].as_str().unwrap_or_default().to_string();
        if command.trim().is_empty() {
            return ToolOutput::err("command must not be empty");
        }
        let timeout_secs = call
            .args
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(self.default_timeout_secs);
        let background = call
            .args
            .get("run_in_background")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let overflow_tmpfile = call.args.get("overflow_policy").and_then(Value::as_str)
            == Some("tmpfile");

        // Per-invocation channel files, readable by the subprocess via env.
        let token = uuid::Uuid::new_v4().simple().to_string();
        let tmp_dir = PathBuf::from(".mux/tmp");
        let output_file = tmp_dir.join(format!("{token}.out"));
        let prompt_file = tmp_dir.join(format!("{token}.prompt"));

        let mut env = ctx.env.clone();
        for (k, v) in &ctx.secrets {
            env.push((k.clone(), v.clone()));
        }
        let ws = ctx.runtime.workspace_dir();
        env.push((
            "MUX_OUTPUT".into(),
            ws.join(&output_file).to_string_lossy().into_owned(),
        ));
        env.push((
            "MUX_PROMPT".into(),
            ws.join(&prompt_file).to_string_lossy().into_owned(),
        ));
        env.push(("MUX_COSTS_USD".into(), format!("{:.4}", ctx.costs_usd)));

        // The channel file directory must exist before the command runs.
        let _ = ctx.runtime.write_file(&tmp_dir.join(".keep"), b"").await;

        debug!(workspace = %ctx.workspace_id, cmd = %command, background, "bash tool");
        let spawned = ctx
            .runtime
            .spawn(&command, SpawnOptions {
                env,
                ..Default::default()
            })
            .await;
        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(format!("spawn error: {e}")),
        };

        if background {
            let id = format!("bg-{}", &token[..8]);
            self.manager.start(id.clone(), command, child).await;
            return ToolOutput::ok(json!({
                "status": "running",
                "backgroundProcessId": id,
            }));
        }

        let started = Instant::now();
        let deadline = tokio::time::sleep(std::time::Duration::from_secs(timeout_secs));
        tokio::pin!(deadline);
        let mut abort = ctx.abort.clone();
        // Detach the kill switch so handlers never need a second mutable
        // borrow of the child while its output stream is being polled.
        let mut kill = child.abort_handle();
        // A dropped abort sender means "no abort source"; stop polling that
        // branch rather than treating channel closure as a cancellation.
        let mut abort_open = true;
        let mut chunks: Vec<OutputChunk> = Vec::new();
        let mut timed_out = false;
        let mut aborted = false;

        loop {
            tokio::select! {
                chunk = child.output.recv() => match chunk {
                    Some(c) => chunks.push(c),
                    None => break,
                },
                _ = &mut deadline, if !timed_out => {
                    timed_out = true;
                    if let Some(k) = kill.take() {
                        k.abort();
                    }
                }
                changed = abort.changed(), if abort_open => {
                    match changed {
                        Ok(()) if *abort.borrow() => {
                            aborted = true;
                            if let Some(k) = kill.take() {
                                k.abort();
                            }
                        }
                        Ok(()) => {}
                        Err(_) => abort_open = false,
                    }
                }
            }
        }
        let exit_code = child.wait().await;
        let wall_ms = started.elapsed().as_millis() as u64;

        // Read back the channel files and clean up, best effort.
        let note = read_channel_file(ctx, &output_file).await;
        let prompt = read_channel_file(ctx, &prompt_file).await;
        if let Some(message) = &note {
            ctx.emit(ToolSideEvent::Toast {
                message: message.clone(),
            });
        }
        if let Some(text) = &prompt {
            ctx.emit(ToolSideEvent::PromptUpdate { text: text.clone() });
        }

        let full_output = render_chunks(chunks);
        let (output, truncated, output_file_path) = if full_output.len() > OVERFLOW_BYTES
            && overflow_tmpfile
        {
            let spill = tmp_dir.join(format!("{token}-full.log"));
            let stored = ctx
                .runtime
                .write_file(&spill, full_output.as_bytes())
                .await
                .is_ok();
            (
                head_tail_truncate(&full_output),
                true,
                stored.then(|| spill.to_string_lossy().into_owned()),
            )
        } else {
            let truncated_output = head_tail_truncate(&full_output);
            let was_truncated = truncated_output.len() < full_output.len();
            (truncated_output, was_truncated, None)
        };

        let mut body = json!({
            "wall_duration_ms": wall_ms,
            "output": output,
            "exitCode": exit_code,
        });
        if truncated {
            body["truncated"] = json!(true);
        }
        if let Some(path) = output_file_path {
            body["outputFile"] = json!(path);
        }
        if let Some(n) = note {
            body["note"] = json!(n);
        }
        if let Some(p) = prompt {
            body["prompt"] = json!(p);
        }

        if timed_out {
            return ToolOutput::err_with(format!("timed out after {timeout_secs}s"), body);
        }
        if aborted {
            return ToolOutput::err_with("aborted", body);
        }
        if exit_code != 0 {
            return ToolOutput::err_with(format!("exit code {exit_code}"), body);
        }
        ToolOutput::ok(body)
    }
}

async fn read_channel_file(ctx: &ToolCtx, rel: &std::path::Path) -> Option<String> {
    let bytes = ctx.runtime.read_file(rel).await.ok()?;
    let text = String::from_utf8_lossy(&bytes).trim().to_string();
    let _ = ctx
        .runtime
        .exec(
            &format!("rm -f {}", rel.to_string_lossy()),
            Default::default(),
        )
        .await;
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

// ── bash_output ───────────────────────────────────────────────────────────────

/// Poll a background shell started with `bash(run_in_background=true)`.
pub struct BashOutputTool {
    pub manager: Arc<BackgroundProcessManager>,
}

#[async_trait]
impl Tool for BashOutputTool {
    fn name(&self) -> &str {
        "bash_output"
    }

    fn description(&self) -> &str {
        "Read new output from a background shell. Returns output produced \
         since the last read, plus the exit code once the process finishes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "process_id": { "type": "string", "description": "Id returned by bash with run_in_background" }
            },
            "required": ["process_id"],
            "additionalProperties": false
        })
    }

    fn effect(&self) -> ToolEffect {
        ToolEffect::ReadOnly
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
        let id = call.args["process_id"].as_str().unwrap_or_default();
        match self.manager.read_output(id).await {
            Some((output, exit_code, running)) => {
                let mut body = json!({
                    "output": head_tail_truncate(&output),
                    "running": running,
                });
                if let Some(code) = exit_code {
                    body["exitCode"] = json!(code);
                }
                ToolOutput::ok(body)
            }
            None => ToolOutput::err(format!("no background process with id {id}")),
        }
    }
}

// ── bash_background_kill ──────────────────────────────────────────────────────

pub struct BashBackgroundKillTool {
    pub manager: Arc<BackgroundProcessManager>,
}

#[async_trait]
impl Tool for BashBackgroundKillTool {
    fn name(&self) -> &str {
        "bash_background_kill"
    }

    fn description(&self) -> &str {
        "Terminate a background shell started with bash(run_in_background)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "process_id": { "type": "string", "description": "Id of the background process" }
            },
            "required": ["process_id"],
            "additionalProperties": false
        })
    }

    fn effect(&self) -> ToolEffect {
        ToolEffect::Exec
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
        let id = call.args["process_id"].as_str().unwrap_or_default();
        if self.manager.kill(id).await {
            ToolOutput::ok(json!({ "killed": id }))
        } else {
            ToolOutput::err(format!("no running background process with id {id}"))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use mux_runtime::LocalRuntime;

    fn fixture() -> (TempDir, ToolCtx, Arc<BackgroundProcessManager>) {
        let tmp = TempDir::new().unwrap();
        let ctx = ToolCtx::new("ws", Arc::new(LocalRuntime::new(tmp.path())));
        (tmp, ctx, Arc::new(BackgroundProcessManager::new()))
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "b1".into(),
            name: "bash".into(),
            args,
        }
    }

    // ── Foreground ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn echo_succeeds_with_wire_shape() {
        let (_tmp, ctx, mgr) = fixture();
        let out = BashTool::new(mgr)
            .execute(&call(json!({"command": "echo hello"})), &ctx)
            .await;
        assert!(!out.is_error, "{:?}", out.value);
        assert_eq!(out.value["exitCode"], 0);
        assert!(out.value["output"].as_str().unwrap().contains("hello"));
        assert!(out.value["wall_duration_ms"].is_number());
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_with_exit_code() {
        let (_tmp, ctx, mgr) = fixture();
        let out = BashTool::new(mgr)
            .execute(&call(json!({"command": "echo oops >&2; exit 4"})), &ctx)
            .await;
        assert!(out.is_error);
        assert_eq!(out.value["exitCode"], 4);
        assert!(out.value["output"].as_str().unwrap().contains("oops"));
    }

    #[tokio::test]
    async fn timeout_aborts_and_reports() {
        let (_tmp, ctx, mgr) = fixture();
        let out = BashTool::new(mgr)
            .execute(
                &call(json!({"command": "sleep 30", "timeout_secs": 1})),
                &ctx,
            )
            .await;
        assert!(out.is_error);
        assert!(out.error_message().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let (_tmp, ctx, mgr) = fixture();
        let out = BashTool::new(mgr).execute(&call(json!({"command": "  "})), &ctx).await;
        assert!(out.is_error);
    }

    // ── MUX_OUTPUT / MUX_PROMPT ───────────────────────────────────────────────

    #[tokio::test]
    async fn mux_output_becomes_note_and_toast() {
        let (_tmp, mut ctx, mgr) = fixture();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        ctx = ctx.with_events(tx);
        let out = BashTool::new(mgr)
            .execute(
                &call(json!({"command": "echo deployed > \"$MUX_OUTPUT\""})),
                &ctx,
            )
            .await;
        assert!(!out.is_error, "{:?}", out.value);
        assert_eq!(out.value["note"], "deployed");
        assert!(matches!(
            rx.try_recv().unwrap(),
            ToolSideEvent::Toast { message } if message == "deployed"
        ));
    }

    #[tokio::test]
    async fn mux_prompt_becomes_prompt_update() {
        let (_tmp, mut ctx, mgr) = fixture();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        ctx = ctx.with_events(tx);
        let out = BashTool::new(mgr)
            .execute(
                &call(json!({"command": "echo 'remember: port 8080' > \"$MUX_PROMPT\""})),
                &ctx,
            )
            .await;
        assert_eq!(out.value["prompt"], "remember: port 8080");
        assert!(matches!(
            rx.try_recv().unwrap(),
            ToolSideEvent::PromptUpdate { text } if text.contains("8080")
        ));
    }

    #[tokio::test]
    async fn costs_env_is_visible_to_command() {
        let (_tmp, mut ctx, mgr) = fixture();
        ctx.costs_usd = 1.25;
        let out = BashTool::new(mgr)
            .execute(&call(json!({"command": "echo \"$MUX_COSTS_USD\""})), &ctx)
            .await;
        assert!(out.value["output"].as_str().unwrap().contains("1.2500"));
    }

    // ── Overflow ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn oversized_output_is_truncated_by_default() {
        let (_tmp, ctx, mgr) = fixture();
        let out = BashTool::new(mgr)
            .execute(
                &call(json!({"command": "seq 1 20000"})),
                &ctx,
            )
            .await;
        assert!(!out.is_error);
        assert_eq!(out.value["truncated"], true);
        assert!(out.value["output"].as_str().unwrap().contains("omitted"));
    }

    #[tokio::test]
    async fn tmpfile_policy_spills_full_output() {
        let (tmp, ctx, mgr) = fixture();
        let out = BashTool::new(mgr)
            .execute(
                &call(json!({"command": "seq 1 20000", "overflow_policy": "tmpfile"})),
                &ctx,
            )
            .await;
        assert!(!out.is_error);
        let spill = out.value["outputFile"].as_str().unwrap();
        let full = std::fs::read_to_string(tmp.path().join(spill)).unwrap();
        assert!(full.contains("\n20000\n") || full.ends_with("20000\n"));
    }

    // ── Background ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn background_run_and_poll() {
        let (_tmp, ctx, mgr) = fixture();
        let out = BashTool::new(mgr.clone())
            .execute(
                &call(json!({"command": "echo bg done", "run_in_background": true})),
                &ctx,
            )
            .await;
        assert!(!out.is_error);
        assert_eq!(out.value["status"], "running");
        let id = out.value["backgroundProcessId"].as_str().unwrap().to_string();

        // Give the drainer a moment.
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let poll = BashOutputTool { manager: mgr }
            .execute(
                &ToolCall {
                    id: "p".into(),
                    name: "bash_output".into(),
                    args: json!({"process_id": id}),
                },
                &ctx,
            )
            .await;
        assert!(!poll.is_error);
        assert!(poll.value["output"].as_str().unwrap().contains("bg done"));
        assert_eq!(poll.value["running"], false);
        assert_eq!(poll.value["exitCode"], 0);
    }

    #[tokio::test]
    async fn background_kill_terminates() {
        let (_tmp, ctx, mgr) = fixture();
        let out = BashTool::new(mgr.clone())
            .execute(
                &call(json!({"command": "sleep 60", "run_in_background": true})),
                &ctx,
            )
            .await;
        let id = out.value["backgroundProcessId"].as_str().unwrap().to_string();

        let kill = BashBackgroundKillTool { manager: mgr.clone() }
            .execute(
                &ToolCall {
                    id: "k".into(),
                    name: "bash_background_kill".into(),
                    args: json!({"process_id": id.clone()}),
                },
                &ctx,
            )
            .await;
        assert!(!kill.is_error);

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let (_, exit, running) = mgr.read_output(&id).await.unwrap();
        assert!(!running);
        assert_ne!(exit, Some(0));
    }

    #[tokio::test]
    async fn polling_unknown_process_is_error() {
        let (_tmp, ctx, mgr) = fixture();
        let out = BashOutputTool { manager: mgr }
            .execute(
                &ToolCall {
                    id: "p".into(),
                    name: "bash_output".into(),
                    args: json!({"process_id": "bg-nope"}),
                },
                &ctx,
            )
            .await;
        assert!(out.is_error);
    }
}
