// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{ExecOptions, ExecResult, RuntimeError, SpawnOptions};

/// Hard byte ceiling for combined stdout + stderr returned from `exec`.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

/// Lines kept from the head / tail of oversized output.  Errors and
/// summaries cluster at the end of build output, so the tail is never lost.
const HEAD_LINES: usize = 100;
const TAIL_LINES: usize = 100;

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Exit code reported when the timeout killed the child (128 + SIGKILL).
const TIMEOUT_EXIT_CODE: i32 = 137;

/// One chunk of streamed process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

impl OutputChunk {
    pub fn line(&self) -> &str {
        match self {
            Self::Stdout(l) | Self::Stderr(l) => l,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Stderr(_))
    }
}

/// A long-running child process with streamed output and explicit abort.
pub struct SpawnedChild {
    pub output: mpsc::UnboundedReceiver<OutputChunk>,
    exit: oneshot::Receiver<i32>,
    abort_tx: Option<oneshot::Sender<()>>,
}

/// Detached kill switch for a [`SpawnedChild`], usable while another task
/// owns the child and drains its output.
pub struct AbortHandle(Option<oneshot::Sender<()>>);

impl AbortHandle {
    pub fn abort(mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

impl SpawnedChild {
    /// Await process exit.  Remaining output stays readable from `output`.
    pub async fn wait(&mut self) -> i32 {
        (&mut self.exit).await.unwrap_or(-1)
    }

    /// Kill the child.  The pipe ends held by the controller task are
    /// released as the reader loops hit EOF, so a downstream `head`-style
    /// consumer never blocks on a half-open pipe.
    pub fn abort(&mut self) {
        if let Some(tx) = self.abort_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Split off the kill switch.  Subsequent `abort` calls on the child
    /// itself become no-ops.
    pub fn abort_handle(&mut self) -> Option<AbortHandle> {
        self.abort_tx.take().map(|tx| AbortHandle(Some(tx)))
    }
}

fn build_command(program: &str, args: &[&str], cwd: Option<&std::path::Path>, env: &[(String, String)], has_stdin: bool) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    // Detach the child from any controlling terminal and make sure the
    // handle is reaped if the owning future is dropped mid-flight.
    cmd.stdin(if has_stdin { Stdio::piped() } else { Stdio::null() });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd
}

/// Run `argv` to completion with a timeout; output is head/tail-capped.
pub(crate) async fn run_argv(
    program: &str,
    args: &[&str],
    opts: &ExecOptions,
) -> Result<ExecResult, RuntimeError> {
    let timeout = if opts.timeout_secs == 0 {
        DEFAULT_TIMEOUT_SECS
    } else {
        opts.timeout_secs
    };
    let mut cmd = build_command(program, args, opts.cwd.as_deref(), &opts.env, opts.stdin.is_some());
    debug!(program, timeout, "exec");

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(RuntimeError::from)?;

    if let Some(input) = &opts.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(input.as_bytes()).await;
            // Drop closes the write side so the child sees EOF.
        }
    }

    let result = tokio::time::timeout(
        std::time::Duration::from_secs(timeout),
        child.wait_with_output(),
    )
    .await;

    let wall_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(Ok(output)) => {
            let raw_out = String::from_utf8_lossy(&output.stdout);
            let raw_err = String::from_utf8_lossy(&output.stderr);
            let stdout = head_tail_truncate(&raw_out);
            let stderr = head_tail_truncate(&raw_err);
            let truncated = stdout.len() < raw_out.len() || stderr.len() < raw_err.len();
            Ok(ExecResult {
                stdout,
                stderr,
                exit_code: output.status.code().unwrap_or(-1),
                wall_ms,
                truncated,
            })
        }
        Ok(Err(e)) => Err(RuntimeError::Io(format!("spawn error: {e}"))),
        Err(_) => Ok(ExecResult {
            stdout: String::new(),
            stderr: format!("timed out after {timeout}s"),
            exit_code: TIMEOUT_EXIT_CODE,
            wall_ms,
            truncated: false,
        }),
    }
}

/// Start `argv` with streamed line output.
pub(crate) async fn spawn_argv(
    program: &str,
    args: &[&str],
    opts: &SpawnOptions,
) -> Result<SpawnedChild, RuntimeError> {
    let mut cmd = build_command(program, args, opts.cwd.as_deref(), &opts.env, opts.stdin.is_some());
    let mut child = cmd.spawn().map_err(RuntimeError::from)?;

    if let Some(input) = opts.stdin.clone() {
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                let _ = stdin.write_all(input.as_bytes()).await;
            });
        }
    }

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        let tx = out_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(OutputChunk::Stdout(line)).is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = out_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(OutputChunk::Stderr(line)).is_err() {
                    break;
                }
            }
        });
    }
    drop(out_tx);

    let (abort_tx, abort_rx) = oneshot::channel::<()>();
    let (exit_tx, exit_rx) = oneshot::channel::<i32>();
    tokio::spawn(async move {
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = abort_rx => None,
        };
        let code = match exited {
            Some(status) => status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1),
            None => {
                // Write-side abort: SIGKILL the whole session, then reap.
                // The reader tasks drain to EOF and exit on their own.
                let _ = child.start_kill();
                let _ = child.wait().await;
                TIMEOUT_EXIT_CODE
            }
        };
        let _ = exit_tx.send(code);
    });

    Ok(SpawnedChild {
        output: out_rx,
        exit: exit_rx,
        abort_tx: Some(abort_tx),
    })
}

/// Truncate `s` to fit within the output byte cap, keeping the first and
/// last lines verbatim with an omission marker in the middle.
pub fn head_tail_truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }

    let lines: Vec<&str> = s.lines().collect();
    let total = lines.len();

    if total <= HEAD_LINES + TAIL_LINES {
        // Byte budget exceeded by very long lines: byte-level head + tail.
        let head_end = (OUTPUT_LIMIT_BYTES / 2).min(s.len());
        let tail_start = s.len().saturating_sub(OUTPUT_LIMIT_BYTES / 2);
        let head = &s[..head_end];
        let tail = &s[tail_start..];
        let omitted = s.len() - head.len() - tail.len();
        return format!("{head}\n...[{omitted} bytes omitted]...\n{tail}");
    }

    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[total - TAIL_LINES..].join("\n");
    let omitted_lines = total - HEAD_LINES - TAIL_LINES;
    let omitted_bytes = s.len().saturating_sub(head.len() + tail.len());
    format!("{head}\n...[{omitted_lines} lines / ~{omitted_bytes} bytes omitted]...\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_opts() -> ExecOptions {
        ExecOptions::default()
    }

    // ── run_argv ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn exec_captures_stdout() {
        let r = run_argv("bash", &["-c", "echo hello"], &exec_opts())
            .await
            .unwrap();
        assert_eq!(r.exit_code, 0);
        assert!(r.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn exec_captures_stderr_and_exit_code() {
        let r = run_argv("bash", &["-c", "echo oops >&2; exit 3"], &exec_opts())
            .await
            .unwrap();
        assert_eq!(r.exit_code, 3);
        assert!(r.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn exec_timeout_reports_signal_exit_code() {
        let opts = ExecOptions {
            timeout_secs: 1,
            ..Default::default()
        };
        let r = run_argv("bash", &["-c", "sleep 30"], &opts).await.unwrap();
        assert_eq!(r.exit_code, TIMEOUT_EXIT_CODE);
        assert!(r.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn exec_pipes_stdin() {
        let opts = ExecOptions {
            stdin: Some("from-stdin\n".into()),
            ..Default::default()
        };
        let r = run_argv("bash", &["-c", "cat"], &opts).await.unwrap();
        assert!(r.stdout.contains("from-stdin"));
    }

    #[tokio::test]
    async fn exec_records_wall_time() {
        let r = run_argv("bash", &["-c", "sleep 0.05"], &exec_opts())
            .await
            .unwrap();
        assert!(r.wall_ms >= 40, "wall_ms = {}", r.wall_ms);
    }

    // ── spawn_argv ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn spawn_streams_stdout_and_stderr() {
        let mut child = spawn_argv(
            "bash",
            &["-c", "echo out; echo err >&2"],
            &SpawnOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(child.wait().await, 0);

        let mut got_out = false;
        let mut got_err = false;
        while let Ok(chunk) = child.output.try_recv() {
            match chunk {
                OutputChunk::Stdout(l) if l == "out" => got_out = true,
                OutputChunk::Stderr(l) if l == "err" => got_err = true,
                _ => {}
            }
        }
        assert!(got_out && got_err);
    }

    #[tokio::test]
    async fn abort_kills_long_running_pipeline() {
        // `yes | head`-shaped hang: without write-side abort this blocks.
        let mut child = spawn_argv("bash", &["-c", "sleep 60"], &SpawnOptions::default())
            .await
            .unwrap();
        child.abort();
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .expect("abort must terminate the child promptly");
        assert_ne!(code, 0);
    }

    // ── head_tail_truncate ────────────────────────────────────────────────────

    #[test]
    fn short_output_passes_through() {
        assert_eq!(head_tail_truncate("ok\n"), "ok\n");
    }

    #[test]
    fn long_output_keeps_head_and_tail() {
        let mut lines = vec!["FIRST".to_string()];
        for i in 0..2000 {
            lines.push(format!("filler line {i} with some padding text"));
        }
        lines.push("LAST".to_string());
        let s = lines.join("\n");

        let out = head_tail_truncate(&s);
        assert!(out.contains("FIRST"));
        assert!(out.contains("LAST"));
        assert!(out.contains("omitted"));
        assert!(out.len() < s.len());
    }

    #[test]
    fn very_long_single_line_truncates_by_bytes() {
        let s = "x".repeat(100_000);
        let out = head_tail_truncate(&s);
        assert!(out.contains("bytes omitted"));
        assert!(out.len() < s.len());
    }
}
