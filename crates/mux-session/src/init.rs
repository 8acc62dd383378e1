// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

use mux_runtime::{Runtime, SpawnOptions};

use crate::store::SessionError;

/// Events emitted while a workspace's init hook runs.
#[derive(Debug, Clone)]
pub enum InitEvent {
    Start {
        workspace_id: String,
        hook_path: Option<String>,
    },
    Output {
        workspace_id: String,
        line: String,
        is_error: bool,
    },
    End {
        workspace_id: String,
        exit_code: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitOutcome {
    Running,
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitLine {
    pub line: String,
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

/// Durable record of the per-workspace init-hook run (`init-status.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitStatus {
    pub status: InitOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub lines: Vec<InitLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_path: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Tracks the init-hook run for every workspace and gates tool execution on
/// its completion.
pub struct InitStateManager {
    sessions_root: PathBuf,
    events: Option<mpsc::UnboundedSender<InitEvent>>,
    /// In-process notification per running init.  A persisted `running`
    /// record with no live entry is stale (previous process died mid-hook)
    /// and is treated as finished so tool calls are not wedged forever.
    live: Mutex<HashMap<String, Arc<Notify>>>,
}

impl InitStateManager {
    pub fn new(
        sessions_root: impl Into<PathBuf>,
        events: Option<mpsc::UnboundedSender<InitEvent>>,
    ) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            events,
            live: Mutex::new(HashMap::new()),
        }
    }

    fn status_path(&self, ws: &str) -> PathBuf {
        self.sessions_root.join(ws).join("init-status.json")
    }

    fn emit(&self, event: InitEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Begin tracking an init run and emit `init-start`.
    pub async fn start_init(
        &self,
        ws: &str,
        hook_path: Option<&Path>,
    ) -> Result<(), SessionError> {
        let status = InitStatus {
            status: InitOutcome::Running,
            exit_code: None,
            lines: Vec::new(),
            hook_path: hook_path.map(|p| p.to_string_lossy().into_owned()),
            start_time: Utc::now(),
            end_time: None,
        };
        self.write_status(ws, &status).await?;
        self.live
            .lock()
            .await
            .insert(ws.to_string(), Arc::new(Notify::new()));
        self.emit(InitEvent::Start {
            workspace_id: ws.to_string(),
            hook_path: status.hook_path.clone(),
        });
        Ok(())
    }

    pub async fn append_output(
        &self,
        ws: &str,
        line: &str,
        is_error: bool,
    ) -> Result<(), SessionError> {
        if let Some(mut status) = self.read_init_status(ws).await {
            status.lines.push(InitLine {
                line: line.to_string(),
                is_error,
                timestamp: Utc::now(),
            });
            self.write_status(ws, &status).await?;
        }
        self.emit(InitEvent::Output {
            workspace_id: ws.to_string(),
            line: line.to_string(),
            is_error,
        });
        Ok(())
    }

    /// Finalize the record and release every `wait_for_init` caller.
    pub async fn end_init(&self, ws: &str, exit_code: i32) -> Result<(), SessionError> {
        if let Some(mut status) = self.read_init_status(ws).await {
            status.status = if exit_code == 0 {
                InitOutcome::Success
            } else {
                InitOutcome::Failure
            };
            status.exit_code = Some(exit_code);
            status.end_time = Some(Utc::now());
            self.write_status(ws, &status).await?;
        }
        if let Some(notify) = self.live.lock().await.remove(ws) {
            notify.notify_waiters();
        }
        self.emit(InitEvent::End {
            workspace_id: ws.to_string(),
            exit_code,
        });
        Ok(())
    }

    /// Record a hook-less init: `init-start` then `init-end` with exit 0 and
    /// no hook path.
    pub async fn mark_no_hook(&self, ws: &str) -> Result<(), SessionError> {
        self.start_init(ws, None).await?;
        self.end_init(ws, 0).await
    }

    /// Run the hook to completion, streaming its stdio into the status
    /// record.  Hook failure is recorded, not returned — a failed init hook
    /// leaves the workspace usable.
    pub async fn run_hook(
        &self,
        ws: &str,
        runtime: &dyn Runtime,
        hook_path: &Path,
    ) -> Result<(), SessionError> {
        self.start_init(ws, Some(hook_path)).await?;
        debug!(workspace = ws, hook = %hook_path.display(), "running init hook");
        let spawned = runtime
            .spawn(&hook_path.to_string_lossy(), SpawnOptions::default())
            .await;
        match spawned {
            Ok(mut child) => {
                while let Some(chunk) = child.output.recv().await {
                    self.append_output(ws, chunk.line(), chunk.is_error()).await?;
                }
                let exit = child.wait().await;
                self.end_init(ws, exit).await
            }
            Err(e) => {
                warn!(workspace = ws, error = %e, "init hook failed to start");
                self.append_output(ws, &format!("failed to start init hook: {e}"), true)
                    .await?;
                self.end_init(ws, -1).await
            }
        }
    }

    /// Await init completion.
    ///
    /// Resolves immediately when: no record exists (workspace predates init
    /// tracking), the record is terminal, or the record says `running` but
    /// no live run exists in this process (stale crash leftovers).
    pub async fn wait_for_init(&self, ws: &str) {
        loop {
            let notify = {
                let live = self.live.lock().await;
                live.get(ws).cloned()
            };
            let Some(notify) = notify else {
                return;
            };
            // Register interest before re-checking liveness: `notify_waiters`
            // only wakes futures that are already enabled, so the plain
            // check-then-await order would miss a racing `end_init`.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.live.lock().await.contains_key(ws) {
                return;
            }
            notified.await;
        }
    }

    pub async fn read_init_status(&self, ws: &str) -> Option<InitStatus> {
        let bytes = tokio::fs::read(self.status_path(ws)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn write_status(&self, ws: &str, status: &InitStatus) -> Result<(), SessionError> {
        let path = self.status_path(ws);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(status)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use super::*;
    use mux_runtime::LocalRuntime;

    fn manager(tmp: &TempDir) -> (InitStateManager, mpsc::UnboundedReceiver<InitEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            InitStateManager::new(tmp.path().join("sessions"), Some(tx)),
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<InitEvent>) -> Vec<InitEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    // ── No-hook contract ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn no_hook_emits_start_and_end_with_exit_zero() {
        let tmp = TempDir::new().unwrap();
        let (m, mut rx) = manager(&tmp);
        m.mark_no_hook("ws").await.unwrap();

        let events = drain(&mut rx);
        assert!(matches!(
            &events[0],
            InitEvent::Start { hook_path: None, .. }
        ));
        assert!(matches!(
            events.last(),
            Some(InitEvent::End { exit_code: 0, .. })
        ));

        let status = m.read_init_status("ws").await.unwrap();
        assert_eq!(status.status, InitOutcome::Success);
        assert_eq!(status.exit_code, Some(0));
        assert!(status.hook_path.is_none());
    }

    // ── Hook execution ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn hook_output_is_persisted_and_emitted() {
        let tmp = TempDir::new().unwrap();
        let ws_dir = tmp.path().join("work");
        std::fs::create_dir_all(ws_dir.join(".mux")).unwrap();
        let hook = ws_dir.join(".mux/init");
        std::fs::write(&hook, "#!/bin/bash\necho setting up\necho oh no >&2\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let (m, mut rx) = manager(&tmp);
        let rt = LocalRuntime::new(&ws_dir);
        m.run_hook("ws", &rt, &hook).await.unwrap();

        let status = m.read_init_status("ws").await.unwrap();
        assert_eq!(status.status, InitOutcome::Success);
        assert!(status.lines.iter().any(|l| l.line == "setting up" && !l.is_error));
        assert!(status.lines.iter().any(|l| l.line == "oh no" && l.is_error));

        let events = drain(&mut rx);
        assert!(matches!(&events[0], InitEvent::Start { .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, InitEvent::Output { line, .. } if line == "setting up")));
        assert!(matches!(events.last(), Some(InitEvent::End { .. })));
    }

    #[tokio::test]
    async fn failing_hook_records_failure() {
        let tmp = TempDir::new().unwrap();
        let ws_dir = tmp.path().join("work");
        std::fs::create_dir_all(ws_dir.join(".mux")).unwrap();
        let hook = ws_dir.join(".mux/init");
        std::fs::write(&hook, "#!/bin/bash\nexit 7\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let (m, _rx) = manager(&tmp);
        let rt = LocalRuntime::new(&ws_dir);
        m.run_hook("ws", &rt, &hook).await.unwrap();

        let status = m.read_init_status("ws").await.unwrap();
        assert_eq!(status.status, InitOutcome::Failure);
        assert_eq!(status.exit_code, Some(7));
    }

    // ── wait_for_init ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn wait_resolves_immediately_without_record() {
        let tmp = TempDir::new().unwrap();
        let (m, _rx) = manager(&tmp);
        // Must not hang.
        m.wait_for_init("never-initialized").await;
    }

    #[tokio::test]
    async fn wait_blocks_until_end_init() {
        let tmp = TempDir::new().unwrap();
        let (m, _rx) = manager(&tmp);
        let m = Arc::new(m);
        m.start_init("ws", None).await.unwrap();

        let waiter = {
            let m = m.clone();
            tokio::spawn(async move { m.wait_for_init("ws").await })
        };
        // Give the waiter a chance to park.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        m.end_init("ws", 0).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .expect("waiter must resolve after end_init")
            .unwrap();
    }

    #[tokio::test]
    async fn stale_running_record_does_not_block() {
        // Simulate a crash: record says running, but the new process has no
        // live entry for it.
        let tmp = TempDir::new().unwrap();
        {
            let (m, _rx) = manager(&tmp);
            m.start_init("ws", None).await.unwrap();
            // Process "dies" here — no end_init.
        }
        let (m2, _rx) = manager(&tmp);
        tokio::time::timeout(std::time::Duration::from_secs(1), m2.wait_for_init("ws"))
            .await
            .expect("stale running record must not wedge waiters");
    }
}
