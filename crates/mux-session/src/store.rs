// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use mux_model::ChatMessage;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Cached per-workspace log state, guarded by the per-workspace mutex.
#[derive(Default)]
struct LogState {
    /// Highest `historySequence` ever assigned; loaded lazily by scanning
    /// `chat.jsonl` so it survives process restarts.  Sequences are never
    /// reused, even after truncation.
    max_sequence: Option<u64>,
}

/// Durable per-workspace conversation storage.
///
/// Layout under the sessions root:
///   `<workspaceId>/chat.jsonl`   — one message per line, append-only
///   `<workspaceId>/partial.json` — at most one in-flight assistant message
///   `<workspaceId>/queue.json`   — user messages queued behind a stream
pub struct SessionStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<LogState>>>>,
}

impl SessionStore {
    pub fn new(sessions_root: impl Into<PathBuf>) -> Self {
        Self {
            root: sessions_root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace_dir(&self, workspace_id: &str) -> PathBuf {
        self.root.join(workspace_id)
    }

    fn chat_path(&self, ws: &str) -> PathBuf {
        self.workspace_dir(ws).join("chat.jsonl")
    }

    fn partial_path(&self, ws: &str) -> PathBuf {
        self.workspace_dir(ws).join("partial.json")
    }

    fn queue_path(&self, ws: &str) -> PathBuf {
        self.workspace_dir(ws).join("queue.json")
    }

    async fn lock_for(&self, ws: &str) -> Arc<Mutex<LogState>> {
        self.locks
            .lock()
            .await
            .entry(ws.to_string())
            .or_default()
            .clone()
    }

    // ── History log ───────────────────────────────────────────────────────────

    /// Append a message, assigning the next `historySequence` atomically.
    /// Returns the assigned sequence.
    pub async fn append_to_history(
        &self,
        ws: &str,
        mut msg: ChatMessage,
    ) -> Result<u64, SessionError> {
        let lock = self.lock_for(ws).await;
        let mut state = lock.lock().await;
        let seq = self.next_sequence(ws, &mut state).await?;
        msg.metadata_mut().history_sequence = Some(seq);
        self.append_line(ws, &msg).await?;
        Ok(seq)
    }

    /// Rewrite the record with `msg.id` in place.  The stored sequence is
    /// preserved when the replacement does not carry one.  Returns `false`
    /// when no such record exists.
    pub async fn update_history(&self, ws: &str, msg: ChatMessage) -> Result<bool, SessionError> {
        let lock = self.lock_for(ws).await;
        let _state = lock.lock().await;
        let mut messages = self.read_lines(ws).await?;
        let mut found = false;
        for existing in messages.iter_mut() {
            if existing.id == msg.id {
                let mut replacement = msg.clone();
                if replacement
                    .metadata
                    .as_ref()
                    .and_then(|m| m.history_sequence)
                    .is_none()
                {
                    replacement.metadata_mut().history_sequence =
                        existing.metadata.as_ref().and_then(|m| m.history_sequence);
                }
                *existing = replacement;
                found = true;
                break;
            }
        }
        if found {
            self.rewrite(ws, &messages).await?;
        }
        Ok(found)
    }

    /// Remove the record with `id`.  Returns `false` when absent.
    pub async fn delete_message(&self, ws: &str, id: &str) -> Result<bool, SessionError> {
        let lock = self.lock_for(ws).await;
        let _state = lock.lock().await;
        let mut messages = self.read_lines(ws).await?;
        let before = messages.len();
        messages.retain(|m| m.id != id);
        if messages.len() == before {
            return Ok(false);
        }
        self.rewrite(ws, &messages).await?;
        Ok(true)
    }

    pub async fn read_history(&self, ws: &str) -> Result<Vec<ChatMessage>, SessionError> {
        let lock = self.lock_for(ws).await;
        let _state = lock.lock().await;
        self.read_lines(ws).await
    }

    /// Keep only the first `keep` messages.  Sequences are not reset — the
    /// next append continues from the historical maximum.
    pub async fn retain_first(&self, ws: &str, keep: usize) -> Result<(), SessionError> {
        let lock = self.lock_for(ws).await;
        let _state = lock.lock().await;
        let mut messages = self.read_lines(ws).await?;
        messages.truncate(keep);
        self.rewrite(ws, &messages).await
    }

    /// Replace the entire history with `messages`, assigning fresh sequences
    /// that continue from the historical maximum.
    pub async fn replace_history(
        &self,
        ws: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<(), SessionError> {
        let lock = self.lock_for(ws).await;
        let mut state = lock.lock().await;
        let mut renumbered = Vec::with_capacity(messages.len());
        for mut msg in messages {
            let seq = self.next_sequence(ws, &mut state).await?;
            msg.metadata_mut().history_sequence = Some(seq);
            renumbered.push(msg);
        }
        self.rewrite(ws, &renumbered).await
    }

    /// Delete the workspace's session directory entirely.
    pub async fn remove_session(&self, ws: &str) -> Result<(), SessionError> {
        let lock = self.lock_for(ws).await;
        let mut state = lock.lock().await;
        let dir = self.workspace_dir(ws);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        state.max_sequence = None;
        Ok(())
    }

    // ── Partial slot ──────────────────────────────────────────────────────────

    /// Swap-write the partial slot: readers see either the old or the new
    /// message, never a torn read.
    pub async fn write_partial(&self, ws: &str, msg: &ChatMessage) -> Result<(), SessionError> {
        let dir = self.workspace_dir(ws);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.partial_path(ws);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(msg)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn read_partial(&self, ws: &str) -> Option<ChatMessage> {
        let bytes = tokio::fs::read(self.partial_path(ws)).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(workspace = ws, error = %e, "partial slot corrupt — ignoring");
                None
            }
        }
    }

    pub async fn delete_partial(&self, ws: &str) -> Result<(), SessionError> {
        match tokio::fs::remove_file(self.partial_path(ws)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Promote the partial message into the history log and clear the slot.
    ///
    /// Idempotent: no partial is a no-op; a partial whose id already exists
    /// in history only clears the slot.  Returns the assigned sequence when
    /// a message was actually appended.
    pub async fn commit_to_history(&self, ws: &str) -> Result<Option<u64>, SessionError> {
        let Some(partial) = self.read_partial(ws).await else {
            return Ok(None);
        };
        let lock = self.lock_for(ws).await;
        let mut state = lock.lock().await;
        let existing = self.read_lines(ws).await?;
        if existing.iter().any(|m| m.id == partial.id) {
            drop(state);
            self.delete_partial(ws).await?;
            return Ok(None);
        }
        let mut msg = partial;
        let seq = self.next_sequence(ws, &mut state).await?;
        msg.metadata_mut().history_sequence = Some(seq);
        self.append_line(ws, &msg).await?;
        drop(state);
        self.delete_partial(ws).await?;
        Ok(Some(seq))
    }

    // ── Queued messages ───────────────────────────────────────────────────────

    pub async fn queued_messages(&self, ws: &str) -> Vec<String> {
        match tokio::fs::read(self.queue_path(ws)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn push_queued(&self, ws: &str, text: &str) -> Result<(), SessionError> {
        let mut queue = self.queued_messages(ws).await;
        queue.push(text.to_string());
        self.write_queue(ws, &queue).await
    }

    pub async fn pop_queued(&self, ws: &str) -> Result<Option<String>, SessionError> {
        let mut queue = self.queued_messages(ws).await;
        if queue.is_empty() {
            return Ok(None);
        }
        let first = queue.remove(0);
        self.write_queue(ws, &queue).await?;
        Ok(Some(first))
    }

    pub async fn clear_queue(&self, ws: &str) -> Result<(), SessionError> {
        self.write_queue(ws, &[]).await
    }

    async fn write_queue(&self, ws: &str, queue: &[String]) -> Result<(), SessionError> {
        let dir = self.workspace_dir(ws);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.queue_path(ws);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(queue)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    // ── Internals (callers hold the per-workspace lock) ───────────────────────

    async fn next_sequence(&self, ws: &str, state: &mut LogState) -> Result<u64, SessionError> {
        if state.max_sequence.is_none() {
            let max = self
                .read_lines(ws)
                .await?
                .iter()
                .filter_map(|m| m.metadata.as_ref().and_then(|md| md.history_sequence))
                .max()
                .unwrap_or(0);
            state.max_sequence = Some(max);
        }
        let next = state.max_sequence.unwrap() + 1;
        state.max_sequence = Some(next);
        Ok(next)
    }

    async fn append_line(&self, ws: &str, msg: &ChatMessage) -> Result<(), SessionError> {
        let dir = self.workspace_dir(ws);
        tokio::fs::create_dir_all(&dir).await?;
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.chat_path(ws))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_lines(&self, ws: &str) -> Result<Vec<ChatMessage>, SessionError> {
        let text = match tokio::fs::read_to_string(self.chat_path(ws)).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut messages = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(workspace = ws, error = %e, "skipping corrupt chat line"),
            }
        }
        Ok(messages)
    }

    async fn rewrite(&self, ws: &str, messages: &[ChatMessage]) -> Result<(), SessionError> {
        let dir = self.workspace_dir(ws);
        tokio::fs::create_dir_all(&dir).await?;
        let mut out = Vec::new();
        for msg in messages {
            out.extend(serde_json::to_vec(msg)?);
            out.push(b'\n');
        }
        let path = self.chat_path(ws);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &out).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
