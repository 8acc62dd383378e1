// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::warn;

use crate::schema::{MuxConfig, WorkspaceMetadata};

/// Root directory for all persisted orchestrator state.
///
/// `MUX_ROOT` overrides the default of `~/.mux`; the value is tilde-expanded.
pub fn mux_root() -> PathBuf {
    if let Ok(root) = std::env::var("MUX_ROOT") {
        if !root.trim().is_empty() {
            return PathBuf::from(shellexpand::tilde(&root).into_owned());
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mux")
}

/// Per-workspace session directory (`chat.jsonl`, `partial.json`, …).
pub fn sessions_dir(root: &Path, workspace_id: &str) -> PathBuf {
    root.join("sessions").join(workspace_id)
}

/// Write `bytes` to `path` atomically (temp file + rename) so readers never
/// observe a torn document.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// The single durable config document with serialized read-modify-write.
///
/// Every writer goes through [`ConfigStore::edit_config`]; the in-process
/// mutex plus the fresh re-read inside the critical section guarantee that
/// no two editors ever observe overlapping writes.
pub struct ConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join("config.json"),
            lock: Mutex::new(()),
        }
    }

    /// Load a snapshot.  Never fails: a missing file yields the default empty
    /// document and a corrupt file is logged and replaced by the default on
    /// the next write.
    pub async fn load(&self) -> MuxConfig {
        read_config(&self.path).await
    }

    /// Read a fresh snapshot, apply `f`, write atomically.  Returns the
    /// document as written.
    pub async fn edit_config<F>(&self, f: F) -> anyhow::Result<MuxConfig>
    where
        F: FnOnce(&mut MuxConfig),
    {
        let _guard = self.lock.lock().await;
        // Re-read inside the lock so edits committed since the caller's last
        // snapshot are not lost.
        let mut config = read_config(&self.path).await;
        f(&mut config);
        let bytes = serde_json::to_vec_pretty(&config).context("serializing config")?;
        write_atomic(&self.path, &bytes).await?;
        Ok(config)
    }

    pub async fn find_workspace(&self, id: &str) -> Option<WorkspaceMetadata> {
        self.load().await.find_workspace(id).cloned()
    }

    pub async fn all_workspaces(&self) -> Vec<WorkspaceMetadata> {
        self.load().await.all_workspaces()
    }

    /// Edit a single workspace entry by id.  Returns `false` when no such
    /// workspace exists (the document is still rewritten unchanged).
    pub async fn edit_workspace<F>(&self, id: &str, f: F) -> anyhow::Result<bool>
    where
        F: FnOnce(&mut WorkspaceMetadata),
    {
        let id = id.to_string();
        let mut found = false;
        self.edit_config(|cfg| {
            if let Some(ws) = cfg.find_workspace_mut(&id) {
                f(ws);
                found = true;
            }
        })
        .await?;
        Ok(found)
    }
}

async fn read_config(path: &Path) -> MuxConfig {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config document corrupt — using defaults");
                MuxConfig::default()
            }
        },
        Err(_) => MuxConfig::default(),
    }
}

/// Secrets are stored in a separate document (`secrets.json`) so filesystem
/// permissions can differ from the main config.  Keyed by project path.
pub struct SecretsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

type SecretsDoc = HashMap<String, HashMap<String, String>>;

impl SecretsStore {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join("secrets.json"),
            lock: Mutex::new(()),
        }
    }

    pub async fn for_project(&self, project_path: &str) -> HashMap<String, String> {
        self.read().await.remove(project_path).unwrap_or_default()
    }

    pub async fn set(
        &self,
        project_path: &str,
        name: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await;
        doc.entry(project_path.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
        let bytes = serde_json::to_vec_pretty(&doc).context("serializing secrets")?;
        write_atomic(&self.path, &bytes).await
    }

    async fn read(&self) -> SecretsDoc {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => SecretsDoc::default(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
