// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use mux_config::{ConfigStore, ThinkingLevel, TaskStatus, WorkspaceMetadata};
use mux_model::ChatMessage;
use mux_runtime::CreateWorkspaceParams;
use mux_session::{InitStateManager, SessionStore};
use mux_tools::PolicyFilter;

use crate::error::OrchestratorError;
use crate::events::{EventBus, WorkspaceEvent};
use crate::orchestrator::{Orchestrator, RuntimeFactory, StreamMessageParams};
use crate::stream::{StreamManager, StreamOutcome};

/// A crashed rename must not leave the workspace locked forever.
const RENAME_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct CreateWorkspaceRequest {
    pub project_path: String,
    pub name: String,
    /// Compact runtime string (`None` → worktree).
    pub runtime_config: Option<String>,
    pub agent_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SendMessageOptions {
    pub model: Option<String>,
    pub thinking_level: Option<ThinkingLevel>,
    pub agent_id: Option<String>,
    /// Permit sending into a task workspace that is still `queued`.
    pub allow_queued_agent_task: bool,
    pub additional_system_instructions: Option<String>,
    pub policy_override: Option<Vec<PolicyFilter>>,
}

/// The slice of workspace operations the task service depends on.
/// Production wires [`WorkspaceService`]; tests wire a recording mock.
#[async_trait]
pub trait WorkspaceOps: Send + Sync {
    async fn send_message(
        &self,
        id: &str,
        text: &str,
        opts: SendMessageOptions,
    ) -> Result<StreamOutcome, OrchestratorError>;
    async fn resume_stream(
        &self,
        id: &str,
        opts: SendMessageOptions,
    ) -> Result<StreamOutcome, OrchestratorError>;
    async fn interrupt_stream(&self, id: &str, abandon_partial: bool);
    /// Create the runtime directory and run the init hook for a workspace
    /// whose metadata already exists (deferred for queued tasks).
    async fn materialize_workspace(&self, id: &str) -> Result<(), OrchestratorError>;
    async fn remove_workspace(&self, id: &str, force: bool) -> Result<(), OrchestratorError>;
    fn is_streaming(&self, id: &str) -> bool;
}

/// Public API surface for workspace lifecycle and messaging.  Serializes
/// per-workspace mutations and owns the advisory rename lock.
pub struct WorkspaceService {
    config: Arc<ConfigStore>,
    sessions: Arc<SessionStore>,
    events: Arc<EventBus>,
    streams: Arc<StreamManager>,
    orchestrator: Arc<Orchestrator>,
    init: Arc<InitStateManager>,
    runtime_factory: RuntimeFactory,
    rename_locks: Mutex<HashMap<String, Instant>>,
}

impl WorkspaceService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConfigStore>,
        sessions: Arc<SessionStore>,
        events: Arc<EventBus>,
        streams: Arc<StreamManager>,
        orchestrator: Arc<Orchestrator>,
        init: Arc<InitStateManager>,
        runtime_factory: RuntimeFactory,
    ) -> Self {
        Self {
            config,
            sessions,
            events,
            streams,
            orchestrator,
            init,
            runtime_factory,
            rename_locks: Mutex::new(HashMap::new()),
        }
    }

    // ── Rename lock ───────────────────────────────────────────────────────────

    /// Acquire the advisory rename lock.  Returns `false` when already held
    /// (and not expired).
    pub fn lock_rename(&self, id: &str) -> bool {
        let mut locks = self.rename_locks.lock().unwrap();
        match locks.get(id) {
            Some(at) if at.elapsed() < RENAME_LOCK_TIMEOUT => false,
            _ => {
                locks.insert(id.to_string(), Instant::now());
                true
            }
        }
    }

    pub fn unlock_rename(&self, id: &str) {
        self.rename_locks.lock().unwrap().remove(id);
    }

    pub fn rename_locked(&self, id: &str) -> bool {
        let mut locks = self.rename_locks.lock().unwrap();
        match locks.get(id) {
            Some(at) if at.elapsed() < RENAME_LOCK_TIMEOUT => true,
            Some(_) => {
                // Expired leftovers from a crashed rename are pruned here.
                locks.remove(id);
                false
            }
            None => false,
        }
    }

    fn refuse_if_renaming(&self, id: &str) -> Result<(), OrchestratorError> {
        if self.rename_locked(id) {
            return Err(OrchestratorError::unknown(format!(
                "workspace {id} is being renamed"
            )));
        }
        Ok(())
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    pub async fn create(
        &self,
        req: CreateWorkspaceRequest,
    ) -> Result<WorkspaceMetadata, OrchestratorError> {
        validate_name(&req.name)?;
        let config = self.config.load().await;
        if config.name_in_use(&req.project_path, &req.name) {
            return Err(OrchestratorError::NameConflict { name: req.name });
        }

        let mut meta = WorkspaceMetadata::new(&req.name, &req.project_path);
        meta.runtime_config = req.runtime_config.clone();
        meta.agent_type = req.agent_type.clone();
        let meta_clone = meta.clone();
        let project_path = req.project_path.clone();
        self.config
            .edit_config(move |cfg| {
                cfg.project_mut(&project_path).workspaces.push(meta_clone);
            })
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;

        self.materialize_workspace(&meta.id).await?;
        self.events.emit(WorkspaceEvent::Metadata {
            workspace_id: meta.id.clone(),
        });
        Ok(meta)
    }

    pub async fn rename(&self, id: &str, new_name: &str) -> Result<(), OrchestratorError> {
        if self.streams.is_streaming(id) {
            return Err(OrchestratorError::StreamActive);
        }
        validate_name(new_name)?;
        let meta = self
            .config
            .find_workspace(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound { id: id.to_string() })?;
        let config = self.config.load().await;
        if config.name_in_use(&meta.project_path, new_name) {
            return Err(OrchestratorError::NameConflict {
                name: new_name.to_string(),
            });
        }

        if !self.lock_rename(id) {
            return Err(OrchestratorError::unknown(format!(
                "workspace {id} is being renamed"
            )));
        }
        // Directories are keyed by workspace id, so the rename is a pure
        // metadata rewrite; the lock still fences concurrent send/resume.
        let new_name_owned = new_name.to_string();
        let result = self
            .config
            .edit_workspace(id, move |w| w.name = new_name_owned)
            .await;
        self.unlock_rename(id);
        result.map_err(|e| OrchestratorError::unknown(e.to_string()))?;
        self.events.emit(WorkspaceEvent::Metadata {
            workspace_id: id.to_string(),
        });
        Ok(())
    }

    pub async fn fork(
        &self,
        src_id: &str,
        new_name: Option<&str>,
    ) -> Result<WorkspaceMetadata, OrchestratorError> {
        let src = self
            .config
            .find_workspace(src_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound {
                id: src_id.to_string(),
            })?;
        let config = self.config.load().await;
        let name = match new_name {
            Some(n) => {
                validate_name(n)?;
                if config.name_in_use(&src.project_path, n) {
                    return Err(OrchestratorError::NameConflict { name: n.into() });
                }
                n.to_string()
            }
            None => next_fork_name(&config, &src.project_path, &src.name),
        };

        let mut meta = WorkspaceMetadata::new(&name, &src.project_path);
        meta.runtime_config = src.runtime_config.clone();
        meta.agent_type = src.agent_type.clone();
        meta.ai_settings = src.ai_settings.clone();
        let meta_clone = meta.clone();
        let project_path = src.project_path.clone();
        self.config
            .edit_config(move |cfg| {
                cfg.project_mut(&project_path).workspaces.push(meta_clone);
            })
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;

        self.materialize_workspace(&meta.id).await?;

        // Clone the conversation so the fork continues from the same state.
        let history = self
            .sessions
            .read_history(src_id)
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
        self.sessions
            .replace_history(&meta.id, history)
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;

        self.events.emit(WorkspaceEvent::Metadata {
            workspace_id: meta.id.clone(),
        });
        Ok(meta)
    }

    /// Archive a workspace: it keeps its history but leaves the active set,
    /// freeing its name for reuse.
    pub async fn archive(&self, id: &str) -> Result<(), OrchestratorError> {
        if self.streams.is_streaming(id) {
            return Err(OrchestratorError::StreamActive);
        }
        let found = self
            .config
            .edit_workspace(id, |w| {
                w.archived_at = Some(chrono::Utc::now());
                w.unarchived_at = None;
            })
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
        if !found {
            return Err(OrchestratorError::NotFound { id: id.to_string() });
        }
        self.events.emit(WorkspaceEvent::Metadata {
            workspace_id: id.to_string(),
        });
        Ok(())
    }

    /// Restore an archived workspace.  Fails with `name_conflict` when its
    /// name has been taken in the meantime.
    pub async fn unarchive(&self, id: &str) -> Result<(), OrchestratorError> {
        let meta = self
            .config
            .find_workspace(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound { id: id.to_string() })?;
        let config = self.config.load().await;
        if config.name_in_use(&meta.project_path, &meta.name) {
            return Err(OrchestratorError::NameConflict { name: meta.name });
        }
        self.config
            .edit_workspace(id, |w| {
                w.archived_at = None;
                w.unarchived_at = Some(chrono::Utc::now());
            })
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
        self.events.emit(WorkspaceEvent::Metadata {
            workspace_id: id.to_string(),
        });
        Ok(())
    }

    pub async fn remove(&self, id: &str, force: bool) -> Result<(), OrchestratorError> {
        if self.streams.is_streaming(id) && !force {
            return Err(OrchestratorError::StreamActive);
        }
        self.streams.stop_stream(id, false);

        if let Some(meta) = self.config.find_workspace(id).await {
            let runtime = (self.runtime_factory)(&meta);
            if let Err(e) = runtime.remove_workspace().await {
                warn!(workspace = id, error = %e, "runtime teardown failed");
            }
        }
        self.sessions
            .remove_session(id)
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
        let id_owned = id.to_string();
        self.config
            .edit_config(move |cfg| {
                cfg.remove_workspace(&id_owned);
            })
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
        self.events.remove(id);
        Ok(())
    }

    // ── Messaging ─────────────────────────────────────────────────────────────

    pub async fn send_message(
        &self,
        id: &str,
        text: &str,
        opts: SendMessageOptions,
    ) -> Result<StreamOutcome, OrchestratorError> {
        self.refuse_if_renaming(id)?;
        let meta = self
            .config
            .find_workspace(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound { id: id.to_string() })?;

        if meta.task_status == Some(TaskStatus::Queued) && !opts.allow_queued_agent_task {
            return Err(OrchestratorError::unknown(format!(
                "task workspace {id} is queued"
            )));
        }

        if self.streams.is_streaming(id) {
            self.sessions
                .push_queued(id, text)
                .await
                .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
            self.events.emit(WorkspaceEvent::QueuedMessageChanged {
                workspace_id: id.to_string(),
                queued: self.sessions.queued_messages(id).await,
            });
            return Ok(StreamOutcome::Queued);
        }

        // Promote any partial left by a prior interrupted stream before the
        // new user turn lands (idempotent).
        self.sessions
            .commit_to_history(id)
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
        self.sessions
            .append_to_history(id, ChatMessage::user(text))
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;

        let mut outcome = self.run_stream(id, &meta, &opts).await?;

        // Drain messages queued behind the stream we just finished.
        while outcome == StreamOutcome::Completed {
            let Some(next) = self
                .sessions
                .pop_queued(id)
                .await
                .map_err(|e| OrchestratorError::unknown(e.to_string()))?
            else {
                break;
            };
            self.events.emit(WorkspaceEvent::QueuedMessageChanged {
                workspace_id: id.to_string(),
                queued: self.sessions.queued_messages(id).await,
            });
            self.sessions
                .append_to_history(id, ChatMessage::user(&next))
                .await
                .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
            outcome = self.run_stream(id, &meta, &opts).await?;
        }
        Ok(outcome)
    }

    pub async fn resume_stream(
        &self,
        id: &str,
        opts: SendMessageOptions,
    ) -> Result<StreamOutcome, OrchestratorError> {
        self.refuse_if_renaming(id)?;
        let meta = self
            .config
            .find_workspace(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound { id: id.to_string() })?;
        self.run_stream(id, &meta, &opts).await
    }

    pub async fn interrupt_stream(&self, id: &str, abandon_partial: bool) {
        self.streams.stop_stream(id, abandon_partial);
    }

    async fn run_stream(
        &self,
        id: &str,
        meta: &WorkspaceMetadata,
        opts: &SendMessageOptions,
    ) -> Result<StreamOutcome, OrchestratorError> {
        let model = opts
            .model
            .clone()
            .or_else(|| meta.task_model_string.clone())
            .or_else(|| meta.ai_settings.as_ref().and_then(|a| a.model.clone()))
            .ok_or_else(|| OrchestratorError::InvalidModelString {
                message: "no model configured for this workspace".into(),
            })?;
        debug!(workspace = id, model = %model, "starting stream");
        self.orchestrator
            .stream_message(StreamMessageParams {
                workspace_id: id.to_string(),
                model,
                thinking_level: opts
                    .thinking_level
                    .or(meta.task_thinking_level)
                    .or_else(|| meta.ai_settings.as_ref().and_then(|a| a.thinking_level)),
                agent_id: opts.agent_id.clone(),
                additional_system_instructions: opts.additional_system_instructions.clone(),
                max_output_tokens: None,
                provider_options: serde_json::Value::Null,
                policy_override: opts.policy_override.clone(),
            })
            .await
    }

    // ── Persistent history edits ──────────────────────────────────────────────

    /// Remove the trailing `fraction` (0–1) of the history; `None` clears
    /// the whole log.
    pub async fn truncate_history(
        &self,
        id: &str,
        fraction: Option<f64>,
    ) -> Result<(), OrchestratorError> {
        if self.streams.is_streaming(id) {
            return Err(OrchestratorError::StreamActive);
        }
        self.refuse_if_renaming(id)?;
        let history = self
            .sessions
            .read_history(id)
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
        let keep = match fraction {
            None => 0,
            Some(f) => {
                let f = f.clamp(0.0, 1.0);
                history.len() - ((history.len() as f64 * f).ceil() as usize).min(history.len())
            }
        };
        self.sessions
            .retain_first(id, keep)
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
        Ok(())
    }

    pub async fn clear_queue(&self, id: &str) -> Result<(), OrchestratorError> {
        if self.streams.is_streaming(id) {
            return Err(OrchestratorError::StreamActive);
        }
        self.refuse_if_renaming(id)?;
        self.sessions
            .clear_queue(id)
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
        self.events.emit(WorkspaceEvent::QueuedMessageChanged {
            workspace_id: id.to_string(),
            queued: Vec::new(),
        });
        Ok(())
    }

    /// Replace the entire conversation with a single summary message
    /// (post-compaction).
    pub async fn replace_chat_history(
        &self,
        id: &str,
        summary: ChatMessage,
    ) -> Result<(), OrchestratorError> {
        if self.streams.is_streaming(id) {
            return Err(OrchestratorError::StreamActive);
        }
        self.refuse_if_renaming(id)?;
        self.sessions
            .replace_history(id, vec![summary])
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
        Ok(())
    }

    pub async fn replay_stream(&self, id: &str) {
        self.streams.replay_stream(id).await;
    }
}

#[async_trait]
impl WorkspaceOps for WorkspaceService {
    async fn send_message(
        &self,
        id: &str,
        text: &str,
        opts: SendMessageOptions,
    ) -> Result<StreamOutcome, OrchestratorError> {
        WorkspaceService::send_message(self, id, text, opts).await
    }

    async fn resume_stream(
        &self,
        id: &str,
        opts: SendMessageOptions,
    ) -> Result<StreamOutcome, OrchestratorError> {
        WorkspaceService::resume_stream(self, id, opts).await
    }

    async fn interrupt_stream(&self, id: &str, abandon_partial: bool) {
        WorkspaceService::interrupt_stream(self, id, abandon_partial).await
    }

    async fn materialize_workspace(&self, id: &str) -> Result<(), OrchestratorError> {
        let meta = self
            .config
            .find_workspace(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound { id: id.to_string() })?;
        let runtime = (self.runtime_factory)(&meta);
        let created = runtime
            .create_workspace(CreateWorkspaceParams {
                project_path: meta.project_path.clone().into(),
                branch_name: format!("mux/{}", meta.name),
                trunk_branch: None,
                directory_name: format!("{}-{}", meta.name, meta.id),
            })
            .await
            .map_err(|e| OrchestratorError::RuntimeStartFailed {
                message: e.to_string(),
            })?;

        match created.init_hook {
            Some(hook) => {
                let init = self.init.clone();
                let ws = id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = init.run_hook(&ws, runtime.as_ref(), &hook).await {
                        warn!(workspace = %ws, error = %e, "init hook bookkeeping failed");
                    }
                });
            }
            None => {
                self.init
                    .mark_no_hook(id)
                    .await
                    .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn remove_workspace(&self, id: &str, force: bool) -> Result<(), OrchestratorError> {
        self.remove(id, force).await
    }

    fn is_streaming(&self, id: &str) -> bool {
        self.streams.is_streaming(id)
    }
}

fn validate_name(name: &str) -> Result<(), OrchestratorError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' ' | '.'));
    if ok {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidName {
            name: name.to_string(),
        })
    }
}

/// First `"<base>-<n>"` (n ≥ 2) not in use among non-archived workspaces.
fn next_fork_name(config: &mux_config::MuxConfig, project_path: &str, base: &str) -> String {
    for n in 2.. {
        let candidate = format!("{base}-{n}");
        if !config.name_in_use(project_path, &candidate) {
            return candidate;
        }
    }
    unreachable!("fork suffix search is unbounded")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
