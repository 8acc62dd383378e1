// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use mux_agents::AgentLoader;
use mux_config::{AgentMode, ConfigStore, SecretsStore, ThinkingLevel, WorkspaceMetadata};
use mux_model::{ChatMessage, ProviderRegistry};
use mux_runtime::{ReadyErrorType, Runtime};
use mux_session::{InitStateManager, SessionStore};
use mux_tools::{resolve_tool_policy, PolicyFilter, ResolvePolicyInput, ToolCtx, ToolRegistry};

use crate::error::OrchestratorError;
use crate::events::{EventBus, WorkspaceEvent};
use crate::stream::{StartStreamParams, StreamManager, StreamOutcome};

/// Builds the runtime adapter for a workspace from its persisted metadata.
pub type RuntimeFactory = Arc<dyn Fn(&WorkspaceMetadata) -> Arc<dyn Runtime> + Send + Sync>;

/// Builds the full (unfiltered) tool registry for one stream.
pub type ToolSetFactory = Arc<dyn Fn() -> ToolRegistry + Send + Sync>;

pub struct StreamMessageParams {
    pub workspace_id: String,
    pub model: String,
    pub thinking_level: Option<ThinkingLevel>,
    pub agent_id: Option<String>,
    pub additional_system_instructions: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub provider_options: Value,
    /// Replaces the resolved policy entirely (e.g. the restart path that
    /// requires `agent_report`).
    pub policy_override: Option<Vec<PolicyFilter>>,
}

impl StreamMessageParams {
    pub fn new(workspace_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            model: model.into(),
            thinking_level: None,
            agent_id: None,
            additional_system_instructions: None,
            max_output_tokens: None,
            provider_options: Value::Null,
            policy_override: None,
        }
    }
}

/// Top-level `stream_message` pipeline: prepares messages, resolves the
/// agent and tool policy, and hands a ready stream to the stream manager.
pub struct Orchestrator {
    config: Arc<ConfigStore>,
    secrets: Arc<SecretsStore>,
    sessions: Arc<SessionStore>,
    events: Arc<EventBus>,
    streams: Arc<StreamManager>,
    providers: Arc<ProviderRegistry>,
    agents: Arc<AgentLoader>,
    init: Arc<InitStateManager>,
    runtime_factory: RuntimeFactory,
    tool_factory: ToolSetFactory,
}

#[allow(clippy::too_many_arguments)]
impl Orchestrator {
    pub fn new(
        config: Arc<ConfigStore>,
        secrets: Arc<SecretsStore>,
        sessions: Arc<SessionStore>,
        events: Arc<EventBus>,
        streams: Arc<StreamManager>,
        providers: Arc<ProviderRegistry>,
        agents: Arc<AgentLoader>,
        init: Arc<InitStateManager>,
        runtime_factory: RuntimeFactory,
        tool_factory: ToolSetFactory,
    ) -> Self {
        Self {
            config,
            secrets,
            sessions,
            events,
            streams,
            providers,
            agents,
            init,
            runtime_factory,
            tool_factory,
        }
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    /// Drive one model response for the workspace, executing tool calls
    /// until the model finishes.  Returns when the stream reaches a
    /// terminal event (or fails one of the preparation phases).
    pub async fn stream_message(
        &self,
        params: StreamMessageParams,
    ) -> Result<StreamOutcome, OrchestratorError> {
        let ws = params.workspace_id.clone();

        // 1. Claim the stream slot up front so a racing stop_stream has
        //    something to cancel even before the provider is invoked.
        let assistant_message_id = uuid::Uuid::new_v4().to_string();
        let guard = self.streams.begin(&ws, &assistant_message_id)?;

        // 2. Promote any interrupted partial from a previous run.
        self.sessions
            .commit_to_history(&ws)
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;

        // 3. Construct the provider handle (validates model string + keys).
        let provider = self.providers.create(&params.model)?;

        // 4. Prepare the message list.
        let ws_meta = self
            .config
            .find_workspace(&ws)
            .await
            .ok_or_else(|| OrchestratorError::NotFound { id: ws.clone() })?;
        let mut messages = self
            .sessions
            .read_history(&ws)
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
        filter_messages(&mut messages);

        let agent_id = params
            .agent_id
            .clone()
            .or_else(|| ws_meta.agent_type.clone())
            .unwrap_or_else(|| "exec".to_string());
        self.inject_agent_transition(&ws, &ws_meta, &agent_id, &mut messages)
            .await;

        // 5. Workspace readiness gates everything that touches the runtime.
        self.init.wait_for_init(&ws).await;
        let runtime = (self.runtime_factory)(&ws_meta);
        let ready = runtime.ensure_ready(None).await;
        if !ready.ready {
            let message = ready.error.unwrap_or_else(|| "runtime unavailable".into());
            let err = match ready.error_type {
                Some(ReadyErrorType::RuntimeStartFailed) => OrchestratorError::RuntimeStartFailed {
                    message: message.clone(),
                },
                _ => OrchestratorError::RuntimeNotReady {
                    message: message.clone(),
                },
            };
            // Subscribers learn about the failure through the event stream
            // even though no provider stream ever started.
            self.events.emit(WorkspaceEvent::StreamError {
                workspace_id: ws.clone(),
                message_id: assistant_message_id.clone(),
                error: message,
                error_type: err.kind().to_string(),
            });
            return Err(err);
        }

        // 6. Agent resolution.
        let workspace_path = runtime.workspace_dir().to_path_buf();
        let pkg = self
            .agents
            .read(runtime.as_ref(), &workspace_path, &agent_id)
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;
        let effective_mode = pkg.frontmatter.policy.base.unwrap_or(AgentMode::Exec);
        let is_subagent = ws_meta.parent_workspace_id.is_some();
        let config_doc = self.config.load().await;
        let depth = task_depth(&config_doc, &ws);
        let disable_task_tools_for_depth =
            depth >= config_doc.task_settings().max_task_nesting_depth;

        // 7. Tool-policy resolution.
        let policy = match &params.policy_override {
            Some(p) => p.clone(),
            None => resolve_tool_policy(&ResolvePolicyInput {
                mode: effective_mode,
                frontmatter: &pkg.frontmatter,
                is_subagent,
                disable_task_tools_for_depth,
            }),
        };

        // 8. System prompt assembly.
        let system = self
            .assemble_system_prompt(
                runtime.as_ref(),
                &workspace_path,
                &agent_id,
                effective_mode,
                params.additional_system_instructions.as_deref(),
            )
            .await?;

        // 9. Tool selection: filter the registry, never mutate tools.
        let registry = (self.tool_factory)();
        let tools = registry
            .filtered(&policy)
            .map_err(|e| OrchestratorError::PolicyDenied {
                message: e.to_string(),
            })?;

        // 10. Claim a history sequence with an empty assistant placeholder.
        let placeholder = ChatMessage::assistant_placeholder(&assistant_message_id);
        self.sessions
            .append_to_history(&ws, placeholder)
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;

        // 11. Hand off to the stream manager and await the terminal event.
        let secrets = self.secrets.for_project(&ws_meta.project_path).await;
        let tool_ctx = ToolCtx::new(ws.clone(), runtime.clone())
            .with_abort(guard.abort_receiver());
        let tool_ctx = ToolCtx {
            secrets,
            costs_usd: self.streams.costs_usd(&ws),
            ..tool_ctx
        };

        let thinking_level = params.thinking_level.or_else(|| {
            ws_meta
                .ai_settings
                .as_ref()
                .and_then(|a| a.thinking_level)
        });

        debug!(workspace = %ws, agent = %agent_id, mode = %effective_mode, "dispatching stream");
        Ok(guard
            .run(StartStreamParams {
                messages,
                system,
                provider,
                tools,
                tool_ctx,
                max_output_tokens: params.max_output_tokens,
                thinking_level,
                provider_options: params.provider_options,
            })
            .await)
    }

    async fn assemble_system_prompt(
        &self,
        runtime: &dyn Runtime,
        workspace_path: &Path,
        agent_id: &str,
        mode: AgentMode,
        additional: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let mut system = self
            .agents
            .resolve_body(runtime, workspace_path, agent_id)
            .await
            .map_err(|e| OrchestratorError::unknown(e.to_string()))?;

        if let Some(extra) = additional {
            if !extra.is_empty() {
                system.push_str("\n\n");
                system.push_str(extra);
            }
        }

        if mode == AgentMode::Plan {
            if let Ok(bytes) = runtime
                .read_file(Path::new(mux_tools::builtin::plan::PLAN_FILE_REL))
                .await
            {
                let plan = String::from_utf8_lossy(&bytes);
                if !plan.trim().is_empty() {
                    system.push_str("\n\n## Current plan\n\n");
                    system.push_str(&plan);
                }
            }
        }

        let subagents = self.agents.discover(runtime, workspace_path).await;
        let runnable: Vec<String> = subagents
            .iter()
            .filter(|a| a.subagent_runnable)
            .map(|a| {
                format!(
                    "- {} — {}",
                    a.id,
                    a.description.as_deref().unwrap_or("(no description)")
                )
            })
            .collect();
        if !runnable.is_empty() {
            system.push_str("\n\n## Available subagents\n\n");
            system.push_str(&runnable.join("\n"));
        }

        Ok(system)
    }

    /// Record the agent in workspace metadata and inject a transition
    /// sentinel into the conversation when it changed mid-session.
    async fn inject_agent_transition(
        &self,
        ws: &str,
        ws_meta: &WorkspaceMetadata,
        agent_id: &str,
        messages: &mut Vec<ChatMessage>,
    ) {
        let previous = ws_meta.agent_type.as_deref();
        if previous == Some(agent_id) {
            return;
        }
        if previous.is_some() && !messages.is_empty() {
            let mut sentinel =
                ChatMessage::user(format!("[switched to agent: {agent_id}]"));
            sentinel.metadata_mut().synthetic = Some(true);
            messages.push(sentinel);
        }
        let agent_id = agent_id.to_string();
        if let Err(e) = self
            .config
            .edit_workspace(ws, move |w| w.agent_type = Some(agent_id))
            .await
        {
            warn!(workspace = %ws, error = %e, "failed to record agent type");
        }
    }
}

/// Drop assistant messages that carry nothing — except reasoning-only
/// messages, which some providers require for extended-thinking replay.
fn filter_messages(messages: &mut Vec<ChatMessage>) {
    messages.retain(|m| {
        if m.role != mux_model::Role::Assistant {
            return true;
        }
        !m.is_empty() || m.is_reasoning_only()
    });
}

/// Number of task ancestors of `ws` (0 for a root workspace).
pub(crate) fn task_depth(config: &mux_config::MuxConfig, ws: &str) -> usize {
    let mut depth = 0;
    let mut current = ws.to_string();
    while let Some(meta) = config.find_workspace(&current) {
        match &meta.parent_workspace_id {
            Some(parent) => {
                depth += 1;
                current = parent.clone();
                // A corrupt chain must not spin forever.
                if depth > 64 {
                    break;
                }
            }
            None => break,
        }
    }
    depth
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
