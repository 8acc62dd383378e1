// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use mux_config::ThinkingLevel;
use mux_model::{ChatMessage, ModelProvider, Part, ProviderEvent, ProviderRequest, ToolSchema};
use mux_session::SessionStore;
use mux_tools::{ToolCall, ToolCtx, ToolOutput, ToolRegistry};

use crate::error::OrchestratorError;
use crate::events::{EventBus, WorkspaceEvent};

/// Write the partial slot after this many unpersisted deltas (and always
/// at part boundaries and terminal events).
const PARTIAL_FLUSH_EVERY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Starting,
    Streaming,
    Aborting,
}

/// How a stream finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Aborted,
    Errored(String),
    /// The message was queued behind an active stream (workspace service).
    Queued,
}

/// Hook invoked synchronously with stream progress.  The task service uses
/// this to observe `agent_report` calls and stream terminations without
/// racing the lossy subscriber bus.
#[async_trait]
pub trait StreamObserver: Send + Sync {
    async fn on_tool_call_end(&self, _workspace_id: &str, _call: &ToolCall, _output: &ToolOutput) {}
    async fn on_stream_end(&self, _workspace_id: &str) {}
}

struct ActiveEntry {
    message_id: String,
    state: StreamState,
    abort_tx: watch::Sender<bool>,
    abandon_partial: Arc<AtomicBool>,
    /// Whether `stream-start` has been emitted yet; an abort racing the
    /// start emits a synthetic `stream-abort` so subscribers always see a
    /// terminal event.
    started: Arc<AtomicBool>,
}

/// Everything one stream run needs, assembled by the orchestrator.
pub struct StartStreamParams {
    pub messages: Vec<ChatMessage>,
    pub system: String,
    pub provider: Arc<dyn ModelProvider>,
    pub tools: ToolRegistry,
    pub tool_ctx: ToolCtx,
    pub max_output_tokens: Option<u32>,
    pub thinking_level: Option<ThinkingLevel>,
    pub provider_options: serde_json::Value,
}

/// Owns the at-most-one active stream slot per workspace and drives the
/// model ↔ tool loop, fanning events to subscribers and keeping the
/// partial slot current.
pub struct StreamManager {
    sessions: Arc<SessionStore>,
    events: Arc<EventBus>,
    active: Mutex<HashMap<String, ActiveEntry>>,
    observers: RwLock<Vec<Arc<dyn StreamObserver>>>,
    /// Cumulative provider cost per workspace, fed from usage events and
    /// surfaced to shell tools as MUX_COSTS_USD.
    costs: Mutex<HashMap<String, f64>>,
}

impl StreamManager {
    pub fn new(sessions: Arc<SessionStore>, events: Arc<EventBus>) -> Self {
        Self {
            sessions,
            events,
            active: Mutex::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            costs: Mutex::new(HashMap::new()),
        }
    }

    pub fn costs_usd(&self, workspace_id: &str) -> f64 {
        *self.costs.lock().unwrap().get(workspace_id).unwrap_or(&0.0)
    }

    fn add_cost(&self, workspace_id: &str, cost: f64) {
        *self
            .costs
            .lock()
            .unwrap()
            .entry(workspace_id.to_string())
            .or_insert(0.0) += cost;
    }

    pub fn add_observer(&self, observer: Arc<dyn StreamObserver>) {
        self.observers.write().unwrap().push(observer);
    }

    pub fn is_streaming(&self, workspace_id: &str) -> bool {
        self.active.lock().unwrap().contains_key(workspace_id)
    }

    pub fn stream_state(&self, workspace_id: &str) -> Option<StreamState> {
        self.active
            .lock()
            .unwrap()
            .get(workspace_id)
            .map(|e| e.state)
    }

    /// Id of the assistant message the active stream is producing.
    pub fn stream_message_id(&self, workspace_id: &str) -> Option<String> {
        self.active
            .lock()
            .unwrap()
            .get(workspace_id)
            .map(|e| e.message_id.clone())
    }

    /// Claim the active-stream slot.  Fails with `stream_active` when a
    /// stream already owns it.  The returned guard releases the slot on
    /// drop, covering pre-start failures in the orchestrator phases.
    pub fn begin(
        self: &Arc<Self>,
        workspace_id: &str,
        assistant_message_id: &str,
    ) -> Result<StreamGuard, OrchestratorError> {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(workspace_id) {
            return Err(OrchestratorError::StreamActive);
        }
        let (abort_tx, abort_rx) = watch::channel(false);
        let abandon = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        active.insert(
            workspace_id.to_string(),
            ActiveEntry {
                message_id: assistant_message_id.to_string(),
                state: StreamState::Starting,
                abort_tx,
                abandon_partial: abandon.clone(),
                started: started.clone(),
            },
        );
        Ok(StreamGuard {
            manager: self.clone(),
            workspace_id: workspace_id.to_string(),
            message_id: assistant_message_id.to_string(),
            abort_rx,
            abandon,
            started,
        })
    }

    /// Cancel the active stream, or the pending startup when no stream has
    /// emitted yet.  No-op when the workspace is idle.
    pub fn stop_stream(&self, workspace_id: &str, abandon_partial: bool) {
        let mut active = self.active.lock().unwrap();
        let Some(entry) = active.get_mut(workspace_id) else {
            return;
        };
        entry.state = StreamState::Aborting;
        entry.abandon_partial.store(abandon_partial, Ordering::SeqCst);
        let _ = entry.abort_tx.send(true);
        if !entry.started.load(Ordering::SeqCst) {
            // The abort raced the real start; subscribers still need a
            // terminal event.
            self.events.emit(WorkspaceEvent::StreamAbort {
                workspace_id: workspace_id.to_string(),
                message_id: entry.message_id.clone(),
                abandoned: abandon_partial,
            });
        }
    }

    /// Re-emit the current stream position for a freshly connected
    /// subscriber: `stream-start`, the partial contents as synthetic
    /// deltas, a synthetic terminal when the stream is gone, and finally
    /// `caught-up`.
    pub async fn replay_stream(&self, workspace_id: &str) {
        if let Some(partial) = self.sessions.read_partial(workspace_id).await {
            self.events.emit(WorkspaceEvent::StreamStart {
                workspace_id: workspace_id.to_string(),
                message_id: partial.id.clone(),
            });
            for part in &partial.parts {
                match part {
                    Part::Text { text } if !text.is_empty() => {
                        self.events.emit(WorkspaceEvent::StreamDelta {
                            workspace_id: workspace_id.to_string(),
                            message_id: partial.id.clone(),
                            delta: text.clone(),
                        });
                    }
                    Part::Reasoning { text } if !text.is_empty() => {
                        self.events.emit(WorkspaceEvent::ReasoningDelta {
                            workspace_id: workspace_id.to_string(),
                            message_id: partial.id.clone(),
                            delta: text.clone(),
                        });
                    }
                    Part::DynamicTool {
                        tool_call_id,
                        tool_name,
                        input,
                        output,
                        ..
                    } => {
                        self.events.emit(WorkspaceEvent::ToolCallStart {
                            workspace_id: workspace_id.to_string(),
                            message_id: partial.id.clone(),
                            tool_call_id: tool_call_id.clone(),
                            tool_name: tool_name.clone(),
                            input: input.clone(),
                        });
                        if let Some(output) = output {
                            self.events.emit(WorkspaceEvent::ToolCallEnd {
                                workspace_id: workspace_id.to_string(),
                                message_id: partial.id.clone(),
                                tool_call_id: tool_call_id.clone(),
                                tool_name: tool_name.clone(),
                                output: output.clone(),
                                is_error: false,
                            });
                        }
                    }
                    _ => {}
                }
            }
            if !self.is_streaming(workspace_id) {
                // Partial without a live stream: the producer died mid-run.
                self.events.emit(WorkspaceEvent::StreamAbort {
                    workspace_id: workspace_id.to_string(),
                    message_id: partial.id,
                    abandoned: false,
                });
            }
        }
        self.events.emit(WorkspaceEvent::CaughtUp {
            workspace_id: workspace_id.to_string(),
        });
    }

    fn set_state(&self, workspace_id: &str, state: StreamState) {
        if let Some(entry) = self.active.lock().unwrap().get_mut(workspace_id) {
            entry.state = state;
        }
    }

    fn release(&self, workspace_id: &str) {
        self.active.lock().unwrap().remove(workspace_id);
    }

    async fn notify_tool_call_end(&self, workspace_id: &str, call: &ToolCall, output: &ToolOutput) {
        let observers: Vec<_> = self.observers.read().unwrap().clone();
        for obs in observers {
            obs.on_tool_call_end(workspace_id, call, output).await;
        }
    }

    async fn notify_stream_end(&self, workspace_id: &str) {
        let observers: Vec<_> = self.observers.read().unwrap().clone();
        for obs in observers {
            obs.on_stream_end(workspace_id).await;
        }
    }
}

/// Exclusive claim on a workspace's stream slot, produced by
/// [`StreamManager::begin`].
pub struct StreamGuard {
    manager: Arc<StreamManager>,
    workspace_id: String,
    message_id: String,
    abort_rx: watch::Receiver<bool>,
    abandon: Arc<AtomicBool>,
    started: Arc<AtomicBool>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.manager.release(&self.workspace_id);
    }
}

enum RoundEnd {
    Done,
    Aborted,
    Failed(String),
}

impl StreamGuard {
    pub fn abort_receiver(&self) -> watch::Receiver<bool> {
        self.abort_rx.clone()
    }

    /// Drive the model ↔ tool loop to a terminal event.
    ///
    /// The assistant placeholder for `message_id` must already exist in
    /// history; on completion it is updated in place with the accumulated
    /// parts and the partial slot is cleared.
    pub async fn run(self, params: StartStreamParams) -> StreamOutcome {
        let ws = self.workspace_id.clone();
        let msg_id = self.message_id.clone();
        let manager = self.manager.clone();
        let sessions = manager.sessions.clone();
        let events = manager.events.clone();

        self.started.store(true, Ordering::SeqCst);
        manager.set_state(&ws, StreamState::Streaming);
        events.emit(WorkspaceEvent::StreamStart {
            workspace_id: ws.clone(),
            message_id: msg_id.clone(),
        });

        let mut partial = ChatMessage::assistant_placeholder(&msg_id);
        partial.metadata_mut().partial = Some(true);
        let mut unflushed = 0usize;
        let mut abort_rx = self.abort_rx.clone();

        let schemas: Vec<ToolSchema> = params
            .tools
            .schemas()
            .into_iter()
            .map(|(name, description, parameters)| ToolSchema {
                name,
                description,
                parameters,
            })
            .collect();

        let end = 'outer: loop {
            if *abort_rx.borrow() {
                break 'outer RoundEnd::Aborted;
            }
            let mut request_messages = params.messages.clone();
            if !partial.parts.is_empty() {
                request_messages.push(partial.clone());
            }
            let request = ProviderRequest {
                messages: request_messages,
                system: params.system.clone(),
                tools: schemas.clone(),
                max_output_tokens: params.max_output_tokens,
                thinking_level: params.thinking_level,
                provider_options: params.provider_options.clone(),
            };

            let mut stream = match params.provider.stream(request).await {
                Ok(s) => s,
                Err(e) => break 'outer RoundEnd::Failed(e.to_string()),
            };

            let mut round_calls: Vec<ToolCall> = Vec::new();
            let mut abort_open = true;
            loop {
                tokio::select! {
                    ev = stream.next() => match ev {
                        Some(Ok(ProviderEvent::TextDelta(delta))) => {
                            partial.push_text_delta(&delta);
                            events.emit(WorkspaceEvent::StreamDelta {
                                workspace_id: ws.clone(),
                                message_id: msg_id.clone(),
                                delta,
                            });
                            unflushed += 1;
                            if unflushed >= PARTIAL_FLUSH_EVERY {
                                let _ = sessions.write_partial(&ws, &partial).await;
                                unflushed = 0;
                            }
                        }
                        Some(Ok(ProviderEvent::ReasoningDelta(delta))) => {
                            partial.push_reasoning_delta(&delta);
                            events.emit(WorkspaceEvent::ReasoningDelta {
                                workspace_id: ws.clone(),
                                message_id: msg_id.clone(),
                                delta,
                            });
                            unflushed += 1;
                            if unflushed >= PARTIAL_FLUSH_EVERY {
                                let _ = sessions.write_partial(&ws, &partial).await;
                                unflushed = 0;
                            }
                        }
                        Some(Ok(ProviderEvent::ReasoningEnd)) => {
                            events.emit(WorkspaceEvent::ReasoningEnd {
                                workspace_id: ws.clone(),
                                message_id: msg_id.clone(),
                            });
                        }
                        Some(Ok(ProviderEvent::ToolCall { id, name, arguments })) => {
                            let input: serde_json::Value = serde_json::from_str(&arguments)
                                .unwrap_or_else(|_| json!({ "raw": arguments.clone() }));
                            partial.parts.push(Part::tool_input(&id, &name, input.clone()));
                            events.emit(WorkspaceEvent::ToolCallStart {
                                workspace_id: ws.clone(),
                                message_id: msg_id.clone(),
                                tool_call_id: id.clone(),
                                tool_name: name.clone(),
                                input: input.clone(),
                            });
                            events.emit(WorkspaceEvent::ToolCallDelta {
                                workspace_id: ws.clone(),
                                message_id: msg_id.clone(),
                                tool_call_id: id.clone(),
                                args_delta: arguments,
                            });
                            round_calls.push(ToolCall { id, name, args: input });
                            let _ = sessions.write_partial(&ws, &partial).await;
                            unflushed = 0;
                        }
                        Some(Ok(ProviderEvent::Usage { input_tokens, output_tokens, cost_usd })) => {
                            if let Some(cost) = cost_usd {
                                manager.add_cost(&ws, cost);
                            }
                            events.emit(WorkspaceEvent::UsageDelta {
                                workspace_id: ws.clone(),
                                message_id: msg_id.clone(),
                                input_tokens,
                                output_tokens,
                                cost_usd,
                            });
                        }
                        Some(Ok(ProviderEvent::Done)) | None => break,
                        Some(Ok(ProviderEvent::Error(e))) => break 'outer RoundEnd::Failed(e),
                        Some(Err(e)) => break 'outer RoundEnd::Failed(e.to_string()),
                    },
                    changed = abort_rx.changed(), if abort_open => {
                        match changed {
                            Ok(()) if *abort_rx.borrow() => break 'outer RoundEnd::Aborted,
                            Ok(()) => {}
                            Err(_) => abort_open = false,
                        }
                    }
                }
            }

            if round_calls.is_empty() {
                break 'outer RoundEnd::Done;
            }

            // Execute this round's tool calls, then loop back to the model
            // with the updated assistant message.
            for call in round_calls {
                if *abort_rx.borrow() {
                    break 'outer RoundEnd::Aborted;
                }
                debug!(workspace = %ws, tool = %call.name, "dispatching tool call");
                let output = params.tools.execute(&call, &params.tool_ctx).await;
                partial.finish_tool_part(&call.id, output.value.clone());
                events.emit(WorkspaceEvent::ToolCallEnd {
                    workspace_id: ws.clone(),
                    message_id: msg_id.clone(),
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    output: output.value.clone(),
                    is_error: output.is_error,
                });
                manager.notify_tool_call_end(&ws, &call, &output).await;
                let _ = sessions.write_partial(&ws, &partial).await;
                unflushed = 0;
            }
        };

        match end {
            RoundEnd::Done => {
                partial.metadata_mut().partial = None;
                if let Err(e) = sessions.update_history(&ws, partial).await {
                    warn!(workspace = %ws, error = %e, "failed to finalize assistant message");
                }
                let _ = sessions.delete_partial(&ws).await;
                events.emit(WorkspaceEvent::StreamEnd {
                    workspace_id: ws.clone(),
                    message_id: msg_id.clone(),
                });
                drop(self);
                manager.notify_stream_end(&ws).await;
                StreamOutcome::Completed
            }
            RoundEnd::Aborted => {
                let abandoned = self.abandon.load(Ordering::SeqCst);
                if abandoned {
                    let _ = sessions.delete_partial(&ws).await;
                } else {
                    partial.metadata_mut().partial = Some(true);
                    let _ = sessions.update_history(&ws, partial).await;
                    let _ = sessions.delete_partial(&ws).await;
                }
                events.emit(WorkspaceEvent::StreamAbort {
                    workspace_id: ws.clone(),
                    message_id: msg_id.clone(),
                    abandoned,
                });
                StreamOutcome::Aborted
            }
            RoundEnd::Failed(error) => {
                let error_type = if error.to_lowercase().contains("context") {
                    "context_exceeded"
                } else {
                    "unknown"
                };
                partial.metadata_mut().partial = Some(true);
                partial.metadata_mut().error = Some(error.clone());
                partial.metadata_mut().error_type = Some(error_type.to_string());
                let _ = sessions.update_history(&ws, partial).await;
                let _ = sessions.delete_partial(&ws).await;
                events.emit(WorkspaceEvent::StreamError {
                    workspace_id: ws.clone(),
                    message_id: msg_id.clone(),
                    error: error.clone(),
                    error_type: error_type.to_string(),
                });
                StreamOutcome::Errored(error)
            }
        }
    }
}
