// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use mux_config::{ConfigStore, MuxConfig, TaskReport, TaskStatus, WorkspaceMetadata};
use mux_model::ChatMessage;
use mux_session::SessionStore;
use mux_tools::{
    CreateTaskRequest, PolicyAction, PolicyFilter, TaskCreation, TaskKind, TaskReportOut,
    TaskSpawner, ToolCall, ToolOutput,
};

use crate::error::OrchestratorError;
use crate::events::{EventBus, WorkspaceEvent};
use crate::orchestrator::{task_depth, RuntimeFactory};
use crate::stream::StreamObserver;
use crate::workspace::{SendMessageOptions, WorkspaceOps};

const REMINDER_PROMPT: &str =
    "Your stream ended without calling agent_report. Call agent_report now with your \
     final findings so the parent workspace can continue.";

type Waiter = oneshot::Sender<Result<TaskReportOut, String>>;

/// Subagent lifecycle: child workspaces as bounded tasks, FIFO overflow
/// queue, report routing back into the parent's `task` tool call, and
/// parent auto-resume.
///
/// All task state transitions happen inside `editConfig` closures so the
/// queue can never be double-drained.
pub struct TaskService {
    config: Arc<ConfigStore>,
    sessions: Arc<SessionStore>,
    events: Arc<EventBus>,
    runtime_factory: RuntimeFactory,
    ops: OnceLock<Arc<dyn WorkspaceOps>>,
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
    /// Reports survive child-workspace removal for late waiters.
    cached_reports: Mutex<HashMap<String, TaskReportOut>>,
    /// Stream-end count without a report, per child; drives the reminder
    /// then the fallback.
    missing_report_ends: Mutex<HashMap<String, u32>>,
    /// Parents already auto-resumed since the last task completion.
    auto_resumed: Mutex<HashSet<String>>,
    status_notify: Mutex<HashMap<String, Arc<Notify>>>,
}

impl TaskService {
    pub fn new(
        config: Arc<ConfigStore>,
        sessions: Arc<SessionStore>,
        events: Arc<EventBus>,
        runtime_factory: RuntimeFactory,
    ) -> Self {
        Self {
            config,
            sessions,
            events,
            runtime_factory,
            ops: OnceLock::new(),
            waiters: Mutex::new(HashMap::new()),
            cached_reports: Mutex::new(HashMap::new()),
            missing_report_ends: Mutex::new(HashMap::new()),
            auto_resumed: Mutex::new(HashSet::new()),
            status_notify: Mutex::new(HashMap::new()),
        }
    }

    /// Wire the workspace operations.  Must be called exactly once by the
    /// composition root before any task is created.
    pub fn set_workspace_ops(&self, ops: Arc<dyn WorkspaceOps>) {
        let _ = self.ops.set(ops);
    }

    fn ops(&self) -> Result<Arc<dyn WorkspaceOps>, String> {
        self.ops
            .get()
            .cloned()
            .ok_or_else(|| "task service is not wired to a workspace service".to_string())
    }

    /// Restart recovery: re-arm `awaiting_report` tasks with a policy that
    /// requires `agent_report`, then drain the queue.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        let ops = self.ops().map_err(OrchestratorError::unknown)?;
        let config = self.config.load().await;
        for ws in config.all_workspaces() {
            if ws.is_task() && ws.task_status == Some(TaskStatus::AwaitingReport) {
                debug!(task = %ws.id, "re-arming awaiting_report task after restart");
                let ops = ops.clone();
                let id = ws.id.clone();
                tokio::spawn(async move {
                    let opts = SendMessageOptions {
                        allow_queued_agent_task: true,
                        policy_override: Some(vec![PolicyFilter::new(
                            "^agent_report$",
                            PolicyAction::Require,
                        )]),
                        ..Default::default()
                    };
                    if let Err(e) = ops.resume_stream(&id, opts).await {
                        warn!(task = %id, error = %e, "failed to resume awaiting_report task");
                    }
                });
            }
        }
        self.drain_queue().await;
        Ok(())
    }

    /// Await a task's report.  Returns the cached report even after the
    /// child workspace is gone.  The timeout countdown only starts once
    /// the task has left `queued`.
    pub async fn wait_for_agent_report(
        &self,
        task_id: &str,
        timeout_ms: Option<u64>,
    ) -> Result<TaskReportOut, String> {
        if let Some(report) = self.cached_reports.lock().unwrap().get(task_id).cloned() {
            return Ok(report);
        }

        let rx = {
            let mut waiters = self.waiters.lock().unwrap();
            let (tx, rx) = oneshot::channel();
            waiters.entry(task_id.to_string()).or_default().push(tx);
            rx
        };
        // Late registration race: a report may have landed between the
        // cache check and waiter registration.
        if let Some(report) = self.cached_reports.lock().unwrap().get(task_id).cloned() {
            return Ok(report);
        }

        self.wait_until_not_queued(task_id).await;

        let resolved = match timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(std::time::Duration::from_millis(ms), rx).await {
                    Ok(r) => r,
                    Err(_) => return Err("timed out waiting for agent report".to_string()),
                }
            }
            None => rx.await,
        };
        match resolved {
            Ok(result) => result,
            Err(_) => Err("task terminated".to_string()),
        }
    }

    /// Tear down a task and its descendants, leaf-first.  Waiters are
    /// rejected before anything is removed.
    pub async fn terminate(self: &Arc<Self>, task_id: &str) -> Result<(), OrchestratorError> {
        let ops = self.ops().map_err(OrchestratorError::unknown)?;
        let config = self.config.load().await;
        let mut order = descendants_leaf_first(&config, task_id);
        order.push(task_id.to_string());

        for id in &order {
            self.reject_waiters(id, "task terminated");
            ops.interrupt_stream(id, true).await;
            if let Err(e) = ops.remove_workspace(id, true).await {
                warn!(task = %id, error = %e, "failed to remove terminated task workspace");
            }
            self.notify_status(id);
        }
        self.drain_queue().await;
        Ok(())
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn wait_until_not_queued(&self, task_id: &str) {
        loop {
            let status = self
                .config
                .find_workspace(task_id)
                .await
                .and_then(|w| w.task_status);
            if status != Some(TaskStatus::Queued) {
                return;
            }
            let notify = self
                .status_notify
                .lock()
                .unwrap()
                .entry(task_id.to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone();
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // Re-check after arming so a racing transition cannot strand us.
            let status = self
                .config
                .find_workspace(task_id)
                .await
                .and_then(|w| w.task_status);
            if status != Some(TaskStatus::Queued) {
                return;
            }
            notified.await;
        }
    }

    fn notify_status(&self, task_id: &str) {
        if let Some(n) = self.status_notify.lock().unwrap().get(task_id) {
            n.notify_waiters();
        }
        self.events.emit(WorkspaceEvent::Metadata {
            workspace_id: task_id.to_string(),
        });
    }

    fn reject_waiters(&self, task_id: &str, reason: &str) {
        if let Some(waiters) = self.waiters.lock().unwrap().remove(task_id) {
            for w in waiters {
                let _ = w.send(Err(reason.to_string()));
            }
        }
    }

    fn resolve_waiters(&self, task_id: &str, report: &TaskReportOut) {
        self.cached_reports
            .lock()
            .unwrap()
            .insert(task_id.to_string(), report.clone());
        if let Some(waiters) = self.waiters.lock().unwrap().remove(task_id) {
            for w in waiters {
                let _ = w.send(Ok(report.clone()));
            }
        }
    }

    async fn set_task_status(&self, task_id: &str, next: TaskStatus) -> bool {
        let changed = Arc::new(AtomicBool::new(false));
        let changed_in = changed.clone();
        let id = task_id.to_string();
        let result = self
            .config
            .edit_config(move |cfg| {
                if let Some(ws) = cfg.find_workspace_mut(&id) {
                    let current = ws.task_status.unwrap_or(TaskStatus::Queued);
                    if current != next && current.can_advance_to(next) {
                        ws.task_status = Some(next);
                        if next == TaskStatus::Reported {
                            ws.reported_at = Some(Utc::now());
                        }
                        changed_in.store(true, Ordering::SeqCst);
                    }
                }
            })
            .await;
        if let Err(e) = result {
            warn!(task = %task_id, error = %e, "failed to persist task status");
            return false;
        }
        let changed = changed.load(Ordering::SeqCst);
        if changed {
            self.notify_status(task_id);
        }
        changed
    }

    /// Start a queued (or freshly created running) task: materialize the
    /// worktree, then fire the first message.  Rolls back the child on
    /// startup failure.
    #[async_recursion::async_recursion]
    async fn start_task(self: &Arc<Self>, meta: WorkspaceMetadata) {
        let Ok(ops) = self.ops() else { return };
        let id = meta.id.clone();

        if let Err(e) = ops.materialize_workspace(&id).await {
            warn!(task = %id, error = %e, "task workspace materialization failed — rolling back");
            self.rollback_task(&id, &e.to_string()).await;
            return;
        }

        if meta.agent_type.is_none() {
            // Shell-kind task: run the prompt as a command and report.
            let service = self.clone();
            tokio::spawn(async move { service.run_bash_task(meta).await });
            return;
        }

        let prompt = meta.task_prompt.clone().unwrap_or_default();
        let service = self.clone();
        tokio::spawn(async move {
            let opts = SendMessageOptions {
                model: meta.task_model_string.clone(),
                thinking_level: meta.task_thinking_level,
                agent_id: meta.agent_type.clone(),
                allow_queued_agent_task: true,
                ..Default::default()
            };
            if let Err(e) = ops.send_message(&id, &prompt, opts).await {
                warn!(task = %id, error = %e, "task send_message failed — rolling back");
                service.rollback_task(&id, &e.to_string()).await;
            }
        });
    }

    async fn run_bash_task(self: Arc<Self>, meta: WorkspaceMetadata) {
        let command = meta.task_prompt.clone().unwrap_or_default();
        let runtime = (self.runtime_factory)(&meta);
        let result = runtime
            .exec(&command, mux_runtime::ExecOptions::default())
            .await;
        let report = match result {
            Ok(r) => TaskReportOut {
                report_markdown: format!(
                    "`{command}` exited {}\n\n```\n{}\n{}```",
                    r.exit_code, r.stdout, r.stderr
                ),
                title: Some(format!("bash: exit {}", r.exit_code)),
            },
            Err(e) => TaskReportOut {
                report_markdown: format!("`{command}` failed to run: {e}"),
                title: Some("bash: spawn failure".into()),
            },
        };
        self.finalize_report(&meta.id, report, false).await;
    }

    async fn rollback_task(&self, task_id: &str, reason: &str) {
        self.reject_waiters(task_id, reason);
        if let Ok(ops) = self.ops() {
            if let Err(e) = ops.remove_workspace(task_id, true).await {
                warn!(task = %task_id, error = %e, "rollback removal failed");
            }
        }
        self.notify_status(task_id);
    }

    /// Route a finished report into the parent and clean the child up.
    async fn finalize_report(self: &Arc<Self>, child_id: &str, report: TaskReportOut, fallback: bool) {
        let Some(child) = self.config.find_workspace(child_id).await else {
            return;
        };
        let Some(parent_id) = child.parent_workspace_id.clone() else {
            return;
        };
        let call_id = child.task_call_id.clone().unwrap_or_default();

        let mut output = json!({
            "status": "reported",
            "taskId": child_id,
            "reportMarkdown": report.report_markdown,
        });
        if let Some(title) = &report.title {
            output["title"] = json!(title);
        }
        if fallback {
            output["fallback"] = json!(true);
        }

        // Prefer the live partial; fall back to history (background task).
        let mut routed = false;
        if let Some(mut partial) = self.sessions.read_partial(&parent_id).await {
            if partial.finish_tool_part(&call_id, output.clone()) {
                let _ = self.sessions.write_partial(&parent_id, &partial).await;
                routed = true;
            }
        }
        if !routed {
            let history = self
                .sessions
                .read_history(&parent_id)
                .await
                .unwrap_or_default();
            for msg in history {
                let mut msg = msg;
                if msg.finish_tool_part(&call_id, output.clone()) {
                    let _ = self.sessions.update_history(&parent_id, msg).await;
                    // Background task: the model never saw the tool result,
                    // so surface the report as a synthetic user message.
                    let mut synthetic = ChatMessage::user(format!(
                        "Background task {child_id} reported:\n\n{}",
                        report.report_markdown
                    ));
                    synthetic.metadata_mut().synthetic = Some(true);
                    let _ = self.sessions.append_to_history(&parent_id, synthetic).await;
                    routed = true;
                    break;
                }
            }
        }
        if !routed {
            warn!(child = child_id, parent = %parent_id, call = %call_id, "no pending task tool call found for report");
        }

        let report_clone = report.clone();
        let child_id_owned = child_id.to_string();
        let _ = self
            .config
            .edit_workspace(child_id, move |w| {
                w.task_report = Some(TaskReport {
                    report_markdown: report_clone.report_markdown.clone(),
                    title: report_clone.title.clone(),
                });
            })
            .await;
        self.set_task_status(&child_id_owned, TaskStatus::Reported).await;
        self.resolve_waiters(child_id, &report);
        self.auto_resumed.lock().unwrap().remove(&parent_id);

        // Cleanup: stop the child, remove its workspace once the stream has
        // wound down, resume the parent when it is idle.
        if let Ok(ops) = self.ops() {
            ops.interrupt_stream(child_id, true).await;
            let child_owned = child_id.to_string();
            let parent_owned = parent_id.clone();
            let ops_clone = ops.clone();
            let service = self.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    if !ops_clone.is_streaming(&child_owned) {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                if let Err(e) = ops_clone.remove_workspace(&child_owned, true).await {
                    warn!(task = %child_owned, error = %e, "reported task cleanup failed");
                }
                if !ops_clone.is_streaming(&parent_owned) {
                    let _ = ops_clone
                        .resume_stream(&parent_owned, SendMessageOptions::default())
                        .await;
                }
                service.drain_queue().await;
            });
        }
    }

    /// Start as many queued tasks as capacity allows, FIFO.
    #[async_recursion::async_recursion]
    pub async fn drain_queue(self: &Arc<Self>) {
        let Ok(ops) = self.ops() else { return };
        let config = self.config.load().await;
        let settings = config.task_settings();

        let mut active = config
            .all_workspaces()
            .iter()
            .filter(|w| {
                w.is_task()
                    && matches!(
                        w.task_status,
                        Some(TaskStatus::Running) | Some(TaskStatus::AwaitingReport)
                    )
            })
            .count();

        let mut queued: Vec<WorkspaceMetadata> = config
            .all_workspaces()
            .into_iter()
            .filter(|w| w.is_task() && w.task_status == Some(TaskStatus::Queued))
            .collect();
        queued.sort_by_key(|w| w.created_at);

        for task in queued {
            if active >= settings.max_parallel_agent_tasks {
                break;
            }
            // Hold back while the nearest ancestor task is still streaming
            // out its own `reported` transition.
            if let Some(ancestor) = nearest_task_ancestor(&config, &task) {
                if ancestor.task_status == Some(TaskStatus::Reported)
                    && ops.is_streaming(&ancestor.id)
                {
                    continue;
                }
            }
            if self.set_task_status(&task.id, TaskStatus::Running).await {
                debug!(task = %task.id, "starting queued task");
                self.start_task(task).await;
                active += 1;
            }
        }
    }
}

// ── TaskSpawner (the `task` tool's view) ──────────────────────────────────────

/// Local newtype so `TaskSpawner` (defined in `mux-tools`) can be implemented
/// for an `Arc<TaskService>` handle without violating the orphan rule.
#[derive(Clone)]
pub struct TaskSpawnerHandle(pub Arc<TaskService>);

impl std::ops::Deref for TaskSpawnerHandle {
    type Target = Arc<TaskService>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl TaskSpawner for TaskSpawnerHandle {
    async fn create_task(&self, req: CreateTaskRequest) -> Result<TaskCreation, String> {
        let service = &self.0;
        let config = service.config.load().await;
        let parent = config
            .find_workspace(&req.parent_workspace_id)
            .cloned()
            .ok_or_else(|| format!("parent workspace not found: {}", req.parent_workspace_id))?;

        let settings = config.task_settings();
        let depth = task_depth(&config, &parent.id);
        if depth >= settings.max_task_nesting_depth {
            return Err(format!(
                "task nesting depth {depth} has reached maxTaskNestingDepth \
                 ({})",
                settings.max_task_nesting_depth
            ));
        }

        let agent_type = match req.kind {
            TaskKind::Agent => req.agent_type.clone(),
            TaskKind::Bash => None,
        };
        let defaults = config
            .subagent_ai_defaults
            .as_ref()
            .and_then(|d| agent_type.as_deref().and_then(|a| d.get(a)))
            .cloned();

        let mut child = WorkspaceMetadata::new("", &parent.project_path);
        let label = agent_type.as_deref().unwrap_or("bash");
        child.name = format!("agent_{label}_{}", child.id);
        child.parent_workspace_id = Some(parent.id.clone());
        child.agent_type = agent_type;
        child.task_status = Some(TaskStatus::Queued);
        child.task_prompt = Some(req.prompt.clone());
        child.task_call_id = Some(req.tool_call_id.clone());
        child.runtime_config = parent.runtime_config.clone();
        child.task_model_string = defaults
            .as_ref()
            .map(|d| d.model_string.clone())
            .or_else(|| parent.ai_settings.as_ref().and_then(|a| a.model.clone()));
        child.task_thinking_level = defaults
            .as_ref()
            .and_then(|d| d.thinking_level)
            .or_else(|| parent.ai_settings.as_ref().and_then(|a| a.thinking_level));

        // Capacity check and insertion happen in one editConfig closure so
        // two concurrent creates cannot both claim the last slot.
        let started = Arc::new(AtomicBool::new(false));
        let started_in = started.clone();
        let child_clone = child.clone();
        let max_parallel = settings.max_parallel_agent_tasks;
        service
            .config
            .edit_config(move |cfg| {
                let active = cfg
                    .all_workspaces()
                    .iter()
                    .filter(|w| {
                        w.is_task()
                            && matches!(
                                w.task_status,
                                Some(TaskStatus::Running) | Some(TaskStatus::AwaitingReport)
                            )
                    })
                    .count();
                let mut entry = child_clone.clone();
                if active < max_parallel {
                    entry.task_status = Some(TaskStatus::Running);
                    started_in.store(true, Ordering::SeqCst);
                }
                let project_path = entry.project_path.clone();
                cfg.project_mut(&project_path).workspaces.push(entry);
            })
            .await
            .map_err(|e| e.to_string())?;

        let started = started.load(Ordering::SeqCst);
        service.events.emit(WorkspaceEvent::Metadata {
            workspace_id: child.id.clone(),
        });

        if started {
            child.task_status = Some(TaskStatus::Running);
            service.start_task(child.clone()).await;
        }

        Ok(TaskCreation {
            task_id: child.id,
            status: if started { "running" } else { "queued" }.to_string(),
        })
    }

    async fn wait_for_report(
        &self,
        task_id: &str,
        timeout_ms: Option<u64>,
    ) -> Result<TaskReportOut, String> {
        self.0.wait_for_agent_report(task_id, timeout_ms).await
    }
}

// ── StreamObserver (hooks from the stream manager) ────────────────────────────

#[async_trait]
impl StreamObserver for Arc<TaskService> {
    async fn on_tool_call_end(&self, workspace_id: &str, call: &ToolCall, output: &ToolOutput) {
        if call.name != "agent_report" || output.is_error {
            return;
        }
        let Some(meta) = self.config.find_workspace(workspace_id).await else {
            return;
        };
        if !meta.is_task() {
            return;
        }
        let report = TaskReportOut {
            report_markdown: call.args["reportMarkdown"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            title: call.args.get("title").and_then(|t| t.as_str()).map(String::from),
        };
        debug!(task = workspace_id, "agent_report received");
        self.finalize_report(workspace_id, report, false).await;
    }

    async fn on_stream_end(&self, workspace_id: &str) {
        let config = self.config.load().await;
        let Some(meta) = config.find_workspace(workspace_id).cloned() else {
            return;
        };

        if meta.is_task() && meta.task_status != Some(TaskStatus::Reported) {
            // A parent task with live descendants is not missing a report;
            // it is waiting for them.
            if has_active_descendants(&config, workspace_id) {
                if meta.task_status == Some(TaskStatus::AwaitingReport) {
                    self.set_task_status(workspace_id, TaskStatus::Running).await;
                }
                return;
            }

            let ends = {
                let mut counts = self.missing_report_ends.lock().unwrap();
                let c = counts.entry(workspace_id.to_string()).or_insert(0);
                *c += 1;
                *c
            };
            if ends == 1 {
                self.set_task_status(workspace_id, TaskStatus::AwaitingReport)
                    .await;
                if let Ok(ops) = self.ops() {
                    let id = workspace_id.to_string();
                    let opts = SendMessageOptions {
                        model: meta.task_model_string.clone(),
                        allow_queued_agent_task: true,
                        ..Default::default()
                    };
                    tokio::spawn(async move {
                        if let Err(e) = ops.send_message(&id, REMINDER_PROMPT, opts).await {
                            warn!(task = %id, error = %e, "agent_report reminder failed");
                        }
                    });
                }
            } else {
                // Second end without a report: synthesize a fallback from
                // the child's final assistant text.
                let text = self
                    .sessions
                    .read_history(workspace_id)
                    .await
                    .unwrap_or_default()
                    .iter()
                    .rev()
                    .find(|m| m.role == mux_model::Role::Assistant && !m.text().is_empty())
                    .map(|m| m.text())
                    .unwrap_or_else(|| "(subagent produced no output)".to_string());
                self.finalize_report(
                    workspace_id,
                    TaskReportOut {
                        report_markdown: text,
                        title: Some("fallback".into()),
                    },
                    true,
                )
                .await;
            }
            return;
        }

        // Any workspace whose stream ended with background tasks still
        // active is resumed once, with an instruction naming them.
        let running: Vec<String> = config
            .all_workspaces()
            .into_iter()
            .filter(|w| {
                w.parent_workspace_id.as_deref() == Some(workspace_id)
                    && matches!(
                        w.task_status,
                        Some(TaskStatus::Queued)
                            | Some(TaskStatus::Running)
                            | Some(TaskStatus::AwaitingReport)
                    )
            })
            .map(|w| w.name)
            .collect();
        if running.is_empty() {
            return;
        }
        if !self.auto_resumed.lock().unwrap().insert(workspace_id.to_string()) {
            return;
        }
        if let Ok(ops) = self.ops() {
            let id = workspace_id.to_string();
            let instruction = format!(
                "Background tasks are still running: {}. Wait for their reports before \
                 concluding; they will arrive as messages in this conversation.",
                running.join(", ")
            );
            tokio::spawn(async move {
                let opts = SendMessageOptions {
                    additional_system_instructions: Some(instruction),
                    allow_queued_agent_task: true,
                    ..Default::default()
                };
                if let Err(e) = ops.resume_stream(&id, opts).await {
                    warn!(workspace = %id, error = %e, "auto-resume failed");
                }
            });
        }
    }
}

// ── Tree helpers ──────────────────────────────────────────────────────────────

fn has_active_descendants(config: &MuxConfig, ws: &str) -> bool {
    config.all_workspaces().iter().any(|w| {
        matches!(
            w.task_status,
            Some(TaskStatus::Queued) | Some(TaskStatus::Running) | Some(TaskStatus::AwaitingReport)
        ) && is_descendant_of(config, &w.id, ws)
    })
}

fn is_descendant_of(config: &MuxConfig, candidate: &str, ancestor: &str) -> bool {
    let mut current = candidate.to_string();
    let mut hops = 0;
    while let Some(meta) = config.find_workspace(&current) {
        match &meta.parent_workspace_id {
            Some(parent) if parent == ancestor => return true,
            Some(parent) => {
                current = parent.clone();
                hops += 1;
                if hops > 64 {
                    return false;
                }
            }
            None => return false,
        }
    }
    false
}

/// Every descendant of `root`, deepest first, so termination cascades
/// leaf-first.
fn descendants_leaf_first(config: &MuxConfig, root: &str) -> Vec<String> {
    let mut ordered = Vec::new();
    let mut frontier = vec![root.to_string()];
    while let Some(current) = frontier.pop() {
        for w in config.all_workspaces() {
            if w.parent_workspace_id.as_deref() == Some(current.as_str()) {
                ordered.push(w.id.clone());
                frontier.push(w.id);
            }
        }
    }
    ordered.reverse();
    ordered
}

fn nearest_task_ancestor(
    config: &MuxConfig,
    task: &WorkspaceMetadata,
) -> Option<WorkspaceMetadata> {
    let parent_id = task.parent_workspace_id.as_ref()?;
    let mut current = config.find_workspace(parent_id)?.clone();
    loop {
        if current.is_task() {
            return Some(current);
        }
        match &current.parent_workspace_id {
            Some(p) => current = config.find_workspace(p)?.clone(),
            None => return None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn ws(id_name: &str, parent: Option<&str>, status: Option<TaskStatus>) -> WorkspaceMetadata {
        let mut meta = WorkspaceMetadata::new(id_name, "/p");
        meta.id = id_name.to_string();
        meta.parent_workspace_id = parent.map(String::from);
        meta.task_status = status;
        meta
    }

    fn config_with(workspaces: Vec<WorkspaceMetadata>) -> MuxConfig {
        let mut cfg = MuxConfig::default();
        cfg.project_mut("/p").workspaces.extend(workspaces);
        cfg
    }

    #[test]
    fn descendants_are_ordered_leaf_first() {
        let cfg = config_with(vec![
            ws("rootroot01", None, None),
            ws("childone01", Some("rootroot01"), Some(TaskStatus::Running)),
            ws("grandkid01", Some("childone01"), Some(TaskStatus::Running)),
        ]);
        let order = descendants_leaf_first(&cfg, "rootroot01");
        assert_eq!(order, vec!["grandkid01".to_string(), "childone01".to_string()]);
    }

    #[test]
    fn active_descendants_detected_transitively() {
        let cfg = config_with(vec![
            ws("rootroot01", None, None),
            ws("childone01", Some("rootroot01"), Some(TaskStatus::Reported)),
            ws("grandkid01", Some("childone01"), Some(TaskStatus::Running)),
        ]);
        assert!(has_active_descendants(&cfg, "rootroot01"));
        assert!(has_active_descendants(&cfg, "childone01"));
        assert!(!has_active_descendants(&cfg, "grandkid01"));
    }

    #[test]
    fn reported_descendants_are_not_active() {
        let cfg = config_with(vec![
            ws("rootroot01", None, None),
            ws("childone01", Some("rootroot01"), Some(TaskStatus::Reported)),
        ]);
        assert!(!has_active_descendants(&cfg, "rootroot01"));
    }

    #[test]
    fn nearest_task_ancestor_skips_non_tasks() {
        let cfg = config_with(vec![
            ws("rootroot01", None, None),
            ws("taskpar001", Some("rootroot01"), Some(TaskStatus::Running)),
            ws("taskkid001", Some("taskpar001"), Some(TaskStatus::Queued)),
        ]);
        let task = cfg.find_workspace("taskkid001").unwrap();
        let ancestor = nearest_task_ancestor(&cfg, task).unwrap();
        assert_eq!(ancestor.id, "taskpar001");
    }
}
