// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Full-stack integration tests: the complete service wiring (config,
/// sessions, stream manager, orchestrator, workspace + task services)
/// driven by scripted mock providers, against a temporary MUX_ROOT.
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use mux_agents::AgentLoader;
use mux_config::{ConfigStore, SecretsStore, WorkspaceMetadata};
use mux_core::{
    EventBus, Orchestrator, RuntimeFactory, SendMessageOptions, StreamManager, StreamOutcome,
    TaskService, ToolSetFactory, WorkspaceOps, WorkspaceService,
};
use mux_model::{Part, ProviderEvent, ProviderRegistry, ScriptedProvider, ToolPartState};
use mux_runtime::{LocalRuntime, Runtime};
use mux_session::{InitStateManager, SessionStore};
use mux_tools::{
    AgentReportTool, BackgroundProcessManager, BashTool, FileEditReplaceStringTool, FileReadTool,
    TaskTool, ToolRegistry,
};

struct Stack {
    _tmp: TempDir,
    project: PathBuf,
    config: Arc<ConfigStore>,
    sessions: Arc<SessionStore>,
    events: Arc<EventBus>,
    workspaces: Arc<WorkspaceService>,
    tasks: Arc<TaskService>,
}

/// Wire the whole orchestrator the way the binary does, with scripted
/// providers registered under the given names.
fn stack(providers_with_scripts: Vec<(&str, Vec<Vec<ProviderEvent>>)>) -> Stack {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let project = root.join("proj");
    std::fs::create_dir_all(&project).unwrap();

    let config = Arc::new(ConfigStore::new(&root));
    let secrets = Arc::new(SecretsStore::new(&root));
    let sessions = Arc::new(SessionStore::new(root.join("sessions")));
    let events = Arc::new(EventBus::new());
    let streams = Arc::new(StreamManager::new(sessions.clone(), events.clone()));
    let init = Arc::new(InitStateManager::new(root.join("sessions"), None));
    let agents = Arc::new(AgentLoader::new(root.join("agents")));

    let mut registry = ProviderRegistry::new();
    for (name, scripts) in providers_with_scripts {
        let provider = ScriptedProvider::new(scripts);
        registry.register(name, move |_| {
            Ok(Arc::new(provider.handle()) as Arc<dyn mux_model::ModelProvider>)
        });
    }
    let providers = Arc::new(registry);

    let project_for_factory = project.clone();
    let runtime_factory: RuntimeFactory = Arc::new(move |_meta: &WorkspaceMetadata| {
        Arc::new(LocalRuntime::new(&project_for_factory)) as Arc<dyn Runtime>
    });

    let tasks = Arc::new(TaskService::new(
        config.clone(),
        sessions.clone(),
        events.clone(),
        runtime_factory.clone(),
    ));

    let background = Arc::new(BackgroundProcessManager::new());
    let tool_tasks = tasks.clone();
    let tool_factory: ToolSetFactory = Arc::new(move || {
        let mut reg = ToolRegistry::new();
        reg.register(FileReadTool);
        reg.register(FileEditReplaceStringTool);
        reg.register(BashTool::new(background.clone()));
        reg.register(TaskTool::new(Arc::new(tool_tasks.clone())));
        reg.register(AgentReportTool);
        reg
    });

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        secrets,
        sessions.clone(),
        events.clone(),
        streams.clone(),
        providers,
        agents,
        init.clone(),
        runtime_factory.clone(),
        tool_factory,
    ));
    let workspaces = Arc::new(WorkspaceService::new(
        config.clone(),
        sessions.clone(),
        events.clone(),
        streams.clone(),
        orchestrator,
        init,
        runtime_factory,
    ));

    tasks.set_workspace_ops(workspaces.clone() as Arc<dyn WorkspaceOps>);
    streams.add_observer(Arc::new(tasks.clone()));

    Stack {
        _tmp: tmp,
        project,
        config,
        sessions,
        events,
        workspaces,
        tasks,
    }
}

async fn create_workspace(s: &Stack, name: &str) -> String {
    s.workspaces
        .create(mux_core::CreateWorkspaceRequest {
            project_path: s.project.to_string_lossy().into_owned(),
            name: name.into(),
            runtime_config: Some("local".into()),
            agent_type: None,
        })
        .await
        .unwrap()
        .id
}

fn opts(model: &str) -> SendMessageOptions {
    SendMessageOptions {
        model: Some(model.to_string()),
        ..Default::default()
    }
}

// ── Plain conversation ────────────────────────────────────────────────────────

#[tokio::test]
async fn conversation_round_trip_with_mock_provider() {
    let s = stack(vec![]);
    let ws = create_workspace(&s, "main").await;

    // The built-in `mock` provider echoes the last user message.
    let outcome = s
        .workspaces
        .send_message(&ws, "hello orchestrator", opts("mock:echo"))
        .await
        .unwrap();
    assert_eq!(outcome, StreamOutcome::Completed);

    let history = s.sessions.read_history(&ws).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[1].text().contains("hello orchestrator"));
}

#[tokio::test]
async fn history_survives_process_restart() {
    let tmp_holder;
    let project;
    let ws_id;
    {
        let s = stack(vec![]);
        let ws = create_workspace(&s, "durable").await;
        s.workspaces
            .send_message(&ws, "persist me", opts("mock:echo"))
            .await
            .unwrap();
        ws_id = ws;
        project = s.project.clone();
        tmp_holder = s._tmp;
    }

    // A fresh stack over the same root sees the same state.
    let root = tmp_holder.path().to_path_buf();
    let config = ConfigStore::new(&root);
    let sessions = SessionStore::new(root.join("sessions"));
    let meta = config.load().await.find_workspace(&ws_id).cloned().unwrap();
    assert_eq!(meta.name, "durable");
    assert_eq!(meta.project_path, project.to_string_lossy());

    let history = sessions.read_history(&ws_id).await.unwrap();
    assert_eq!(history.len(), 2);
    let seqs: Vec<u64> = history
        .iter()
        .map(|m| m.metadata.as_ref().unwrap().history_sequence.unwrap())
        .collect();
    assert_eq!(seqs, vec![1, 2]);
}

// ── Subagent round trip ───────────────────────────────────────────────────────

#[tokio::test]
async fn subagent_task_reports_back_into_parent_tool_call() {
    // Parent model: calls the task tool, then concludes after the report.
    // Child model: immediately files its report.
    let s = stack(vec![
        (
            "parent",
            vec![
                vec![
                    ProviderEvent::ToolCall {
                        id: "tc-task".into(),
                        name: "task".into(),
                        arguments: r#"{"kind": "agent", "agent_type": "explore", "prompt": "count the files"}"#.into(),
                    },
                    ProviderEvent::Done,
                ],
                vec![
                    ProviderEvent::TextDelta("Subagent finished.".into()),
                    ProviderEvent::Done,
                ],
            ],
        ),
        (
            "child",
            vec![vec![
                ProviderEvent::ToolCall {
                    id: "tc-report".into(),
                    name: "agent_report".into(),
                    arguments: r#"{"reportMarkdown": "Hello from child", "title": "Result"}"#.into(),
                },
                ProviderEvent::Done,
            ]],
        ),
    ]);
    let ws = create_workspace(&s, "main").await;
    // Subagents inherit the parent's configured model.
    s.config
        .edit_workspace(&ws, |w| {
            w.ai_settings = Some(mux_config::AiSettings {
                model: Some("child:sub".into()),
                thinking_level: None,
            })
        })
        .await
        .unwrap();

    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        s.workspaces
            .send_message(&ws, "delegate the counting", opts("parent:main")),
    )
    .await
    .expect("subagent round trip must not hang")
    .unwrap();
    assert_eq!(outcome, StreamOutcome::Completed);

    let history = s.sessions.read_history(&ws).await.unwrap();
    let assistant = history
        .iter()
        .find(|m| m.find_tool_part("tc-task").is_some())
        .expect("assistant message with the task call");
    match assistant.find_tool_part("tc-task").unwrap() {
        Part::DynamicTool { state, output, .. } => {
            assert_eq!(*state, ToolPartState::OutputAvailable);
            let serialized = serde_json::to_string(output.as_ref().unwrap()).unwrap();
            assert!(serialized.contains("Hello from child"), "{serialized}");
        }
        other => panic!("unexpected part: {other:?}"),
    }

    // The child workspace was cleaned up after reporting; the report is
    // still resolvable from the cache.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let remaining_tasks: Vec<WorkspaceMetadata> = s
        .config
        .load()
        .await
        .all_workspaces()
        .into_iter()
        .filter(|w| w.is_task())
        .collect();
    assert!(
        remaining_tasks.is_empty(),
        "reported child should be removed: {remaining_tasks:?}"
    );
}

// ── Tool execution against the real runtime ───────────────────────────────────

#[tokio::test]
async fn file_edit_via_stream_modifies_workspace() {
    let s = stack(vec![(
        "scripted",
        vec![
            vec![
                ProviderEvent::ToolCall {
                    id: "tc-edit".into(),
                    name: "file_edit_replace_string".into(),
                    arguments:
                        r#"{"path": "src.txt", "old_string": "old value", "new_string": "new value"}"#
                            .into(),
                },
                ProviderEvent::Done,
            ],
            vec![ProviderEvent::TextDelta("edited".into()), ProviderEvent::Done],
        ],
    )]);
    std::fs::write(s.project.join("src.txt"), "old value\n").unwrap();
    let ws = create_workspace(&s, "main").await;

    s.workspaces
        .send_message(&ws, "fix the value", opts("scripted:x"))
        .await
        .unwrap();

    let content = std::fs::read_to_string(s.project.join("src.txt")).unwrap();
    assert_eq!(content, "new value\n");
}

// ── Restart bookkeeping ───────────────────────────────────────────────────────

#[tokio::test]
async fn initialize_is_safe_on_a_quiet_root() {
    let s = stack(vec![]);
    let _ws = create_workspace(&s, "main").await;
    s.tasks.initialize().await.unwrap();
    // Nothing queued, nothing awaiting: no events, no panics.
    let mut rx = s.events.subscribe("nobody");
    assert!(rx.try_recv().is_err());
}
