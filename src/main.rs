// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use mux_agents::AgentLoader;
use mux_config::{
    mux_root, parse_runtime_string, ConfigStore, RuntimeMode, SecretsStore, WorkspaceMetadata,
};
use mux_core::{
    EventBus, Orchestrator, RuntimeFactory, SendMessageOptions, StreamManager, TaskService,
    TaskSpawnerHandle,
    ToolSetFactory, WorkspaceEvent, WorkspaceOps, WorkspaceService,
};
use mux_model::ProviderRegistry;
use mux_runtime::{LocalRuntime, Runtime, SshRuntime, WorktreeRuntime};
use mux_session::{InitStateManager, SessionStore};
use mux_tools::{
    AgentReportTool, AskUserQuestionTool, BackgroundProcessManager, BashBackgroundKillTool,
    BashOutputTool, BashTool, FileEditInsertTool, FileEditReplaceStringTool, FileReadTool,
    ProposePlanTool, TaskTool, ToolRegistry,
};

/// Everything the process owns, wired once at startup.
struct Services {
    config: Arc<ConfigStore>,
    agents: Arc<AgentLoader>,
    events: Arc<EventBus>,
    workspaces: Arc<WorkspaceService>,
    tasks: Arc<TaskService>,
}

fn runtime_factory(root: PathBuf) -> RuntimeFactory {
    Arc::new(move |meta: &WorkspaceMetadata| -> Arc<dyn Runtime> {
        let parsed = parse_runtime_string(meta.runtime_config.as_deref());
        match parsed.mode {
            RuntimeMode::Local => Arc::new(LocalRuntime::new(&meta.project_path)),
            RuntimeMode::Worktree => {
                let dir = root
                    .join("worktrees")
                    .join(format!("{}-{}", meta.name, meta.id));
                Arc::new(WorktreeRuntime::new(&meta.project_path, dir))
            }
            RuntimeMode::Ssh => Arc::new(SshRuntime::new(
                parsed.host,
                meta.project_path.clone(),
                PathBuf::from(format!("~/.mux/worktrees/{}-{}", meta.name, meta.id)),
                None,
                None,
            )),
        }
    })
}

fn build_services(root: PathBuf) -> Services {
    let config = Arc::new(ConfigStore::new(&root));
    let secrets = Arc::new(SecretsStore::new(&root));
    let sessions_root = root.join("sessions");
    let sessions = Arc::new(SessionStore::new(&sessions_root));
    let events = Arc::new(EventBus::new());
    let streams = Arc::new(StreamManager::new(sessions.clone(), events.clone()));
    let init = Arc::new(InitStateManager::new(&sessions_root, None));
    let agents = Arc::new(AgentLoader::new(root.join("agents")));
    let providers = Arc::new(ProviderRegistry::new());
    let factory = runtime_factory(root);

    let tasks = Arc::new(TaskService::new(
        config.clone(),
        sessions.clone(),
        events.clone(),
        factory.clone(),
    ));

    let background = Arc::new(BackgroundProcessManager::new());
    let tool_tasks = tasks.clone();
    let tool_factory: ToolSetFactory = Arc::new(move || {
        let mut reg = ToolRegistry::new();
        reg.register(FileReadTool);
        reg.register(FileEditReplaceStringTool);
        reg.register(FileEditInsertTool);
        reg.register(BashTool::new(background.clone()));
        reg.register(BashOutputTool {
            manager: background.clone(),
        });
        reg.register(BashBackgroundKillTool {
            manager: background.clone(),
        });
        reg.register(TaskTool::new(Arc::new(TaskSpawnerHandle(tool_tasks.clone()))));
        reg.register(AgentReportTool);
        reg.register(ProposePlanTool);
        reg.register(AskUserQuestionTool);
        reg
    });

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        secrets,
        sessions.clone(),
        events.clone(),
        streams.clone(),
        providers,
        agents.clone(),
        init.clone(),
        factory.clone(),
        tool_factory,
    ));
    let workspaces = Arc::new(WorkspaceService::new(
        config.clone(),
        sessions,
        events.clone(),
        streams.clone(),
        orchestrator,
        init,
        factory,
    ));

    tasks.set_workspace_ops(workspaces.clone() as Arc<dyn WorkspaceOps>);
    streams.add_observer(Arc::new(tasks.clone()));

    Services {
        config,
        agents,
        events,
        workspaces,
        tasks,
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_env("MUX_LOG").unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    if let Ok(path) = std::env::var("MUX_LOG_FILE") {
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
                .init();
            return;
        }
    }
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let root = cli
        .root
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(mux_root);
    let services = build_services(root.clone());

    match cli.command {
        Commands::Workspaces => {
            let config = services.config.load().await;
            for (project, pc) in &config.projects {
                println!("{project}");
                for ws in &pc.workspaces {
                    let status = ws
                        .task_status
                        .map(|s| format!(" [{}]", serde_json::to_string(&s).unwrap_or_default()))
                        .unwrap_or_default();
                    println!("  {}  {}{}", ws.id, ws.name, status);
                }
            }
        }
        Commands::Agents { path } => {
            let dir = PathBuf::from(&path);
            let runtime = LocalRuntime::new(&dir);
            for agent in services.agents.discover(&runtime, Path::new(&path)).await {
                println!(
                    "{:<16} {:?}  {}",
                    agent.id,
                    agent.scope,
                    agent.description.unwrap_or_default()
                );
            }
        }
        Commands::Doctor => {
            let config = services.config.load().await;
            let workspaces = config.all_workspaces();
            let tasks = workspaces.iter().filter(|w| w.is_task()).count();
            println!("root: {}", root.display());
            println!("projects: {}", config.projects.len());
            println!("workspaces: {} ({} task workspaces)", workspaces.len(), tasks);
            println!("taskSettings: {:?}", config.task_settings());
        }
        Commands::Send {
            workspace,
            text,
            model,
            agent,
        } => {
            let mut rx = services.events.subscribe(&workspace);
            let printer = tokio::spawn(async move {
                while let Ok(event) = rx.recv().await {
                    match event {
                        WorkspaceEvent::StreamDelta { delta, .. } => print!("{delta}"),
                        WorkspaceEvent::StreamEnd { .. }
                        | WorkspaceEvent::StreamAbort { .. }
                        | WorkspaceEvent::StreamError { .. } => {
                            println!();
                            break;
                        }
                        _ => {}
                    }
                }
            });
            services
                .workspaces
                .send_message(
                    &workspace,
                    &text,
                    SendMessageOptions {
                        model,
                        agent_id: agent,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))
                .context("send failed")?;
            let _ = printer.await;
        }
        Commands::Resume => {
            services
                .tasks
                .initialize()
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            println!("task queue drained");
        }
    }
    Ok(())
}
