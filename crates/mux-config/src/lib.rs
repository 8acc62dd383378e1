// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod runtime;
mod schema;
mod store;

pub use runtime::{build_runtime_string, parse_runtime_string, ParsedRuntime, RuntimeConfig, RuntimeMode};
pub use schema::{
    generate_workspace_id, AgentMode, AiSettings, MuxConfig, PersistedAiSettings, PersistedSettings,
    ProjectConfig, SectionConfig, SubagentAiDefaults, TaskReport, TaskSettings, TaskStatus,
    ThinkingLevel, WorkspaceMetadata,
};
pub use store::{mux_root, sessions_dir, ConfigStore, SecretsStore};
