// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod builtin;
pub mod events;
pub mod policy;
pub mod registry;
pub mod tool;

pub use events::ToolSideEvent;
pub use policy::{
    apply_tool_policy, normalize_tool_name, resolve_tool_policy, PolicyAction, PolicyError,
    PolicyFilter, ResolvePolicyInput,
};
pub use registry::ToolRegistry;
pub use tool::{Tool, ToolCall, ToolCtx, ToolEffect, ToolOutput};

pub use builtin::agent_report::AgentReportTool;
pub use builtin::bash::{BackgroundProcessManager, BashBackgroundKillTool, BashOutputTool, BashTool};
pub use builtin::file_edit::{FileEditInsertTool, FileEditReplaceStringTool};
pub use builtin::file_read::FileReadTool;
pub use builtin::plan::{AskUserQuestionTool, ProposePlanTool};
pub use builtin::task::{
    CreateTaskRequest, TaskCreation, TaskKind, TaskReportOut, TaskSpawner, TaskTool,
};
