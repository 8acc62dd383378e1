// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The single durable configuration document (`config.json` under MUX_ROOT).
///
/// Projects are an ordered list of `[absolutePath, ProjectConfig]` pairs so
/// the on-disk JSON stays stable across edits (HashMap ordering would churn
/// the file on every write).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuxConfig {
    #[serde(default)]
    pub projects: Vec<(String, ProjectConfig)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_settings: Option<TaskSettings>,
    /// Per-agent-type model defaults applied when spawning subagent tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_ai_defaults: Option<HashMap<String, SubagentAiDefaults>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted_settings: Option<PersistedSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_project_clone_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_port: Option<u16>,
}

impl MuxConfig {
    pub fn project(&self, path: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|(p, _)| p == path).map(|(_, c)| c)
    }

    pub fn project_mut(&mut self, path: &str) -> &mut ProjectConfig {
        if !self.projects.iter().any(|(p, _)| p == path) {
            self.projects
                .push((path.to_string(), ProjectConfig::default()));
        }
        let idx = self.projects.iter().position(|(p, _)| p == path).unwrap();
        &mut self.projects[idx].1
    }

    pub fn find_workspace(&self, id: &str) -> Option<&WorkspaceMetadata> {
        self.projects
            .iter()
            .flat_map(|(_, p)| p.workspaces.iter())
            .find(|w| w.id == id)
    }

    pub fn find_workspace_mut(&mut self, id: &str) -> Option<&mut WorkspaceMetadata> {
        self.projects
            .iter_mut()
            .flat_map(|(_, p)| p.workspaces.iter_mut())
            .find(|w| w.id == id)
    }

    pub fn all_workspaces(&self) -> Vec<WorkspaceMetadata> {
        self.projects
            .iter()
            .flat_map(|(_, p)| p.workspaces.iter().cloned())
            .collect()
    }

    /// Remove a workspace entry wherever it lives.  Returns the removed entry.
    pub fn remove_workspace(&mut self, id: &str) -> Option<WorkspaceMetadata> {
        for (_, project) in self.projects.iter_mut() {
            if let Some(pos) = project.workspaces.iter().position(|w| w.id == id) {
                return Some(project.workspaces.remove(pos));
            }
        }
        None
    }

    /// `(projectPath, name)` must be unique among non-archived workspaces.
    pub fn name_in_use(&self, project_path: &str, name: &str) -> bool {
        self.project(project_path)
            .map(|p| {
                p.workspaces
                    .iter()
                    .any(|w| w.name == name && w.archived_at.is_none())
            })
            .unwrap_or(false)
    }

    pub fn task_settings(&self) -> TaskSettings {
        self.task_settings.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    #[serde(default)]
    pub workspaces: Vec<WorkspaceMetadata>,
    /// In-order linked list of sections; each entry points at the next via
    /// `nextId`.  Purely organisational — the orchestrator never interprets it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sections: Option<Vec<SectionConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_compaction_hours: Option<u32>,
    /// Names of secrets this project may read.  Values live in `secrets.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionConfig {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_id: Option<String>,
}

/// Metadata for a single workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMetadata {
    /// Stable 10-character lowercase id.
    pub id: String,
    pub name: String,
    pub project_path: String,
    pub created_at: DateTime<Utc>,
    /// Runtime mode string: absent → worktree, `"local"`, `"ssh <host>"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_config: Option<String>,
    /// Set when this workspace is a subagent task; its lifecycle is then
    /// owned by the task service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_settings: Option<AiSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unarchived_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,

    // ── Task state (task workspaces only) ────────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_model_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_thinking_level: Option<ThinkingLevel>,
    /// The task prompt, kept until the task leaves `queued` (queued tasks
    /// have no materialized workspace to hold anything else).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_prompt: Option<String>,
    /// The parent's `task` tool-call id, recorded at create time so report
    /// routing survives parent resumes and process restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_report: Option<TaskReport>,
}

impl WorkspaceMetadata {
    pub fn new(name: impl Into<String>, project_path: impl Into<String>) -> Self {
        Self {
            id: generate_workspace_id(),
            name: name.into(),
            project_path: project_path.into(),
            created_at: Utc::now(),
            runtime_config: None,
            parent_workspace_id: None,
            agent_type: None,
            task_status: None,
            ai_settings: None,
            archived_at: None,
            unarchived_at: None,
            section_id: None,
            task_model_string: None,
            task_thinking_level: None,
            task_prompt: None,
            task_call_id: None,
            reported_at: None,
            task_report: None,
        }
    }

    pub fn is_task(&self) -> bool {
        self.parent_workspace_id.is_some()
    }
}

/// Lifecycle of a task workspace.  Advances monotonically
/// `queued → running → awaiting_report → reported`; `reported` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    AwaitingReport,
    Reported,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::AwaitingReport => 2,
            Self::Reported => 3,
        }
    }

    /// `true` when advancing from `self` to `next` respects monotonicity.
    /// The single sanctioned reversal is `awaiting_report → running`, used
    /// when a parent task still has active descendants.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        if self == Self::AwaitingReport && next == Self::Running {
            return true;
        }
        next.rank() >= self.rank() && self != Self::Reported
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub report_markdown: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<ThinkingLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Off,
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSettings {
    pub max_parallel_agent_tasks: usize,
    pub max_task_nesting_depth: usize,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            max_parallel_agent_tasks: 3,
            max_task_nesting_depth: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentAiDefaults {
    pub model_string: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<ThinkingLevel>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai: Option<PersistedAiSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_defaults: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedAiSettings {
    #[serde(default)]
    pub thinking_level_by_model: HashMap<String, ThinkingLevel>,
}

/// Effective operating mode of an agent.
///
/// `exec` may modify the workspace, `plan` reads and proposes, `compact`
/// runs with no tools at all (history summarization).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Exec,
    Plan,
    Compact,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exec => write!(f, "exec"),
            Self::Plan => write!(f, "plan"),
            Self::Compact => write!(f, "compact"),
        }
    }
}

/// Allocate a stable 10-character lowercase workspace id.
pub fn generate_workspace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..10].to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_ids_are_ten_lowercase_chars() {
        for _ in 0..32 {
            let id = generate_workspace_id();
            assert_eq!(id.len(), 10);
            assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn workspace_ids_are_unique() {
        let a = generate_workspace_id();
        let b = generate_workspace_id();
        assert_ne!(a, b);
    }

    // ── Projects list ─────────────────────────────────────────────────────────

    #[test]
    fn project_mut_creates_missing_project() {
        let mut cfg = MuxConfig::default();
        cfg.project_mut("/home/user/proj").workspaces.push(
            WorkspaceMetadata::new("main", "/home/user/proj"),
        );
        assert_eq!(cfg.projects.len(), 1);
        assert!(cfg.project("/home/user/proj").is_some());
    }

    #[test]
    fn find_workspace_searches_all_projects() {
        let mut cfg = MuxConfig::default();
        let ws = WorkspaceMetadata::new("feature", "/p2");
        let id = ws.id.clone();
        cfg.project_mut("/p1");
        cfg.project_mut("/p2").workspaces.push(ws);
        assert_eq!(cfg.find_workspace(&id).unwrap().name, "feature");
    }

    #[test]
    fn remove_workspace_returns_removed_entry() {
        let mut cfg = MuxConfig::default();
        let ws = WorkspaceMetadata::new("gone", "/p");
        let id = ws.id.clone();
        cfg.project_mut("/p").workspaces.push(ws);
        let removed = cfg.remove_workspace(&id).unwrap();
        assert_eq!(removed.name, "gone");
        assert!(cfg.find_workspace(&id).is_none());
    }

    // ── Name uniqueness ───────────────────────────────────────────────────────

    #[test]
    fn name_in_use_among_non_archived() {
        let mut cfg = MuxConfig::default();
        cfg.project_mut("/p")
            .workspaces
            .push(WorkspaceMetadata::new("main", "/p"));
        assert!(cfg.name_in_use("/p", "main"));
        assert!(!cfg.name_in_use("/p", "other"));
        assert!(!cfg.name_in_use("/q", "main"));
    }

    #[test]
    fn archived_workspace_frees_its_name() {
        let mut cfg = MuxConfig::default();
        let mut ws = WorkspaceMetadata::new("main", "/p");
        ws.archived_at = Some(Utc::now());
        cfg.project_mut("/p").workspaces.push(ws);
        assert!(!cfg.name_in_use("/p", "main"));
    }

    // ── Task status monotonicity ──────────────────────────────────────────────

    #[test]
    fn task_status_advances_forward() {
        assert!(TaskStatus::Queued.can_advance_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_advance_to(TaskStatus::AwaitingReport));
        assert!(TaskStatus::AwaitingReport.can_advance_to(TaskStatus::Reported));
    }

    #[test]
    fn task_status_reported_is_terminal() {
        assert!(!TaskStatus::Reported.can_advance_to(TaskStatus::Running));
        assert!(!TaskStatus::Reported.can_advance_to(TaskStatus::Queued));
    }

    #[test]
    fn awaiting_report_may_revert_to_running() {
        // The one sanctioned reversal: a parent with active descendants.
        assert!(TaskStatus::AwaitingReport.can_advance_to(TaskStatus::Running));
        assert!(!TaskStatus::Running.can_advance_to(TaskStatus::Queued));
    }

    // ── Serialization shape ───────────────────────────────────────────────────

    #[test]
    fn projects_serialize_as_path_config_pairs() {
        let mut cfg = MuxConfig::default();
        cfg.project_mut("/abs/path");
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["projects"][0][0], "/abs/path");
        assert!(json["projects"][0][1].is_object());
    }

    #[test]
    fn workspace_metadata_uses_camel_case() {
        let ws = WorkspaceMetadata::new("n", "/p");
        let json = serde_json::to_value(&ws).unwrap();
        assert!(json.get("projectPath").is_some());
        assert!(json.get("createdAt").is_some());
        assert!(json.get("project_path").is_none());
    }

    #[test]
    fn task_status_round_trips_snake_case() {
        let json = serde_json::to_string(&TaskStatus::AwaitingReport).unwrap();
        assert_eq!(json, "\"awaiting_report\"");
        let back: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TaskStatus::AwaitingReport);
    }

    #[test]
    fn default_task_settings() {
        let s = TaskSettings::default();
        assert_eq!(s.max_parallel_agent_tasks, 3);
        assert_eq!(s.max_task_nesting_depth, 3);
    }
}
