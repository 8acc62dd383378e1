// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;
use thiserror::Error;

use mux_agents::{AgentFrontmatter, PermissionMode};
use mux_config::AgentMode;

/// What a matching policy filter does to a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Enable,
    Disable,
    /// Reduce the available toolset to exactly the single matching tool.
    Require,
}

/// One ordered filter.  Patterns are regexes, anchored on application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyFilter {
    pub pattern: String,
    pub action: PolicyAction,
}

impl PolicyFilter {
    pub fn new(pattern: impl Into<String>, action: PolicyAction) -> Self {
        Self {
            pattern: pattern.into(),
            action,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("require filters match more than one tool: {0:?}")]
    AmbiguousRequire(Vec<String>),
}

/// Inputs that determine the effective policy for one stream.
pub struct ResolvePolicyInput<'a> {
    pub mode: AgentMode,
    pub frontmatter: &'a AgentFrontmatter,
    pub is_subagent: bool,
    /// Set when task nesting already reached `maxTaskNestingDepth`.
    pub disable_task_tools_for_depth: bool,
}

/// Compose the effective ordered filter list.
///
/// Chunk order matters: the agent's own section comes first and the hard
/// denies are appended last, so an agent definition can never re-enable a
/// tool the mode, depth, or subagent status forbids.
pub fn resolve_tool_policy(input: &ResolvePolicyInput<'_>) -> Vec<PolicyFilter> {
    use PolicyAction::{Disable, Enable};

    // Compact runs toolless, full stop.
    if input.mode == AgentMode::Compact {
        return vec![PolicyFilter::new(".*", Disable)];
    }

    let fm = input.frontmatter;
    let mut policy: Vec<PolicyFilter> = Vec::new();

    let only = fm
        .policy
        .tools
        .only
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|n| normalize_tool_name(n))
        .collect::<Vec<_>>();

    if !only.is_empty() {
        // Ground-up allowlist replaces the whole agent section, minus names
        // the current mode denies at the base level.
        policy.push(PolicyFilter::new(".*", Disable));
        for name in only {
            if input.mode == AgentMode::Exec && name == "propose_plan" {
                continue;
            }
            policy.push(PolicyFilter::new(name, Enable));
        }
    } else {
        // Permission-mode baseline.  An absent mode on a custom agent means
        // deny-all until the definition says otherwise.
        match fm.permission_mode {
            Some(PermissionMode::Default) => {}
            Some(PermissionMode::ReadOnly) => {
                policy.push(PolicyFilter::new(".*", Disable));
                for allowed in [
                    "file_read",
                    "agent_skill_read",
                    "agent_skill_read_file",
                    "web_fetch",
                ] {
                    policy.push(PolicyFilter::new(allowed, Enable));
                }
            }
            None => policy.push(PolicyFilter::new(".*", Disable)),
        }

        for name in fm.tools.as_deref().unwrap_or_default() {
            if let Some(n) = normalize_tool_name(name) {
                policy.push(PolicyFilter::new(n, Enable));
            }
        }
        for name in fm.disallowed_tools.as_deref().unwrap_or_default() {
            if let Some(n) = normalize_tool_name(name) {
                policy.push(PolicyFilter::new(n, Disable));
            }
        }
        for name in fm.policy.tools.deny.as_deref().unwrap_or_default() {
            if let Some(n) = normalize_tool_name(name) {
                policy.push(PolicyFilter::new(n, Disable));
            }
        }
    }

    // Base hard-deny: exec agents never propose plans.
    if input.mode == AgentMode::Exec {
        policy.push(PolicyFilter::new("propose_plan", Disable));
    }

    if input.disable_task_tools_for_depth {
        policy.push(PolicyFilter::new("task", Disable));
        policy.push(PolicyFilter::new("task_.*", Disable));
    }

    if input.is_subagent {
        policy.push(PolicyFilter::new("task", Disable));
        policy.push(PolicyFilter::new("task_.*", Disable));
        policy.push(PolicyFilter::new("propose_plan", Disable));
        policy.push(PolicyFilter::new("ask_user_question", Disable));
        // The one thing a subagent must always be able to do.
        policy.push(PolicyFilter::new("agent_report", Enable));
    }

    policy
}

/// Map human tool aliases onto canonical name regexes.  Whitespace is
/// trimmed; empty names are dropped.
pub fn normalize_tool_name(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(match name {
        "Read" => "file_read".to_string(),
        "Edit" => "file_edit_.*".to_string(),
        "Bash" => "(?:bash|bash_output|bash_background_.*)".to_string(),
        other => other.to_string(),
    })
}

fn anchored(pattern: &str) -> Regex {
    Regex::new(&format!("^(?:{pattern})$"))
        .unwrap_or_else(|_| Regex::new(&format!("^{}$", regex::escape(pattern))).unwrap())
}

/// Filter `tools` through `policy`.
///
/// An empty policy passes everything.  `require` entries are resolved
/// first: exactly one distinct match reduces the set to that tool, more
/// than one is a loud policy error, none falls through to normal replay
/// where the last matching filter wins.
pub fn apply_tool_policy(tools: &[String], policy: &[PolicyFilter]) -> Result<Vec<String>, PolicyError> {
    if policy.is_empty() {
        return Ok(tools.to_vec());
    }

    let compiled: Vec<(Regex, PolicyAction)> = policy
        .iter()
        .map(|f| (anchored(&f.pattern), f.action))
        .collect();

    let mut required: Vec<String> = Vec::new();
    for (re, action) in &compiled {
        if *action != PolicyAction::Require {
            continue;
        }
        for tool in tools {
            if re.is_match(tool) && !required.contains(tool) {
                required.push(tool.clone());
            }
        }
    }
    if required.len() > 1 {
        return Err(PolicyError::AmbiguousRequire(required));
    }
    if required.len() == 1 {
        return Ok(required);
    }

    let mut result = Vec::new();
    for tool in tools {
        let mut enabled = true;
        for (re, action) in &compiled {
            if *action == PolicyAction::Require {
                continue;
            }
            if re.is_match(tool) {
                enabled = *action == PolicyAction::Enable;
            }
        }
        if enabled {
            result.push(tool.clone());
        }
    }
    Ok(result)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
