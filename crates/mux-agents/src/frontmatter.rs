// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::Deserialize;
use thiserror::Error;

use mux_config::{AgentMode, ThinkingLevel};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentDefinitionParseError {
    #[error("frontmatter delimiters missing")]
    MissingFrontmatter,
    #[error("invalid frontmatter YAML: {0}")]
    InvalidYaml(String),
    #[error("policy.tools.deny and policy.tools.only cannot both be set")]
    ConflictingToolFilters,
    #[error("agent file too large: {size} bytes (max {max})")]
    Oversized { size: u64, max: u64 },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentFrontmatter {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Id of the agent this definition inherits from.
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub prompt: PromptConfig,
    /// `None` for unknown custom agents resolves to deny-all (safe default).
    #[serde(default)]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    #[serde(default)]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub subagent: SubagentConfig,
    #[serde(default)]
    pub ai: Option<AiDefaults>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PromptConfig {
    /// When `true` and `base` is set, the base's resolved body is prepended.
    /// The default is `false`: appending always requires the explicit form.
    #[serde(default)]
    pub append: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    ReadOnly,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    /// The agent's operating mode; `exec` when absent.
    #[serde(default)]
    pub base: Option<AgentMode>,
    #[serde(default)]
    pub tools: PolicyTools,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyTools {
    /// Ground-up allowlist; mutually exclusive with `deny`.
    #[serde(default)]
    pub only: Option<Vec<String>>,
    #[serde(default)]
    pub deny: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UiConfig {
    #[serde(default)]
    pub selectable: Option<bool>,
    #[serde(default)]
    pub hidden: Option<bool>,
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubagentConfig {
    /// Whether the `task` tool may spawn this agent.
    #[serde(default)]
    pub runnable: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiDefaults {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub thinking_level: Option<ThinkingLevel>,
}

/// Split an agent markdown file into parsed frontmatter and body.
///
/// The file must open with a `---` fence on the first line.  Validation
/// failures are typed so the loader can log-and-skip without poisoning
/// sibling definitions.
pub fn parse_agent_markdown(
    raw: &str,
) -> Result<(AgentFrontmatter, String), AgentDefinitionParseError> {
    let rest = raw.trim_start_matches('\u{feff}').trim_start_matches('\n');
    let after_open = rest
        .strip_prefix("---")
        .ok_or(AgentDefinitionParseError::MissingFrontmatter)?;
    let close = after_open
        .find("\n---")
        .ok_or(AgentDefinitionParseError::MissingFrontmatter)?;
    let yaml_block = &after_open[..close];
    let body = after_open[close + 4..]
        .trim_start_matches('\n')
        .to_string();

    let fm: AgentFrontmatter = serde_yaml::from_str(yaml_block)
        .map_err(|e| AgentDefinitionParseError::InvalidYaml(e.to_string()))?;

    let only_set = fm.policy.tools.only.as_ref().is_some_and(|v| !v.is_empty());
    let deny_set = fm.policy.tools.deny.as_ref().is_some_and(|v| !v.is_empty());
    if only_set && deny_set {
        return Err(AgentDefinitionParseError::ConflictingToolFilters);
    }

    Ok((fm, body))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_agent() {
        let raw = "---\nname: Tester\n---\n\nYou test things.";
        let (fm, body) = parse_agent_markdown(raw).unwrap();
        assert_eq!(fm.name, "Tester");
        assert_eq!(body, "You test things.");
        assert!(!fm.prompt.append);
        assert!(fm.permission_mode.is_none());
    }

    #[test]
    fn parses_full_frontmatter() {
        let raw = "---\n\
                   name: Reviewer\n\
                   description: Reviews diffs.\n\
                   base: exec\n\
                   prompt:\n  append: true\n\
                   permissionMode: readOnly\n\
                   tools: [file_read]\n\
                   disallowedTools: [bash]\n\
                   policy:\n  base: plan\n  tools:\n    deny: [task]\n\
                   ui:\n  color: teal\n  hidden: true\n\
                   subagent:\n  runnable: true\n\
                   ai:\n  model: mock:fast\n\
                   ---\nBody.";
        let (fm, body) = parse_agent_markdown(raw).unwrap();
        assert_eq!(fm.base.as_deref(), Some("exec"));
        assert!(fm.prompt.append);
        assert_eq!(fm.permission_mode, Some(PermissionMode::ReadOnly));
        assert_eq!(fm.tools.as_deref(), Some(&["file_read".to_string()][..]));
        assert_eq!(fm.policy.base, Some(AgentMode::Plan));
        assert_eq!(fm.policy.tools.deny.as_deref(), Some(&["task".to_string()][..]));
        assert_eq!(fm.ui.color.as_deref(), Some("teal"));
        assert_eq!(fm.subagent.runnable, Some(true));
        assert_eq!(fm.ai.unwrap().model.as_deref(), Some("mock:fast"));
        assert_eq!(body, "Body.");
    }

    #[test]
    fn missing_fence_is_error() {
        assert_eq!(
            parse_agent_markdown("no fences here").unwrap_err(),
            AgentDefinitionParseError::MissingFrontmatter
        );
    }

    #[test]
    fn unterminated_fence_is_error() {
        assert_eq!(
            parse_agent_markdown("---\nname: X\nno close").unwrap_err(),
            AgentDefinitionParseError::MissingFrontmatter
        );
    }

    #[test]
    fn invalid_yaml_is_error() {
        let raw = "---\nname: [unclosed\n---\nbody";
        assert!(matches!(
            parse_agent_markdown(raw).unwrap_err(),
            AgentDefinitionParseError::InvalidYaml(_)
        ));
    }

    #[test]
    fn deny_and_only_together_are_rejected() {
        let raw = "---\nname: X\npolicy:\n  tools:\n    only: [file_read]\n    deny: [bash]\n---\nb";
        assert_eq!(
            parse_agent_markdown(raw).unwrap_err(),
            AgentDefinitionParseError::ConflictingToolFilters
        );
    }

    #[test]
    fn empty_only_does_not_conflict_with_deny() {
        let raw = "---\nname: X\npolicy:\n  tools:\n    only: []\n    deny: [bash]\n---\nb";
        assert!(parse_agent_markdown(raw).is_ok());
    }

    #[test]
    fn body_preserves_internal_dashes() {
        let raw = "---\nname: X\n---\nline one\n---\nline two";
        let (_, body) = parse_agent_markdown(raw).unwrap();
        assert!(body.contains("---"));
    }
}
