// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::policy::{apply_tool_policy, PolicyError, PolicyFilter};
use crate::tool::{check_required_args, Tool, ToolCall, ToolCtx, ToolOutput};

/// Central registry holding all available tools for one workspace binding.
///
/// Policy is applied by *filtering the registry*: tools removed by the
/// effective policy do not appear in the schema surface at all, so the
/// model can never address them.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// `(name, description, parameters)` triples for the provider call
    /// surface, sorted by name for a stable wire order.
    pub fn schemas(&self) -> Vec<(String, String, serde_json::Value)> {
        let mut schemas: Vec<_> = self
            .tools
            .values()
            .map(|t| {
                (
                    t.name().to_string(),
                    t.description().to_string(),
                    t.parameters_schema(),
                )
            })
            .collect();
        schemas.sort_by(|a, b| a.0.cmp(&b.0));
        schemas
    }

    /// Produce a registry containing only the tools the policy enables.
    pub fn filtered(&self, policy: &[PolicyFilter]) -> Result<ToolRegistry, PolicyError> {
        let names = self.names();
        let kept = apply_tool_policy(&names, policy)?;
        debug!(total = names.len(), kept = kept.len(), "applied tool policy");
        let mut out = ToolRegistry::new();
        for name in kept {
            if let Some(tool) = self.tools.get(&name) {
                out.tools.insert(name, tool.clone());
            }
        }
        Ok(out)
    }

    /// Validate and dispatch one call.  Unknown tools and missing required
    /// arguments come back as failure results, never errors.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolOutput {
        let Some(tool) = self.tools.get(&call.name) else {
            return ToolOutput::err(format!("unknown tool: {}", call.name));
        };
        if let Err(msg) = check_required_args(&tool.parameters_schema(), &call.args) {
            return ToolOutput::err(msg);
        }
        tool.execute(call, ctx).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::policy::PolicyAction;
    use crate::tool::ToolEffect;
    use mux_runtime::LocalRuntime;

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "required": ["text"] })
        }
        fn effect(&self) -> ToolEffect {
            ToolEffect::ReadOnly
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolOutput {
            ToolOutput::ok(json!({ "echo": call.args["text"] }))
        }
    }

    fn ctx() -> ToolCtx {
        ToolCtx::new("ws", std::sync::Arc::new(LocalRuntime::new("/tmp")))
    }

    #[tokio::test]
    async fn register_and_execute() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        let out = reg
            .execute(
                &ToolCall {
                    id: "1".into(),
                    name: "echo".into(),
                    args: json!({"text": "hi"}),
                },
                &ctx(),
            )
            .await;
        assert!(!out.is_error);
        assert_eq!(out.value["echo"], "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_failure_result() {
        let reg = ToolRegistry::new();
        let out = reg
            .execute(
                &ToolCall {
                    id: "1".into(),
                    name: "missing".into(),
                    args: json!({}),
                },
                &ctx(),
            )
            .await;
        assert!(out.is_error);
        assert!(out.error_message().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn missing_required_arg_is_rejected_before_dispatch() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        let out = reg
            .execute(
                &ToolCall {
                    id: "1".into(),
                    name: "echo".into(),
                    args: json!({}),
                },
                &ctx(),
            )
            .await;
        assert!(out.is_error);
        assert!(out.error_message().unwrap().contains("text"));
    }

    #[test]
    fn filtered_removes_disabled_tools() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "a" });
        reg.register(EchoTool { name: "b" });
        let policy = vec![PolicyFilter::new("a", PolicyAction::Disable)];
        let filtered = reg.filtered(&policy).unwrap();
        assert_eq!(filtered.names(), vec!["b"]);
    }

    #[test]
    fn filtered_schemas_are_sorted() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "zeta" });
        reg.register(EchoTool { name: "alpha" });
        let schemas = reg.schemas();
        assert_eq!(schemas[0].0, "alpha");
        assert_eq!(schemas[1].0, "zeta");
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "t" });
        reg.register(EchoTool { name: "t" });
        assert_eq!(reg.names().len(), 1);
    }
}
