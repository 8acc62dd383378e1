// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::events::ToolSideEvent;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolEffect, ToolOutput};

/// Where the proposed plan is persisted inside the workspace.
pub const PLAN_FILE_REL: &str = ".mux/plan.md";

/// Propose a plan (plan mode only; policy hard-denies it elsewhere).
///
/// The plan markdown is written to the workspace plan file and announced
/// through the side-event channel so the UI can render an approval prompt.
pub struct ProposePlanTool;

#[async_trait]
impl Tool for ProposePlanTool {
    fn name(&self) -> &str {
        "propose_plan"
    }

    fn description(&self) -> &str {
        "Present your implementation plan for approval. Call this when your \
         investigation is complete; the plan should be a concrete, ordered \
         markdown list of the changes you intend to make."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "plan": { "type": "string", "description": "Markdown plan" }
            },
            "required": ["plan"],
            "additionalProperties": false
        })
    }

    fn effect(&self) -> ToolEffect {
        ToolEffect::Write
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolOutput {
        let plan = call.args["plan"].as_str().unwrap_or_default();
        if plan.trim().is_empty() {
            return ToolOutput::err("plan must not be empty");
        }
        if let Err(e) = ctx
            .runtime
            .write_file(Path::new(PLAN_FILE_REL), plan.as_bytes())
            .await
        {
            return ToolOutput::err(format!("failed to persist plan: {e}"));
        }
        ctx.emit(ToolSideEvent::PlanProposed {
            markdown: plan.to_string(),
        });
        ToolOutput::ok(json!({ "success": true, "planFile": PLAN_FILE_REL }))
    }
}

/// Ask the user a blocking question (plan mode only).
pub struct AskUserQuestionTool;

#[async_trait]
impl Tool for AskUserQuestionTool {
    fn name(&self) -> &str {
        "ask_user_question"
    }

    fn description(&self) -> &str {
        "Ask the user one or more questions that block further planning. \
         Use sparingly; prefer making a reasonable assumption and noting it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Questions to put to the user"
                }
            },
            "required": ["questions"],
            "additionalProperties": false
        })
    }

    fn effect(&self) -> ToolEffect {
        ToolEffect::ReadOnly
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolOutput {
        let questions: Vec<String> = call.args["questions"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if questions.is_empty() {
            return ToolOutput::err("questions must not be empty");
        }
        let id = uuid::Uuid::new_v4().to_string();
        ctx.emit(ToolSideEvent::Question {
            id: id.clone(),
            questions,
        });
        // The answer arrives as the next user message; the tool result only
        // confirms delivery.
        ToolOutput::ok(json!({ "delivered": true, "questionId": id }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use mux_runtime::LocalRuntime;

    fn fixture() -> (
        TempDir,
        ToolCtx,
        tokio::sync::mpsc::UnboundedReceiver<ToolSideEvent>,
    ) {
        let tmp = TempDir::new().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = ToolCtx::new("ws", Arc::new(LocalRuntime::new(tmp.path()))).with_events(tx);
        (tmp, ctx, rx)
    }

    #[tokio::test]
    async fn plan_is_persisted_and_announced() {
        let (tmp, ctx, mut rx) = fixture();
        let out = ProposePlanTool
            .execute(
                &ToolCall {
                    id: "p".into(),
                    name: "propose_plan".into(),
                    args: json!({"plan": "1. do the thing"}),
                },
                &ctx,
            )
            .await;
        assert!(!out.is_error);
        let stored = std::fs::read_to_string(tmp.path().join(PLAN_FILE_REL)).unwrap();
        assert_eq!(stored, "1. do the thing");
        assert!(matches!(
            rx.try_recv().unwrap(),
            ToolSideEvent::PlanProposed { markdown } if markdown.contains("do the thing")
        ));
    }

    #[tokio::test]
    async fn empty_plan_is_rejected() {
        let (_tmp, ctx, _rx) = fixture();
        let out = ProposePlanTool
            .execute(
                &ToolCall {
                    id: "p".into(),
                    name: "propose_plan".into(),
                    args: json!({"plan": ""}),
                },
                &ctx,
            )
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn question_event_carries_all_questions() {
        let (_tmp, ctx, mut rx) = fixture();
        let out = AskUserQuestionTool
            .execute(
                &ToolCall {
                    id: "q".into(),
                    name: "ask_user_question".into(),
                    args: json!({"questions": ["Which database?", "Which region?"]}),
                },
                &ctx,
            )
            .await;
        assert!(!out.is_error);
        match rx.try_recv().unwrap() {
            ToolSideEvent::Question { questions, .. } => {
                assert_eq!(questions.len(), 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_questions_are_rejected() {
        let (_tmp, ctx, _rx) = fixture();
        let out = AskUserQuestionTool
            .execute(
                &ToolCall {
                    id: "q".into(),
                    name: "ask_user_question".into(),
                    args: json!({"questions": []}),
                },
                &ctx,
            )
            .await;
        assert!(out.is_error);
    }
}
