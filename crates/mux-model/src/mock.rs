// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::provider::{ModelProvider, ProviderEvent, ProviderEventStream, ProviderRequest};

/// Deterministic mock provider for tests and dry runs.
///
/// Each call to [`ModelProvider::stream`] pops the next script from the
/// front of the queue, so tests can describe exact event sequences —
/// including tool calls — without network access.  When the queue is empty
/// the provider echoes the last user message, which keeps ad-hoc sessions
/// against `mock:*` models usable.
pub struct ScriptedProvider {
    model: String,
    scripts: Arc<Mutex<Vec<Vec<ProviderEvent>>>>,
    /// Every request seen, in order, so tests can assert what was sent.
    pub requests: Arc<Mutex<Vec<ProviderRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<ProviderEvent>>) -> Self {
        Self {
            model: "scripted".into(),
            scripts: Arc::new(Mutex::new(scripts)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Echo-only provider used by the default registry for `mock:<model>`.
    pub fn echo(model: &str) -> Self {
        Self {
            model: model.to_string(),
            scripts: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            ProviderEvent::TextDelta(reply.into()),
            ProviderEvent::Usage {
                input_tokens: 5,
                output_tokens: 5,
                cost_usd: None,
            },
            ProviderEvent::Done,
        ]])
    }

    /// Provider that emits one tool call, then (on the next round) a text
    /// reply.  The canonical two-round agentic-loop script.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                ProviderEvent::ToolCall {
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ProviderEvent::Done,
            ],
            vec![ProviderEvent::TextDelta(final_text.into()), ProviderEvent::Done],
        ])
    }

    /// Number of completion rounds this provider has served.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// A shareable handle — clones observe the same script queue and request
    /// log, so a test can keep one while the orchestrator owns the other.
    pub fn handle(&self) -> Self {
        Self {
            model: self.model.clone(),
            scripts: self.scripts.clone(),
            requests: self.requests.clone(),
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, req: ProviderRequest) -> anyhow::Result<ProviderEventStream> {
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                None
            } else {
                Some(scripts.remove(0))
            }
        };

        let events: Vec<anyhow::Result<ProviderEvent>> = match script {
            Some(events) => events.into_iter().map(Ok).collect(),
            None => {
                let reply = req
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == crate::Role::User)
                    .map(|m| m.text())
                    .unwrap_or_else(|| "[no input]".into());
                vec![
                    Ok(ProviderEvent::TextDelta(format!("MOCK: {reply}"))),
                    Ok(ProviderEvent::Done),
                ]
            }
        };

        self.requests.lock().unwrap().push(req);
        Ok(Box::pin(stream::iter(events)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::message::ChatMessage;

    async fn drain(mut s: ProviderEventStream) -> Vec<ProviderEvent> {
        let mut out = Vec::new();
        while let Some(ev) = s.next().await {
            out.push(ev.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn scripted_events_come_back_in_order() {
        let p = ScriptedProvider::always_text("hi");
        let events = drain(p.stream(ProviderRequest::default()).await.unwrap()).await;
        assert!(matches!(&events[0], ProviderEvent::TextDelta(t) if t == "hi"));
        assert!(matches!(events.last(), Some(ProviderEvent::Done)));
    }

    #[tokio::test]
    async fn scripts_pop_per_call() {
        let p = ScriptedProvider::tool_then_text("c1", "bash", "{}", "done");
        let first = drain(p.stream(ProviderRequest::default()).await.unwrap()).await;
        assert!(matches!(&first[0], ProviderEvent::ToolCall { name, .. } if name == "bash"));
        let second = drain(p.stream(ProviderRequest::default()).await.unwrap()).await;
        assert!(matches!(&second[0], ProviderEvent::TextDelta(t) if t == "done"));
    }

    #[tokio::test]
    async fn exhausted_scripts_fall_back_to_echo() {
        let p = ScriptedProvider::new(vec![]);
        let req = ProviderRequest {
            messages: vec![ChatMessage::user("ping")],
            ..Default::default()
        };
        let events = drain(p.stream(req).await.unwrap()).await;
        assert!(matches!(&events[0], ProviderEvent::TextDelta(t) if t.contains("ping")));
    }

    #[tokio::test]
    async fn requests_are_recorded() {
        let p = ScriptedProvider::always_text("x");
        let handle = p.handle();
        let req = ProviderRequest {
            system: "be brief".into(),
            ..Default::default()
        };
        let _ = p.stream(req).await.unwrap();
        assert_eq!(handle.request_count(), 1);
        assert_eq!(handle.requests.lock().unwrap()[0].system, "be brief");
    }
}
