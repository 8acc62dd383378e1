// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use mux_config::ThinkingLevel;

use crate::message::ChatMessage;

pub type ProviderEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<ProviderEvent>> + Send>>;

/// A tool schema exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// One model turn as handed to a provider adapter.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub messages: Vec<ChatMessage>,
    pub system: String,
    pub tools: Vec<ToolSchema>,
    pub max_output_tokens: Option<u32>,
    pub thinking_level: Option<ThinkingLevel>,
    /// Free-form provider-specific options forwarded as-is to the adapter.
    pub provider_options: serde_json::Value,
}

/// A single streamed event from the model.  This is the neutral event set —
/// the orchestrator never sees a provider's wire format.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    TextDelta(String),
    ReasoningDelta(String),
    /// The current reasoning block is complete.
    ReasoningEnd,
    /// The model requested a tool call (arguments fully accumulated).
    ToolCall {
        id: String,
        name: String,
        /// JSON-encoded argument object
        arguments: String,
    },
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        cost_usd: Option<f64>,
    },
    /// The stream finished normally.
    Done,
    /// A stream-fatal provider error.
    Error(String),
}

/// Capability contract for a language-model provider.
///
/// Adapters own their transport; the orchestrator only drives the event
/// iterator and forwards an abort by dropping the stream.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider identifier (e.g. `"anthropic"`, `"mock"`).
    fn provider_name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return the streaming response.
    async fn stream(&self, req: ProviderRequest) -> anyhow::Result<ProviderEventStream>;
}
