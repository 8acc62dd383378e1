use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Message parts ────────────────────────────────────────────────────────────

/// A single content part of a chat message.
///
/// The tagged form matches the persisted wire shape: `text`, `reasoning`,
/// `dynamic-tool`, and `file` (inline image/blob by data URL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    DynamicTool {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        state: ToolPartState,
        input: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
    },
    File {
        #[serde(rename = "mediaType")]
        media_type: String,
        /// Data URL (`data:<mime>;base64,<b64>`).
        url: String,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning { text: text.into() }
    }

    pub fn tool_input(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::DynamicTool {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            state: ToolPartState::InputAvailable,
            input,
            output: None,
        }
    }
}

/// State of a tool part: transitions `input-available → output-available`
/// exactly once, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolPartState {
    InputAvailable,
    OutputAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Metadata attached to a persisted message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Per-workspace strictly monotonic sequence assigned on append.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_sequence: Option<u64>,
    /// Set when the message was interrupted mid-stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    /// Set on messages the orchestrator fabricated (e.g. background task
    /// reports posted into the parent conversation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One message in a workspace's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl ChatMessage {
    pub fn new(role: Role) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            parts: Vec::new(),
            metadata: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        let mut m = Self::new(Role::User);
        m.parts.push(Part::text(text));
        m
    }

    pub fn system(text: impl Into<String>) -> Self {
        let mut m = Self::new(Role::System);
        m.parts.push(Part::text(text));
        m
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        let mut m = Self::new(Role::Assistant);
        m.parts.push(Part::text(text));
        m
    }

    /// Empty assistant placeholder claiming a known id.
    pub fn assistant_placeholder(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            parts: Vec::new(),
            metadata: None,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut MessageMetadata {
        self.metadata.get_or_insert_with(MessageMetadata::default)
    }

    /// Concatenation of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// `true` when the message carries no text, reasoning, tool, or file part.
    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|p| match p {
            Part::Text { text } | Part::Reasoning { text } => text.is_empty(),
            _ => false,
        })
    }

    /// `true` when the only non-empty parts are reasoning.
    pub fn is_reasoning_only(&self) -> bool {
        !self.is_empty()
            && self.parts.iter().all(|p| match p {
                Part::Reasoning { .. } => true,
                Part::Text { text } => text.is_empty(),
                _ => false,
            })
    }

    /// Append a text delta, extending the trailing text part when present.
    pub fn push_text_delta(&mut self, delta: &str) {
        if let Some(Part::Text { text }) = self.parts.last_mut() {
            text.push_str(delta);
        } else {
            self.parts.push(Part::text(delta));
        }
    }

    /// Append a reasoning delta, extending the trailing reasoning part.
    pub fn push_reasoning_delta(&mut self, delta: &str) {
        if let Some(Part::Reasoning { text }) = self.parts.last_mut() {
            text.push_str(delta);
        } else {
            self.parts.push(Part::reasoning(delta));
        }
    }

    pub fn find_tool_part(&self, call_id: &str) -> Option<&Part> {
        self.parts.iter().find(
            |p| matches!(p, Part::DynamicTool { tool_call_id, .. } if tool_call_id == call_id),
        )
    }

    /// Mark the tool part with `call_id` as completed with `output`.
    /// Returns `false` if no such part exists or it already has output.
    pub fn finish_tool_part(&mut self, call_id: &str, value: serde_json::Value) -> bool {
        for p in self.parts.iter_mut() {
            if let Part::DynamicTool {
                tool_call_id,
                state,
                output,
                ..
            } = p
            {
                if tool_call_id == call_id && *state == ToolPartState::InputAvailable {
                    *state = ToolPartState::OutputAvailable;
                    *output = Some(value);
                    return true;
                }
            }
        }
        false
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
