// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

/// Everything a subscriber can observe about a workspace, as one typed
/// union.  Every variant carries the workspace id; stream-scoped variants
/// carry the id of the assistant message being produced.
#[derive(Debug, Clone)]
pub enum WorkspaceEvent {
    StreamStart {
        workspace_id: String,
        message_id: String,
    },
    StreamDelta {
        workspace_id: String,
        message_id: String,
        delta: String,
    },
    ReasoningDelta {
        workspace_id: String,
        message_id: String,
        delta: String,
    },
    ReasoningEnd {
        workspace_id: String,
        message_id: String,
    },
    ToolCallStart {
        workspace_id: String,
        message_id: String,
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolCallDelta {
        workspace_id: String,
        message_id: String,
        tool_call_id: String,
        args_delta: String,
    },
    ToolCallEnd {
        workspace_id: String,
        message_id: String,
        tool_call_id: String,
        tool_name: String,
        output: serde_json::Value,
        is_error: bool,
    },
    UsageDelta {
        workspace_id: String,
        message_id: String,
        input_tokens: u32,
        output_tokens: u32,
        cost_usd: Option<f64>,
    },
    StreamEnd {
        workspace_id: String,
        message_id: String,
    },
    StreamAbort {
        workspace_id: String,
        message_id: String,
        abandoned: bool,
    },
    StreamError {
        workspace_id: String,
        message_id: String,
        error: String,
        error_type: String,
    },
    InitStart {
        workspace_id: String,
        hook_path: Option<String>,
    },
    InitOutput {
        workspace_id: String,
        line: String,
        is_error: bool,
    },
    InitEnd {
        workspace_id: String,
        exit_code: i32,
    },
    /// Replay is complete; everything after this is live.
    CaughtUp {
        workspace_id: String,
    },
    Delete {
        workspace_id: String,
        message_id: String,
    },
    QueuedMessageChanged {
        workspace_id: String,
        queued: Vec<String>,
    },
    RestoreToInput {
        workspace_id: String,
        text: String,
    },
    /// Workspace metadata changed (task status, rename, archive).
    Metadata {
        workspace_id: String,
    },
}

impl WorkspaceEvent {
    pub fn workspace_id(&self) -> &str {
        match self {
            Self::StreamStart { workspace_id, .. }
            | Self::StreamDelta { workspace_id, .. }
            | Self::ReasoningDelta { workspace_id, .. }
            | Self::ReasoningEnd { workspace_id, .. }
            | Self::ToolCallStart { workspace_id, .. }
            | Self::ToolCallDelta { workspace_id, .. }
            | Self::ToolCallEnd { workspace_id, .. }
            | Self::UsageDelta { workspace_id, .. }
            | Self::StreamEnd { workspace_id, .. }
            | Self::StreamAbort { workspace_id, .. }
            | Self::StreamError { workspace_id, .. }
            | Self::InitStart { workspace_id, .. }
            | Self::InitOutput { workspace_id, .. }
            | Self::InitEnd { workspace_id, .. }
            | Self::CaughtUp { workspace_id }
            | Self::Delete { workspace_id, .. }
            | Self::QueuedMessageChanged { workspace_id, .. }
            | Self::RestoreToInput { workspace_id, .. }
            | Self::Metadata { workspace_id } => workspace_id,
        }
    }

    /// Wire tag of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StreamStart { .. } => "stream-start",
            Self::StreamDelta { .. } => "stream-delta",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::ToolCallStart { .. } => "tool-call-start",
            Self::ToolCallDelta { .. } => "tool-call-delta",
            Self::ToolCallEnd { .. } => "tool-call-end",
            Self::UsageDelta { .. } => "usage-delta",
            Self::StreamEnd { .. } => "stream-end",
            Self::StreamAbort { .. } => "stream-abort",
            Self::StreamError { .. } => "stream-error",
            Self::InitStart { .. } => "init-start",
            Self::InitOutput { .. } => "init-output",
            Self::InitEnd { .. } => "init-end",
            Self::CaughtUp { .. } => "caught-up",
            Self::Delete { .. } => "delete",
            Self::QueuedMessageChanged { .. } => "queued-message-changed",
            Self::RestoreToInput { .. } => "restore-to-input",
            Self::Metadata { .. } => "metadata",
        }
    }
}

/// Per-workspace capacity of the subscriber ring.  Slow subscribers that
/// fall more than this far behind drop events; the producer never blocks.
const CHANNEL_CAPACITY: usize = 256;

/// Typed per-workspace pub/sub.
///
/// Emission is non-blocking and delivery is best-effort (drop on
/// backpressure); durable state lives in the session store, never here.
#[derive(Default)]
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<WorkspaceEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, workspace_id: &str) -> broadcast::Receiver<WorkspaceEvent> {
        self.sender(workspace_id).subscribe()
    }

    pub fn emit(&self, event: WorkspaceEvent) {
        let tx = self.sender(event.workspace_id());
        // A send error just means nobody is listening right now.
        let _ = tx.send(event);
    }

    /// Drop the channel for a removed workspace.
    pub fn remove(&self, workspace_id: &str) {
        self.channels.lock().unwrap().remove(workspace_id);
    }

    fn sender(&self, workspace_id: &str) -> broadcast::Sender<WorkspaceEvent> {
        self.channels
            .lock()
            .unwrap()
            .entry(workspace_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("ws");
        bus.emit(WorkspaceEvent::StreamStart {
            workspace_id: "ws".into(),
            message_id: "m1".into(),
        });
        bus.emit(WorkspaceEvent::StreamEnd {
            workspace_id: "ws".into(),
            message_id: "m1".into(),
        });
        assert_eq!(rx.recv().await.unwrap().event_type(), "stream-start");
        assert_eq!(rx.recv().await.unwrap().event_type(), "stream-end");
    }

    #[tokio::test]
    async fn events_are_scoped_per_workspace() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe("a");
        let _rx_b = bus.subscribe("b");
        bus.emit(WorkspaceEvent::CaughtUp {
            workspace_id: "b".into(),
        });
        assert!(rx_a.try_recv().is_err(), "workspace a must not see b's events");
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_block_or_panic() {
        let bus = EventBus::new();
        bus.emit(WorkspaceEvent::Metadata {
            workspace_id: "nobody".into(),
        });
    }

    #[tokio::test]
    async fn lagging_subscriber_drops_not_stalls() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("ws");
        for i in 0..(CHANNEL_CAPACITY + 50) {
            bus.emit(WorkspaceEvent::StreamDelta {
                workspace_id: "ws".into(),
                message_id: "m".into(),
                delta: format!("{i}"),
            });
        }
        // First recv reports the lag; the producer was never blocked.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn event_type_tags_match_wire_names() {
        let e = WorkspaceEvent::QueuedMessageChanged {
            workspace_id: "w".into(),
            queued: vec![],
        };
        assert_eq!(e.event_type(), "queued-message-changed");
        assert_eq!(e.workspace_id(), "w");
    }
}
