// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod error;
mod events;
mod orchestrator;
mod stream;
mod tasks;
mod workspace;


pub use error::OrchestratorError;
pub use events::{EventBus, WorkspaceEvent};
pub use orchestrator::{Orchestrator, RuntimeFactory, StreamMessageParams, ToolSetFactory};
pub use stream::{StartStreamParams, StreamManager, StreamObserver, StreamOutcome, StreamState};
pub use tasks::{TaskService, TaskSpawnerHandle};
pub use workspace::{
    CreateWorkspaceRequest, SendMessageOptions, WorkspaceOps, WorkspaceService,
};
