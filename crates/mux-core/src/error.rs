// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use mux_model::ModelError;

/// The failure taxonomy every public orchestrator operation returns.
/// Exceptions never cross a public boundary; anything unclassified is
/// wrapped as `Unknown` at the outermost layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("no API key configured for provider '{provider}'")]
    ApiKeyNotFound { provider: String },
    #[error("provider '{provider}' is not supported")]
    ProviderNotSupported { provider: String },
    #[error("invalid model string: {message}")]
    InvalidModelString { message: String },
    #[error("context window exceeded")]
    ContextExceeded,
    #[error("runtime not ready: {message}")]
    RuntimeNotReady { message: String },
    #[error("runtime start failed: {message}")]
    RuntimeStartFailed { message: String },
    #[error("denied by policy: {message}")]
    PolicyDenied { message: String },
    #[error("a stream is active for this workspace")]
    StreamActive,
    #[error("workspace name already in use: {name}")]
    NameConflict { name: String },
    #[error("invalid workspace name: {name}")]
    InvalidName { name: String },
    #[error("workspace not found: {id}")]
    NotFound { id: String },
    #[error("{raw}")]
    Unknown { raw: String },
}

impl OrchestratorError {
    pub fn unknown(raw: impl Into<String>) -> Self {
        Self::Unknown { raw: raw.into() }
    }

    /// Stable machine-readable tag, used in events and wire payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApiKeyNotFound { .. } => "api_key_not_found",
            Self::ProviderNotSupported { .. } => "provider_not_supported",
            Self::InvalidModelString { .. } => "invalid_model_string",
            Self::ContextExceeded => "context_exceeded",
            Self::RuntimeNotReady { .. } => "runtime_not_ready",
            Self::RuntimeStartFailed { .. } => "runtime_start_failed",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::StreamActive => "stream_active",
            Self::NameConflict { .. } => "name_conflict",
            Self::InvalidName { .. } => "invalid_name",
            Self::NotFound { .. } => "not_found",
            Self::Unknown { .. } => "unknown",
        }
    }
}

impl From<ModelError> for OrchestratorError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::ApiKeyNotFound { provider } => Self::ApiKeyNotFound { provider },
            ModelError::ProviderNotSupported { provider } => Self::ProviderNotSupported { provider },
            ModelError::InvalidModelString { message } => Self::InvalidModelString { message },
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
