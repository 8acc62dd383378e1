// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::mock::ScriptedProvider;
use crate::provider::ModelProvider;

/// Typed failures of model construction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("no API key configured for provider '{provider}'")]
    ApiKeyNotFound { provider: String },
    #[error("provider '{provider}' is not supported")]
    ProviderNotSupported { provider: String },
    #[error("invalid model string: {message}")]
    InvalidModelString { message: String },
}

/// A parsed `provider:model` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedModelString {
    pub provider: String,
    pub model: String,
}

/// Parse a model string of the form `provider:model`.
pub fn parse_model_string(s: &str) -> Result<ParsedModelString, ModelError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ModelError::InvalidModelString {
            message: "model string is empty".into(),
        });
    }
    let (provider, model) = s.split_once(':').ok_or_else(|| ModelError::InvalidModelString {
        message: format!("expected 'provider:model', got '{s}'"),
    })?;
    if provider.is_empty() || model.is_empty() {
        return Err(ModelError::InvalidModelString {
            message: format!("expected 'provider:model', got '{s}'"),
        });
    }
    Ok(ParsedModelString {
        provider: provider.to_string(),
        model: model.to_string(),
    })
}

type ProviderFactory =
    Arc<dyn Fn(&ParsedModelString) -> Result<Arc<dyn ModelProvider>, ModelError> + Send + Sync>;

/// Registry of provider factories keyed by provider name.
///
/// The composition root registers the concrete adapters; the default
/// registry only knows `mock` so tests and dry runs work without any
/// credentials.  Model-string aliases (gateway routing, reasoning-variant
/// selection) are applied before parsing.
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
    aliases: HashMap<String, String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            factories: HashMap::new(),
            aliases: HashMap::new(),
        };
        reg.register("mock", |parsed| {
            Ok(Arc::new(ScriptedProvider::echo(&parsed.model)) as Arc<dyn ModelProvider>)
        });
        reg
    }

    pub fn register<F>(&mut self, provider: &str, factory: F)
    where
        F: Fn(&ParsedModelString) -> Result<Arc<dyn ModelProvider>, ModelError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(provider.to_string(), Arc::new(factory));
    }

    /// Map one model string onto another before parsing.
    pub fn alias(&mut self, from: &str, to: &str) {
        self.aliases.insert(from.to_string(), to.to_string());
    }

    /// Construct a provider handle for `model_string`, validating that the
    /// provider exists and its credentials resolve.
    pub fn create(&self, model_string: &str) -> Result<Arc<dyn ModelProvider>, ModelError> {
        let resolved = self
            .aliases
            .get(model_string.trim())
            .map(String::as_str)
            .unwrap_or(model_string);
        let parsed = parse_model_string(resolved)?;
        debug!(provider = %parsed.provider, model = %parsed.model, "constructing provider");
        let factory =
            self.factories
                .get(&parsed.provider)
                .ok_or_else(|| ModelError::ProviderNotSupported {
                    provider: parsed.provider.clone(),
                })?;
        factory(&parsed)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
