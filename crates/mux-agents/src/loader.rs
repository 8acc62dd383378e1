// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_recursion::async_recursion;
use thiserror::Error;
use tracing::warn;

use mux_runtime::Runtime;

use crate::builtin::builtin_agents;
use crate::frontmatter::{parse_agent_markdown, AgentDefinitionParseError, AgentFrontmatter};
use crate::{MAX_AGENT_FILE_BYTES, MAX_INHERIT_DEPTH};

/// Where a definition was loaded from.  Ordering is precedence: later
/// variants shadow earlier ones for the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AgentScope {
    BuiltIn,
    Global,
    Project,
}

/// Listing entry produced by discovery.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub scope: AgentScope,
    pub color: Option<String>,
    pub hidden: bool,
    pub selectable: bool,
    pub subagent_runnable: bool,
}

/// A fully loaded definition.
#[derive(Debug, Clone)]
pub struct AgentPackage {
    pub id: String,
    pub scope: AgentScope,
    pub frontmatter: AgentFrontmatter,
    pub body: String,
}

#[derive(Debug, Clone, Error)]
pub enum AgentLoadError {
    #[error("agent '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Parse(#[from] AgentDefinitionParseError),
    #[error("circular inheritance: {0}")]
    CircularInheritance(String),
    #[error("inheritance chain exceeds depth {MAX_INHERIT_DEPTH}")]
    DepthExceeded,
}

/// Loads agent definitions from the three scopes with deterministic
/// precedence.  Definitions are immutable once loaded; discovery re-reads
/// from scratch every time.
pub struct AgentLoader {
    global_dir: PathBuf,
}

impl AgentLoader {
    /// `global_dir` is `<MUX_ROOT>/agents` in production.
    pub fn new(global_dir: impl Into<PathBuf>) -> Self {
        Self {
            global_dir: global_dir.into(),
        }
    }

    fn project_agents_dir(workspace_path: &Path) -> PathBuf {
        workspace_path.join(".mux").join("agents")
    }

    /// Enumerate every visible agent: built-ins, then global files, then
    /// project files — higher scope wins per id.  Definitions with
    /// `ui.disabled: true` are dropped.  Sorted by display name.
    pub async fn discover(
        &self,
        runtime: &dyn Runtime,
        workspace_path: &Path,
    ) -> Vec<AgentDescriptor> {
        let mut map: HashMap<String, AgentPackage> = HashMap::new();

        for (id, md) in builtin_agents() {
            // Built-ins are validated by tests; a parse failure here would be
            // a packaging bug, so it is logged rather than propagated.
            match parse_agent_markdown(md) {
                Ok((fm, body)) => {
                    map.insert(
                        id.to_string(),
                        AgentPackage {
                            id: id.to_string(),
                            scope: AgentScope::BuiltIn,
                            frontmatter: fm,
                            body,
                        },
                    );
                }
                Err(e) => warn!(id, error = %e, "builtin agent failed to parse"),
            }
        }

        for (id, pkg) in self.scan_global().await {
            map.insert(id, pkg);
        }
        for (id, pkg) in self.scan_project(runtime, workspace_path).await {
            map.insert(id, pkg);
        }

        let mut result: Vec<AgentDescriptor> = map
            .into_values()
            .filter(|pkg| pkg.frontmatter.ui.disabled != Some(true))
            .map(descriptor_of)
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    /// Load a single definition under the same precedence, falling back to
    /// built-in when neither file scope yields a valid parse.
    pub async fn read(
        &self,
        runtime: &dyn Runtime,
        workspace_path: &Path,
        id: &str,
    ) -> Result<AgentPackage, AgentLoadError> {
        if let Some(pkg) = self.read_project(runtime, workspace_path, id).await {
            return Ok(pkg);
        }
        if let Some(pkg) = self.read_global(id).await {
            return Ok(pkg);
        }
        if let Some((_, md)) = builtin_agents().iter().find(|(bid, _)| *bid == id) {
            let (fm, body) = parse_agent_markdown(md)?;
            return Ok(AgentPackage {
                id: id.to_string(),
                scope: AgentScope::BuiltIn,
                frontmatter: fm,
                body,
            });
        }
        Err(AgentLoadError::NotFound(id.to_string()))
    }

    /// Compute the effective system-prompt body, following `base` chains
    /// when `prompt.append` is set.  Cycles and over-deep chains fail with
    /// typed errors rather than recursion blowups.
    pub async fn resolve_body(
        &self,
        runtime: &dyn Runtime,
        workspace_path: &Path,
        id: &str,
    ) -> Result<String, AgentLoadError> {
        let mut visited = Vec::new();
        self.resolve_body_inner(runtime, workspace_path, id, &mut visited)
            .await
    }

    #[async_recursion]
    async fn resolve_body_inner(
        &self,
        runtime: &dyn Runtime,
        workspace_path: &Path,
        id: &str,
        visited: &mut Vec<String>,
    ) -> Result<String, AgentLoadError> {
        if visited.iter().any(|v| v == id) {
            let chain = format!("{} -> {id}", visited.join(" -> "));
            return Err(AgentLoadError::CircularInheritance(chain));
        }
        if visited.len() >= MAX_INHERIT_DEPTH {
            return Err(AgentLoadError::DepthExceeded);
        }
        visited.push(id.to_string());

        let pkg = self.read(runtime, workspace_path, id).await?;
        if !pkg.frontmatter.prompt.append {
            return Ok(pkg.body);
        }
        let Some(base_id) = pkg.frontmatter.base.clone() else {
            return Ok(pkg.body);
        };

        let base_body = self
            .resolve_body_inner(runtime, workspace_path, &base_id, visited)
            .await?;
        Ok(join_bodies(&base_body, &pkg.body))
    }

    // ── Scope readers ─────────────────────────────────────────────────────────

    async fn read_global(&self, id: &str) -> Option<AgentPackage> {
        let path = self.global_dir.join(format!("{id}.md"));
        let size = tokio::fs::metadata(&path).await.ok()?.len();
        if size > MAX_AGENT_FILE_BYTES {
            warn!(path = %path.display(), size, "skipping oversized global agent file");
            return None;
        }
        let raw = tokio::fs::read_to_string(&path).await.ok()?;
        match parse_agent_markdown(&raw) {
            Ok((fm, body)) => Some(AgentPackage {
                id: id.to_string(),
                scope: AgentScope::Global,
                frontmatter: fm,
                body,
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unparseable global agent");
                None
            }
        }
    }

    async fn read_project(
        &self,
        runtime: &dyn Runtime,
        workspace_path: &Path,
        id: &str,
    ) -> Option<AgentPackage> {
        let path = Self::project_agents_dir(workspace_path).join(format!("{id}.md"));
        let stat = runtime.stat(&path).await.ok()?;
        if stat.size > MAX_AGENT_FILE_BYTES {
            warn!(path = %path.display(), size = stat.size, "skipping oversized project agent file");
            return None;
        }
        let bytes = runtime.read_file(&path).await.ok()?;
        let raw = String::from_utf8_lossy(&bytes);
        match parse_agent_markdown(&raw) {
            Ok((fm, body)) => Some(AgentPackage {
                id: id.to_string(),
                scope: AgentScope::Project,
                frontmatter: fm,
                body,
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unparseable project agent");
                None
            }
        }
    }

    async fn scan_global(&self) -> Vec<(String, AgentPackage)> {
        let mut out = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.global_dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = name.strip_suffix(".md") else {
                continue;
            };
            if let Some(pkg) = self.read_global(id).await {
                out.push((id.to_string(), pkg));
            }
        }
        out
    }

    async fn scan_project(
        &self,
        runtime: &dyn Runtime,
        workspace_path: &Path,
    ) -> Vec<(String, AgentPackage)> {
        let mut out = Vec::new();
        let dir = Self::project_agents_dir(workspace_path);
        let entries = match runtime.list_dir(&dir).await {
            Ok(e) => e,
            Err(_) => return out,
        };
        for name in entries {
            let Some(id) = name.strip_suffix(".md") else {
                continue;
            };
            if let Some(pkg) = self.read_project(runtime, workspace_path, id).await {
                out.push((id.to_string(), pkg));
            }
        }
        out
    }
}

fn descriptor_of(pkg: AgentPackage) -> AgentDescriptor {
    AgentDescriptor {
        name: if pkg.frontmatter.name.is_empty() {
            pkg.id.clone()
        } else {
            pkg.frontmatter.name.clone()
        },
        description: pkg.frontmatter.description.clone(),
        scope: pkg.scope,
        color: pkg.frontmatter.ui.color.clone(),
        hidden: pkg.frontmatter.ui.hidden.unwrap_or(false),
        selectable: pkg.frontmatter.ui.selectable.unwrap_or(true),
        subagent_runnable: pkg.frontmatter.subagent.runnable.unwrap_or(false),
        id: pkg.id,
    }
}

/// Concatenate base and own body with a blank-line separator, only when
/// both sides are non-empty.
fn join_bodies(base: &str, own: &str) -> String {
    if base.is_empty() {
        own.to_string()
    } else if own.is_empty() {
        base.to_string()
    } else {
        format!("{base}\n\n{own}")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
