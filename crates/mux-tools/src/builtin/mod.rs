// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod agent_report;
pub mod bash;
pub mod file_edit;
pub mod file_read;
pub mod plan;
pub mod task;

use std::path::{Path, PathBuf};

use crate::tool::ToolCtx;

/// Resolve a tool-supplied path against the workspace directory, rejecting
/// anything that escapes it.  Tool paths are workspace-relative by
/// contract; absolute paths are only accepted when they stay inside.
pub(crate) fn workspace_path(ctx: &ToolCtx, raw: &str) -> Result<PathBuf, String> {
    let resolved = ctx.runtime.resolve_path(Path::new(raw));
    if !resolved.starts_with(ctx.runtime.workspace_dir()) {
        return Err(format!("path escapes the workspace: {raw}"));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use mux_runtime::LocalRuntime;

    fn ctx() -> ToolCtx {
        ToolCtx::new("ws", Arc::new(LocalRuntime::new("/ws/root")))
    }

    #[test]
    fn relative_paths_resolve_into_workspace() {
        let p = workspace_path(&ctx(), "src/lib.rs").unwrap();
        assert_eq!(p, PathBuf::from("/ws/root/src/lib.rs"));
    }

    #[test]
    fn dotdot_escape_is_rejected() {
        assert!(workspace_path(&ctx(), "../outside.txt").is_err());
    }

    #[test]
    fn absolute_path_inside_workspace_is_accepted() {
        assert!(workspace_path(&ctx(), "/ws/root/ok.txt").is_ok());
    }

    #[test]
    fn absolute_path_outside_workspace_is_rejected() {
        assert!(workspace_path(&ctx(), "/etc/passwd").is_err());
    }
}
