// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runtime adapters.
//!
//! A [`Runtime`] is the filesystem + shell target where a workspace's tools
//! execute.  Three adapters exist: local (project directory, no isolation),
//! worktree (a git worktree under a base directory), and ssh (a remote host).
//! Every component that touches the workspace filesystem goes through this
//! trait so local and remote workspaces are indistinguishable above L1.

mod exec;
mod local;
mod ssh;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use exec::{head_tail_truncate, AbortHandle, OutputChunk, SpawnedChild};
pub use local::{LocalRuntime, WorktreeRuntime};
pub use ssh::SshRuntime;

#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("runtime not ready: {0}")]
    NotReady(String),
    #[error("runtime start failed: {0}")]
    StartFailed(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            RuntimeError::NotFound(e.to_string())
        } else {
            RuntimeError::Io(e.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileStat {
    pub size: u64,
    pub is_directory: bool,
    pub mode: u32,
    pub mtime: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    /// 0 means the adapter default (120 s).
    pub timeout_secs: u64,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub wall_ms: u64,
    /// Set when stdout/stderr were head/tail truncated to the byte cap.
    pub truncated: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

/// Outcome of a readiness probe.
#[derive(Debug, Clone)]
pub struct ReadyStatus {
    pub ready: bool,
    pub error: Option<String>,
    pub error_type: Option<ReadyErrorType>,
}

impl ReadyStatus {
    pub fn ready() -> Self {
        Self {
            ready: true,
            error: None,
            error_type: None,
        }
    }

    pub fn failed(error_type: ReadyErrorType, message: impl Into<String>) -> Self {
        Self {
            ready: false,
            error: Some(message.into()),
            error_type: Some(error_type),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyErrorType {
    RuntimeNotReady,
    RuntimeStartFailed,
}

/// Phase updates emitted while a runtime is being brought up (container
/// start, remote wake).  Delivery is best-effort.
pub type StatusSink = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CreateWorkspaceParams {
    pub project_path: PathBuf,
    pub branch_name: String,
    pub trunk_branch: Option<String>,
    pub directory_name: String,
}

/// Result of workspace creation.  The init hook, when present, is returned
/// to the caller; running it (and persisting its output) is the init-state
/// manager's job, not the adapter's.
#[derive(Debug, Clone)]
pub struct CreatedWorkspace {
    pub workspace_dir: PathBuf,
    pub init_hook: Option<PathBuf>,
}

/// Uniform capability set over local / worktree / ssh execution targets.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// The directory all relative tool paths resolve against.
    fn workspace_dir(&self) -> &Path;

    async fn stat(&self, path: &Path) -> Result<FileStat, RuntimeError>;
    async fn read_file(&self, path: &Path) -> Result<Vec<u8>, RuntimeError>;
    /// Entry names (not full paths) of a directory; empty when it is absent.
    async fn list_dir(&self, path: &Path) -> Result<Vec<String>, RuntimeError>;
    /// Atomic write (temp + rename) so readers never observe a torn file.
    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), RuntimeError>;

    /// Run a shell command to completion, with timeout and output caps.
    async fn exec(&self, command: &str, opts: ExecOptions) -> Result<ExecResult, RuntimeError>;

    /// Start a long-running shell command with streamed output and explicit
    /// abort.  Aborting kills the child and closes the adapter's pipe ends
    /// so downstream readers see EOF rather than a hung pipeline.
    async fn spawn(&self, command: &str, opts: SpawnOptions)
        -> Result<SpawnedChild, RuntimeError>;

    /// Resolve `p` to a canonical absolute path inside this runtime.
    fn resolve_path(&self, p: &Path) -> PathBuf;

    /// Set up the working directory for a new workspace.  Returns promptly;
    /// the returned init hook (if any) has not been executed.
    async fn create_workspace(
        &self,
        params: CreateWorkspaceParams,
    ) -> Result<CreatedWorkspace, RuntimeError>;

    /// Tear down whatever `create_workspace` materialized.
    async fn remove_workspace(&self) -> Result<(), RuntimeError>;

    /// Probe (and if needed bring up) the runtime.  Returns promptly when
    /// reachable; emits phase updates through `status` otherwise.
    async fn ensure_ready(&self, status: Option<&StatusSink>) -> ReadyStatus;
}

/// Normalize a relative path against `base`: collapse `.` and `..` segments
/// lexically without touching the filesystem.
pub fn normalize_path(rel: &str, base: &Path) -> String {
    let joined = if Path::new(rel).is_absolute() {
        PathBuf::from(rel)
    } else {
        base.join(rel)
    };
    let mut out: Vec<std::ffi::OsString> = Vec::new();
    for comp in joined.components() {
        use std::path::Component;
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str().to_os_string()),
        }
    }
    let mut p = PathBuf::new();
    for seg in out {
        p.push(seg);
    }
    p.to_string_lossy().into_owned()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dot_segments() {
        assert_eq!(
            normalize_path("./src/../lib/mod.rs", Path::new("/ws")),
            "/ws/lib/mod.rs"
        );
    }

    #[test]
    fn normalize_keeps_absolute_paths() {
        assert_eq!(normalize_path("/etc/hosts", Path::new("/ws")), "/etc/hosts");
    }

    #[test]
    fn normalize_joins_relative_to_base() {
        assert_eq!(normalize_path("a/b.txt", Path::new("/ws")), "/ws/a/b.txt");
    }

    #[test]
    fn parent_escape_is_clamped_at_root() {
        // `..` past the root must not panic or produce an empty path.
        let p = normalize_path("../../..", Path::new("/ws"));
        assert!(!p.is_empty());
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let e = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(RuntimeError::from(e), RuntimeError::NotFound(_)));
    }
}
