// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::exec::{run_argv, spawn_argv, SpawnedChild};
use crate::{
    normalize_path, CreateWorkspaceParams, CreatedWorkspace, ExecOptions, ExecResult, FileStat,
    ReadyErrorType, ReadyStatus, Runtime, RuntimeError, SpawnOptions, StatusSink,
};

/// Relative location of the optional per-project init hook.
pub(crate) const INIT_HOOK_REL: &str = ".mux/init";

async fn stat_local(path: &Path) -> Result<FileStat, RuntimeError> {
    let meta = tokio::fs::metadata(path).await?;
    let mtime: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::from);
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode()
    };
    #[cfg(not(unix))]
    let mode = 0;
    Ok(FileStat {
        size: meta.len(),
        is_directory: meta.is_dir(),
        mode,
        mtime,
    })
}

async fn write_local_atomic(path: &Path, bytes: &[u8]) -> Result<(), RuntimeError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("mux-tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn list_dir_local(path: &Path) -> Result<Vec<String>, RuntimeError> {
    let mut entries = Vec::new();
    let mut dir = match tokio::fs::read_dir(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = dir.next_entry().await? {
        entries.push(entry.file_name().to_string_lossy().into_owned());
    }
    entries.sort();
    Ok(entries)
}

fn detect_init_hook(workspace_dir: &Path) -> Option<PathBuf> {
    let hook = workspace_dir.join(INIT_HOOK_REL);
    if hook.is_file() {
        Some(hook)
    } else {
        None
    }
}

/// Runtime that executes directly in the project directory — no isolation.
pub struct LocalRuntime {
    workspace_dir: PathBuf,
}

impl LocalRuntime {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
        }
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    async fn stat(&self, path: &Path) -> Result<FileStat, RuntimeError> {
        stat_local(&self.resolve_path(path)).await
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>, RuntimeError> {
        Ok(tokio::fs::read(self.resolve_path(path)).await?)
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<String>, RuntimeError> {
        list_dir_local(&self.resolve_path(path)).await
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), RuntimeError> {
        write_local_atomic(&self.resolve_path(path), bytes).await
    }

    async fn exec(&self, command: &str, mut opts: ExecOptions) -> Result<ExecResult, RuntimeError> {
        if opts.cwd.is_none() {
            opts.cwd = Some(self.workspace_dir.clone());
        }
        run_argv("bash", &["-c", command], &opts).await
    }

    async fn spawn(
        &self,
        command: &str,
        mut opts: SpawnOptions,
    ) -> Result<SpawnedChild, RuntimeError> {
        if opts.cwd.is_none() {
            opts.cwd = Some(self.workspace_dir.clone());
        }
        spawn_argv("bash", &["-c", command], &opts).await
    }

    fn resolve_path(&self, p: &Path) -> PathBuf {
        PathBuf::from(normalize_path(&p.to_string_lossy(), &self.workspace_dir))
    }

    async fn create_workspace(
        &self,
        params: CreateWorkspaceParams,
    ) -> Result<CreatedWorkspace, RuntimeError> {
        // Local mode shares the project directory; nothing to materialize.
        tokio::fs::create_dir_all(&params.project_path).await?;
        Ok(CreatedWorkspace {
            workspace_dir: params.project_path.clone(),
            init_hook: detect_init_hook(&params.project_path),
        })
    }

    async fn remove_workspace(&self) -> Result<(), RuntimeError> {
        // The project directory is not ours to delete.
        Ok(())
    }

    async fn ensure_ready(&self, _status: Option<&StatusSink>) -> ReadyStatus {
        if self.workspace_dir.is_dir() {
            ReadyStatus::ready()
        } else {
            ReadyStatus::failed(
                ReadyErrorType::RuntimeNotReady,
                format!("workspace directory missing: {}", self.workspace_dir.display()),
            )
        }
    }
}

/// Runtime backed by a git worktree under a base directory.
pub struct WorktreeRuntime {
    project_path: PathBuf,
    workspace_dir: PathBuf,
}

impl WorktreeRuntime {
    pub fn new(project_path: impl Into<PathBuf>, workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            workspace_dir: workspace_dir.into(),
        }
    }

    async fn git(&self, args: &[&str], cwd: &Path) -> Result<ExecResult, RuntimeError> {
        let opts = ExecOptions {
            cwd: Some(cwd.to_path_buf()),
            ..Default::default()
        };
        run_argv("git", args, &opts).await
    }
}

#[async_trait]
impl Runtime for WorktreeRuntime {
    fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    async fn stat(&self, path: &Path) -> Result<FileStat, RuntimeError> {
        stat_local(&self.resolve_path(path)).await
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>, RuntimeError> {
        Ok(tokio::fs::read(self.resolve_path(path)).await?)
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<String>, RuntimeError> {
        list_dir_local(&self.resolve_path(path)).await
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), RuntimeError> {
        write_local_atomic(&self.resolve_path(path), bytes).await
    }

    async fn exec(&self, command: &str, mut opts: ExecOptions) -> Result<ExecResult, RuntimeError> {
        if opts.cwd.is_none() {
            opts.cwd = Some(self.workspace_dir.clone());
        }
        run_argv("bash", &["-c", command], &opts).await
    }

    async fn spawn(
        &self,
        command: &str,
        mut opts: SpawnOptions,
    ) -> Result<SpawnedChild, RuntimeError> {
        if opts.cwd.is_none() {
            opts.cwd = Some(self.workspace_dir.clone());
        }
        spawn_argv("bash", &["-c", command], &opts).await
    }

    fn resolve_path(&self, p: &Path) -> PathBuf {
        PathBuf::from(normalize_path(&p.to_string_lossy(), &self.workspace_dir))
    }

    async fn create_workspace(
        &self,
        params: CreateWorkspaceParams,
    ) -> Result<CreatedWorkspace, RuntimeError> {
        if let Some(parent) = self.workspace_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let dir = self.workspace_dir.to_string_lossy().into_owned();
        let mut args: Vec<&str> = vec!["worktree", "add", "-b", &params.branch_name, &dir];
        if let Some(trunk) = &params.trunk_branch {
            args.push(trunk);
        }
        debug!(branch = %params.branch_name, dir = %dir, "creating worktree");
        let result = self.git(&args, &params.project_path).await?;
        if !result.success() {
            return Err(RuntimeError::StartFailed(format!(
                "git worktree add failed: {}",
                result.stderr.trim()
            )));
        }
        Ok(CreatedWorkspace {
            workspace_dir: self.workspace_dir.clone(),
            init_hook: detect_init_hook(&self.workspace_dir),
        })
    }

    async fn remove_workspace(&self) -> Result<(), RuntimeError> {
        let dir = self.workspace_dir.to_string_lossy().into_owned();
        let result = self
            .git(&["worktree", "remove", "--force", &dir], &self.project_path)
            .await?;
        if !result.success() {
            warn!(dir = %dir, stderr = %result.stderr.trim(), "git worktree remove failed — deleting directory");
            let _ = tokio::fs::remove_dir_all(&self.workspace_dir).await;
        }
        Ok(())
    }

    async fn ensure_ready(&self, _status: Option<&StatusSink>) -> ReadyStatus {
        if self.workspace_dir.is_dir() {
            ReadyStatus::ready()
        } else {
            ReadyStatus::failed(
                ReadyErrorType::RuntimeNotReady,
                format!("worktree missing: {}", self.workspace_dir.display()),
            )
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn sh(dir: &Path, cmd: &str) {
        let status = std::process::Command::new("bash")
            .arg("-c")
            .arg(cmd)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "command failed: {cmd}");
    }

    // ── LocalRuntime file IO ──────────────────────────────────────────────────

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let tmp = TempDir::new().unwrap();
        let rt = LocalRuntime::new(tmp.path());
        rt.write_file(Path::new("sub/file.txt"), b"payload")
            .await
            .unwrap();
        let bytes = rt.read_file(Path::new("sub/file.txt")).await.unwrap();
        assert_eq!(bytes, b"payload");
    }

    #[tokio::test]
    async fn stat_missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let rt = LocalRuntime::new(tmp.path());
        let err = rt.stat(Path::new("absent.txt")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[tokio::test]
    async fn stat_reports_directory_and_size() {
        let tmp = TempDir::new().unwrap();
        let rt = LocalRuntime::new(tmp.path());
        rt.write_file(Path::new("f.txt"), b"12345").await.unwrap();
        let stat = rt.stat(Path::new("f.txt")).await.unwrap();
        assert_eq!(stat.size, 5);
        assert!(!stat.is_directory);
        assert!(rt.stat(Path::new(".")).await.unwrap().is_directory);
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_file() {
        let tmp = TempDir::new().unwrap();
        let rt = LocalRuntime::new(tmp.path());
        rt.write_file(Path::new("out.json"), b"{}").await.unwrap();
        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["out.json"]);
    }

    // ── exec cwd + relative paths ─────────────────────────────────────────────

    #[tokio::test]
    async fn exec_defaults_to_workspace_dir() {
        let tmp = TempDir::new().unwrap();
        let rt = LocalRuntime::new(tmp.path());
        let r = rt.exec("pwd", ExecOptions::default()).await.unwrap();
        let canon = tmp.path().canonicalize().unwrap();
        assert!(
            r.stdout.trim().ends_with(canon.file_name().unwrap().to_str().unwrap()),
            "pwd = {}",
            r.stdout
        );
    }

    #[tokio::test]
    async fn resolve_path_joins_relative_to_workspace() {
        let rt = LocalRuntime::new("/ws");
        assert_eq!(rt.resolve_path(Path::new("a/b")), PathBuf::from("/ws/a/b"));
        assert_eq!(rt.resolve_path(Path::new("/abs")), PathBuf::from("/abs"));
    }

    // ── Readiness ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ensure_ready_when_dir_exists() {
        let tmp = TempDir::new().unwrap();
        let rt = LocalRuntime::new(tmp.path());
        assert!(rt.ensure_ready(None).await.ready);
    }

    #[tokio::test]
    async fn ensure_ready_fails_for_missing_dir() {
        let rt = LocalRuntime::new("/no/such/dir/mux-test");
        let status = rt.ensure_ready(None).await;
        assert!(!status.ready);
        assert_eq!(status.error_type, Some(ReadyErrorType::RuntimeNotReady));
    }

    // ── Init hook detection ───────────────────────────────────────────────────

    #[tokio::test]
    async fn create_workspace_detects_init_hook() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(".mux")).unwrap();
        std::fs::write(tmp.path().join(".mux/init"), "#!/bin/sh\necho hi\n").unwrap();

        let rt = LocalRuntime::new(tmp.path());
        let created = rt
            .create_workspace(CreateWorkspaceParams {
                project_path: tmp.path().to_path_buf(),
                branch_name: "b".into(),
                trunk_branch: None,
                directory_name: "d".into(),
            })
            .await
            .unwrap();
        assert!(created.init_hook.is_some());
    }

    #[tokio::test]
    async fn create_workspace_without_hook() {
        let tmp = TempDir::new().unwrap();
        let rt = LocalRuntime::new(tmp.path());
        let created = rt
            .create_workspace(CreateWorkspaceParams {
                project_path: tmp.path().to_path_buf(),
                branch_name: "b".into(),
                trunk_branch: None,
                directory_name: "d".into(),
            })
            .await
            .unwrap();
        assert!(created.init_hook.is_none());
    }

    // ── Worktree lifecycle ────────────────────────────────────────────────────

    #[tokio::test]
    async fn worktree_create_and_remove() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        sh(&repo, "git init -q -b main");
        sh(&repo, "git -c user.email=t@t -c user.name=t commit -q --allow-empty -m init");

        let ws_dir = tmp.path().join("trees/feature-x");
        let rt = WorktreeRuntime::new(&repo, &ws_dir);
        let created = rt
            .create_workspace(CreateWorkspaceParams {
                project_path: repo.clone(),
                branch_name: "mux/feature-x".into(),
                trunk_branch: Some("main".into()),
                directory_name: "feature-x".into(),
            })
            .await
            .unwrap();
        assert!(created.workspace_dir.join(".git").exists());
        assert!(rt.ensure_ready(None).await.ready);

        rt.remove_workspace().await.unwrap();
        assert!(!ws_dir.exists());
    }

    #[tokio::test]
    async fn worktree_create_fails_outside_git_repo() {
        let tmp = TempDir::new().unwrap();
        let not_repo = tmp.path().join("plain");
        std::fs::create_dir_all(&not_repo).unwrap();
        let rt = WorktreeRuntime::new(&not_repo, tmp.path().join("trees/x"));
        let err = rt
            .create_workspace(CreateWorkspaceParams {
                project_path: not_repo,
                branch_name: "b".into(),
                trunk_branch: None,
                directory_name: "x".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::StartFailed(_)));
    }
}
