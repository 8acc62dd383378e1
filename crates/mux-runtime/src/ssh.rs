// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use tracing::debug;

use crate::exec::{run_argv, spawn_argv, SpawnedChild};
use crate::{
    normalize_path, CreateWorkspaceParams, CreatedWorkspace, ExecOptions, ExecResult, FileStat,
    ReadyErrorType, ReadyStatus, Runtime, RuntimeError, SpawnOptions, StatusSink,
};

/// Runtime on a remote host reached by ssh.
///
/// Every operation is a remote shell command behind the same spawn helper
/// the local adapters use; file transfer goes through base64 so binary
/// content survives the text pipe.
pub struct SshRuntime {
    host: String,
    project_path: String,
    workspace_dir: PathBuf,
    identity_file: Option<String>,
    port: Option<u16>,
}

impl SshRuntime {
    pub fn new(
        host: impl Into<String>,
        project_path: impl Into<String>,
        workspace_dir: impl Into<PathBuf>,
        identity_file: Option<String>,
        port: Option<u16>,
    ) -> Self {
        Self {
            host: host.into(),
            project_path: project_path.into(),
            workspace_dir: workspace_dir.into(),
            identity_file: identity_file.map(|f| shellexpand::tilde(&f).into_owned()),
            port,
        }
    }

    fn ssh_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(id) = &self.identity_file {
            args.push("-i".to_string());
            args.push(id.clone());
        }
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.host.clone());
        args.push("--".to_string());
        args.push(remote_command.to_string());
        args
    }

    async fn remote(&self, command: &str, opts: &ExecOptions) -> Result<ExecResult, RuntimeError> {
        let wrapped = match &opts.cwd {
            Some(cwd) => format!("cd {} && {command}", sh_quote(&cwd.to_string_lossy())),
            None => command.to_string(),
        };
        let args = self.ssh_args(&wrapped);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let local_opts = ExecOptions {
            cwd: None,
            timeout_secs: opts.timeout_secs,
            env: Vec::new(),
            stdin: opts.stdin.clone(),
        };
        run_argv("ssh", &arg_refs, &local_opts).await
    }
}

/// Single-quote `s` for a POSIX shell.
pub(crate) fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[async_trait]
impl Runtime for SshRuntime {
    fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    async fn stat(&self, path: &Path) -> Result<FileStat, RuntimeError> {
        let p = sh_quote(&self.resolve_path(path).to_string_lossy());
        let r = self
            .remote(&format!("stat -c '%s %F %f %Y' {p}"), &ExecOptions::default())
            .await?;
        if !r.success() {
            return Err(RuntimeError::NotFound(r.stderr.trim().to_string()));
        }
        parse_stat_line(r.stdout.trim())
            .ok_or_else(|| RuntimeError::Io(format!("unparseable stat output: {}", r.stdout)))
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>, RuntimeError> {
        let p = sh_quote(&self.resolve_path(path).to_string_lossy());
        let r = self
            .remote(&format!("base64 < {p}"), &ExecOptions::default())
            .await?;
        if !r.success() {
            return Err(RuntimeError::NotFound(r.stderr.trim().to_string()));
        }
        let compact: String = r.stdout.chars().filter(|c| !c.is_whitespace()).collect();
        base64::engine::general_purpose::STANDARD
            .decode(compact)
            .map_err(|e| RuntimeError::Io(format!("base64 decode: {e}")))
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<String>, RuntimeError> {
        let p = sh_quote(&self.resolve_path(path).to_string_lossy());
        let r = self
            .remote(&format!("ls -1A {p} 2>/dev/null || true"), &ExecOptions::default())
            .await?;
        Ok(r.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), RuntimeError> {
        let target = self.resolve_path(path);
        let dir = sh_quote(&target.parent().unwrap_or(Path::new("/")).to_string_lossy());
        let p = sh_quote(&target.to_string_lossy());
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        // Decode into a temp file then rename, matching the local adapters'
        // atomicity guarantee.
        let opts = ExecOptions {
            stdin: Some(encoded),
            ..Default::default()
        };
        let r = self
            .remote(
                &format!("mkdir -p {dir} && base64 -d > {p}.mux-tmp && mv {p}.mux-tmp {p}"),
                &opts,
            )
            .await?;
        if !r.success() {
            return Err(RuntimeError::Io(r.stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn exec(&self, command: &str, mut opts: ExecOptions) -> Result<ExecResult, RuntimeError> {
        if opts.cwd.is_none() {
            opts.cwd = Some(self.workspace_dir.clone());
        }
        // Environment travels inline; ssh does not forward arbitrary vars.
        let env_prefix: String = opts
            .env
            .iter()
            .map(|(k, v)| format!("{k}={} ", sh_quote(v)))
            .collect();
        let cmd = format!("{env_prefix}{command}");
        self.remote(&cmd, &opts).await
    }

    async fn spawn(
        &self,
        command: &str,
        mut opts: SpawnOptions,
    ) -> Result<SpawnedChild, RuntimeError> {
        if opts.cwd.is_none() {
            opts.cwd = Some(self.workspace_dir.clone());
        }
        let cwd = opts.cwd.as_ref().unwrap();
        let wrapped = format!("cd {} && {command}", sh_quote(&cwd.to_string_lossy()));
        let args = self.ssh_args(&wrapped);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let local_opts = SpawnOptions {
            cwd: None,
            env: Vec::new(),
            stdin: opts.stdin.clone(),
        };
        spawn_argv("ssh", &arg_refs, &local_opts).await
    }

    fn resolve_path(&self, p: &Path) -> PathBuf {
        PathBuf::from(normalize_path(&p.to_string_lossy(), &self.workspace_dir))
    }

    async fn create_workspace(
        &self,
        params: CreateWorkspaceParams,
    ) -> Result<CreatedWorkspace, RuntimeError> {
        let dir = sh_quote(&self.workspace_dir.to_string_lossy());
        let project = sh_quote(&self.project_path);
        let branch = sh_quote(&params.branch_name);
        let trunk = params
            .trunk_branch
            .as_deref()
            .map(sh_quote)
            .unwrap_or_default();
        debug!(host = %self.host, branch = %params.branch_name, "creating remote worktree");
        let r = self
            .remote(
                &format!(
                    "mkdir -p $(dirname {dir}) && git -C {project} worktree add -b {branch} {dir} {trunk}"
                ),
                &ExecOptions::default(),
            )
            .await?;
        if !r.success() {
            return Err(RuntimeError::StartFailed(format!(
                "remote worktree add failed: {}",
                r.stderr.trim()
            )));
        }
        let hook = self
            .remote(
                &format!("test -f {dir}/.mux/init && echo yes || true"),
                &ExecOptions::default(),
            )
            .await?;
        let init_hook = if hook.stdout.trim() == "yes" {
            Some(self.workspace_dir.join(".mux/init"))
        } else {
            None
        };
        Ok(CreatedWorkspace {
            workspace_dir: self.workspace_dir.clone(),
            init_hook,
        })
    }

    async fn remove_workspace(&self) -> Result<(), RuntimeError> {
        let dir = sh_quote(&self.workspace_dir.to_string_lossy());
        let project = sh_quote(&self.project_path);
        let r = self
            .remote(
                &format!("git -C {project} worktree remove --force {dir} || rm -rf {dir}"),
                &ExecOptions::default(),
            )
            .await?;
        if !r.success() {
            return Err(RuntimeError::Io(r.stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn ensure_ready(&self, status: Option<&StatusSink>) -> ReadyStatus {
        if let Some(sink) = status {
            sink(&format!("connecting to {}", self.host));
        }
        let probe = self
            .remote(
                &format!(
                    "test -d {} && echo ok",
                    sh_quote(&self.workspace_dir.to_string_lossy())
                ),
                &ExecOptions {
                    timeout_secs: 15,
                    ..Default::default()
                },
            )
            .await;
        match probe {
            Ok(r) if r.success() && r.stdout.trim() == "ok" => ReadyStatus::ready(),
            Ok(r) => ReadyStatus::failed(
                ReadyErrorType::RuntimeNotReady,
                format!("remote probe failed: {}", r.stderr.trim()),
            ),
            Err(e) => ReadyStatus::failed(
                ReadyErrorType::RuntimeStartFailed,
                format!("ssh to {} failed: {e}", self.host),
            ),
        }
    }
}

fn parse_stat_line(line: &str) -> Option<FileStat> {
    let mut rest = line.splitn(2, ' ');
    let size: u64 = rest.next()?.parse().ok()?;
    let tail = rest.next()?;
    // File type is a multi-word field ("regular file", "directory"); mode hex
    // and mtime epoch are the final two tokens.
    let tokens: Vec<&str> = tail.rsplitn(3, ' ').collect();
    if tokens.len() < 3 {
        return None;
    }
    let mtime_epoch: i64 = tokens[0].parse().ok()?;
    let mode = u32::from_str_radix(tokens[1], 16).ok()?;
    let kind = tokens[2];
    Some(FileStat {
        size,
        is_directory: kind.contains("directory"),
        mode,
        mtime: chrono::DateTime::from_timestamp(mtime_epoch, 0),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
