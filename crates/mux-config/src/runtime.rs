// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Where a workspace's tools execute.
///
/// Serialized as a tagged JSON variant inside richer documents; the compact
/// UI form is a mode string handled by [`parse_runtime_string`] /
/// [`build_runtime_string`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuntimeConfig {
    /// Tools run directly in the project directory, no isolation.
    Local {},
    /// Tools run in a git worktree created under `srcBaseDir`.
    Worktree {
        #[serde(rename = "srcBaseDir")]
        src_base_dir: String,
    },
    /// Tools run on a remote host reached by ssh.
    Ssh {
        host: String,
        #[serde(rename = "srcBaseDir")]
        src_base_dir: String,
        #[serde(rename = "identityFile", default, skip_serializing_if = "Option::is_none")]
        identity_file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
}

// Tolerant deserialize: legacy documents wrote `local { srcBaseDir }` where
// they meant a worktree.  A `local` with a srcBaseDir is mapped accordingly.
impl<'de> Deserialize<'de> for RuntimeConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            #[serde(rename = "type")]
            kind: String,
            #[serde(default)]
            src_base_dir: Option<String>,
            #[serde(default)]
            host: Option<String>,
            #[serde(default)]
            identity_file: Option<String>,
            #[serde(default)]
            port: Option<u16>,
        }

        let raw = Raw::deserialize(deserializer)?;
        match raw.kind.as_str() {
            "local" => match raw.src_base_dir {
                Some(dir) => Ok(RuntimeConfig::Worktree { src_base_dir: dir }),
                None => Ok(RuntimeConfig::Local {}),
            },
            "worktree" => Ok(RuntimeConfig::Worktree {
                src_base_dir: raw.src_base_dir.unwrap_or_default(),
            }),
            "ssh" => Ok(RuntimeConfig::Ssh {
                host: raw.host.unwrap_or_default(),
                src_base_dir: raw.src_base_dir.unwrap_or_default(),
                identity_file: raw.identity_file,
                port: raw.port,
            }),
            other => Err(serde::de::Error::custom(format!(
                "unknown runtime type: {other}"
            ))),
        }
    }
}

/// The three runtime modes as serialized in the compact UI string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    Local,
    Worktree,
    Ssh,
}

impl std::fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Worktree => write!(f, "worktree"),
            Self::Ssh => write!(f, "ssh"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRuntime {
    pub mode: RuntimeMode,
    /// Empty unless `mode == Ssh`.
    pub host: String,
}

/// Parse the compact runtime string.
///
/// `None` / `""` → worktree, `"local"` → local, `"ssh"` → ssh with empty
/// host, `"ssh <host>"` → ssh with host.  Unrecognised strings fall back to
/// worktree so a hand-edited config never wedges workspace startup.
pub fn parse_runtime_string(s: Option<&str>) -> ParsedRuntime {
    let s = s.unwrap_or("").trim();
    if s.is_empty() {
        return ParsedRuntime {
            mode: RuntimeMode::Worktree,
            host: String::new(),
        };
    }
    if s == "local" {
        return ParsedRuntime {
            mode: RuntimeMode::Local,
            host: String::new(),
        };
    }
    if s == "ssh" {
        return ParsedRuntime {
            mode: RuntimeMode::Ssh,
            host: String::new(),
        };
    }
    if let Some(host) = s.strip_prefix("ssh ") {
        return ParsedRuntime {
            mode: RuntimeMode::Ssh,
            host: host.trim().to_string(),
        };
    }
    ParsedRuntime {
        mode: RuntimeMode::Worktree,
        host: String::new(),
    }
}

/// Build the compact runtime string.  Worktree is the default and serializes
/// as `None` (absent field).
pub fn build_runtime_string(mode: RuntimeMode, host: &str) -> Option<String> {
    match mode {
        RuntimeMode::Worktree => None,
        RuntimeMode::Local => Some("local".to_string()),
        RuntimeMode::Ssh => {
            if host.is_empty() {
                Some("ssh".to_string())
            } else {
                Some(format!("ssh {host}"))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Parse ─────────────────────────────────────────────────────────────────

    #[test]
    fn absent_string_means_worktree() {
        assert_eq!(parse_runtime_string(None).mode, RuntimeMode::Worktree);
        assert_eq!(parse_runtime_string(Some("")).mode, RuntimeMode::Worktree);
    }

    #[test]
    fn local_string_parses() {
        let p = parse_runtime_string(Some("local"));
        assert_eq!(p.mode, RuntimeMode::Local);
        assert!(p.host.is_empty());
    }

    #[test]
    fn bare_ssh_has_empty_host() {
        let p = parse_runtime_string(Some("ssh"));
        assert_eq!(p.mode, RuntimeMode::Ssh);
        assert!(p.host.is_empty());
    }

    #[test]
    fn ssh_with_host() {
        let p = parse_runtime_string(Some("ssh user@host"));
        assert_eq!(p.mode, RuntimeMode::Ssh);
        assert_eq!(p.host, "user@host");
    }

    #[test]
    fn unrecognised_falls_back_to_worktree() {
        assert_eq!(
            parse_runtime_string(Some("docker whatever")).mode,
            RuntimeMode::Worktree
        );
    }

    // ── Build ─────────────────────────────────────────────────────────────────

    #[test]
    fn build_produces_compact_strings() {
        assert_eq!(build_runtime_string(RuntimeMode::Ssh, ""), Some("ssh".into()));
        assert_eq!(
            build_runtime_string(RuntimeMode::Ssh, "user@host"),
            Some("ssh user@host".into())
        );
        assert_eq!(
            build_runtime_string(RuntimeMode::Local, ""),
            Some("local".into())
        );
        assert_eq!(build_runtime_string(RuntimeMode::Worktree, ""), None);
    }

    // ── Round trips ───────────────────────────────────────────────────────────

    #[test]
    fn build_parse_round_trip() {
        for s in ["local", "ssh", "ssh user@host"] {
            let p = parse_runtime_string(Some(s));
            assert_eq!(build_runtime_string(p.mode, &p.host).as_deref(), Some(s));
        }
    }

    #[test]
    fn parse_build_round_trip() {
        for (mode, host) in [
            (RuntimeMode::Local, ""),
            (RuntimeMode::Worktree, ""),
            (RuntimeMode::Ssh, ""),
            (RuntimeMode::Ssh, "box.example"),
        ] {
            let built = build_runtime_string(mode, host);
            let parsed = parse_runtime_string(built.as_deref());
            assert_eq!(parsed.mode, mode);
            assert_eq!(parsed.host, host);
        }
    }

    // ── Tagged variant tolerance ──────────────────────────────────────────────

    #[test]
    fn legacy_local_with_src_base_dir_is_worktree() {
        let json = r#"{"type":"local","srcBaseDir":"/srv/worktrees"}"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            cfg,
            RuntimeConfig::Worktree {
                src_base_dir: "/srv/worktrees".into()
            }
        );
    }

    #[test]
    fn plain_local_stays_local() {
        let cfg: RuntimeConfig = serde_json::from_str(r#"{"type":"local"}"#).unwrap();
        assert_eq!(cfg, RuntimeConfig::Local {});
    }

    #[test]
    fn ssh_variant_round_trips() {
        let cfg = RuntimeConfig::Ssh {
            host: "dev@build1".into(),
            src_base_dir: "/src".into(),
            identity_file: Some("~/.ssh/id_ed25519".into()),
            port: Some(2222),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn unknown_runtime_type_is_rejected() {
        let err = serde_json::from_str::<RuntimeConfig>(r#"{"type":"podman"}"#);
        assert!(err.is_err());
    }
}
