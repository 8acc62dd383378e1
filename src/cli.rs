// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "mux",
    about = "Server-side orchestrator for concurrent AI coding workspaces",
    version
)]
pub struct Cli {
    /// Root directory for persisted state (defaults to MUX_ROOT or ~/.mux)
    #[arg(long, global = true)]
    pub root: Option<String>,

    /// Verbose logging to stderr (MUX_LOG overrides the filter)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List all workspaces across projects
    Workspaces,
    /// List agent definitions visible from a directory
    Agents {
        /// Workspace directory to resolve project-scope agents from
        #[arg(default_value = ".")]
        path: String,
    },
    /// Validate the config document and report basic health
    Doctor,
    /// Send a one-shot message to a workspace and print the reply
    Send {
        /// Workspace id
        workspace: String,
        /// The message text
        text: String,
        /// Model string (provider:model); defaults to the workspace setting
        #[arg(long)]
        model: Option<String>,
        /// Agent id to run as
        #[arg(long)]
        agent: Option<String>,
    },
    /// Resume task bookkeeping after a restart (drains the task queue)
    Resume,
}
