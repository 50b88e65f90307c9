// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "mcgw", about = "WebSocket gateway bridging Minecraft Bedrock Edition clients to LLM providers", version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (overrides auto-discovery).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway: bind the WebSocket listener and run the worker pool.
    Serve {
        /// Listener host, overriding the config file.
        #[arg(long)]
        host: Option<String>,
        /// Listener port, overriding the config file.
        #[arg(long)]
        port: Option<u16>,
        /// Log level (error, warn, info, debug, trace); overrides -v.
        #[arg(long)]
        log_level: Option<String>,
        /// Bypass authentication, for local debugging only.
        #[arg(long)]
        dev: bool,
    },
    /// Print the resolved configuration and the registered model drivers.
    Info,
    /// Construct the configured default model provider and run one minimal
    /// completion to confirm connectivity and credentials.
    TestProvider,
    /// Write a starter config file with default values.
    Init {
        /// Destination path for the generated config file.
        #[arg(long, default_value = "mcgw.yaml")]
        path: PathBuf,
        /// Overwrite an existing file at `path`.
        #[arg(long)]
        force: bool,
    },
}
