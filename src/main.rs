// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;

use clap::Parser;
use cli::{Cli, Commands};
use mcgw_model::{CompletionRequest, Message};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { host, port, dev, log_level: _ } => {
            let mut config = mcgw_config::load(cli.config.as_deref())?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if dev {
                config.gateway.dev_mode = true;
            }
            mcgw_net::Gateway::run(config).await
        }
        Commands::Info => {
            let config = mcgw_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config)?);
            println!("Registered model drivers:");
            for driver in mcgw_model::list_drivers() {
                println!("  {:16} {}", driver.id, driver.name);
            }
            Ok(())
        }
        Commands::TestProvider => test_provider(cli.config.as_deref()).await,
        Commands::Init { path, force } => init_config(&path, force),
    }
}

/// Constructs the configured default model provider and runs one minimal
/// completion to confirm connectivity and credentials (§6 CLI contract).
async fn test_provider(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = mcgw_config::load(config_path)?;
    let provider = mcgw_model::from_config(&config.model)?;
    println!("testing provider={} model={}", provider.name(), provider.model_name());

    let request = CompletionRequest {
        messages: vec![Message::user("ping")],
        tools: Vec::new(),
        stream: false,
        system_dynamic_suffix: None,
    };
    let mut stream = provider.complete(request).await?;
    use futures::StreamExt;
    while let Some(event) = stream.next().await {
        event?;
    }
    println!("ok: provider responded successfully");
    Ok(())
}

fn init_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
    }
    let config = mcgw_config::Config::default();
    let yaml = serde_yaml::to_string(&config)?;
    let mut file = std::fs::File::create(path)?;
    file.write_all(yaml.as_bytes())?;
    println!("wrote default configuration to {}", path.display());
    Ok(())
}

fn init_logging(cli: &Cli) {
    let directive = match &cli.command {
        Commands::Serve { log_level: Some(level), .. } => level.clone(),
        _ => match cli.verbose {
            0 => "info".to_string(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        },
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let _ = tracing_subscriber::registry().with(fmt::layer().with_target(true)).with(filter).try_init();
}
