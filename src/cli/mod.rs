// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::EngineConfig;
use crate::context::EngineContext;

/// Fabstir RAG Engine CLI
#[derive(Parser, Debug)]
#[command(name = "rag-engine")]
#[command(version)]
#[command(about = "Document-grounded chat over local and remote model backends", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, short, global = true, env = "RAG_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest a plain-text document into the index
    Ingest(commands::IngestArgs),

    /// Ask a single question
    Ask(commands::AskArgs),

    /// Interactive chat session on stdin
    Chat(commands::ChatArgs),

    /// Encrypt and store a backend API key
    StoreKey(commands::StoreKeyArgs),

    /// Check a code snippet against the sandbox rules
    Validate(commands::CodeArgs),

    /// Validate and run a code snippet in the sandbox
    Exec(commands::ExecArgs),

    /// Show engine statistics (admin)
    Stats(commands::StatsArgs),
}

/// Execute CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    let config = EngineConfig::load(cli.config.as_deref())?;

    // Validation needs no engine state
    if let Commands::Validate(args) = &cli.command {
        return commands::validate(&config, args).await;
    }

    let engine = EngineContext::initialize(config).await?;
    let result = match cli.command {
        Commands::Ingest(args) => commands::ingest(&engine, args).await,
        Commands::Ask(args) => commands::ask(&engine, args).await,
        Commands::Chat(args) => commands::chat(&engine, args).await,
        Commands::StoreKey(args) => commands::store_key(&engine, args).await,
        Commands::Exec(args) => commands::exec(&engine, args).await,
        Commands::Stats(args) => commands::stats(&engine, args).await,
        Commands::Validate(_) => Ok(()),
    };
    engine.shutdown().await?;
    result
}
