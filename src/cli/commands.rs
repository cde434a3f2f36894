// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::{anyhow, Context, Result};
use clap::Args;
use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::rag::DocumentScope;
use crate::sandbox::CodeSandbox;
use crate::session::{ChatReply, SessionHandle};

/// Arguments for ingest command
#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Text file to ingest
    pub path: PathBuf,

    /// Document id (defaults to the file name)
    #[arg(long)]
    pub id: Option<String>,

    /// Caller identity for rate limiting
    #[arg(long, default_value = "cli", env = "RAG_IDENTITY")]
    pub identity: String,
}

/// Session options shared by ask and chat
#[derive(Args, Debug)]
pub struct SessionArgs {
    /// Restrict retrieval to these document ids (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub documents: Vec<String>,

    /// Backend to try first
    #[arg(long)]
    pub backend: Option<String>,

    /// Prompt template for the system preamble
    #[arg(long)]
    pub template: Option<String>,

    /// Caller identity
    #[arg(long, default_value = "cli", env = "RAG_IDENTITY")]
    pub identity: String,
}

/// Arguments for ask command
#[derive(Args, Debug)]
pub struct AskArgs {
    pub question: String,

    #[command(flatten)]
    pub session: SessionArgs,
}

/// Arguments for chat command
#[derive(Args, Debug)]
pub struct ChatArgs {
    #[command(flatten)]
    pub session: SessionArgs,

    /// Write the transcript as Markdown on exit
    #[arg(long)]
    pub export: Option<PathBuf>,
}

/// Arguments for store-key command
#[derive(Args, Debug)]
pub struct StoreKeyArgs {
    /// Backend name as configured
    pub backend: String,

    /// API key (read from stdin when omitted)
    #[arg(long, env = "RAG_BACKEND_API_KEY", hide_env_values = true)]
    pub key: Option<String>,
}

/// Arguments for validate command
#[derive(Args, Debug)]
pub struct CodeArgs {
    /// Source file
    pub path: PathBuf,
}

/// Arguments for exec command
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Source file
    pub path: PathBuf,

    /// Wall-clock limit in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    #[arg(long, default_value = "cli", env = "RAG_IDENTITY")]
    pub identity: String,
}

/// Arguments for stats command
#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Admin password
    #[arg(long, env = "RAG_ADMIN_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Print Prometheus text instead of the JSON summary
    #[arg(long)]
    pub prometheus: bool,
}

pub async fn ingest(engine: &EngineContext, args: IngestArgs) -> Result<()> {
    let text = tokio::fs::read_to_string(&args.path)
        .await
        .with_context(|| format!("reading {}", args.path.display()))?;
    let document_id = match args.id {
        Some(id) => id,
        None => args
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("cannot derive a document id from {}", args.path.display()))?,
    };

    let chunks = engine.ingest(&args.identity, &document_id, &text).await?;
    println!("Ingested {} as {} chunks", document_id, chunks);
    Ok(())
}

async fn open_session(engine: &EngineContext, args: &SessionArgs) -> Result<SessionHandle> {
    let handle = engine.create_session(&args.identity).await?;
    if !args.documents.is_empty() {
        engine
            .set_documents(&handle, DocumentScope::only(args.documents.iter().cloned()))
            .await?;
    }
    engine.set_backend(&handle, args.backend.as_deref()).await?;
    engine.set_template(&handle, args.template.as_deref()).await?;
    Ok(handle)
}

fn print_reply(reply: &ChatReply) {
    println!("{}", reply.text.trim());
    if !reply.sources.is_empty() {
        println!();
        for (i, source) in reply.sources.iter().enumerate() {
            println!(
                "  [{}] {} part {} (score {:.3})",
                i + 1,
                source.document_id,
                source.ordinal + 1,
                source.score
            );
        }
    }
    println!(
        "  -- {}{}",
        reply.backend,
        if reply.cached { ", cached" } else { "" }
    );
}

pub async fn ask(engine: &EngineContext, args: AskArgs) -> Result<()> {
    let handle = open_session(engine, &args.session).await?;
    let result = engine.chat(&handle, &args.question).await;
    engine.delete_session(&handle).await?;

    match result {
        Ok(reply) => {
            print_reply(&reply);
            Ok(())
        }
        Err(e) => Err(anyhow!("{}", e.user_message())),
    }
}

pub async fn chat(engine: &EngineContext, args: ChatArgs) -> Result<()> {
    let handle = open_session(engine, &args.session).await?;
    println!("Session {} started. Type /exit to quit.", handle.id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/exit" || line == "/quit" {
            break;
        }
        match engine.chat(&handle, line).await {
            Ok(reply) => print_reply(&reply),
            Err(e) => eprintln!("! {}", e.user_message()),
        }
    }

    if let Some(path) = args.export {
        let transcript = engine.sessions.export_markdown(&handle).await?;
        tokio::fs::write(&path, transcript)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Transcript written to {}", path.display());
    }
    Ok(())
}

pub async fn store_key(engine: &EngineContext, args: StoreKeyArgs) -> Result<()> {
    let key = match args.key {
        Some(key) => key,
        None => {
            eprintln!("API key for {}:", args.backend);
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            lines
                .next_line()
                .await?
                .ok_or_else(|| anyhow!("no key given on stdin"))?
        }
    };
    let key = key.trim().to_string();
    if key.is_empty() {
        return Err(anyhow!("API key must not be empty"));
    }

    engine
        .store_credential(&args.backend, SecretString::new(key))
        .await?;
    info!("Credential stored for backend {}", args.backend);
    println!("Stored credential for {}", args.backend);
    Ok(())
}

pub async fn validate(config: &EngineConfig, args: &CodeArgs) -> Result<()> {
    let source = tokio::fs::read_to_string(&args.path)
        .await
        .with_context(|| format!("reading {}", args.path.display()))?;
    let sandbox = CodeSandbox::new(&config.sandbox, config.code_execution_enabled);

    let violations = sandbox.validate(&source);
    if violations.is_empty() {
        println!("No violations");
        return Ok(());
    }
    for violation in &violations {
        println!("  {}", violation);
    }
    Err(anyhow!("{} violation(s) found", violations.len()))
}

pub async fn exec(engine: &EngineContext, args: ExecArgs) -> Result<()> {
    let source = tokio::fs::read_to_string(&args.path)
        .await
        .with_context(|| format!("reading {}", args.path.display()))?;
    let timeout = args.timeout.map(Duration::from_secs);

    let output = engine
        .execute_code(&args.identity, &source, timeout)
        .await
        .map_err(|e| anyhow!("{}", e.user_message()))?;
    print!("{}", output.stdout);
    if !output.stderr.is_empty() {
        eprint!("{}", output.stderr);
    }
    Ok(())
}

pub async fn stats(engine: &EngineContext, args: StatsArgs) -> Result<()> {
    let token = engine.admin.authenticate(&args.password)?;
    if args.prometheus {
        print!("{}", engine.admin.metrics_text(&token)?);
        return Ok(());
    }

    let report = serde_json::json!({
        "system": engine.admin.system_stats(&token).await?,
        "metrics": engine.admin.metrics_summary(&token)?,
        "backends": engine.gateway.refresh_probes().await,
        "sessions": engine.admin.list_sessions(&token).await?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
