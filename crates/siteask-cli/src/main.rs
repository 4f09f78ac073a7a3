//! Siteask CLI
//!
//! Ask natural-language questions of structured site corpora.

use anyhow::Result;
use clap::Parser;
use siteask_core::error::exit_codes;
use siteask_core::{Config, CorpusStore, SiteAskError};
use std::process::ExitCode;
use std::sync::Arc;

mod app;
mod commands;
mod output;
mod progress;
mod server;

use app::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout carries results (and MCP frames), so logs go to stderr
    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            let code = e
                .downcast_ref::<SiteAskError>()
                .map(SiteAskError::exit_code)
                .unwrap_or(exit_codes::GENERAL_ERROR);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // Open corpus (SITEASK_DB overrides the default location)
    let corpus = Arc::new(CorpusStore::open(CorpusStore::default_path())?);
    commands::adopt_corpus_sites(&mut config, &corpus)?;

    match cli.command {
        Commands::Load(args) => commands::load::run(args, &corpus, &config, cli.verbose).await,
        Commands::Sites(args) => commands::sites::run(args, &corpus, cli.format).await,
        Commands::Ask(args) => {
            let coordinator = commands::coordinator(&config, Arc::clone(&corpus))?;
            commands::ask::run(args, coordinator, cli.format).await
        }
        Commands::Serve(args) => {
            let coordinator = commands::coordinator(&config, Arc::clone(&corpus))?;
            commands::serve::run(args, coordinator, corpus).await
        }
        Commands::Watch(args) => commands::watch::run(args, cli.format).await,
        Commands::Mcp => {
            let coordinator = commands::coordinator(&config, Arc::clone(&corpus))?;
            siteask_mcp::start_server(coordinator, corpus).await
        }
    }
}
