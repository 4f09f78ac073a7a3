//! CLI argument definitions

use clap::{Args, Parser, Subcommand, ValueEnum};
use siteask_core::GenerateMode;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "siteask")]
#[command(
    author,
    version,
    about = "Ask natural-language questions of structured site corpora"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "cli")]
    pub format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file
    #[arg(long, global = true, env = "SITEASK_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load items from JSON, JSON-lines or TSV files into the corpus
    Load(LoadArgs),

    /// List or remove loaded sites
    Sites(SitesArgs),

    /// Ask a question and print the turn's events
    Ask(AskArgs),

    /// Serve the event stream over HTTP
    Serve(ServeArgs),

    /// Ask a running server, reconnecting on dropped streams
    Watch(WatchArgs),

    /// Start MCP server
    Mcp,
}

#[derive(Args)]
pub struct LoadArgs {
    /// Files or directories to load
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Site the items belong to (defaults to the file or directory name)
    #[arg(short, long)]
    pub site: Option<String>,

    /// Type assumed for items without an `@type`
    #[arg(long)]
    pub item_type: Option<String>,

    /// Drop the site's existing items first
    #[arg(long)]
    pub replace: bool,
}

#[derive(Args)]
pub struct SitesArgs {
    /// Remove a site and all of its items
    #[arg(long, value_name = "SITE")]
    pub remove: Option<String>,
}

/// Options shared by `ask` and `watch`
#[derive(Args, Clone)]
pub struct TurnArgs {
    /// The question
    #[arg(required = true)]
    pub query: Vec<String>,

    /// Comma separated sites to ask (all sites when omitted)
    #[arg(short, long)]
    pub site: Option<String>,

    /// list, summarize or generate
    #[arg(short, long, default_value = "list")]
    pub mode: GenerateMode,

    /// Earlier queries of the conversation, oldest first
    #[arg(long = "prev")]
    pub prev: Vec<String>,

    /// Facts remembered from earlier turns
    #[arg(long = "remember")]
    pub remembered: Vec<String>,

    /// Item the user is looking at
    #[arg(long)]
    pub context_url: Option<String>,

    /// Caller-chosen query id
    #[arg(long)]
    pub query_id: Option<String>,
}

#[derive(Args)]
pub struct AskArgs {
    #[command(flatten)]
    pub turn: TurnArgs,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080", env = "SITEASK_ADDR")]
    pub addr: SocketAddr,
}

#[derive(Args)]
pub struct WatchArgs {
    #[command(flatten)]
    pub turn: TurnArgs,

    /// Base URL of a `siteask serve` instance
    #[arg(long, default_value = "http://127.0.0.1:8080", env = "SITEASK_SERVER")]
    pub server: String,

    /// Session the turn belongs to
    #[arg(long)]
    pub session: Option<String>,

    /// Give up after this many failed reconnects
    #[arg(long, default_value = "5")]
    pub max_retries: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable, results as they arrive
    Cli,
    /// One aggregated JSON document per turn
    Json,
    /// Raw `data:` frames
    Sse,
}
