//! Forum GraphRAG CLI - main entry point
//!
//! This is the unified CLI interface for ingesting forum archives and
//! querying them with hybrid graph plus vector retrieval.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use forum_graphrag::{commands, metrics, Config, QueryOpts};
use tracing::warn;

#[derive(Parser)]
#[command(name = "forum_graphrag")]
#[command(about = "Hybrid graph and vector retrieval over forum archives", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a YAML config file (defaults to config.yml in the working directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to expose Prometheus metrics (e.g., 0.0.0.0:9898)
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log debug detail for this crate
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a JSON export of forum records
    Build {
        /// Path to a JSON array of records
        file: PathBuf,

        /// Only ingest the first N records
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Ask a question against the ingested archive
    Query {
        /// Question text
        text: String,

        /// Number of vector seeds to start from
        #[arg(long)]
        k_vector: Option<usize>,

        /// Number of additional graph posts to admit
        #[arg(long)]
        k_graph: Option<usize>,

        /// Maximum graph traversal depth
        #[arg(long)]
        max_hops: Option<usize>,

        /// Print the response as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Show node and point counts for both stores
    Stats,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Build { .. } => "build",
            Commands::Query { .. } => "query",
            Commands::Stats => "stats",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env for local development
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Initialize logging
    let default_directive = if cli.verbose {
        "forum_graphrag=debug"
    } else {
        "forum_graphrag=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_directive.parse()?))
        .init();

    let config = match cli.config.as_deref() {
        Some(path) => Config::load_from_file(path)?,
        None => Config::new(),
    };
    config.validate()?;

    if let Some(addr) = cli.metrics_addr.as_deref() {
        match addr.parse::<SocketAddr>() {
            Ok(socket) => metrics::spawn_metrics_server(socket),
            Err(err) => warn!(%addr, "Invalid metrics address: {}", err),
        }
    }

    let command_name = cli.command.name();
    metrics::record_command_start(command_name);
    let start = Instant::now();

    let result = execute_command(cli.command, &config).await;

    metrics::record_command_result(command_name, start.elapsed(), result.is_ok());

    result
}

async fn execute_command(command: Commands, config: &Config) -> anyhow::Result<()> {
    match command {
        Commands::Build { file, limit } => {
            let summary = commands::build::run(config, &file, limit).await?;
            println!("{}", summary);
        }
        Commands::Query {
            text,
            k_vector,
            k_graph,
            max_hops,
            json,
        } => {
            let opts = QueryOpts {
                k_vector: k_vector.unwrap_or(config.k_vector),
                k_graph: k_graph.unwrap_or(config.k_graph),
                max_hops: max_hops.unwrap_or(config.max_hops),
            };
            let response = commands::query::run(config, &text, &opts).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                commands::query::print_results(&response);
            }
        }
        Commands::Stats => {
            let stats = commands::stats::run(config).await?;
            commands::stats::print_stats(&stats);
        }
    }

    Ok(())
}

// Commands are in src/commands/ directory
