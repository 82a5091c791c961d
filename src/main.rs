//! Trellis CLI entry point

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Live dependency graph of a source tree, queryable by agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Repository root path (defaults to current directory)
    #[arg(short, long, default_value = ".", global = true)]
    root: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Index, watch and serve the graph
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },
    /// Index the repository, save a snapshot and exit
    Index,
    /// Print graph statistics from the saved snapshot
    Stats,
    /// Remove saved state
    Clear,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("trellis={level},trellis_core={level},trellis_indexer={level},trellis_server={level},trellis_watcher={level}", level = log_level))
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::debug!("Repository root: {}", cli.root.display());

    match cli.command {
        Commands::Serve { port, host } => commands::serve(cli.root, host, port).await,
        Commands::Index => commands::index(cli.root).await,
        Commands::Stats => commands::stats(cli.root),
        Commands::Clear => commands::clear(cli.root),
        Commands::Version => {
            println!("trellis v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
