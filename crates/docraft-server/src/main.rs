//! Docraft replica node

use clap::Parser;
use docraft_server::{Config, Node, serve};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Docraft Server CLI arguments
#[derive(Parser, Debug)]
#[command(name = "docraft-server")]
#[command(about = "Docraft replicated document store node", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "docraft_server=debug,docraft_core=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "docraft_server=info,docraft_core=info".into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(args.config.as_deref())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("docraft-worker")
        .enable_all()
        .build()?;

    rt.block_on(async_main(config))
}

async fn async_main(config: Config) -> anyhow::Result<()> {
    let node = Node::open(&config)?;

    let listener = TcpListener::bind(&config.addr).await?;
    info!("Docraft node {} listening on {}", config.url, config.addr);

    serve(listener, node.engine.clone(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    })
    .await?;

    // Joining the session worker blocks
    tokio::task::spawn_blocking(move || node.shutdown()).await??;
    info!("Docraft node stopped");
    Ok(())
}
