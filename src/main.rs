mod backend;
mod cli;
mod engine;
mod error;
mod model;
mod orchestrator;
mod storage;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let fallback = args.log_level.clone().unwrap_or_else(|| "warn".into());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with_writer(std::io::stderr)
        .init();

    match cli::run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}
