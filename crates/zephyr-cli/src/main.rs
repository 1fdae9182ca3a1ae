//! Zephyr CLI entrypoint.

use clap::Parser;

mod commands;
mod config;
mod local;

#[derive(Parser)]
#[command(name = "zephyr")]
#[command(author, version, about = "Self-hosted CI with microVM job isolation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let exit_code = commands::dispatch(cli.command).await?;
    std::process::exit(exit_code);
}
