//! postline - content distribution feedback loop

use clap::Parser;
use postline::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Rustls 0.23+ needs an explicit crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install Rustls crypto provider"))?;

    let cli = cli::Cli::parse();

    // WARN by default, INFO with --verbose; RUST_LOG directives still apply
    let level = if cli.verbose { tracing::Level::INFO } else { tracing::Level::WARN };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(level.into())
        )
        .init();

    cli::run(cli).await
}
