use anyhow::{Context, Result};
use clap::Parser;

use scipass_core::config::ScipassConfig;
use scipass_daemon::Orchestrator;
use scipass_daemon::cli::DaemonCli;
use scipass_daemon::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    let mut config = ScipassConfig::load(&cli.config)
        .await
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    cli.apply_overrides(&mut config.general);
    config
        .validate()
        .context("invalid configuration after command-line overrides")?;

    if cli.validate {
        println!("configuration {} is valid", cli.config.display());
        return Ok(());
    }

    init_tracing(&config.general)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "scipass-daemon starting"
    );

    let mut orchestrator = Orchestrator::build_from_config(config)?;
    orchestrator.run().await
}
