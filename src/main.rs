use anyhow::Context;
use clap::Parser;
use creative_capture::{
    run_normalize, setup_logging, validate_config_file, Cli, CliRunner, Commands, Config, ConfigOverrides,
};
use std::path::Path;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    setup_logging(args.verbose)?;

    info!("Starting creative-capture v{}", env!("CARGO_PKG_VERSION"));

    // These commands need neither a browser nor a loaded configuration.
    let command = match args.command {
        Commands::Normalize {
            input,
            output,
            no_trim,
        } => return run_normalize(input, output, !no_trim).await,
        Commands::Validate { path } => return validate_config_file(path).await,
        command => command,
    };

    let config = load_config(args.config.as_deref(), &args.overrides).await?;
    let runner = CliRunner::new(config)?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = tokio::select! {
        result = runner.run(command) => {
            info!("Capture completed");
            result
        }
        _ = shutdown_rx.recv() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!("Application error: {:#}", e);
    }
    info!("creative-capture stopped");
    result
}

async fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&content).with_context(|| format!("invalid config {}", path.display()))?
        }
        None => Config::default(),
    };

    overrides.apply(&mut config);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Profile: {}", config.profile.as_str());
    info!("Pipeline version: {}", config.pipeline_version());
    info!("Concurrency: {}", config.concurrency);
    info!("Shard: {}/{}", config.shard.index, config.shard.count);

    Ok(config)
}

fn setup_shutdown_handler(shutdown_tx: tokio::sync::broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let sigint = signal::unix::signal(signal::unix::SignalKind::interrupt());
        let sigterm = signal::unix::signal(signal::unix::SignalKind::terminate());
        let (mut sigint, mut sigterm) = match (sigint, sigterm) {
            (Ok(i), Ok(t)) => (i, t),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
