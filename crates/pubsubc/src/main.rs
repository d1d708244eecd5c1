#![forbid(unsafe_code)]

use pubsubc::config::{load_config, Cli, ClientConfig, Commands};
use pubsubc::events::log_events;
use pubsubc::orchestrator::Orchestrator;
use pubsubc::ClientError;

use clap::Parser;
use std::process::ExitCode;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

fn resolve_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = load_config(cli.config.as_deref())?;

    if let Some(ref endpoint) = cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(ref channel_id) = cli.channel_id {
        config.channel_id = channel_id.clone();
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    Ok(config)
}

async fn run_client(cli: &Cli) -> anyhow::Result<()> {
    let config = resolve_config(cli)?;
    info!(
        channel_id = %config.channel_id,
        endpoint = %config.endpoint,
        "starting pubsubc"
    );

    let (events_tx, events_rx) = broadcast::channel(256);
    tokio::spawn(log_events(events_rx));

    let orchestrator = Orchestrator::new(config, events_tx);
    let cancel = orchestrator.cancel_token();
    let fatal_tx = orchestrator.fatal_sender();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal");
                cancel.cancel();
            }
            Err(e) => {
                let _ = fatal_tx.send(ClientError::Signal(e)).await;
            }
        }
    });

    orchestrator.run().await?;
    info!("pubsubc stopped");
    Ok(())
}

fn check_config(cli: &Cli) -> anyhow::Result<()> {
    let config = resolve_config(cli)?;
    let auth = if config.access_token.is_empty() {
        format!("oauth via http://{}/", config.oauth.listen)
    } else {
        "access token".to_string()
    };
    println!("configuration ok");
    println!("  endpoint   {}", config.endpoint);
    println!("  topics     {}", config.topics().join(", "));
    println!("  auth       {auth}");
    println!("  keepalive  {}s", config.keepalive.interval_s);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Start => run_client(&cli).await,
        Commands::CheckConfig => check_config(&cli),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
