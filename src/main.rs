use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tunnelkeeper::config::{AppConfig, LoggingConfig};
use tunnelkeeper::error::{Result, TunnelError};
use tunnelkeeper::provider::ProviderKind;
use tunnelkeeper::supervisor::TunnelEvent;
use tunnelkeeper::{Orchestrator, StatusServer};

#[derive(Parser)]
#[command(name = "tunnelkeeper", about = "Keeps public tunnels to local services alive")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start all configured tunnels and supervise them until Ctrl-C
    Run {
        /// Path to a TOML config file (defaults to ./tunnelkeeper.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// One-shot reachability check against a URL
    Check {
        #[arg(long)]
        url: String,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// List supported tunnel providers
    Providers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = AppConfig::load_from(config.as_deref())?;
            init_logging(&config.logging);
            run(config).await
        }
        Commands::Check { url, timeout_ms } => {
            init_logging(&LoggingConfig::default());
            check_url(&url, timeout_ms).await
        }
        Commands::Providers => {
            for kind in ProviderKind::all() {
                println!("{kind}");
            }
            Ok(())
        }
    }
}

async fn run(config: AppConfig) -> Result<()> {
    let orchestrator = Arc::new(Orchestrator::new(config.clone())?);
    let mut events = orchestrator.subscribe();

    if let Some(port) = config.status_port {
        let server = StatusServer::new(Arc::clone(&orchestrator), port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "status server stopped");
            }
        });
    }

    let ready = orchestrator.start_all().await;
    if ready.is_empty() {
        warn!("no tunnels came up; waiting for shutdown");
    }
    for (name, url) in &ready {
        println!("{name}: {url}");
    }

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Ok(TunnelEvent::Ready { name, url }) => info!(tunnel = %name, url = %url, "tunnel ready"),
                Ok(TunnelEvent::Down { name, error }) => warn!(tunnel = %name, error = %error, "tunnel down"),
                Ok(TunnelEvent::ProviderChanged { name, provider }) => {
                    info!(tunnel = %name, provider = %provider, "provider changed")
                }
                Ok(TunnelEvent::Error { context, error }) => error!(tunnel = %context, error = %error, "tunnel error"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event listener lagging")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    orchestrator.stop_all().await;
    Ok(())
}

async fn check_url(url: &str, timeout_ms: u64) -> Result<()> {
    // Same liveness rule as the health probe: any response counts
    let parsed = url::Url::parse(url)
        .map_err(|e| TunnelError::Validation(format!("invalid url \"{url}\": {e}")))?;

    let client = reqwest::Client::new();
    match client
        .get(parsed)
        .timeout(Duration::from_millis(timeout_ms))
        .send()
        .await
    {
        Ok(response) => {
            println!("{url} is reachable (status {})", response.status());
            Ok(())
        }
        Err(e) => {
            println!("{url} is unreachable: {e}");
            Err(TunnelError::Probe(e.to_string()))
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
