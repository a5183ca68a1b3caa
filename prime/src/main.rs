use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use alfred_prime::config::Config;
use alfred_prime::events::{EventBus, Priority};
use alfred_prime::registry::DaemonRegistry;
use alfred_prime::server;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(
    name = "alfred-prime",
    about = "Alfred Prime link endpoint for daemon connections"
)]
struct Cli {
    /// Override PRIME_LISTEN_ADDR.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "prime link listening");

    let registry = DaemonRegistry::new(config.registration_key.clone(), config.command_timeout);
    let bus = Arc::new(EventBus::default());

    // Log bus traffic; the intent pipeline that consumes it lives elsewhere.
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.priority {
                    Priority::High => warn!(
                        daemon_id = %event.daemon_id,
                        source = %event.source,
                        event_type = %event.event_type,
                        "alert"
                    ),
                    Priority::Normal => info!(
                        daemon_id = %event.daemon_id,
                        source = %event.source,
                        event_type = %event.event_type,
                        "event"
                    ),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let cancel = CancellationToken::new();
    let endpoint = tokio::spawn(server::run(
        listener,
        registry.clone(),
        bus.clone(),
        cancel.clone(),
    ));

    shutdown_signal().await?;
    info!("shutting down");
    cancel.cancel();
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, endpoint).await;
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("installing SIGINT handler")?,
        _ = term.recv() => {}
    }
    Ok(())
}
