use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use alfred_daemon::client::PrimeClient;
use alfred_daemon::config::Config;
use alfred_daemon::emitters::filewatcher::FileWatcher;
use alfred_daemon::emitters::resource::ResourceMonitor;
use alfred_daemon::emitters::Manager;
use alfred_daemon::handlers::Registry;

/// How long to wait for in-flight work after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(
    name = "alfred-daemon",
    about = "Per-machine Alfred agent that maintains a persistent link to Prime"
)]
struct Cli {
    /// Dotenv-style file consulted for variables the environment leaves
    /// unset.
    #[arg(long)]
    env_file: Option<PathBuf>,
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
    let config = Config::load(cli.env_file.as_deref())?;

    info!(
        name = %config.name,
        hostname = %config.hostname,
        capabilities = ?config.capabilities,
        prime = %config.prime_address,
        "alfred daemon starting"
    );
    if config.is_soul_daemon {
        info!(
            root = config.alfred_root.as_deref().unwrap_or(""),
            "running as soul daemon"
        );
    }

    let registry = Registry::with_builtins();
    info!(handlers = ?registry.list(), "handlers registered");

    let manager = Manager::new();
    manager.add_emitter(Arc::new(ResourceMonitor::new(&config.name)));
    if !config.watch_paths.is_empty() {
        manager.add_emitter(Arc::new(FileWatcher::new(&config.name, &config.watch_paths)?));
    }

    let client = PrimeClient::new(config, registry);
    {
        let client = client.clone();
        manager.on_event(move |event| client.forward_event(event));
    }

    let cancel = CancellationToken::new();
    manager.clone().start(&cancel);
    let link = tokio::spawn(client.run(cancel.clone()));

    shutdown_signal().await?;
    info!("shutting down");
    cancel.cancel();
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = link.await;
        manager.join().await;
    })
    .await;
    info!("goodbye");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("installing SIGINT handler")?,
        _ = term.recv() => {}
    }
    Ok(())
}
