//! Feed collector entrypoint.

use hl_collector::notify::Alert;
use hl_collector::{Config, CollectorService, Notifier, Result, SystemClock, WebhookNotifier};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();

    if let Err(e) = run().await {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    info!("starting feed collector");

    let config = Config::from_env()?;
    config.validate()?;

    let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::from_env(config.dry_run));
    let clock = Arc::new(SystemClock);

    let mut service = CollectorService::new(config, clock, Arc::clone(&notifier));
    service.start().await?;

    let signal_name = wait_for_shutdown().await;
    let _ = notifier
        .send(&Alert::CollectorStopping {
            signal: signal_name,
        })
        .await;

    service.stop().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Wait for SIGINT or SIGTERM; returns which one arrived.
async fn wait_for_shutdown() -> &'static str {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT");
            "SIGINT"
        }
        _ = terminate => {
            info!("received SIGTERM");
            "SIGTERM"
        }
    }
}
