//! Watchdog monitor entrypoint.
//!
//! No explicit shutdown contract: state is persisted after every probe
//! tick, so termination at any point resumes cleanly on restart.

use hl_collector::monitor::SystemProcessProbe;
use hl_collector::{Config, HealthMonitor, Notifier, Result, SystemClock, WebhookNotifier};
use std::sync::Arc;
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
    let config = Config::from_env()?;

    let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::from_env(config.dry_run));
    let mut monitor = HealthMonitor::new(
        config.monitor.clone(),
        config.heartbeat_file.clone(),
        Arc::new(SystemClock),
        Arc::new(SystemProcessProbe),
        notifier,
    )?;

    info!(
        "monitor started, heartbeat={} state={}",
        config.heartbeat_file.display(),
        config.monitor.state_file.display()
    );

    monitor.run().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
