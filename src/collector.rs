//! Collector service: composition and lifecycle.
//!
//! One instance owns all mutable state (connection status, queue, timers)
//! behind explicit `start()`/`stop()`, so tests can run isolated instances.

use crate::buffer::IngestBuffer;
use crate::clock::Clock;
use crate::config::Config;
use crate::errors::Result;
use crate::heartbeat::{HeartbeatPublisher, HeartbeatSnapshot, LifecycleState};
use crate::hyperliquid::{ConnectionEvent, ConnectionStatus, StreamClient};
use crate::notify::{Alert, Notifier};
use crate::retention::RetentionManager;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long `stop()` waits for the stream task before giving up.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CollectorService {
    config: Config,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    status: Arc<ConnectionStatus>,
    buffer: Arc<IngestBuffer>,
    client: Arc<StreamClient>,
    publisher: Arc<HeartbeatPublisher>,
    retention: Arc<RetentionManager>,
    lifecycle: Arc<RwLock<LifecycleState>>,
    shutdown: Arc<AtomicBool>,
    started_at_ms: i64,
    events_rx: Option<mpsc::Receiver<ConnectionEvent>>,
    timer_tasks: Vec<JoinHandle<()>>,
    stream_task: Option<JoinHandle<()>>,
}

impl CollectorService {
    pub fn new(config: Config, clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>) -> Self {
        let status = ConnectionStatus::new();
        let buffer = IngestBuffer::new(&config);
        let (events_tx, events_rx) = mpsc::channel::<ConnectionEvent>(16);
        let client = StreamClient::new(
            config.ws_url.clone(),
            config.symbols.clone(),
            config.sub_types.clone(),
            config.reconnect_delay,
            Arc::clone(&status),
            Arc::clone(&buffer),
            Arc::clone(&clock),
            events_tx,
        );
        let publisher = Arc::new(HeartbeatPublisher::new(config.heartbeat_file.clone()));
        let retention = Arc::new(RetentionManager::new(&config));
        let started_at_ms = clock.now_ms();

        Self {
            config,
            clock,
            notifier,
            status,
            buffer,
            client,
            publisher,
            retention,
            lifecycle: Arc::new(RwLock::new(LifecycleState::Starting)),
            shutdown: Arc::new(AtomicBool::new(false)),
            started_at_ms,
            events_rx: Some(events_rx),
            timer_tasks: Vec::new(),
            stream_task: None,
        }
    }

    /// Bring the pipeline up: outputs, heartbeat, retention, stream.
    pub async fn start(&mut self) -> Result<()> {
        self.ensure_outputs().await?;

        self.publish_heartbeat().await;
        info!("sharedFeed={}", self.config.shared_feed_file.display());
        info!(
            "logDir={} rawPattern={}YYYYMMDD.jsonl",
            self.config.log_dir.display(),
            self.config.raw_prefix
        );
        info!(
            "symbols={} channels={}",
            self.config.symbols.join(","),
            self.config.sub_types.join(",")
        );

        // eager retention pass before the first timer fires
        self.run_retention_once().await;

        self.spawn_event_listener();
        self.spawn_heartbeat_timer();
        self.spawn_retention_timer();
        self.spawn_staleness_watchdog();

        let client = Arc::clone(&self.client);
        self.stream_task = Some(tokio::spawn(async move {
            client.run().await;
        }));

        let _ = self
            .notifier
            .send(&Alert::CollectorStarted {
                shared_feed: self.config.shared_feed_file.display().to_string(),
                log_dir: self.config.log_dir.display().to_string(),
                symbols: self.config.symbols.join(","),
                channels: self.config.sub_types.join(","),
            })
            .await;

        Ok(())
    }

    /// Drain sequence: stop scheduling, close the connection, final flush,
    /// terminal heartbeat.
    pub async fn stop(&mut self) {
        info!("stopping collector");
        self.shutdown.store(true, Ordering::SeqCst);

        for task in self.timer_tasks.drain(..) {
            task.abort();
        }

        self.client.shutdown();
        if let Some(stream_task) = self.stream_task.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, stream_task).await.is_err() {
                warn!("stream task did not stop within {:?}", SHUTDOWN_TIMEOUT);
            }
        }

        if let Err(e) = self.buffer.drain(self.clock.now_ms()).await {
            error!("final flush failed: {}", e);
        }

        *self.lifecycle.write() = LifecycleState::Stopped;
        self.publish_heartbeat().await;
        info!("collector stopped");
    }

    /// Create output directories and make sure the shared feed file exists.
    async fn ensure_outputs(&self) -> Result<()> {
        if let Some(parent) = self.config.shared_feed_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.shared_feed_file)
            .await?;
        tokio::fs::create_dir_all(&self.config.log_dir).await?;
        if let Some(parent) = self.config.heartbeat_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Connection transitions drive both the advertised lifecycle and an
    /// immediate out-of-cycle heartbeat publish.
    fn spawn_event_listener(&mut self) {
        let mut events_rx = self
            .events_rx
            .take()
            .expect("start() called twice on one CollectorService");
        let lifecycle = Arc::clone(&self.lifecycle);
        let shutdown = Arc::clone(&self.shutdown);
        let publisher = Arc::clone(&self.publisher);
        let snapshot_parts = self.snapshot_parts();

        self.timer_tasks.push(tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let next = match event {
                    ConnectionEvent::Connected => LifecycleState::Running,
                    ConnectionEvent::Disconnected => {
                        if shutdown.load(Ordering::SeqCst) {
                            LifecycleState::Stopped
                        } else {
                            LifecycleState::Degraded
                        }
                    }
                };
                *lifecycle.write() = next;
                if let Err(e) = publisher.publish(snapshot_parts.build()).await {
                    warn!("heartbeat publish failed: {}", e);
                }
            }
        }));
    }

    fn spawn_heartbeat_timer(&mut self) {
        let publisher = Arc::clone(&self.publisher);
        let snapshot_parts = self.snapshot_parts();
        let interval = self.config.heartbeat_publish_interval;

        self.timer_tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = publisher.publish(snapshot_parts.build()).await {
                    warn!("heartbeat publish failed: {}", e);
                }
            }
        }));
    }

    fn spawn_retention_timer(&mut self) {
        let retention = Arc::clone(&self.retention);
        let clock = Arc::clone(&self.clock);
        let interval = self.config.retention_check_interval;

        self.timer_tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the eager startup pass already ran; skip the immediate tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let today = chrono::DateTime::from_timestamp_millis(clock.now_ms())
                    .unwrap_or_else(Utc::now)
                    .date_naive();
                match retention.run_once(today).await {
                    Ok(report) if !report.is_noop() => {
                        info!(
                            "retention: compressed={} deleted_raw={} deleted_compressed={} errors={}",
                            report.compressed,
                            report.deleted_raw,
                            report.deleted_compressed,
                            report.errors
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("retention scan failed: {}", e),
                }
            }
        }));
    }

    /// Treat "connected but silent past the threshold" as disconnected.
    fn spawn_staleness_watchdog(&mut self) {
        let status = Arc::clone(&self.status);
        let client = Arc::clone(&self.client);
        let clock = Arc::clone(&self.clock);
        let threshold_ms = self.config.stale_threshold.as_millis() as i64;
        let period = self.config.stale_threshold;

        self.timer_tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let last = status.last_message_at_ms();
                let age_ms = clock.now_ms() - last;
                if status.is_connected() && last > 0 && age_ms > threshold_ms {
                    warn!("stale connection detected ageMs={}, reconnecting", age_ms);
                    client.force_close();
                }
            }
        }));
    }

    async fn run_retention_once(&self) {
        let today = chrono::DateTime::from_timestamp_millis(self.clock.now_ms())
            .unwrap_or_else(Utc::now)
            .date_naive();
        if let Err(e) = self.retention.run_once(today).await {
            error!("retention scan failed: {}", e);
        }
    }

    async fn publish_heartbeat(&self) {
        if let Err(e) = self.publisher.publish(self.snapshot_parts().build()).await {
            warn!("heartbeat publish failed: {}", e);
        }
    }

    fn snapshot_parts(&self) -> SnapshotParts {
        SnapshotParts {
            clock: Arc::clone(&self.clock),
            status: Arc::clone(&self.status),
            buffer: Arc::clone(&self.buffer),
            lifecycle: Arc::clone(&self.lifecycle),
            started_at_ms: self.started_at_ms,
            shared_feed_path: self.config.shared_feed_file.display().to_string(),
            symbols: self.config.symbols.clone(),
            sub_types: self.config.sub_types.clone(),
        }
    }
}

/// Everything a heartbeat snapshot is assembled from, cloneable into tasks.
struct SnapshotParts {
    clock: Arc<dyn Clock>,
    status: Arc<ConnectionStatus>,
    buffer: Arc<IngestBuffer>,
    lifecycle: Arc<RwLock<LifecycleState>>,
    started_at_ms: i64,
    shared_feed_path: String,
    symbols: Vec<String>,
    sub_types: Vec<String>,
}

impl SnapshotParts {
    fn build(&self) -> HeartbeatSnapshot {
        let now_ms = self.clock.now_ms();
        HeartbeatSnapshot {
            observed_at_epoch_ms: now_ms,
            process_id: std::process::id(),
            lifecycle_state: *self.lifecycle.read(),
            process_started_at_epoch_ms: self.started_at_ms,
            connection_up: self.status.is_connected(),
            last_message_at_epoch_ms: self.status.last_message_at_ms(),
            shared_feed_path: self.shared_feed_path.clone(),
            current_raw_log_path: self
                .buffer
                .current_raw_log_path(now_ms)
                .display()
                .to_string(),
            subscribed_symbols: self.symbols.clone(),
            subscribed_channels: self.sub_types.clone(),
            pending_queue_length: self.buffer.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MonitorConfig;
    use crate::heartbeat::{read_heartbeat, HeartbeatRead};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct RecordingNotifier {
        sent: Mutex<Vec<Alert>>,
    }

    impl RecordingNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, alert: &Alert) -> bool {
            self.sent.lock().push(alert.clone());
            true
        }
    }

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            // nothing listens here, so the client stays in its reconnect loop
            ws_url: "ws://127.0.0.1:9/ws".to_string(),
            shared_feed_file: dir.join("feed/shared-feed.jsonl"),
            log_dir: dir.join("logs"),
            raw_prefix: "raw-".to_string(),
            symbols: vec!["BTC".to_string(), "ETH".to_string()],
            sub_types: vec!["l2Book".to_string(), "trades".to_string()],
            reconnect_delay: Duration::from_millis(500),
            stale_threshold: Duration::from_millis(1_000),
            queue_warn_limit: 1_000,
            heartbeat_file: dir.join("hb/heartbeat.json"),
            heartbeat_publish_interval: Duration::from_millis(1_000),
            retention_check_interval: Duration::from_millis(60_000),
            compress_after_days: 2,
            keep_days: 7,
            monitor: MonitorConfig {
                state_file: dir.join("monitor-state.json"),
                check_interval: Duration::from_millis(1_000),
                stale_threshold: Duration::from_millis(5_000),
                down_report_interval: Duration::from_millis(60_000),
                suspect_report_interval: Duration::from_millis(30_000),
            },
            dry_run: true,
        }
    }

    const NOW_MS: i64 = 1_704_326_401_000; // 2024-01-04T00:00:01Z

    #[tokio::test]
    async fn test_start_creates_outputs_and_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let clock = Arc::new(ManualClock::new(NOW_MS));
        let notifier = RecordingNotifier::new();
        let mut service =
            CollectorService::new(config.clone(), clock.clone(), notifier.clone());

        service.start().await.unwrap();

        assert!(config.shared_feed_file.exists());
        assert!(config.log_dir.exists());
        match read_heartbeat(&config.heartbeat_file).await {
            HeartbeatRead::Present(hb) => {
                assert_eq!(hb.process_id, std::process::id());
                assert!(!hb.connection_up);
                assert_eq!(hb.subscribed_symbols, vec!["BTC", "ETH"]);
                assert!(hb.current_raw_log_path.ends_with("raw-20240104.jsonl"));
            }
            other => panic!("expected Present, got {:?}", other),
        }
        assert!(matches!(
            notifier.sent.lock().first(),
            Some(Alert::CollectorStarted { .. })
        ));

        service.stop().await;
    }

    #[tokio::test]
    async fn test_stop_writes_terminal_heartbeat_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let clock = Arc::new(ManualClock::new(NOW_MS));
        let notifier = RecordingNotifier::new();
        let mut service =
            CollectorService::new(config.clone(), clock.clone(), notifier.clone());

        service.start().await.unwrap();
        service.buffer.enqueue("{\"tail\":1}".to_string(), NOW_MS);
        service.stop().await;

        match read_heartbeat(&config.heartbeat_file).await {
            HeartbeatRead::Present(hb) => {
                assert_eq!(hb.lifecycle_state, LifecycleState::Stopped);
                assert_eq!(hb.pending_queue_length, 0);
            }
            other => panic!("expected Present, got {:?}", other),
        }

        let shared = std::fs::read_to_string(&config.shared_feed_file).unwrap();
        assert!(shared.contains("{\"tail\":1}"));
    }
}
