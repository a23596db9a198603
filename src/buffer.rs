//! In-memory ingest queue with an at-least-once dual-sink flush.
//!
//! Records are enqueued in arrival order and drained by a single flush path
//! into the current UTC day's raw log and the shared feed file. The flush is
//! guarded by a single-flight flag: concurrent triggers collapse into one
//! running flush, and anything enqueued meanwhile is picked up by the next
//! trigger. A crash between the two appends can leave the sinks inconsistent
//! for the last batch; that risk is accepted rather than masked.

use crate::config::{raw_log_path, utc_day_key, Config};
use crate::errors::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

pub struct IngestBuffer {
    shared_feed_file: PathBuf,
    log_dir: PathBuf,
    raw_prefix: String,
    queue_warn_limit: usize,
    queue: Mutex<VecDeque<String>>,
    flushing: AtomicBool,
}

impl IngestBuffer {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            shared_feed_file: config.shared_feed_file.clone(),
            log_dir: config.log_dir.clone(),
            raw_prefix: config.raw_prefix.clone(),
            queue_warn_limit: config.queue_warn_limit,
            queue: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
        })
    }

    /// Number of lines currently queued.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Append a line to the queue and schedule an asynchronous flush.
    ///
    /// Never blocks the caller. Crossing the high-watermark logs a warning
    /// but drops nothing: durability wins over bounded memory.
    pub fn enqueue(self: &Arc<Self>, line: String, now_ms: i64) {
        let depth = {
            let mut queue = self.queue.lock();
            queue.push_back(line);
            queue.len()
        };

        if depth > self.queue_warn_limit {
            warn!(depth, "ingest queue above high-watermark");
        }

        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = buffer.flush(now_ms).await {
                error!("flush failed: {}", e);
            }
        });
    }

    /// Drain the queue into both sinks.
    ///
    /// At most one flush runs at a time; a trigger while one is in flight is
    /// a no-op because the running flush drained the queue at start and the
    /// next trigger will pick up whatever arrived meanwhile.
    pub async fn flush(&self, now_ms: i64) -> Result<()> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let result = self.flush_drained(now_ms).await;
        self.flushing.store(false, Ordering::SeqCst);
        result
    }

    /// Wait out any in-flight flush, then flush until the queue is empty.
    ///
    /// Used on shutdown, where "schedule and hope" is not enough.
    pub async fn drain(&self, now_ms: i64) -> Result<()> {
        loop {
            self.flush(now_ms).await?;
            if self.queue.lock().is_empty() && !self.flushing.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }

    async fn flush_drained(&self, now_ms: i64) -> Result<()> {
        let lines: Vec<String> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };

        if lines.is_empty() {
            return Ok(());
        }

        let mut payload = lines.join("\n");
        payload.push('\n');

        let raw_path = self.current_raw_log_path(now_ms);
        let mut targets = vec![raw_path];
        if !targets.contains(&self.shared_feed_file) {
            targets.push(self.shared_feed_file.clone());
        }

        for target in &targets {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(target)
                .await?;
            file.write_all(payload.as_bytes()).await?;
            file.flush().await?;
        }

        Ok(())
    }

    /// Raw log path for the UTC day containing `now_ms`.
    pub fn current_raw_log_path(&self, now_ms: i64) -> PathBuf {
        raw_log_path(&self.log_dir, &self.raw_prefix, &utc_day_key(now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use std::time::Duration;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            ws_url: "wss://api.hyperliquid.xyz/ws".to_string(),
            shared_feed_file: dir.join("shared-feed.jsonl"),
            log_dir: dir.to_path_buf(),
            raw_prefix: "raw-".to_string(),
            symbols: vec!["BTC".to_string()],
            sub_types: vec!["trades".to_string()],
            reconnect_delay: Duration::from_millis(500),
            stale_threshold: Duration::from_millis(1_000),
            queue_warn_limit: 1_000,
            heartbeat_file: dir.join("heartbeat.json"),
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
    async fn test_both_sinks_receive_same_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let buffer = IngestBuffer::new(&config);

        for i in 0..20 {
            buffer.queue.lock().push_back(format!("{{\"n\":{}}}", i));
        }
        buffer.flush(NOW_MS).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("raw-20240104.jsonl")).unwrap();
        let shared = std::fs::read_to_string(dir.path().join("shared-feed.jsonl")).unwrap();
        assert_eq!(raw, shared);

        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 20);
        assert_eq!(lines[0], "{\"n\":0}");
        assert_eq!(lines[19], "{\"n\":19}");
        assert!(raw.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_overlapping_flushes_produce_union_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let buffer = IngestBuffer::new(&config);

        // several bursts, each followed by a re-entrant flush trigger
        for burst in 0..5 {
            for i in 0..10 {
                buffer
                    .queue
                    .lock()
                    .push_back(format!("burst-{}-line-{}", burst, i));
            }
            let b1 = Arc::clone(&buffer);
            let b2 = Arc::clone(&buffer);
            let (r1, r2) = tokio::join!(b1.flush(NOW_MS), b2.flush(NOW_MS));
            r1.unwrap();
            r2.unwrap();
        }
        buffer.drain(NOW_MS).await.unwrap();

        let shared = std::fs::read_to_string(dir.path().join("shared-feed.jsonl")).unwrap();
        let lines: Vec<&str> = shared.lines().collect();
        assert_eq!(lines.len(), 50);
        let unique: std::collections::HashSet<&str> = lines.iter().copied().collect();
        assert_eq!(unique.len(), 50);
    }

    #[tokio::test]
    async fn test_enqueue_schedules_flush() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let buffer = IngestBuffer::new(&config);

        buffer.enqueue("{\"hello\":1}".to_string(), NOW_MS);
        buffer.drain(NOW_MS).await.unwrap();
        assert!(buffer.is_empty());

        let shared = std::fs::read_to_string(dir.path().join("shared-feed.jsonl")).unwrap();
        assert_eq!(shared, "{\"hello\":1}\n");
    }

    #[tokio::test]
    async fn test_coinciding_sink_paths_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        // point the shared feed at the current day's raw file
        config.shared_feed_file = dir.path().join("raw-20240104.jsonl");
        let buffer = IngestBuffer::new(&config);

        buffer.queue.lock().push_back("only-once".to_string());
        buffer.flush(NOW_MS).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("raw-20240104.jsonl")).unwrap();
        assert_eq!(raw, "only-once\n");
    }
}
