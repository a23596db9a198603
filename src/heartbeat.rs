//! Heartbeat snapshot: the file contract between collector and monitor.
//!
//! The collector overwrites the snapshot wholesale on every publish; the
//! monitor polls it. The two processes share nothing else, so the schema
//! here is a versioned contract: fields are only ever added, and a reader
//! treats any parse failure as absence rather than falling back to a
//! previous value.

use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

/// Collector lifecycle as advertised to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starting,
    Running,
    Degraded,
    Stopped,
}

/// Full liveness snapshot written by the collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatSnapshot {
    pub observed_at_epoch_ms: i64,
    pub process_id: u32,
    pub lifecycle_state: LifecycleState,
    pub process_started_at_epoch_ms: i64,
    pub connection_up: bool,
    pub last_message_at_epoch_ms: i64,
    pub shared_feed_path: String,
    pub current_raw_log_path: String,
    pub subscribed_symbols: Vec<String>,
    pub subscribed_channels: Vec<String>,
    pub pending_queue_length: usize,
}

/// Outcome of reading the heartbeat file.
///
/// `Absent` covers both a missing file and an unparseable one; `Unreadable`
/// is reserved for reads that failed for some other reason (permissions,
/// transient IO), which the monitor treats as inconclusive evidence.
#[derive(Debug, Clone)]
pub enum HeartbeatRead {
    Present(HeartbeatSnapshot),
    Absent,
    Unreadable(String),
}

/// Read and parse the heartbeat file.
pub async fn read_heartbeat(path: &Path) -> HeartbeatRead {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(snapshot) => HeartbeatRead::Present(snapshot),
            Err(e) => {
                debug!("heartbeat parse failure treated as absence: {}", e);
                HeartbeatRead::Absent
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => HeartbeatRead::Absent,
        Err(e) => HeartbeatRead::Unreadable(e.to_string()),
    }
}

/// Writes heartbeat snapshots with full-file replace semantics.
///
/// The snapshot is written to a sibling temp file and renamed into place so
/// a concurrent reader never observes a torn mix of old and new fields.
/// `observed_at_epoch_ms` is clamped to be non-decreasing across publishes
/// from this process.
pub struct HeartbeatPublisher {
    path: PathBuf,
    tmp_path: PathBuf,
    last_observed_ms: AtomicI64,
}

impl HeartbeatPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut tmp_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "heartbeat.json".into());
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);
        Self {
            path,
            tmp_path,
            last_observed_ms: AtomicI64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize and atomically replace the heartbeat file.
    pub async fn publish(&self, mut snapshot: HeartbeatSnapshot) -> Result<()> {
        let prev = self.last_observed_ms.load(Ordering::SeqCst);
        if snapshot.observed_at_epoch_ms < prev {
            snapshot.observed_at_epoch_ms = prev;
        }
        self.last_observed_ms
            .store(snapshot.observed_at_epoch_ms, Ordering::SeqCst);

        let json = serde_json::to_vec(&snapshot)?;
        tokio::fs::write(&self.tmp_path, &json).await?;
        tokio::fs::rename(&self.tmp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(observed_at: i64) -> HeartbeatSnapshot {
        HeartbeatSnapshot {
            observed_at_epoch_ms: observed_at,
            process_id: 4242,
            lifecycle_state: LifecycleState::Running,
            process_started_at_epoch_ms: 1_700_000_000_000,
            connection_up: true,
            last_message_at_epoch_ms: observed_at,
            shared_feed_path: "/tmp/feed.jsonl".to_string(),
            current_raw_log_path: "/tmp/raw-20240104.jsonl".to_string(),
            subscribed_symbols: vec!["BTC".to_string()],
            subscribed_channels: vec!["trades".to_string()],
            pending_queue_length: 0,
        }
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(snapshot(1_700_000_100_000)).unwrap();
        assert_eq!(json["observedAtEpochMs"], 1_700_000_100_000i64);
        assert_eq!(json["processId"], 4242);
        assert_eq!(json["lifecycleState"], "running");
        assert_eq!(json["connectionUp"], true);
        assert_eq!(json["subscribedSymbols"][0], "BTC");
        assert_eq!(json["pendingQueueLength"], 0);
    }

    #[tokio::test]
    async fn test_publish_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.json");
        let publisher = HeartbeatPublisher::new(&path);

        publisher.publish(snapshot(1_700_000_100_000)).await.unwrap();
        match read_heartbeat(&path).await {
            HeartbeatRead::Present(hb) => {
                assert_eq!(hb.observed_at_epoch_ms, 1_700_000_100_000);
                assert_eq!(hb.process_id, 4242);
            }
            other => panic!("expected Present, got {:?}", other),
        }
        // no temp residue after a completed publish
        assert!(!publisher.tmp_path.exists());
    }

    #[tokio::test]
    async fn test_observed_at_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.json");
        let publisher = HeartbeatPublisher::new(&path);

        publisher.publish(snapshot(2_000)).await.unwrap();
        // a clock step backwards must not move the published timestamp back
        publisher.publish(snapshot(1_000)).await.unwrap();

        match read_heartbeat(&path).await {
            HeartbeatRead::Present(hb) => assert_eq!(hb.observed_at_epoch_ms, 2_000),
            other => panic!("expected Present, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let read = read_heartbeat(&dir.path().join("nope.json")).await;
        assert!(matches!(read, HeartbeatRead::Absent));
    }

    #[tokio::test]
    async fn test_parse_failure_is_absence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.json");
        tokio::fs::write(&path, b"{ truncated").await.unwrap();
        let read = read_heartbeat(&path).await;
        assert!(matches!(read, HeartbeatRead::Absent));
    }
}
