//! Configuration for the collector and monitor processes.
//!
//! Loads from environment variables with sensible defaults. Interval and
//! threshold knobs are clamped to a minimum floor.

use crate::errors::{CollectorError, Result};
use chrono::NaiveDate;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Main configuration for the collector process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Streaming endpoint URL
    pub ws_url: String,

    /// Shared feed file aggregating all days' records
    pub shared_feed_file: PathBuf,

    /// Directory holding per-day raw logs
    pub log_dir: PathBuf,

    /// Raw log file name prefix
    pub raw_prefix: String,

    /// Subscribed symbols, in subscription order
    pub symbols: Vec<String>,

    /// Subscribed channel types, in subscription order
    pub sub_types: Vec<String>,

    /// Delay between reconnect attempts
    pub reconnect_delay: Duration,

    /// Force-close a silent connection after this long without a message
    pub stale_threshold: Duration,

    /// Queue depth that triggers an observational warning
    pub queue_warn_limit: usize,

    /// Heartbeat snapshot file path
    pub heartbeat_file: PathBuf,

    /// Interval between periodic heartbeat publishes
    pub heartbeat_publish_interval: Duration,

    /// Interval between retention scans
    pub retention_check_interval: Duration,

    /// Compress raw logs at least this many UTC days old
    pub compress_after_days: i64,

    /// Delete compressed logs strictly older than this many UTC days
    pub keep_days: i64,

    /// Monitor process settings
    pub monitor: MonitorConfig,

    /// Echo alerts locally instead of delivering them
    pub dry_run: bool,
}

/// Settings for the watchdog monitor process.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Persisted monitor state file path
    pub state_file: PathBuf,

    /// Interval between probe ticks
    pub check_interval: Duration,

    /// Heartbeat age beyond which the collector is considered stale
    pub stale_threshold: Duration,

    /// Minimum gap between repeated down alerts
    pub down_report_interval: Duration,

    /// Minimum gap between repeated suspect alerts
    pub suspect_report_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let compress_after_days =
            env_i64_floor("WS_COLLECTOR_LOG_COMPRESS_AFTER_DAYS", 2, 0);
        let keep_days = env_i64_floor(
            "WS_COLLECTOR_LOG_KEEP_DAYS",
            7,
            compress_after_days + 1,
        );

        Ok(Self {
            ws_url: env::var("HL_WS_URL")
                .unwrap_or_else(|_| "wss://api.hyperliquid.xyz/ws".to_string()),

            shared_feed_file: env_path(
                "WS_SHARED_FEED_FILE",
                "/tmp/hlws-shared-feed.jsonl",
            ),

            log_dir: env_path("WS_COLLECTOR_LOG_DIR", "./logs"),

            raw_prefix: env::var("WS_COLLECTOR_RAW_PREFIX")
                .unwrap_or_else(|_| "raw-".to_string()),

            symbols: env_list("WS_SHARED_SYMBOLS", "BTC", true),

            sub_types: env_list("WS_SHARED_SUB_TYPES", "l2Book,trades,activeAssetCtx", false),

            reconnect_delay: env_ms_floor("WS_COLLECTOR_RECONNECT_MS", 3_000, 500),

            stale_threshold: env_ms_floor("WS_COLLECTOR_STALE_MS", 15_000, 1_000),

            queue_warn_limit: env_i64_floor("WS_COLLECTOR_QUEUE_WARN_LIMIT", 50_000, 1_000)
                as usize,

            heartbeat_file: env_path(
                "WS_COLLECTOR_HEARTBEAT_FILE",
                "/tmp/ws_collector_heartbeat.json",
            ),

            heartbeat_publish_interval: env_ms_floor(
                "WS_COLLECTOR_HEARTBEAT_PUBLISH_MS",
                5_000,
                1_000,
            ),

            retention_check_interval: env_ms_floor(
                "WS_COLLECTOR_RETENTION_CHECK_MS",
                3_600_000,
                60_000,
            ),

            compress_after_days,
            keep_days,

            monitor: MonitorConfig {
                state_file: env_path(
                    "WS_COLLECTOR_MONITOR_STATE_FILE",
                    "/tmp/ws_collector_monitor_state.json",
                ),
                check_interval: env_ms_floor("WS_COLLECTOR_MONITOR_CHECK_MS", 10_000, 1_000),
                stale_threshold: env_ms_floor("WS_COLLECTOR_MONITOR_STALE_MS", 60_000, 5_000),
                down_report_interval: env_ms_floor(
                    "WS_COLLECTOR_MONITOR_DOWN_REPORT_MS",
                    1_800_000,
                    60_000,
                ),
                suspect_report_interval: env_ms_floor(
                    "WS_COLLECTOR_MONITOR_SUSPECT_REPORT_MS",
                    600_000,
                    30_000,
                ),
            },

            dry_run: env::var("WS_COLLECTOR_DRY_RUN").map(|v| v == "1").unwrap_or(false),
        })
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.ws_url)?;

        if self.symbols.is_empty() {
            return Err(CollectorError::config("WS_SHARED_SYMBOLS is empty"));
        }
        if self.sub_types.is_empty() {
            return Err(CollectorError::config("WS_SHARED_SUB_TYPES is empty"));
        }

        // A zero-day threshold makes the active day's file eligible for
        // compression while it is still being appended to.
        if self.compress_after_days == 0 {
            warn!(
                "WS_COLLECTOR_LOG_COMPRESS_AFTER_DAYS=0 races compression \
                 against the active raw log; set it to 1 or more"
            );
        }

        Ok(())
    }

    /// Raw log path for a given UTC day: `<log_dir>/<prefix><YYYYMMDD>.jsonl`.
    pub fn raw_log_path(&self, day: NaiveDate) -> PathBuf {
        let key = day.format("%Y%m%d").to_string();
        self.log_dir.join(format!("{}{}.jsonl", self.raw_prefix, key))
    }
}

fn env_path(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env::var(name).unwrap_or_else(|_| default.to_string()))
}

fn env_list(name: &str, default: &str, uppercase: bool) -> Vec<String> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| {
            if uppercase {
                v.to_uppercase()
            } else {
                v.to_string()
            }
        })
        .collect()
}

fn env_i64_floor(name: &str, default: i64, floor: i64) -> i64 {
    let value = env::var(name)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default);
    value.max(floor)
}

fn env_ms_floor(name: &str, default_ms: i64, floor_ms: i64) -> Duration {
    Duration::from_millis(env_i64_floor(name, default_ms, floor_ms) as u64)
}

/// UTC calendar day key (`YYYYMMDD`) for an epoch-milliseconds timestamp.
pub fn utc_day_key(epoch_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms)
        .unwrap_or_default()
        .format("%Y%m%d")
        .to_string()
}

/// Parse a `YYYYMMDD` day key back into a date.
pub fn parse_day_key(key: &str) -> Option<NaiveDate> {
    if key.len() != 8 || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(key, "%Y%m%d").ok()
}

/// Raw log path for a day key, independent of a full [`Config`].
pub fn raw_log_path(log_dir: &Path, prefix: &str, day_key: &str) -> PathBuf {
    log_dir.join(format!("{}{}.jsonl", prefix, day_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_clamping() {
        assert_eq!(env_i64_floor("HLC_TEST_UNSET_VAR", 3_000, 500), 3_000);
        std::env::set_var("HLC_TEST_FLOOR_VAR", "10");
        assert_eq!(env_i64_floor("HLC_TEST_FLOOR_VAR", 3_000, 500), 500);
        std::env::set_var("HLC_TEST_FLOOR_VAR", "not-a-number");
        assert_eq!(env_i64_floor("HLC_TEST_FLOOR_VAR", 3_000, 500), 3_000);
        std::env::remove_var("HLC_TEST_FLOOR_VAR");
    }

    #[test]
    fn test_symbol_list_parsing() {
        std::env::set_var("HLC_TEST_SYMBOLS", " btc, eth ,,sol ");
        let symbols = env_list("HLC_TEST_SYMBOLS", "BTC", true);
        assert_eq!(symbols, vec!["BTC", "ETH", "SOL"]);
        std::env::remove_var("HLC_TEST_SYMBOLS");

        let channels = env_list("HLC_TEST_CHANNELS_UNSET", "l2Book,trades", false);
        assert_eq!(channels, vec!["l2Book", "trades"]);
    }

    #[test]
    fn test_day_key_round_trip() {
        // 2024-01-04T00:00:01Z
        let key = utc_day_key(1_704_326_401_000);
        assert_eq!(key, "20240104");
        assert_eq!(
            parse_day_key("20240104"),
            NaiveDate::from_ymd_opt(2024, 1, 4)
        );
        assert_eq!(parse_day_key("2024010"), None);
        assert_eq!(parse_day_key("2024010a"), None);
    }

    #[test]
    fn test_raw_log_path_is_pure() {
        let path = raw_log_path(Path::new("/var/log/hl"), "raw-", "20240104");
        assert_eq!(path, PathBuf::from("/var/log/hl/raw-20240104.jsonl"));
    }
}
