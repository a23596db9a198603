//! Alert delivery.
//!
//! Alerts are a closed set of typed records, each carrying exactly the
//! fields its kind needs. Delivery is best-effort: a failed or skipped send
//! never affects collector or monitor liveness.

use crate::monitor::ProbeReason;
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }
}

/// Every alert the system can emit, with explicit per-kind fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    CollectorStarted {
        shared_feed: String,
        log_dir: String,
        symbols: String,
        channels: String,
    },
    CollectorStopping {
        signal: &'static str,
    },
    SuspectDetected {
        reason: ProbeReason,
    },
    StillSuspect {
        reason: ProbeReason,
        suspect_for_ms: i64,
    },
    DownDetected {
        reason: ProbeReason,
        last_pid: Option<u32>,
    },
    StillDown {
        reason: ProbeReason,
        downtime_ms: i64,
    },
    Recovered {
        pid: Option<u32>,
        downtime_ms: i64,
    },
    HeartbeatRecovered {
        pid: Option<u32>,
    },
    RestartDetected {
        old_pid: u32,
        new_pid: u32,
    },
}

impl Alert {
    pub fn severity(&self) -> Severity {
        match self {
            Alert::CollectorStarted { .. } => Severity::Info,
            Alert::CollectorStopping { .. } => Severity::Warn,
            Alert::SuspectDetected { .. } => Severity::Warn,
            Alert::StillSuspect { .. } => Severity::Warn,
            Alert::DownDetected { .. } => Severity::Error,
            Alert::StillDown { .. } => Severity::Error,
            Alert::Recovered { .. } => Severity::Info,
            Alert::HeartbeatRecovered { .. } => Severity::Info,
            Alert::RestartDetected { .. } => Severity::Warn,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Alert::CollectorStarted { .. } => "collector started",
            Alert::CollectorStopping { .. } => "collector stopping",
            Alert::SuspectDetected { .. } => "collector suspect",
            Alert::StillSuspect { .. } => "collector still suspect",
            Alert::DownDetected { .. } => "collector down detected",
            Alert::StillDown { .. } => "collector still down",
            Alert::Recovered { .. } => "collector recovered",
            Alert::HeartbeatRecovered { .. } => "heartbeat recovered",
            Alert::RestartDetected { .. } => "collector restart detected",
        }
    }

    /// Render the variant's fields as ordered `key: value` pairs.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            Alert::CollectorStarted {
                shared_feed,
                log_dir,
                symbols,
                channels,
            } => vec![
                ("sharedFeed", shared_feed.clone()),
                ("logDir", log_dir.clone()),
                ("symbols", symbols.clone()),
                ("channels", channels.clone()),
            ],
            Alert::CollectorStopping { signal } => vec![("signal", signal.to_string())],
            Alert::SuspectDetected { reason } => vec![("reason", reason.as_str().to_string())],
            Alert::StillSuspect {
                reason,
                suspect_for_ms,
            } => vec![
                ("reason", reason.as_str().to_string()),
                ("suspectFor", fmt_duration_ms(*suspect_for_ms)),
            ],
            Alert::DownDetected { reason, last_pid } => vec![
                ("reason", reason.as_str().to_string()),
                (
                    "lastPid",
                    last_pid.map_or_else(|| "unknown".to_string(), |p| p.to_string()),
                ),
            ],
            Alert::StillDown {
                reason,
                downtime_ms,
            } => vec![
                ("reason", reason.as_str().to_string()),
                ("downtime", fmt_duration_ms(*downtime_ms)),
            ],
            Alert::Recovered { pid, downtime_ms } => vec![
                (
                    "pid",
                    pid.map_or_else(|| "unknown".to_string(), |p| p.to_string()),
                ),
                ("downtime", fmt_duration_ms(*downtime_ms)),
            ],
            Alert::HeartbeatRecovered { pid } => vec![(
                "pid",
                pid.map_or_else(|| "unknown".to_string(), |p| p.to_string()),
            )],
            Alert::RestartDetected { old_pid, new_pid } => vec![
                ("oldPid", old_pid.to_string()),
                ("newPid", new_pid.to_string()),
            ],
        }
    }
}

/// Outbound alert channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one alert. Returns whether delivery succeeded; callers never
    /// retry within a tick.
    async fn send(&self, alert: &Alert) -> bool;
}

/// Discord-style webhook notifier.
pub struct WebhookNotifier {
    webhook_url: Option<String>,
    dry_run: bool,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(webhook_url: Option<String>, dry_run: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            webhook_url: webhook_url.filter(|u| !u.trim().is_empty()),
            dry_run,
            client,
        }
    }

    /// Webhook URL from the environment; the dev override wins.
    pub fn from_env(dry_run: bool) -> Self {
        let url = std::env::var("DEV_DISCORD_WEBHOOK_URL")
            .or_else(|_| std::env::var("DISCORD_WEBHOOK_URL"))
            .ok();
        Self::new(url, dry_run)
    }

    fn render(&self, alert: &Alert) -> String {
        let mut lines = vec![
            format!("WS_COLLECTOR {}", alert.severity().as_str()),
            format!("Time(UTC): {}", Utc::now().to_rfc3339()),
        ];
        if let Ok(host) = std::env::var("HOSTNAME") {
            if !host.is_empty() {
                lines.push(format!("Host: {}", host));
            }
        }
        lines.push(format!("Message: {}", alert.message()));
        for (key, value) in alert.fields() {
            lines.push(format!("{}: {}", key, value));
        }
        lines.join("\n")
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, alert: &Alert) -> bool {
        let content = self.render(alert);

        let Some(webhook) = &self.webhook_url else {
            info!("webhook is not set, skipping alert: {}", alert.message());
            return false;
        };

        if self.dry_run {
            info!("[dry-run] {}", content);
            return true;
        }

        let body = serde_json::json!({ "content": content });
        match self.client.post(webhook).json(&body).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(
                    "webhook delivery failed, status {}: {}",
                    response.status(),
                    alert.message()
                );
                false
            }
            Err(e) => {
                warn!("webhook delivery failed: {}", e);
                false
            }
        }
    }
}

/// Human-readable duration, e.g. `1h 2m 3s`.
pub fn fmt_duration_ms(ms: i64) -> String {
    let total_secs = (ms / 1_000).max(0);
    let hours = total_secs / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    format!("{}h {}m {}s", hours, minutes, seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_duration() {
        assert_eq!(fmt_duration_ms(0), "0h 0m 0s");
        assert_eq!(fmt_duration_ms(-5_000), "0h 0m 0s");
        assert_eq!(fmt_duration_ms(3_723_000), "1h 2m 3s");
        assert_eq!(fmt_duration_ms(59_999), "0h 0m 59s");
    }

    #[test]
    fn test_alert_severities() {
        assert_eq!(
            Alert::DownDetected {
                reason: ProbeReason::HeartbeatMissing,
                last_pid: None
            }
            .severity(),
            Severity::Error
        );
        assert_eq!(
            Alert::SuspectDetected {
                reason: ProbeReason::HeartbeatStale
            }
            .severity(),
            Severity::Warn
        );
        assert_eq!(
            Alert::Recovered {
                pid: Some(1),
                downtime_ms: 0
            }
            .severity(),
            Severity::Info
        );
    }

    #[test]
    fn test_rendered_body_contains_typed_fields() {
        let notifier = WebhookNotifier::new(None, true);
        let content = notifier.render(&Alert::StillDown {
            reason: ProbeReason::PidDead,
            downtime_ms: 3_723_000,
        });
        assert!(content.starts_with("WS_COLLECTOR ERROR"));
        assert!(content.contains("Message: collector still down"));
        assert!(content.contains("reason: pid_dead"));
        assert!(content.contains("downtime: 1h 2m 3s"));
    }
}
