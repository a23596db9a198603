//! Watchdog monitor: probe classification and hysteresis.
//!
//! Runs as its own process. Each tick reads the heartbeat file, probes the
//! recorded process at the OS level, classifies the collector's health, and
//! drives a four-state machine whose transitions decide what (if anything)
//! to alert. Classification and transition logic are pure functions of
//! their inputs so the whole table is testable without timers.

use crate::clock::Clock;
use crate::config::MonitorConfig;
use crate::errors::{CollectorError, Result};
use crate::heartbeat::{read_heartbeat, HeartbeatRead};
use crate::notify::{Alert, Notifier};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Health classification of the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Up,
    Suspect,
    Down,
}

/// How confident a single probe is in its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Certainty {
    High,
    Low,
}

/// Why a probe classified the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReason {
    Ok,
    HeartbeatMissing,
    HeartbeatMissingPidAlive,
    HeartbeatUnreadable,
    HeartbeatStale,
    HeartbeatStalePidDead,
    PidDead,
}

impl ProbeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeReason::Ok => "ok",
            ProbeReason::HeartbeatMissing => "heartbeat_missing",
            ProbeReason::HeartbeatMissingPidAlive => "heartbeat_missing_pid_alive",
            ProbeReason::HeartbeatUnreadable => "heartbeat_unreadable",
            ProbeReason::HeartbeatStale => "heartbeat_stale",
            ProbeReason::HeartbeatStalePidDead => "heartbeat_stale_pid_dead",
            ProbeReason::PidDead => "pid_dead",
        }
    }
}

/// Outcome of one probe tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub health: HealthStatus,
    pub certainty: Certainty,
    pub reason: ProbeReason,
    /// Process id from the heartbeat, when it was readable.
    pub pid: Option<u32>,
}

/// OS-level process liveness, distinct from application-level freshness:
/// a crashed process and a hung one are different failure modes.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probes `/proc` on Linux, `kill -0` elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }

        if cfg!(target_os = "linux") {
            return Path::new(&format!("/proc/{}", pid)).exists();
        }

        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Monitor-owned state, persisted across monitor restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorState {
    pub status: HealthStatus,
    pub down_since: Option<i64>,
    pub last_down_alert_at: Option<i64>,
    pub suspect_since: Option<i64>,
    pub last_suspect_alert_at: Option<i64>,
    pub last_known_process_id: Option<u32>,
    pub last_up_at: Option<i64>,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            down_since: None,
            last_down_alert_at: None,
            suspect_since: None,
            last_suspect_alert_at: None,
            last_known_process_id: None,
            last_up_at: None,
        }
    }
}

/// Classify one observation of the heartbeat file.
///
/// Implements the full classification table: the heartbeat's freshness and
/// the OS liveness of its process are judged independently, and the
/// combination decides both the health level and how certain it is.
pub fn classify(
    read: &HeartbeatRead,
    now_ms: i64,
    stale_threshold_ms: i64,
    last_known_pid: Option<u32>,
    process_probe: &dyn ProcessProbe,
) -> Probe {
    match read {
        HeartbeatRead::Absent => {
            let last_alive = last_known_pid.is_some_and(|pid| process_probe.is_alive(pid));
            if last_alive {
                Probe {
                    health: HealthStatus::Suspect,
                    certainty: Certainty::Low,
                    reason: ProbeReason::HeartbeatMissingPidAlive,
                    pid: None,
                }
            } else {
                Probe {
                    health: HealthStatus::Down,
                    certainty: Certainty::High,
                    reason: ProbeReason::HeartbeatMissing,
                    pid: None,
                }
            }
        }
        HeartbeatRead::Unreadable(_) => Probe {
            health: HealthStatus::Suspect,
            certainty: Certainty::Low,
            reason: ProbeReason::HeartbeatUnreadable,
            pid: None,
        },
        HeartbeatRead::Present(hb) => {
            let stale = now_ms - hb.observed_at_epoch_ms > stale_threshold_ms;
            let alive = process_probe.is_alive(hb.process_id);
            let pid = Some(hb.process_id);

            if !alive {
                Probe {
                    health: HealthStatus::Down,
                    certainty: Certainty::High,
                    reason: if stale {
                        ProbeReason::HeartbeatStalePidDead
                    } else {
                        ProbeReason::PidDead
                    },
                    pid,
                }
            } else if stale {
                Probe {
                    health: HealthStatus::Suspect,
                    certainty: Certainty::Low,
                    reason: ProbeReason::HeartbeatStale,
                    pid,
                }
            } else {
                Probe {
                    health: HealthStatus::Up,
                    certainty: Certainty::High,
                    reason: ProbeReason::Ok,
                    pid,
                }
            }
        }
    }
}

/// Apply one probe to the state machine, returning the alerts to emit.
///
/// Exactly one of {up, suspect, down} is active after every call. Repeat
/// alerts while remaining down or suspect are gated by their respective
/// report intervals; a pid change while up is surfaced without a status
/// change.
pub fn evaluate(
    state: &mut MonitorState,
    probe: &Probe,
    now_ms: i64,
    config: &MonitorConfig,
) -> Vec<Alert> {
    let previous = state.status;

    match probe.health {
        HealthStatus::Up => {
            let mut alerts = Vec::new();
            match previous {
                HealthStatus::Up => {
                    if let (Some(old_pid), Some(new_pid)) =
                        (state.last_known_process_id, probe.pid)
                    {
                        if old_pid != new_pid {
                            alerts.push(Alert::RestartDetected {
                                old_pid,
                                new_pid,
                            });
                        }
                    }
                }
                HealthStatus::Down => {
                    let downtime_ms = state
                        .down_since
                        .map(|since| (now_ms - since).max(0))
                        .unwrap_or(0);
                    alerts.push(Alert::Recovered {
                        pid: probe.pid,
                        downtime_ms,
                    });
                }
                HealthStatus::Suspect => {
                    alerts.push(Alert::HeartbeatRecovered { pid: probe.pid });
                }
                HealthStatus::Unknown => {
                    // first decisive observation; nothing recovered
                }
            }
            state.status = HealthStatus::Up;
            state.down_since = None;
            state.last_down_alert_at = None;
            state.suspect_since = None;
            state.last_suspect_alert_at = None;
            state.last_up_at = Some(now_ms);
            if probe.pid.is_some() {
                state.last_known_process_id = probe.pid;
            }
            alerts
        }

        HealthStatus::Suspect => match previous {
            HealthStatus::Suspect => {
                let last_alert = state.last_suspect_alert_at.unwrap_or(0);
                if now_ms - last_alert >= config.suspect_report_interval.as_millis() as i64 {
                    state.last_suspect_alert_at = Some(now_ms);
                    let suspect_for_ms = state
                        .suspect_since
                        .map(|since| (now_ms - since).max(0))
                        .unwrap_or(0);
                    vec![Alert::StillSuspect {
                        reason: probe.reason,
                        suspect_for_ms,
                    }]
                } else {
                    Vec::new()
                }
            }
            HealthStatus::Down => {
                // evidence improved but is inconclusive; keep down_since in
                // case the outage resumes, and stay quiet until decisive
                state.status = HealthStatus::Suspect;
                state.suspect_since = Some(now_ms);
                state.last_suspect_alert_at = Some(now_ms);
                Vec::new()
            }
            HealthStatus::Up | HealthStatus::Unknown => {
                state.status = HealthStatus::Suspect;
                state.suspect_since = Some(now_ms);
                state.last_suspect_alert_at = Some(now_ms);
                vec![Alert::SuspectDetected {
                    reason: probe.reason,
                }]
            }
        },

        HealthStatus::Down => match previous {
            HealthStatus::Down => {
                let last_alert = state.last_down_alert_at.unwrap_or(0);
                if now_ms - last_alert >= config.down_report_interval.as_millis() as i64 {
                    state.last_down_alert_at = Some(now_ms);
                    let downtime_ms = state
                        .down_since
                        .map(|since| (now_ms - since).max(0))
                        .unwrap_or(0);
                    vec![Alert::StillDown {
                        reason: probe.reason,
                        downtime_ms,
                    }]
                } else {
                    Vec::new()
                }
            }
            _ => {
                let last_pid = state.last_known_process_id;
                state.status = HealthStatus::Down;
                // preserve down_since from a suspect interlude of the same outage
                state.down_since.get_or_insert(now_ms);
                state.last_down_alert_at = Some(now_ms);
                state.suspect_since = None;
                state.last_suspect_alert_at = None;
                vec![Alert::DownDetected {
                    reason: probe.reason,
                    last_pid,
                }]
            }
        },

        HealthStatus::Unknown => {
            // probes never classify as unknown; it only exists as the
            // monitor's pre-first-observation state
            Vec::new()
        }
    }
}

/// The watchdog process: probe loop plus persisted state.
pub struct HealthMonitor {
    config: MonitorConfig,
    heartbeat_file: PathBuf,
    state: MonitorState,
    clock: Arc<dyn Clock>,
    process_probe: Arc<dyn ProcessProbe>,
    notifier: Arc<dyn Notifier>,
}

impl HealthMonitor {
    /// Load persisted state and prepare the probe loop.
    ///
    /// Failure to create the state directory is the one unrecoverable
    /// startup error in the system.
    pub fn new(
        config: MonitorConfig,
        heartbeat_file: PathBuf,
        clock: Arc<dyn Clock>,
        process_probe: Arc<dyn ProcessProbe>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        if let Some(parent) = config.state_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CollectorError::config(format!(
                    "cannot create monitor state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let state = load_state(&config.state_file);
        info!("monitor starting with status {:?}", state.status);

        Ok(Self {
            config,
            heartbeat_file,
            state,
            clock,
            process_probe,
            notifier,
        })
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    /// One probe tick: classify, transition, persist, alert.
    pub async fn tick(&mut self) {
        let now_ms = self.clock.now_ms();
        let read = read_heartbeat(&self.heartbeat_file).await;
        let probe = classify(
            &read,
            now_ms,
            self.config.stale_threshold.as_millis() as i64,
            self.state.last_known_process_id,
            self.process_probe.as_ref(),
        );
        debug!(
            "probe: {:?} ({:?}, {})",
            probe.health,
            probe.certainty,
            probe.reason.as_str()
        );

        let alerts = evaluate(&mut self.state, &probe, now_ms, &self.config);
        self.persist();

        for alert in &alerts {
            // best-effort; a failed delivery re-triggers naturally next tick
            let _ = self.notifier.send(alert).await;
        }
    }

    /// Run the probe loop forever.
    pub async fn run(&mut self) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    fn persist(&self) {
        match serde_json::to_vec(&self.state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.config.state_file, json) {
                    warn!("failed to persist monitor state: {}", e);
                }
            }
            Err(e) => warn!("failed to serialize monitor state: {}", e),
        }
    }
}

fn load_state(path: &Path) -> MonitorState {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => MonitorState::default(),
    }
}
